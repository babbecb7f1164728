//! Repository storage capability for refbatch.
//!
//! The batch update engine never imports gix directly; it programs against
//! the [`GitRepo`] and [`RepositoryStore`] traits defined here.
//!
//! # Crate layout
//!
//! - [`repo`]: the [`GitRepo`] trait (ref reads, atomic ref transactions,
//!   object reads and writes).
//! - [`store`]: the [`RepositoryStore`] trait plus on-disk and in-memory
//!   stores.
//! - [`types`]: value types ([`GitOid`], [`RefName`], [`RefEdit`], ...).
//! - [`error`]: the [`GitError`] enum.
//! - [`mem_repo`]: [`MemRepo`], an in-memory repository with fault injection.

pub mod error;
pub mod mem_repo;
pub mod repo;
pub mod store;
pub mod types;

mod gix_repo;
mod objects_impl;
mod refs_impl;

pub use error::GitError;
pub use gix_repo::GixRepo;
pub use mem_repo::{MemRepo, ReflogRecord};
pub use repo::GitRepo;
pub use store::{FsRepositoryStore, InMemoryRepositoryStore, RepositoryStore};
pub use types::{
    CommitInfo, EntryMode, GitOid, OidParseError, PersonIdent, ProjectName, ProjectNameError,
    RefEdit, RefLog, RefName, RefNameError, TreeEntry,
};
