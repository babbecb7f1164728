//! Repository stores: open a project's repository by name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::GitError;
use crate::gix_repo::GixRepo;
use crate::mem_repo::MemRepo;
use crate::repo::GitRepo;
use crate::types::ProjectName;

/// Hands out repository handles by project name.
///
/// Every call to [`open_repository`](Self::open_repository) returns an
/// independent handle; callers drop it to close the repository.
pub trait RepositoryStore: Send + Sync {
    /// Open the repository for `project`.
    ///
    /// # Errors
    /// `NotFound` if no such project exists, backend errors otherwise.
    fn open_repository(&self, project: &ProjectName) -> Result<Arc<dyn GitRepo>, GitError>;

    /// List all projects, sorted by name.
    ///
    /// # Errors
    /// Returns an error if the store cannot be enumerated.
    fn list_projects(&self) -> Result<Vec<ProjectName>, GitError>;
}

// ---------------------------------------------------------------------------
// FsRepositoryStore
// ---------------------------------------------------------------------------

/// Repositories on disk under one base directory.
///
/// Project `a/b` lives at `<base>/a/b.git`, falling back to `<base>/a/b`.
#[derive(Clone, Debug)]
pub struct FsRepositoryStore {
    base: PathBuf,
}

impl FsRepositoryStore {
    /// A store rooted at `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn locate(&self, project: &ProjectName) -> Option<PathBuf> {
        let bare = self.base.join(format!("{}.git", project.as_str()));
        if bare.is_dir() {
            return Some(bare);
        }
        let plain = self.base.join(project.as_str());
        plain.is_dir().then_some(plain)
    }

    fn scan(&self, dir: &Path, out: &mut Vec<ProjectName>) -> Result<(), GitError> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if path.join("HEAD").is_file() || path.join(".git").exists() {
                if let Some(rel) = path.strip_prefix(&self.base).ok().and_then(Path::to_str)
                    && let Ok(name) = ProjectName::new(rel)
                {
                    out.push(name);
                }
            } else {
                self.scan(&path, out)?;
            }
        }
        Ok(())
    }
}

impl RepositoryStore for FsRepositoryStore {
    fn open_repository(&self, project: &ProjectName) -> Result<Arc<dyn GitRepo>, GitError> {
        let path = self.locate(project).ok_or_else(|| GitError::NotFound {
            message: format!("project {project}"),
        })?;
        tracing::trace!(%project, path = %path.display(), "opening repository");
        Ok(Arc::new(GixRepo::open(&path)?))
    }

    fn list_projects(&self) -> Result<Vec<ProjectName>, GitError> {
        let mut out = Vec::new();
        if self.base.is_dir() {
            self.scan(&self.base, &mut out)?;
        }
        out.sort();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// InMemoryRepositoryStore
// ---------------------------------------------------------------------------

/// A store of [`MemRepo`]s.
///
/// Handles returned by `open_repository` share the project's single
/// in-memory repository, like separate file handles on one on-disk repo.
#[derive(Default)]
pub struct InMemoryRepositoryStore {
    repos: Mutex<BTreeMap<ProjectName, Arc<MemRepo>>>,
    opens: AtomicUsize,
}

impl InMemoryRepositoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a project's repository.
    ///
    /// # Errors
    /// Returns a backend error if the project already exists.
    pub fn create_repository(&self, project: &ProjectName) -> Result<Arc<MemRepo>, GitError> {
        let mut repos = self
            .repos
            .lock()
            .map_err(|_| GitError::backend("repository store poisoned"))?;
        if repos.contains_key(project) {
            return Err(GitError::backend(format!("project {project} already exists")));
        }
        let repo = Arc::new(MemRepo::new());
        repos.insert(project.clone(), Arc::clone(&repo));
        Ok(repo)
    }

    /// The concrete repository for `project`, for inspection and fault
    /// injection.
    #[must_use]
    pub fn repository(&self, project: &ProjectName) -> Option<Arc<MemRepo>> {
        self.repos.lock().ok()?.get(project).cloned()
    }

    /// Number of handles opened so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl RepositoryStore for InMemoryRepositoryStore {
    fn open_repository(&self, project: &ProjectName) -> Result<Arc<dyn GitRepo>, GitError> {
        let repo = self.repository(project).ok_or_else(|| GitError::NotFound {
            message: format!("project {project}"),
        })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(repo)
    }

    fn list_projects(&self) -> Result<Vec<ProjectName>, GitError> {
        let repos = self
            .repos
            .lock()
            .map_err(|_| GitError::backend("repository store poisoned"))?;
        Ok(repos.keys().cloned().collect())
    }
}
