//! Value types shared between the [`GitRepo`](crate::GitRepo) trait, the
//! repository stores, and the batch update engine.
//!
//! None of these types expose gix internals; the backend stays an
//! implementation detail.

use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// GitOid
// ---------------------------------------------------------------------------

/// A git object identifier (SHA-1, 20 bytes).
///
/// Displays as 40 lowercase hex characters. [`GitOid::ZERO`] means "no
/// object": a ref that does not exist, or a ref that is being deleted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GitOid([u8; 20]);

impl GitOid {
    /// The zero OID (`0000...0000`).
    pub const ZERO: Self = Self([0; 20]);

    /// Create a `GitOid` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Return `true` if this is the zero OID.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Abbreviated hex form used in log lines.
    #[must_use]
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GitOid({self})")
    }
}

impl FromStr for GitOid {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(OidParseError {
                value: s.to_owned(),
                reason: format!("expected 40 hex characters, got {}", s.len()),
            });
        }
        let mut bytes = [0u8; 20];
        for (slot, pair) in bytes.iter_mut().zip(s.as_bytes().chunks_exact(2)) {
            let (Some(hi), Some(lo)) = (hex_digit(pair[0]), hex_digit(pair[1])) else {
                return Err(OidParseError {
                    value: s.to_owned(),
                    reason: format!("invalid hex pair '{}'", String::from_utf8_lossy(pair)),
                });
            };
            *slot = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

/// Error from parsing a hex string into a [`GitOid`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OidParseError {
    /// The raw value that failed.
    pub value: String,
    /// Why it failed.
    pub reason: String,
}

impl fmt::Display for OidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid OID {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for OidParseError {}

const fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// RefName
// ---------------------------------------------------------------------------

/// A validated, fully-qualified ref name (`refs/...` or `HEAD`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

impl RefName {
    /// Create a new `RefName`.
    ///
    /// # Errors
    /// Returns an error if the name is empty, is not `HEAD` and does not start
    /// with `refs/`, or contains components git would refuse (`..`, `//`, a
    /// trailing `/` or `.lock`).
    pub fn new(name: &str) -> Result<Self, RefNameError> {
        Self::validate(name)?;
        Ok(Self(name.to_owned()))
    }

    /// Return the ref name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), RefNameError> {
        let reject = |reason: &str| {
            Err(RefNameError {
                value: name.to_owned(),
                reason: reason.to_owned(),
            })
        };
        if name.is_empty() {
            return reject("ref name must not be empty");
        }
        if name == "HEAD" {
            return Ok(());
        }
        if !name.starts_with("refs/") {
            return reject("ref name must start with 'refs/' or be HEAD");
        }
        if name.contains("..") || name.contains("//") {
            return reject("ref name must not contain '..' or '//'");
        }
        if name.ends_with('/') || name.ends_with(".lock") {
            return reject("ref name must not end with '/' or '.lock'");
        }
        if name.chars().any(|c| c.is_ascii_control() || " ~^:?*[\\".contains(c)) {
            return reject("ref name contains a forbidden character");
        }
        Ok(())
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RefName {
    type Err = RefNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for RefName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Error from validating a [`RefName`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefNameError {
    /// The invalid value.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

impl fmt::Display for RefNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ref name {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for RefNameError {}

// ---------------------------------------------------------------------------
// ProjectName
// ---------------------------------------------------------------------------

/// Name of a project, which is also the name of its repository in a
/// [`RepositoryStore`](crate::RepositoryStore).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectName(String);

impl ProjectName {
    /// Create a project name.
    ///
    /// # Errors
    /// Rejects empty names, absolute paths, and names with `..` components.
    pub fn new(name: &str) -> Result<Self, ProjectNameError> {
        let name = name.trim_end_matches(".git");
        if name.is_empty() || name.starts_with('/') || name.split('/').any(|c| c == ".." || c.is_empty()) {
            return Err(ProjectNameError {
                value: name.to_owned(),
            });
        }
        Ok(Self(name.to_owned()))
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectName {
    type Err = ProjectNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Error from validating a [`ProjectName`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectNameError {
    /// The invalid value.
    pub value: String,
}

impl fmt::Display for ProjectNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid project name {:?}", self.value)
    }
}

impl std::error::Error for ProjectNameError {}

// ---------------------------------------------------------------------------
// Ref transactions
// ---------------------------------------------------------------------------

/// One compare-and-swap edit inside an atomic ref transaction.
///
/// `expected_old` of [`GitOid::ZERO`] asserts the ref does not exist yet;
/// `new` of [`GitOid::ZERO`] deletes the ref.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefEdit {
    /// The ref to update.
    pub name: RefName,
    /// The value the ref must currently have.
    pub expected_old: GitOid,
    /// The value to set.
    pub new: GitOid,
}

impl RefEdit {
    /// `true` if this edit removes the ref.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.new.is_zero()
    }
}

/// A person identity as recorded in commits and ref logs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PersonIdent {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
}

impl PersonIdent {
    /// Create an identity.
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for PersonIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// The ref-log entry written alongside an atomic ref transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefLog {
    /// Reflog message.
    pub message: String,
    /// Identity recorded in the reflog. `None` uses the repository's
    /// configured committer.
    pub ident: Option<PersonIdent>,
}

impl RefLog {
    /// A reflog entry with the repository's default identity.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ident: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// The file mode of a tree entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryMode {
    /// Regular file (`100644`).
    Blob,
    /// Executable file (`100755`).
    BlobExecutable,
    /// Subdirectory (`040000`).
    Tree,
    /// Symbolic link (`120000`).
    Link,
    /// Gitlink / submodule (`160000`).
    Commit,
}

/// A single entry in a git tree object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// Basename of the entry.
    pub name: String,
    /// The entry mode.
    pub mode: EntryMode,
    /// The object this entry points to.
    pub oid: GitOid,
}

/// Information about a commit object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    /// OID of the tree this commit points to.
    pub tree_oid: GitOid,
    /// Parent commits (empty for root commits).
    pub parents: Vec<GitOid>,
    /// The full commit message.
    pub message: String,
    /// Author identity.
    pub author: PersonIdent,
    /// Committer identity.
    pub committer: PersonIdent,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
