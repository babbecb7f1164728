//! Change identity, ref naming, and the value types operations work with.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use refbatch_git::{GitOid, PersonIdent, ProjectName};
use serde::{Deserialize, Serialize};

/// Prefix of every change ref.
pub const REFS_CHANGES: &str = "refs/changes/";

/// Prefix of every draft-comment ref (stored in the shared repository).
pub const REFS_DRAFT_COMMENTS: &str = "refs/draft-comments/";

// ---------------------------------------------------------------------------
// ChangeId
// ---------------------------------------------------------------------------

/// Numeric change identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId(u32);

impl ChangeId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Two-digit shard used in ref names (`42` -> `"42"`, `7` -> `"07"`,
    /// `1234` -> `"34"`).
    #[must_use]
    pub fn shard(self) -> String {
        format!("{:02}", self.0 % 100)
    }

    /// `refs/changes/NN/ID/`
    #[must_use]
    pub fn refs_prefix(self) -> String {
        format!("{REFS_CHANGES}{}/{}/", self.shard(), self.0)
    }

    /// The change's metadata ref, `refs/changes/NN/ID/meta`.
    #[must_use]
    pub fn meta_ref(self) -> String {
        format!("{}meta", self.refs_prefix())
    }

    /// A patch-set ref, `refs/changes/NN/ID/PS`.
    #[must_use]
    pub fn patch_set_ref(self, patch_set: u32) -> String {
        format!("{}{patch_set}", self.refs_prefix())
    }

    /// `refs/draft-comments/NN/ID/`
    #[must_use]
    pub fn draft_comments_prefix(self) -> String {
        format!("{REFS_DRAFT_COMMENTS}{}/{}/", self.shard(), self.0)
    }

    /// Draft comments of one account on this change.
    #[must_use]
    pub fn draft_comments_ref(self, account: AccountId) -> String {
        format!("{}{}", self.draft_comments_prefix(), account.get())
    }

    /// The change a change ref or draft-comment ref belongs to.
    ///
    /// Returns `None` for refs outside both namespaces or with a shard that
    /// does not match the id.
    #[must_use]
    pub fn from_ref(ref_name: &str) -> Option<Self> {
        let rest = ref_name
            .strip_prefix(REFS_CHANGES)
            .or_else(|| ref_name.strip_prefix(REFS_DRAFT_COMMENTS))?;
        let mut parts = rest.splitn(3, '/');
        let shard = parts.next()?;
        let id: u32 = parts.next()?.parse().ok()?;
        parts.next()?;
        let change = Self(id);
        (change.shard() == shard).then_some(change)
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `true` for refs holding draft comments.
#[must_use]
pub fn is_draft_comments_ref(ref_name: &str) -> bool {
    ref_name.starts_with(REFS_DRAFT_COMMENTS)
}

/// A patch set of a change. Orders by change, then patch-set number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchSetId {
    /// Owning change.
    pub change: ChangeId,
    /// 1-based patch-set number.
    pub number: u32,
}

impl fmt::Display for PatchSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.change, self.number)
    }
}

// ---------------------------------------------------------------------------
// Accounts and users
// ---------------------------------------------------------------------------

/// Numeric account identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(u32);

impl AccountId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered account.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Account {
    /// Account id.
    pub id: AccountId,
    /// Full name.
    pub name: String,
    /// Preferred email.
    pub email: String,
}

impl Account {
    /// Create an account.
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: AccountId::new(id),
            name: name.into(),
            email: email.into(),
        }
    }

    /// The identity used when this account authors a metadata commit.
    #[must_use]
    pub fn ident(&self) -> PersonIdent {
        PersonIdent::new(self.name.clone(), self.email.clone())
    }
}

/// Who an operation runs as.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CurrentUser {
    /// A real account.
    Identified(Account),
    /// The server itself (background jobs, migrations).
    Internal,
}

impl CurrentUser {
    /// `true` for a real account.
    #[must_use]
    pub const fn is_identified(&self) -> bool {
        matches!(self, Self::Identified(_))
    }

    /// The account, if identified.
    #[must_use]
    pub const fn account(&self) -> Option<&Account> {
        match self {
            Self::Identified(account) => Some(account),
            Self::Internal => None,
        }
    }
}

impl fmt::Display for CurrentUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identified(a) => write!(f, "account {}", a.id),
            Self::Internal => write!(f, "internal user"),
        }
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// Lifecycle state of a change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// Open for review.
    #[default]
    New,
    /// Submitted into its destination branch.
    Merged,
    /// Closed without submitting.
    Abandoned,
}

impl ChangeStatus {
    /// Lowercase name as stored in metadata footers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Merged => "merged",
            Self::Abandoned => "abandoned",
        }
    }

    /// `true` for merged and abandoned changes.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        !matches!(self, Self::New)
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "new" => Ok(Self::New),
            "merged" => Ok(Self::Merged),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown change status {other:?}")),
        }
    }
}

/// The in-memory state of a change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    /// Change id.
    pub id: ChangeId,
    /// Project the change lives in.
    pub project: ProjectName,
    /// Destination branch, fully qualified.
    pub dest_branch: String,
    /// Owning account.
    pub owner: AccountId,
    /// Lifecycle state.
    pub status: ChangeStatus,
    /// Subject of the current patch set.
    pub subject: String,
    /// Optional topic.
    pub topic: Option<String>,
    /// Current patch-set number (0 before the first patch set exists).
    pub current_patch_set: u32,
    /// Time of the last metadata update.
    pub last_updated_on: SystemTime,
}

impl Change {
    /// A new, open change with no patch set yet.
    #[must_use]
    pub fn new(
        id: ChangeId,
        project: ProjectName,
        dest_branch: impl Into<String>,
        owner: AccountId,
        when: SystemTime,
    ) -> Self {
        Self {
            id,
            project,
            dest_branch: dest_branch.into(),
            owner,
            status: ChangeStatus::New,
            subject: String::new(),
            topic: None,
            current_patch_set: 0,
            last_updated_on: when,
        }
    }

    /// The current patch set.
    #[must_use]
    pub const fn current_patch_set_id(&self) -> PatchSetId {
        PatchSetId {
            change: self.id,
            number: self.current_patch_set,
        }
    }
}

/// Change state handed to post-update operations, loaded after the write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeData {
    /// The change as written (or as it was before deletion).
    pub change: Change,
    /// Tip of the metadata ref after the update; `None` once deleted.
    pub meta_id: Option<GitOid>,
}

// ---------------------------------------------------------------------------
// Notification and comments
// ---------------------------------------------------------------------------

/// Who gets notified about an update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyHandling {
    /// Nobody.
    None,
    /// Only the change owner.
    Owner,
    /// Owner and reviewers.
    OwnerReviewers,
    /// Owner, reviewers, and watchers.
    #[default]
    All,
}

/// An unpublished inline comment, stored per account in the shared
/// repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftComment {
    /// Author of the draft.
    pub author: AccountId,
    /// Patch set commented on.
    pub patch_set: u32,
    /// File path.
    pub file: String,
    /// 1-based line, 0 for a file comment.
    pub line: u32,
    /// Comment text.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_names_are_sharded() {
        let c = ChangeId::new(7);
        assert_eq!(c.meta_ref(), "refs/changes/07/7/meta");
        assert_eq!(c.patch_set_ref(2), "refs/changes/07/7/2");
        assert_eq!(
            c.draft_comments_ref(AccountId::new(1000)),
            "refs/draft-comments/07/7/1000"
        );
        assert_eq!(ChangeId::new(1234).meta_ref(), "refs/changes/34/1234/meta");
    }

    #[test]
    fn change_from_ref() {
        assert_eq!(ChangeId::from_ref("refs/changes/42/42/meta"), Some(ChangeId::new(42)));
        assert_eq!(ChangeId::from_ref("refs/changes/01/1/1"), Some(ChangeId::new(1)));
        assert_eq!(
            ChangeId::from_ref("refs/draft-comments/07/7/1000"),
            Some(ChangeId::new(7))
        );
        assert_eq!(ChangeId::from_ref("refs/changes/02/1/meta"), None);
        assert_eq!(ChangeId::from_ref("refs/heads/main"), None);
        assert_eq!(ChangeId::from_ref("refs/changes/01/1"), None);
    }

    #[test]
    fn status_roundtrips_through_footer_text() {
        for s in [ChangeStatus::New, ChangeStatus::Merged, ChangeStatus::Abandoned] {
            assert_eq!(s.as_str().parse::<ChangeStatus>().unwrap(), s);
        }
        assert!("draft".parse::<ChangeStatus>().is_err());
    }

    #[test]
    fn patch_sets_order_by_number() {
        let c = ChangeId::new(1);
        let ps1 = PatchSetId { change: c, number: 1 };
        let ps2 = PatchSetId { change: c, number: 2 };
        assert!(ps1 < ps2);
    }
}
