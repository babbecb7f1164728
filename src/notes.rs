//! Change metadata stored as commits on the change's metadata ref.
//!
//! Every metadata commit carries one [`ChangeUpdate`]: a subject line, an
//! optional change message body, and a footer block such as
//!
//! ```text
//! Update patch set 2
//!
//! Rebased onto main.
//!
//! Patch-set: 2
//! Status: new
//! Subject: Fix the frobnicator
//! ```
//!
//! [`ChangeNotes`] replays those commits oldest-first to rebuild the change.
//! Draft comments live in the shared repository as a JSON blob per account.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use refbatch_git::{EntryMode, GitOid, GitRepo, PersonIdent, ProjectName, RefName, TreeEntry};

use crate::change::{Account, AccountId, Change, ChangeId, ChangeStatus, DraftComment};
use crate::error::UpdateError;

const FOOTER_PATCH_SET: &str = "Patch-set";
const FOOTER_STATUS: &str = "Status";
const FOOTER_SUBJECT: &str = "Subject";
const FOOTER_TOPIC: &str = "Topic";
const FOOTER_BRANCH: &str = "Branch";
const FOOTER_OWNER: &str = "Owner";
const FOOTER_UPDATED: &str = "Updated";

const BUILT_IN_FOOTERS: [&str; 7] = [
    FOOTER_PATCH_SET,
    FOOTER_STATUS,
    FOOTER_SUBJECT,
    FOOTER_TOPIC,
    FOOTER_BRANCH,
    FOOTER_OWNER,
    FOOTER_UPDATED,
];

/// File holding an account's drafts inside a draft-comments commit.
pub const DRAFTS_FILE: &str = "drafts.json";

// ---------------------------------------------------------------------------
// ChangeUpdate
// ---------------------------------------------------------------------------

/// A pending metadata commit for one patch set of one change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeUpdate {
    change_id: ChangeId,
    patch_set: u32,
    author: Option<Account>,
    when: SystemTime,
    message: Option<String>,
    status: Option<ChangeStatus>,
    subject: Option<String>,
    topic: Option<String>,
    branch: Option<String>,
    owner: Option<AccountId>,
    footers: Vec<(String, String)>,
    drafts: Vec<DraftComment>,
    root_only: bool,
    allow_write_to_new_ref: bool,
}

impl ChangeUpdate {
    /// An empty update authored by `author` (`None` for the server).
    #[must_use]
    pub const fn new(
        change_id: ChangeId,
        patch_set: u32,
        author: Option<Account>,
        when: SystemTime,
    ) -> Self {
        Self {
            change_id,
            patch_set,
            author,
            when,
            message: None,
            status: None,
            subject: None,
            topic: None,
            branch: None,
            owner: None,
            footers: Vec::new(),
            drafts: Vec::new(),
            root_only: false,
            allow_write_to_new_ref: false,
        }
    }

    /// The update that creates `change`: root-only, allowed to write a new
    /// metadata ref, and carrying the change's initial fields.
    #[must_use]
    pub fn for_new_change(change: &Change, author: Option<Account>, when: SystemTime) -> Self {
        let mut update = Self::new(change.id, change.current_patch_set.max(1), author, when);
        update.branch = Some(sanitize_footer(&change.dest_branch));
        update.owner = Some(change.owner);
        update.status = Some(change.status);
        update.subject = Some(sanitize_footer(&change.subject));
        update.topic = change.topic.as_deref().map(sanitize_footer);
        update.root_only = true;
        update.allow_write_to_new_ref = true;
        update
    }

    /// Change this update belongs to.
    #[must_use]
    pub const fn change_id(&self) -> ChangeId {
        self.change_id
    }

    /// Patch set this update is recorded against.
    #[must_use]
    pub const fn patch_set(&self) -> u32 {
        self.patch_set
    }

    /// Author, `None` for the server.
    #[must_use]
    pub const fn author(&self) -> Option<&Account> {
        self.author.as_ref()
    }

    /// Set the change message recorded with this update. Trailing
    /// whitespace is dropped.
    pub fn set_change_message(&mut self, message: impl Into<String>) -> &mut Self {
        let mut message = message.into();
        message.truncate(message.trim_end().len());
        self.message = Some(message);
        self
    }

    /// Set the change's status.
    pub const fn set_status(&mut self, status: ChangeStatus) -> &mut Self {
        self.status = Some(status);
        self
    }

    /// Set the change's subject. Line breaks become spaces.
    pub fn set_subject(&mut self, subject: impl Into<String>) -> &mut Self {
        self.subject = Some(sanitize_footer(&subject.into()));
        self
    }

    /// Set the topic; an empty string clears it. Line breaks become spaces.
    pub fn set_topic(&mut self, topic: impl Into<String>) -> &mut Self {
        self.topic = Some(sanitize_footer(&topic.into()));
        self
    }

    /// Add a custom footer line. Line breaks in `value` become spaces.
    ///
    /// # Errors
    /// `BadRequest` if `key` is empty, contains `:` or whitespace, or names
    /// a footer the engine writes itself.
    pub fn put_footer(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, UpdateError> {
        let key = key.into();
        if key.is_empty() || key.contains(':') || key.chars().any(char::is_whitespace) {
            return Err(UpdateError::BadRequest(format!("invalid footer key {key:?}")));
        }
        if BUILT_IN_FOOTERS.iter().any(|b| b.eq_ignore_ascii_case(&key)) {
            return Err(UpdateError::BadRequest(format!("footer {key} is reserved")));
        }
        self.footers.push((key, sanitize_footer(&value.into())));
        Ok(self)
    }

    /// Stage a draft comment; it is written to the shared repository.
    pub fn put_draft(&mut self, draft: DraftComment) -> &mut Self {
        self.drafts.push(draft);
        self
    }

    /// Fail the write if the metadata ref already exists.
    pub const fn set_root_only(&mut self, root_only: bool) -> &mut Self {
        self.root_only = root_only;
        self
    }

    /// Permit writing when the metadata ref does not exist yet.
    pub const fn set_allow_write_to_new_ref(&mut self, allow: bool) -> &mut Self {
        self.allow_write_to_new_ref = allow;
        self
    }

    /// `true` if the metadata ref must not exist yet.
    #[must_use]
    pub const fn is_root_only(&self) -> bool {
        self.root_only
    }

    /// `true` if the update may create the metadata ref.
    #[must_use]
    pub const fn allows_write_to_new_ref(&self) -> bool {
        self.allow_write_to_new_ref
    }

    /// Staged drafts.
    #[must_use]
    pub fn drafts(&self) -> &[DraftComment] {
        &self.drafts
    }

    /// `true` if this update would produce no metadata commit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message.is_none()
            && self.status.is_none()
            && self.subject.is_none()
            && self.topic.is_none()
            && self.branch.is_none()
            && self.owner.is_none()
            && self.footers.is_empty()
    }

    /// Apply this update's field changes to an in-memory change.
    pub fn apply_to(&self, change: &mut Change) {
        if let Some(status) = self.status {
            change.status = status;
        }
        if let Some(subject) = &self.subject {
            change.subject.clone_from(subject);
        }
        if let Some(topic) = &self.topic {
            change.topic = (!topic.is_empty()).then(|| topic.clone());
        }
        if let Some(branch) = &self.branch {
            change.dest_branch.clone_from(branch);
        }
        if let Some(owner) = self.owner {
            change.owner = owner;
        }
        change.current_patch_set = change.current_patch_set.max(self.patch_set);
        change.last_updated_on = self.when;
    }

    /// The commit message for this update.
    #[must_use]
    pub fn commit_message(&self) -> String {
        let mut msg = format!("Update patch set {}\n\n", self.patch_set);
        if let Some(body) = self.message.as_deref().filter(|b| !b.is_empty()) {
            msg.push_str(body);
            msg.push_str("\n\n");
        }
        let mut footer = |key: &str, value: &str| {
            msg.push_str(key);
            msg.push_str(": ");
            msg.push_str(value);
            msg.push('\n');
        };
        footer(FOOTER_PATCH_SET, &self.patch_set.to_string());
        if let Some(branch) = &self.branch {
            footer(FOOTER_BRANCH, branch);
        }
        if let Some(owner) = self.owner {
            footer(FOOTER_OWNER, &owner.to_string());
        }
        if let Some(status) = self.status {
            footer(FOOTER_STATUS, status.as_str());
        }
        if let Some(subject) = &self.subject {
            footer(FOOTER_SUBJECT, subject);
        }
        if let Some(topic) = &self.topic {
            footer(FOOTER_TOPIC, topic);
        }
        let secs = self.when.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        footer(FOOTER_UPDATED, &secs.to_string());
        for (key, value) in &self.footers {
            footer(key, value);
        }
        msg
    }
}

/// A footer value on one line: CR and LF become spaces.
#[must_use]
pub fn sanitize_footer(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One metadata commit, parsed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedUpdate {
    /// Patch set the commit was recorded against.
    pub patch_set: u32,
    /// Change message body, if any.
    pub message: Option<String>,
    /// Footers in order of appearance.
    pub footers: Vec<(String, String)>,
}

impl ParsedUpdate {
    fn footer(&self, key: &str) -> Option<&str> {
        self.footers
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a metadata commit message.
///
/// # Errors
/// Returns an error if the footer block lacks a valid `Patch-set` line.
pub fn parse_update(message: &str) -> anyhow::Result<ParsedUpdate> {
    let message = message.trim_end_matches('\n');
    let (Some(head_end), Some(footer_start)) = (message.find("\n\n"), message.rfind("\n\n"))
    else {
        anyhow::bail!("metadata commit has no footer block");
    };
    let footers: Vec<(String, String)> = message[footer_start + 2..]
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_owned(), v.strip_prefix(' ').unwrap_or(v).to_owned()))
        .collect();
    let body = if footer_start >= head_end + 2 {
        &message[head_end + 2..footer_start]
    } else {
        ""
    };
    let mut parsed = ParsedUpdate {
        patch_set: 0,
        message: (!body.is_empty()).then(|| body.to_owned()),
        footers,
    };
    parsed.patch_set = parsed
        .footer(FOOTER_PATCH_SET)
        .context("missing Patch-set footer")?
        .parse()
        .context("invalid Patch-set footer")?;
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// ChangeNotes
// ---------------------------------------------------------------------------

/// A change rebuilt from its metadata ref.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeNotes {
    /// The rebuilt change.
    pub change: Change,
    /// Tip of the metadata ref.
    pub meta_id: GitOid,
    /// Change messages, oldest first.
    pub messages: Vec<String>,
    /// Custom footers, oldest first.
    pub footers: Vec<(String, String)>,
    /// Number of metadata commits.
    pub commit_count: usize,
}

impl ChangeNotes {
    /// Load notes for `id` from `repo`, `None` if the metadata ref is absent.
    ///
    /// # Errors
    /// Storage errors, or `Other` if the history cannot be parsed.
    pub fn load(
        repo: &dyn GitRepo,
        project: &ProjectName,
        id: ChangeId,
    ) -> Result<Option<Self>, UpdateError> {
        let meta_ref = RefName::new(&id.meta_ref()).map_err(|e| UpdateError::Other(e.into()))?;
        let Some(tip) = repo.read_ref(&meta_ref)? else {
            return Ok(None);
        };
        Self::load_at(repo, project, id, tip).map(Some)
    }

    /// Load notes as of metadata commit `tip`.
    ///
    /// # Errors
    /// Storage errors, or `Other` if the history cannot be parsed.
    pub fn load_at(
        repo: &dyn GitRepo,
        project: &ProjectName,
        id: ChangeId,
        tip: GitOid,
    ) -> Result<Self, UpdateError> {
        let mut messages = Vec::new();
        let mut next = Some(tip);
        while let Some(oid) = next {
            let commit = repo.read_commit(oid)?;
            next = commit.parents.first().copied();
            messages.push(commit.message);
        }
        messages.reverse();
        Self::parse(project, id, tip, &messages)
            .with_context(|| format!("corrupt metadata for change {id} in {project}"))
            .map_err(UpdateError::Other)
    }

    /// Rebuild a change from its metadata commit messages, oldest first.
    ///
    /// # Errors
    /// Returns an error if a commit cannot be parsed or the root commit lacks
    /// the `Branch` or `Owner` footer.
    pub fn parse(
        project: &ProjectName,
        id: ChangeId,
        meta_id: GitOid,
        commit_messages: &[String],
    ) -> anyhow::Result<Self> {
        let mut change: Option<Change> = None;
        let mut messages = Vec::new();
        let mut footers = Vec::new();

        for raw in commit_messages {
            let parsed = parse_update(raw)?;
            if change.is_none() {
                let branch = parsed
                    .footer(FOOTER_BRANCH)
                    .context("root commit has no Branch footer")?;
                let owner: u32 = parsed
                    .footer(FOOTER_OWNER)
                    .context("root commit has no Owner footer")?
                    .parse()
                    .context("invalid Owner footer")?;
                change = Some(Change::new(
                    id,
                    project.clone(),
                    branch,
                    AccountId::new(owner),
                    UNIX_EPOCH,
                ));
            }
            let Some(c) = change.as_mut() else {
                anyhow::bail!("metadata ref has no commits");
            };
            for (key, value) in &parsed.footers {
                match key.as_str() {
                    FOOTER_PATCH_SET | FOOTER_OWNER => {}
                    FOOTER_BRANCH => c.dest_branch.clone_from(value),
                    FOOTER_STATUS => {
                        c.status = value.parse().map_err(anyhow::Error::msg)?;
                    }
                    FOOTER_SUBJECT => c.subject.clone_from(value),
                    FOOTER_TOPIC => c.topic = (!value.is_empty()).then(|| value.clone()),
                    FOOTER_UPDATED => {
                        let secs: u64 = value.parse().context("invalid Updated footer")?;
                        c.last_updated_on = UNIX_EPOCH + Duration::from_secs(secs);
                    }
                    _ => footers.push((key.clone(), value.clone())),
                }
            }
            c.current_patch_set = c.current_patch_set.max(parsed.patch_set);
            if let Some(m) = parsed.message {
                messages.push(m);
            }
        }

        let change = change.context("metadata ref has no commits")?;
        Ok(Self {
            change,
            meta_id,
            messages,
            footers,
            commit_count: commit_messages.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Draft comments
// ---------------------------------------------------------------------------

/// Read the drafts stored in draft-comments commit `tip`.
///
/// # Errors
/// Storage errors, or `Other` if the blob is not valid JSON.
pub fn read_drafts(repo: &dyn GitRepo, tip: GitOid) -> Result<Vec<DraftComment>, UpdateError> {
    let commit = repo.read_commit(tip)?;
    let entries = repo.read_tree(commit.tree_oid)?;
    let Some(entry) = entries.iter().find(|e| e.name == DRAFTS_FILE) else {
        return Ok(Vec::new());
    };
    let data = repo.read_blob(entry.oid)?;
    serde_json::from_slice(&data)
        .context("invalid drafts blob")
        .map_err(UpdateError::Other)
}

/// Write a draft-comments commit holding `drafts` on top of `parent`.
///
/// # Errors
/// Storage errors.
pub fn write_drafts(
    repo: &dyn GitRepo,
    parent: Option<GitOid>,
    ident: Option<&PersonIdent>,
    drafts: &[DraftComment],
) -> Result<GitOid, UpdateError> {
    let json = serde_json::to_vec_pretty(drafts)
        .context("serializing drafts")
        .map_err(UpdateError::Other)?;
    let blob = repo.write_blob(&json)?;
    let tree = repo.write_tree(&[TreeEntry {
        name: DRAFTS_FILE.to_owned(),
        mode: EntryMode::Blob,
        oid: blob,
    }])?;
    let parents: Vec<GitOid> = parent.into_iter().collect();
    let message = format!("Update draft comments\n\n{} drafts", drafts.len());
    Ok(repo.create_commit(tree, &parents, &message, ident)?)
}
