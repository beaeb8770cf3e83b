use serde::{Deserialize, Serialize};

/// A Gerrit account, as embedded in approvals and patch sets.
///
/// Older servers omit the username for some automated accounts, so every
/// field is optional and callers go through `username_or_unknown`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Account {
    pub fn username_or_unknown(&self) -> &str {
        self.username.as_deref().unwrap_or("unknown")
    }
}

/// Kind of a vote. The wire string differs between Gerrit generations
/// ("Code-Review" vs "CRVW", etc.), so both spellings decode to the same
/// variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VoteKind {
    CodeReview,
    Verified,
    Approved,
    Workflow,
    Other(String),
}

impl From<String> for VoteKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Code-Review" | "CRVW" => Self::CodeReview,
            "Verified" | "VRIF" => Self::Verified,
            "Approved" | "APRV" => Self::Approved,
            "Workflow" | "WIP" => Self::Workflow,
            _ => Self::Other(s),
        }
    }
}

impl From<VoteKind> for String {
    fn from(kind: VoteKind) -> Self {
        match kind {
            VoteKind::CodeReview => "Code-Review".to_string(),
            VoteKind::Verified => "Verified".to_string(),
            VoteKind::Approved => "Approved".to_string(),
            VoteKind::Workflow => "Workflow".to_string(),
            VoteKind::Other(s) => s,
        }
    }
}

/// One vote cast on a patch set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    #[serde(rename = "type")]
    pub kind: VoteKind,
    /// String-encoded signed integer on the wire ("-2".."2").
    pub value: String,
    /// Grant timestamp, Unix epoch seconds.
    pub granted_on: i64,
    pub by: Account,
}

impl Approval {
    /// Parsed vote value. Garbage decodes to 0 so arithmetic comparisons
    /// never panic on malformed server data.
    pub fn numeric_value(&self) -> i32 {
        self.value.trim().parse().unwrap_or(0)
    }

    pub fn is_negative(&self) -> bool {
        self.numeric_value() < 0
    }
}

/// One revision of a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSet {
    #[serde(default)]
    pub number: Option<u64>,
    /// Creation timestamp, Unix epoch seconds. This is when the patch was
    /// written, not when it was submitted for review.
    pub created_on: i64,
    #[serde(default)]
    pub uploader: Account,
    #[serde(default)]
    pub approvals: Vec<Approval>,
}

impl PatchSet {
    /// Approvals re-sorted by grant time ascending. The stored order is
    /// whatever the server emitted and is not meaningful.
    pub fn sorted_approvals(&self) -> Vec<&Approval> {
        let mut approvals: Vec<&Approval> = self.approvals.iter().collect();
        approvals.sort_by_key(|a| a.granted_on);
        approvals
    }

    /// True if this patch set carries a final approval: an Approved vote,
    /// or a positive Workflow vote on newer servers.
    pub fn is_approved(&self) -> bool {
        self.approvals.iter().any(|a| match a.kind {
            VoteKind::Approved => true,
            VoteKind::Workflow => a.numeric_value() > 0,
            _ => false,
        })
    }
}

/// Review status of a change. WORKINPROGRESS only exists on legacy servers;
/// current ones express WIP as a negative Workflow vote instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeStatus {
    New,
    Merged,
    Abandoned,
    Workinprogress,
    Other(String),
}

impl From<String> for ChangeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "NEW" => Self::New,
            "MERGED" => Self::Merged,
            "ABANDONED" => Self::Abandoned,
            "WORKINPROGRESS" => Self::Workinprogress,
            _ => Self::Other(s),
        }
    }
}

impl From<ChangeStatus> for String {
    fn from(status: ChangeStatus) -> Self {
        match status {
            ChangeStatus::New => "NEW".to_string(),
            ChangeStatus::Merged => "MERGED".to_string(),
            ChangeStatus::Abandoned => "ABANDONED".to_string(),
            ChangeStatus::Workinprogress => "WORKINPROGRESS".to_string(),
            ChangeStatus::Other(s) => s,
        }
    }
}

/// Composite identity of a change within a cache. The same change id can
/// exist on several branches (cherry-picks to stable), so id alone is not
/// unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeKey {
    pub id: String,
    pub project: String,
    pub branch: String,
}

impl ChangeKey {
    /// Stable string form used as the JSON object key in cache snapshots.
    pub fn storage_key(&self) -> String {
        format!("{}\t{}\t{}", self.id, self.project, self.branch)
    }
}

/// One code-review change with its full patch-set and approval history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: String,
    pub project: String,
    pub branch: String,
    pub status: ChangeStatus,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    /// Resume cursor for paginated queries; opaque to us.
    #[serde(default)]
    pub sort_key: Option<String>,
    #[serde(default)]
    pub patch_sets: Vec<PatchSet>,
}

impl ChangeRecord {
    pub fn key(&self) -> ChangeKey {
        ChangeKey {
            id: self.id.clone(),
            project: self.project.clone(),
            branch: self.branch.clone(),
        }
    }

    /// A record returned by the query client always has at least one patch
    /// set; the client validates this at the decode boundary.
    pub fn latest_patch_set(&self) -> Option<&PatchSet> {
        self.patch_sets.last()
    }

    pub fn first_patch_set(&self) -> Option<&PatchSet> {
        self.patch_sets.first()
    }

    /// True for legacy WORKINPROGRESS status, or a negative Workflow vote
    /// on the latest patch set (current servers).
    pub fn is_work_in_progress(&self) -> bool {
        if self.status == ChangeStatus::Workinprogress {
            return true;
        }
        self.latest_patch_set()
            .map(|ps| {
                ps.approvals
                    .iter()
                    .any(|a| a.kind == VoteKind::Workflow && a.numeric_value() < 0)
            })
            .unwrap_or(false)
    }

    pub fn url_or_id(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.id)
    }

    pub fn subject_or_empty(&self) -> &str {
        self.subject.as_deref().unwrap_or("")
    }
}

/// Terminal row of a query page. A row count of zero means the result
/// stream is exhausted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub row_count: u64,
}

/// One newline-delimited JSON row from the query protocol: either a change
/// or the trailing stats row.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueryRow {
    Stats(QueryStats),
    Change(ChangeRecord),
}
