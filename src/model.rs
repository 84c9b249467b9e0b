use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered project. Created once per distinct human key, immutable after.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub slug: String,
    pub human_key: String,
    pub created_ts: DateTime<Utc>,
}

/// A registered agent within a project. Names are unique per project,
/// case-insensitively. Re-registration refreshes the descriptive fields and
/// the liveness timestamp; agents are never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub program: String,
    pub model: String,
    pub task_description: String,
    pub inception_ts: DateTime<Utc>,
    pub last_active_ts: DateTime<Utc>,
}

/// An advisory, time-bounded hold on a path pattern.
///
/// Leases are never deleted: release and expiry both set `released_ts`,
/// preserving the full audit trail. Validity is purely a timestamp
/// comparison; nothing actively revokes a holder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    pub project_id: i64,
    pub agent_id: i64,
    /// Holder name, joined in by queries for conflict reporting.
    pub agent_name: String,
    pub path_pattern: String,
    pub exclusive: bool,
    pub reason: String,
    pub created_ts: DateTime<Utc>,
    pub expires_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_ts: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_ts.is_none() && self.expires_ts > now
    }
}

/// One granted lease in a batch response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: i64,
    pub path_pattern: String,
    pub exclusive: bool,
    pub reason: String,
    pub expires_ts: DateTime<Utc>,
}

/// An active lease blocking a requested path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictHolder {
    pub agent: String,
    pub path_pattern: String,
    pub exclusive: bool,
    pub expires_ts: DateTime<Utc>,
}

/// A requested path that was rejected, with every holder that blocked it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathConflict {
    pub path: String,
    pub holders: Vec<ConflictHolder>,
}

/// Outcome of a batch lease request. Partial success is explicit: paths land
/// in exactly one of the two lists, in request order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchOutcome {
    pub granted: Vec<LeaseGrant>,
    pub conflicts: Vec<PathConflict>,
}

/// Receipt for a release call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseReceipt {
    pub released: usize,
    pub released_at: DateTime<Utc>,
}

/// The claim artifact persisted under `claims/<sha256(pattern)>.json`.
/// Deterministically named so retries overwrite instead of duplicating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRecord {
    pub id: i64,
    pub agent: String,
    pub project: String,
    pub path_pattern: String,
    pub exclusive: bool,
    pub reason: String,
    pub created_ts: DateTime<Utc>,
    pub expires_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_ts: Option<DateTime<Utc>>,
}

/// How an attachment should be embedded in the owning message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedPolicy {
    /// Inline when the encoded size fits the configured threshold.
    #[default]
    Auto,
    Inline,
    File,
}

/// What the attachment store handed back: either a base64 payload for direct
/// embedding, or an archive-relative path to the canonical blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttachmentDescriptor {
    Inline {
        media_type: String,
        bytes: usize,
        width: u32,
        height: u32,
        sha256: String,
        data_base64: String,
    },
    File {
        media_type: String,
        bytes: usize,
        path: String,
        width: u32,
        height: u32,
        sha256: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_path: Option<String>,
    },
}

impl AttachmentDescriptor {
    pub fn sha256(&self) -> &str {
        match self {
            Self::Inline { sha256, .. } | Self::File { sha256, .. } => sha256,
        }
    }
}
