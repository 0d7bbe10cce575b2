//! Data models
//!
//! Rust structs representing persisted federation state.
//! Entity IDs are ULIDs; delivery job times are unix milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Cached copy of a remote actor profile
///
/// `uri` is the identity; re-resolution overwrites every other column.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActor {
    pub uri: String,
    /// `name@host`
    pub handle: String,
    pub display_name: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub summary: Option<String>,
    pub icon_url: Option<String>,
    pub profile_url: Option<String>,
    /// The profile document as fetched
    pub raw_json: String,
    pub fetched_at: DateTime<Utc>,
}

// =============================================================================
// Note
// =============================================================================

/// A note authored by the local actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    /// Plain text as submitted by the owner
    pub content: String,
    /// Object URI, set once the note has been published
    pub federated_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Relations
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRelation {
    pub follower_uri: String,
    pub target_uri: String,
    /// Id of the Follow activity, matched when an Undo references it
    pub follow_activity_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A remote Announce of a local note
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Share {
    pub activity_id: String,
    pub sharer_uri: String,
    pub object_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Dedup ledger entry for an inbound activity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboxItem {
    pub activity_id: String,
    pub activity_type: String,
    pub actor_uri: String,
    pub received_at: DateTime<Utc>,
}

// =============================================================================
// Delivery jobs
// =============================================================================

/// Lifecycle state of a delivery job
///
/// `Succeeded` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::InFlight,
        JobState::Succeeded,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::Succeeded => "succeeded",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Dead)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "in_flight" => Ok(JobState::InFlight),
            "succeeded" => Ok(JobState::Succeeded),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A persisted delivery of one activity to one inbox
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: String,
    pub activity_id: String,
    pub recipient_inbox: String,
    /// Serialized activity JSON, sent verbatim
    pub payload: String,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub state: JobState,
    pub last_error: Option<String>,
    pub claimed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a pending job
#[derive(Debug, Clone)]
pub struct NewDeliveryJob {
    pub activity_id: String,
    pub recipient_inbox: String,
    pub payload: String,
}
