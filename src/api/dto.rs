//! Owner API request and response DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// POST /api/note body
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNoteRequest {
    pub content: String,
}

/// A stored note
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteResponse {
    pub id: String,
    /// Plain text as submitted
    pub content: String,
    pub uri: String,
    pub federated_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of publishing a note
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub note: NoteResponse,
    pub activity_id: String,
    /// Number of delivery jobs created
    pub deliveries: usize,
    /// Followers that could not be resolved
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteNoteResponse {
    pub id: String,
    pub cancelled_jobs: u64,
}

/// A delivery job as shown to the owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub activity_id: String,
    pub recipient_inbox: String,
    pub state: String,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Job list query
#[derive(Debug, Clone, Deserialize)]
pub struct JobListQuery {
    pub state: Option<String>,
    pub limit: Option<u32>,
}
