//! Conversion functions from database models to API DTOs

use chrono::{DateTime, Utc};

use crate::api::dto::*;
use crate::data::{DeliveryJob, Note};
use crate::service::{PublishedNote, note_uri};

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Convert Note to NoteResponse
pub fn note_to_response(note: &Note, actor_url: &str) -> NoteResponse {
    NoteResponse {
        id: note.id.clone(),
        content: note.content.clone(),
        uri: note_uri(actor_url, &note.id),
        federated_id: note.federated_id.clone(),
        created_at: note.created_at,
    }
}

pub fn published_to_response(published: &PublishedNote, actor_url: &str) -> PublishResponse {
    PublishResponse {
        note: note_to_response(&published.note, actor_url),
        activity_id: published.activity_id.clone(),
        deliveries: published.fanout.job_ids.len(),
        unresolved: published
            .fanout
            .failures
            .iter()
            .map(|f| f.actor_uri.clone())
            .collect(),
    }
}

/// Convert DeliveryJob to JobResponse; the payload is left out
pub fn job_to_response(job: &DeliveryJob) -> JobResponse {
    JobResponse {
        id: job.id.clone(),
        activity_id: job.activity_id.clone(),
        recipient_inbox: job.recipient_inbox.clone(),
        state: job.state.as_str().to_string(),
        attempts: job.attempts,
        next_attempt_at: millis_to_datetime(job.next_attempt_at),
        last_error: job.last_error.clone(),
        created_at: millis_to_datetime(job.created_at),
        updated_at: millis_to_datetime(job.updated_at),
    }
}
