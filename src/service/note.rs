//! Note service
//!
//! Handles publishing and deleting notes of the local actor.

use chrono::Utc;
use std::sync::Arc;

use crate::data::{Database, EntityId, Note};
use crate::error::AppError;
use crate::federation::{
    Activity, FanoutEngine, FanoutReport, JobScheduler, NoteObject, PUBLIC_AUDIENCE,
    render_note_content,
};
use crate::metrics::NOTES_PUBLISHED_TOTAL;

const MAX_NOTE_CHARS: usize = 5000;

/// Object URI of a local note
pub fn note_uri(actor_uri: &str, note_id: &str) -> String {
    format!("{}/s/{}", actor_uri, note_id)
}

/// Note object as served and delivered
pub fn note_object(actor_uri: &str, note: &Note) -> NoteObject {
    NoteObject {
        id: note_uri(actor_uri, &note.id),
        attributed_to: actor_uri.to_string(),
        content: render_note_content(&note.content),
        published: note.created_at,
        to: vec![PUBLIC_AUDIENCE.to_string()],
        cc: vec![format!("{}/followers", actor_uri)],
    }
}

/// A stored note and the fan-out it triggered
#[derive(Debug, Clone)]
pub struct PublishedNote {
    pub note: Note,
    pub activity_id: String,
    pub fanout: FanoutReport,
}

/// Note service
#[derive(Clone)]
pub struct NoteService {
    db: Arc<Database>,
    fanout: FanoutEngine,
    scheduler: JobScheduler,
    actor_uri: String,
}

impl NoteService {
    pub fn new(
        db: Arc<Database>,
        fanout: FanoutEngine,
        scheduler: JobScheduler,
        actor_uri: String,
    ) -> Self {
        Self {
            db,
            fanout,
            scheduler,
            actor_uri,
        }
    }

    /// Create a note and fan its Create activity out to all followers
    ///
    /// # Side Effects
    /// - Inserts into database
    /// - Enqueues one delivery job per follower
    /// - Records the note's federated id
    pub async fn create(&self, content: String) -> Result<PublishedNote, AppError> {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(AppError::Validation("note content is required".to_string()));
        }
        if content.chars().count() > MAX_NOTE_CHARS {
            return Err(AppError::Validation(format!(
                "note content must be at most {} characters",
                MAX_NOTE_CHARS
            )));
        }

        let mut note = Note {
            id: EntityId::new().0,
            content,
            federated_id: None,
            created_at: Utc::now(),
        };
        self.db.insert_note(&note).await?;

        let activity = Activity::create_note(&self.actor_uri, note_object(&self.actor_uri, &note));
        let fanout = match self.fanout.fanout(&activity).await {
            Ok(report) => report,
            Err(e) => {
                NOTES_PUBLISHED_TOTAL.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };

        let federated_id = note_uri(&self.actor_uri, &note.id);
        self.db.set_note_federated_id(&note.id, &federated_id).await?;
        note.federated_id = Some(federated_id);

        NOTES_PUBLISHED_TOTAL.with_label_values(&["success"]).inc();
        tracing::info!(note_id = %note.id, activity_id = %activity.id, "Note published");

        Ok(PublishedNote {
            note,
            activity_id: activity.id,
            fanout,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Note, AppError> {
        self.db.get_note(id).await?.ok_or(AppError::NotFound)
    }

    /// Delete a note and cancel its outstanding deliveries
    ///
    /// # Returns
    /// Number of jobs cancelled
    pub async fn delete(&self, id: &str) -> Result<u64, AppError> {
        let note = self.get(id).await?;
        let activity_id = format!("{}/activity", note_uri(&self.actor_uri, &note.id));

        // Cancel first so no worker picks the jobs up after the note is gone
        let cancelled = self.scheduler.cancel_for_activity(&activity_id).await?;
        self.db.delete_note(&note.id).await?;

        tracing::info!(note_id = %note.id, cancelled, "Note deleted");
        Ok(cancelled)
    }
}
