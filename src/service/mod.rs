//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate database and federation operations.

mod note;

pub use note::{NoteService, PublishedNote, note_object, note_uri};
