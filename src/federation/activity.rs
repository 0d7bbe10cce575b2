//! Activity model
//!
//! The activity types this server sends and understands, as a closed enum,
//! plus JSON builders and the inbound parser.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::AppError;

pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Activity types that are acknowledged and dropped without side effects
const HARMLESS_TYPES: &[&str] = &[
    "Like",
    "Update",
    "Delete",
    "Reject",
    "EmojiReact",
    "Block",
    "Move",
];

/// A Note object as published by this server
#[derive(Debug, Clone, PartialEq)]
pub struct NoteObject {
    pub id: String,
    pub attributed_to: String,
    /// HTML content
    pub content: String,
    pub published: DateTime<Utc>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

impl NoteObject {
    pub fn to_json(&self) -> Value {
        builder::note(
            &self.id,
            &self.attributed_to,
            &self.content,
            self.published,
            &self.to,
            &self.cc,
        )
    }
}

/// What an Undo refers to
#[derive(Debug, Clone, PartialEq)]
pub enum UndoTarget {
    /// An embedded Follow, possibly without id
    Follow {
        id: Option<String>,
        object: Option<String>,
    },
    /// A bare activity id
    Reference(String),
    /// Some other embedded activity type
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityKind {
    Create(NoteObject),
    Follow { object: String },
    Undo(UndoTarget),
    Announce { object: String },
    Accept { object: Value },
}

/// An immutable activity envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub id: String,
    pub actor: String,
    pub kind: ActivityKind,
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

/// Result of parsing an inbound activity document
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Activity(Activity),
    /// A known but unhandled type; acknowledged without side effects
    Ignored {
        id: String,
        actor: String,
        activity_type: String,
    },
}

impl Inbound {
    pub fn id(&self) -> &str {
        match self {
            Inbound::Activity(activity) => &activity.id,
            Inbound::Ignored { id, .. } => id,
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            Inbound::Activity(activity) => &activity.actor,
            Inbound::Ignored { actor, .. } => actor,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Inbound::Activity(activity) => activity.type_name(),
            Inbound::Ignored { activity_type, .. } => activity_type,
        }
    }
}

impl Activity {
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ActivityKind::Create(_) => "Create",
            ActivityKind::Follow { .. } => "Follow",
            ActivityKind::Undo(_) => "Undo",
            ActivityKind::Announce { .. } => "Announce",
            ActivityKind::Accept { .. } => "Accept",
        }
    }

    /// Wrap a local note in a public Create
    pub fn create_note(actor: &str, note: NoteObject) -> Self {
        Self {
            id: format!("{}/activity", note.id),
            actor: actor.to_string(),
            to: note.to.clone(),
            cc: note.cc.clone(),
            kind: ActivityKind::Create(note),
        }
    }

    /// Accept a remote Follow; the original Follow is embedded
    pub fn accept_follow(actor: &str, follow: &Activity) -> Self {
        Self {
            id: format!("{}/accept/{}", actor, ulid::Ulid::new()),
            actor: actor.to_string(),
            kind: ActivityKind::Accept {
                object: follow.to_json(),
            },
            to: vec![follow.actor.clone()],
            cc: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        match &self.kind {
            ActivityKind::Create(note) => {
                builder::create(&self.id, &self.actor, note.to_json(), &self.to, &self.cc, note.published)
            }
            ActivityKind::Follow { object } => builder::follow(&self.id, &self.actor, object),
            ActivityKind::Undo(target) => {
                let object = match target {
                    UndoTarget::Follow { id, object } => {
                        let mut follow = serde_json::Map::new();
                        follow.insert("type".to_string(), Value::from("Follow"));
                        if let Some(id) = id {
                            follow.insert("id".to_string(), Value::from(id.as_str()));
                        }
                        if let Some(object) = object {
                            follow.insert("object".to_string(), Value::from(object.as_str()));
                        }
                        Value::Object(follow)
                    }
                    UndoTarget::Reference(id) => Value::from(id.as_str()),
                    UndoTarget::Other(kind) => serde_json::json!({ "type": kind }),
                };
                builder::undo(&self.id, &self.actor, object)
            }
            ActivityKind::Announce { object } => {
                builder::announce(&self.id, &self.actor, object, &self.to, &self.cc)
            }
            ActivityKind::Accept { object } => builder::accept(&self.id, &self.actor, object.clone()),
        }
    }

    /// Parse an inbound activity document
    ///
    /// # Errors
    /// `Validation` when `id`, `actor` or `type` is missing, the type is not
    /// understood, or a handled type lacks its required fields.
    pub fn parse(value: &Value) -> Result<Inbound, AppError> {
        let id = required_str(value, "id")?;
        let actor = value
            .get("actor")
            .and_then(reference_id)
            .ok_or_else(|| AppError::Validation("Missing actor".to_string()))?;
        let activity_type = required_str(value, "type")?;

        let kind = match activity_type.as_str() {
            "Create" => {
                let object = value
                    .get("object")
                    .ok_or_else(|| AppError::Validation("Missing object in Create".to_string()))?;
                match object.get("type").and_then(Value::as_str) {
                    Some("Note") => ActivityKind::Create(parse_note(object)?),
                    _ => {
                        return Ok(Inbound::Ignored {
                            id,
                            actor,
                            activity_type,
                        });
                    }
                }
            }
            "Follow" => ActivityKind::Follow {
                object: value
                    .get("object")
                    .and_then(reference_id)
                    .ok_or_else(|| AppError::Validation("Missing object in Follow".to_string()))?,
            },
            "Undo" => {
                let object = value
                    .get("object")
                    .ok_or_else(|| AppError::Validation("Missing object in Undo".to_string()))?;
                ActivityKind::Undo(parse_undo_target(object)?)
            }
            "Announce" => ActivityKind::Announce {
                object: value
                    .get("object")
                    .and_then(reference_id)
                    .ok_or_else(|| AppError::Validation("Missing object in Announce".to_string()))?,
            },
            "Accept" => ActivityKind::Accept {
                object: value.get("object").cloned().unwrap_or(Value::Null),
            },
            other if HARMLESS_TYPES.contains(&other) => {
                return Ok(Inbound::Ignored {
                    id,
                    actor,
                    activity_type,
                });
            }
            other => {
                return Err(AppError::Validation(format!(
                    "Unknown activity type: {}",
                    other
                )));
            }
        };

        Ok(Inbound::Activity(Activity {
            id,
            actor,
            kind,
            to: string_list(value.get("to")),
            cc: string_list(value.get("cc")),
        }))
    }
}

fn required_str(value: &Value, field: &str) -> Result<String, AppError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation(format!("Missing {}", field)))
}

/// Accept either `"https://..."` or `{"id": "https://..."}`
fn reference_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_note(object: &Value) -> Result<NoteObject, AppError> {
    let published = object
        .get("published")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(NoteObject {
        id: required_str(object, "id")?,
        attributed_to: object
            .get("attributedTo")
            .and_then(reference_id)
            .unwrap_or_default(),
        content: object
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing content in Note".to_string()))?
            .to_string(),
        published,
        to: string_list(object.get("to")),
        cc: string_list(object.get("cc")),
    })
}

fn parse_undo_target(object: &Value) -> Result<UndoTarget, AppError> {
    if let Some(id) = object.as_str() {
        return Ok(UndoTarget::Reference(id.to_string()));
    }

    match object.get("type").and_then(Value::as_str) {
        Some("Follow") => Ok(UndoTarget::Follow {
            id: object
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string),
            object: object.get("object").and_then(reference_id),
        }),
        Some(other) => Ok(UndoTarget::Other(other.to_string())),
        None => object
            .get("id")
            .and_then(Value::as_str)
            .map(|id| UndoTarget::Reference(id.to_string()))
            .ok_or_else(|| AppError::Validation("Undo object has neither type nor id".to_string())),
    }
}

/// Render owner-submitted text as note HTML
///
/// Escapes markup, wraps in `<p>`, and turns newlines into `<br>`.
pub fn render_note_content(text: &str) -> String {
    let lines: Vec<String> = text
        .lines()
        .map(|line| html_escape::encode_text(line).into_owned())
        .collect();
    format!("<p>{}</p>", lines.join("<br>"))
}

/// Activity JSON builders
pub mod builder {
    use chrono::{DateTime, Utc};
    use serde_json::Value;

    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    /// Build a Note object
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: DateTime<Utc>,
        to: &[String],
        cc: &[String],
    ) -> Value {
        serde_json::json!({
            "id": id,
            "type": "Note",
            "attributedTo": attributed_to,
            "content": content,
            "url": id,
            "published": published.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "to": to,
            "cc": cc
        })
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (a Note)
    /// * `to` - Primary recipients
    /// * `cc` - CC recipients
    pub fn create(
        id: &str,
        actor: &str,
        object: Value,
        to: &[String],
        cc: &[String],
        published: DateTime<Utc>,
    ) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": published.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        })
    }

    /// Build a Follow activity
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    pub fn announce(id: &str, actor: &str, object: &str, to: &[String], cc: &[String]) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc
        })
    }

    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_note_content_escapes_and_wraps() {
        assert_eq!(render_note_content("hello"), "<p>hello</p>");
        assert_eq!(
            render_note_content("a <b> & c\nsecond line"),
            "<p>a &lt;b&gt; &amp; c<br>second line</p>"
        );
    }

    #[test]
    fn parse_follow_accepts_string_and_object_forms() {
        let as_string = json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "https://local.example/u/alice"
        });
        let as_object = json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": {"id": "https://remote.example/users/bob"},
            "object": {"id": "https://local.example/u/alice"}
        });

        for value in [as_string, as_object] {
            match Activity::parse(&value).unwrap() {
                Inbound::Activity(Activity {
                    kind: ActivityKind::Follow { object },
                    actor,
                    ..
                }) => {
                    assert_eq!(object, "https://local.example/u/alice");
                    assert_eq!(actor, "https://remote.example/users/bob");
                }
                other => panic!("expected Follow, got {other:?}"),
            }
        }
    }

    #[test]
    fn parse_undo_recognizes_embedded_follow_and_bare_reference() {
        let embedded = json!({
            "id": "https://remote.example/undo/1",
            "type": "Undo",
            "actor": "https://remote.example/users/bob",
            "object": {
                "id": "https://remote.example/follows/1",
                "type": "Follow",
                "object": "https://local.example/u/alice"
            }
        });
        let Inbound::Activity(activity) = Activity::parse(&embedded).unwrap() else {
            panic!("expected activity");
        };
        assert_eq!(
            activity.kind,
            ActivityKind::Undo(UndoTarget::Follow {
                id: Some("https://remote.example/follows/1".to_string()),
                object: Some("https://local.example/u/alice".to_string()),
            })
        );

        let bare = json!({
            "id": "https://remote.example/undo/2",
            "type": "Undo",
            "actor": "https://remote.example/users/bob",
            "object": "https://remote.example/follows/1"
        });
        let Inbound::Activity(activity) = Activity::parse(&bare).unwrap() else {
            panic!("expected activity");
        };
        assert_eq!(
            activity.kind,
            ActivityKind::Undo(UndoTarget::Reference(
                "https://remote.example/follows/1".to_string()
            ))
        );
    }

    #[test]
    fn parse_rejects_missing_fields_and_unknown_types() {
        let no_id = json!({"type": "Follow", "actor": "https://a.example/u", "object": "x"});
        assert!(matches!(Activity::parse(&no_id), Err(AppError::Validation(_))));

        let no_actor = json!({"id": "https://a.example/1", "type": "Follow", "object": "x"});
        assert!(matches!(Activity::parse(&no_actor), Err(AppError::Validation(_))));

        let unknown = json!({"id": "https://a.example/1", "type": "Teleport", "actor": "https://a.example/u"});
        assert!(matches!(Activity::parse(&unknown), Err(AppError::Validation(_))));

        let announce_without_object =
            json!({"id": "https://a.example/1", "type": "Announce", "actor": "https://a.example/u"});
        assert!(matches!(
            Activity::parse(&announce_without_object),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn parse_ignores_harmless_types() {
        let like = json!({
            "id": "https://remote.example/likes/1",
            "type": "Like",
            "actor": "https://remote.example/users/bob",
            "object": "https://local.example/u/alice/s/1"
        });
        assert!(matches!(
            Activity::parse(&like).unwrap(),
            Inbound::Ignored { activity_type, .. } if activity_type == "Like"
        ));
    }

    #[test]
    fn create_note_json_embeds_html_content() {
        let note = NoteObject {
            id: "https://local.example/u/alice/s/01ABC".to_string(),
            attributed_to: "https://local.example/u/alice".to_string(),
            content: render_note_content("hi"),
            published: Utc::now(),
            to: vec![PUBLIC_AUDIENCE.to_string()],
            cc: vec!["https://local.example/u/alice/followers".to_string()],
        };
        let activity = Activity::create_note("https://local.example/u/alice", note);
        let json = activity.to_json();

        assert_eq!(json["type"], "Create");
        assert_eq!(json["id"], "https://local.example/u/alice/s/01ABC/activity");
        assert_eq!(json["object"]["type"], "Note");
        assert_eq!(json["object"]["content"], "<p>hi</p>");

        // What we send, we can read back
        let Inbound::Activity(parsed) = Activity::parse(&json).unwrap() else {
            panic!("expected activity");
        };
        assert_eq!(parsed.type_name(), "Create");
    }

    #[test]
    fn accept_embeds_original_follow() {
        let follow = Activity {
            id: "https://remote.example/follows/1".to_string(),
            actor: "https://remote.example/users/bob".to_string(),
            kind: ActivityKind::Follow {
                object: "https://local.example/u/alice".to_string(),
            },
            to: Vec::new(),
            cc: Vec::new(),
        };
        let accept = Activity::accept_follow("https://local.example/u/alice", &follow);
        let json = accept.to_json();

        assert_eq!(json["type"], "Accept");
        assert!(
            json["id"]
                .as_str()
                .unwrap()
                .starts_with("https://local.example/u/alice/accept/")
        );
        assert_eq!(json["object"]["type"], "Follow");
        assert_eq!(json["object"]["id"], "https://remote.example/follows/1");
    }
}
