//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (signing and verification)
//! - Outbound HTTP capability
//! - Remote actor resolution and caching
//! - Activity model and JSON builders
//! - Delivery, fan-out and the durable retry scheduler
//! - Inbound activity ingestion

mod activity;
mod delivery;
mod fanout;
mod inbox;
mod resolver;
mod scheduler;
mod signature;
mod transport;

pub use activity::{
    Activity, ActivityKind, Inbound, NoteObject, PUBLIC_AUDIENCE, UndoTarget, builder,
    render_note_content,
};
pub use delivery::{DeliveryClient, DeliveryOutcome, classify_status};
pub use fanout::{FanoutEngine, FanoutReport, RecipientFailure};
pub use inbox::{InboundRequest, InboxIngestion, IngestOutcome};
pub use resolver::{ActorResolver, parse_actor_document};
pub use scheduler::{BackoffPolicy, JobScheduler, TickReport, backoff_delay};
pub use signature::{
    HTTP_DATE_FORMAT, LocalKey, SignatureHeaders, check_signed_headers, extract_signature_key_id,
    generate_digest, key_id_matches_actor, parse_signature_header, sign_request, verify_signature,
};
pub use transport::{
    FetchError, OutboundFetch, OutboundRequest, OutboundResponse, ReqwestFetcher,
    check_remote_url,
};
