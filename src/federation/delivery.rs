//! Activity delivery
//!
//! Performs one signed POST of an activity to one inbox and classifies
//! the result for the scheduler.

use std::sync::Arc;

use chrono::Utc;

use super::signature::{LocalKey, sign_request};
use super::transport::{OutboundFetch, OutboundRequest};
use crate::metrics::DELIVERY_ATTEMPTS_TOTAL;

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    /// Timeout, network failure, 408, 429 or 5xx
    Retryable(String),
    /// Any other 4xx, or a destination that can never be reached
    Permanent(String),
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::Retryable(_) => "retryable",
            DeliveryOutcome::Permanent(_) => "permanent",
        }
    }
}

/// Map an HTTP status to a delivery outcome.
pub fn classify_status(status: u16) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Success,
        408 | 429 => DeliveryOutcome::Retryable(format!("HTTP {}", status)),
        400..=499 => DeliveryOutcome::Permanent(format!("HTTP {}", status)),
        500..=599 => DeliveryOutcome::Retryable(format!("HTTP {}", status)),
        // 1xx/3xx: redirects are not followed for signed POSTs
        _ => DeliveryOutcome::Permanent(format!("HTTP {}", status)),
    }
}

/// Activity delivery client
///
/// Sends activities to remote inbox endpoints.
#[derive(Clone)]
pub struct DeliveryClient {
    fetcher: Arc<dyn OutboundFetch>,
    key: Arc<LocalKey>,
}

impl DeliveryClient {
    pub fn new(fetcher: Arc<dyn OutboundFetch>, key: Arc<LocalKey>) -> Self {
        Self { fetcher, key }
    }

    /// Deliver an already serialized activity to a single inbox
    ///
    /// # Arguments
    /// * `inbox_url` - Target inbox URL
    /// * `body` - Activity JSON bytes, sent verbatim
    pub async fn deliver(&self, inbox_url: &str, body: Vec<u8>) -> DeliveryOutcome {
        let outcome = self.send(inbox_url, body).await;
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        outcome
    }

    async fn send(&self, inbox_url: &str, body: Vec<u8>) -> DeliveryOutcome {
        let signed = match sign_request("POST", inbox_url, Some(&body), Utc::now(), &self.key) {
            Ok(signed) => signed,
            Err(e) => return DeliveryOutcome::Permanent(e.to_string()),
        };

        let mut headers = vec![
            ("Content-Type".to_string(), "application/activity+json".to_string()),
            ("Accept".to_string(), "application/activity+json".to_string()),
            ("Host".to_string(), signed.host),
            ("Date".to_string(), signed.date),
            ("Signature".to_string(), signed.signature),
        ];
        if let Some(digest) = signed.digest {
            headers.push(("Digest".to_string(), digest));
        }

        let request = OutboundRequest {
            method: http::Method::POST,
            url: inbox_url.to_string(),
            headers,
            body: Some(body),
        };

        match self.fetcher.send(request).await {
            Ok(response) => {
                let outcome = classify_status(response.status);
                if !matches!(outcome, DeliveryOutcome::Success) {
                    tracing::debug!(
                        inbox = %inbox_url,
                        status = response.status,
                        body = %String::from_utf8_lossy(&response.body[..response.body.len().min(256)]),
                        "Inbox rejected delivery"
                    );
                }
                outcome
            }
            Err(e) if e.is_permanent() => DeliveryOutcome::Permanent(e.to_string()),
            Err(e) => DeliveryOutcome::Retryable(e.to_string()),
        }
    }
}
