//! HTTP Signatures for ActivityPub
//!
//! Implements the draft-cavage HTTP Signatures scheme used by ActivityPub
//! servers (rsa-sha256 over `(request-target)`, `host`, `date`, `digest`).
//!
//! Every verification failure is reported as `AppError::InvalidSignature`
//! so callers can deny by default.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Format of the `Date` header
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

const KEY_BITS: usize = 2048;

/// The local actor's signing key
///
/// Loaded once at startup and shared behind an `Arc`; never mutated.
pub struct LocalKey {
    key_id: String,
    private_key: RsaPrivateKey,
    public_key_pem: String,
}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl LocalKey {
    /// Parse a PKCS#8 PEM private key
    pub fn from_pem(private_key_pem: &str, key_id: impl Into<String>) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| AppError::Config(format!("Invalid private key: {}", e)))?;
        Self::from_private_key(private_key, key_id.into())
    }

    /// Generate a fresh key pair
    pub fn generate(bits: usize, key_id: impl Into<String>) -> Result<Self, AppError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Key generation failed: {}", e)))?;
        Self::from_private_key(private_key, key_id.into())
    }

    /// Load the key from `path`, generating and writing one if the file is missing.
    pub fn load_or_generate(path: &Path, key_id: impl Into<String>) -> Result<Self, AppError> {
        let key_id = key_id.into();

        if path.exists() {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            tracing::info!(path = %path.display(), "Loaded actor private key");
            return Self::from_pem(&pem, key_id);
        }

        let key = Self::generate(KEY_BITS, key_id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Config(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(path, key.private_key_pem()?.as_bytes()).map_err(|e| {
            AppError::Config(format!("Failed to write {}: {}", path.display(), e))
        })?;
        tracing::info!(path = %path.display(), "Generated new actor private key");

        Ok(key)
    }

    fn from_private_key(private_key: RsaPrivateKey, key_id: String) -> Result<Self, AppError> {
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Public key encoding failed: {}", e)))?;

        Ok(Self {
            key_id,
            private_key,
            public_key_pem,
        })
    }

    /// Full URL of the public key (actor#main-key)
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    fn private_key_pem(&self) -> Result<String, AppError> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Private key encoding failed: {}", e)))
    }
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Host header value the signature covers
    pub host: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an HTTP request
///
/// Covers `(request-target) host date`, plus `digest` when a body is present.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `date` - Value for the Date header
/// * `key` - Local signing key
///
/// # Example
/// ```ignore
/// let headers = sign_request("POST", "https://remote.server/inbox", Some(&body), Utc::now(), &key)?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    date: DateTime<Utc>,
    key: &LocalKey,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = host_header_value(&parsed_url)?;

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = date.format(HTTP_DATE_FORMAT).to_string();
    let digest = body.map(generate_digest);

    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];

    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(key.private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key.key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        host,
        date,
        digest,
    })
}

/// `host[:port]` as sent in the Host header
fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Check the parts of a signed request that do not depend on the signer's key
///
/// Validates the Signature header shape, the covered header list, the Date
/// window and the body digest.
///
/// # Errors
/// `InvalidSignature` for any missing header, malformed value, stale date or
/// digest mismatch.
pub fn check_signed_headers(
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    max_skew_secs: i64,
    now: DateTime<Utc>,
) -> Result<ParsedSignature, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(invalid(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(invalid(format!("Signed headers must include: {}", required)));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(invalid("Signed headers must include: digest"));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| invalid("Invalid Date format"))?;
    if (now.timestamp() - date.timestamp()).abs() > max_skew_secs {
        return Err(invalid("Date header too old or in future"));
    }

    if let Some(body_data) = body {
        if header_str(headers, "digest")? != generate_digest(body_data) {
            return Err(invalid("Digest mismatch"));
        }
    }

    Ok(parsed)
}

/// Verify an HTTP request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path and query
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
/// * `max_skew_secs` - Accepted distance between Date and `now`
///
/// # Errors
/// `InvalidSignature` for any missing header, malformed value, stale date,
/// digest mismatch or bad signature.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    max_skew_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let parsed = check_signed_headers(headers, body, max_skew_secs, now)?;

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" | "content-type" => {
                header_str(headers, header_name)?.to_string()
            }
            _ => {
                return Err(invalid(format!(
                    "Unsupported header in signature: {}",
                    header_name
                )));
            }
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| invalid("Invalid signature encoding"))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| invalid(format!("Invalid public key: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| invalid(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| invalid("Signature verification failed"))
}

fn invalid(msg: impl Into<String>) -> AppError {
    AppError::InvalidSignature(msg.into())
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| invalid(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| invalid(format!("Invalid {} header", name)))
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Strip the fragment from a key id, giving the owning actor URL.
pub fn key_id_actor(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    key_id_actor(key_id) == key_id_actor(actor_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` defaults to `hs2019` and `headers` to `date` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                // base64 padding contains '=', so take everything after the first one
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| invalid("Missing keyId"))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| invalid("Missing signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    pub(crate) fn generate_test_key(key_id: &str) -> LocalKey {
        LocalKey::generate(1024, key_id).expect("key generation should work")
    }

    fn build_signed_header_map(
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        key: &LocalKey,
        date: DateTime<Utc>,
    ) -> (HeaderMap, String) {
        let signed = sign_request(method, url, body, date, key).expect("signed");
        let parsed_url = url::Url::parse(url).expect("valid test url");
        let path_and_query = match parsed_url.query() {
            Some(query) => format!("{}?{}", parsed_url.path(), query),
            None => parsed_url.path().to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).expect("host header"));
        headers.insert(
            "date",
            HeaderValue::from_str(&signed.date).expect("date header"),
        );
        if let Some(digest) = signed.digest {
            headers.insert(
                "digest",
                HeaderValue::from_str(&digest).expect("digest header"),
            );
        }
        headers.insert(
            "signature",
            HeaderValue::from_str(&signed.signature).expect("signature header"),
        );

        (headers, path_and_query)
    }

    const KEY_ID: &str = "https://local.example/u/alice#main-key";

    #[test]
    fn verify_signature_accepts_valid_signed_request() {
        let key = generate_test_key(KEY_ID);
        let now = Utc::now();
        let body = br#"{"type":"Create"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox?foo=bar",
            Some(body),
            &key,
            now,
        );

        let result = verify_signature(
            "POST",
            &path,
            &headers,
            Some(body),
            key.public_key_pem(),
            300,
            now,
        );
        assert!(result.is_ok(), "valid signature should verify: {result:?}");
    }

    #[test]
    fn host_header_keeps_explicit_port() {
        let key = generate_test_key(KEY_ID);
        let signed = sign_request("GET", "http://remote.example:8080/u/bob", None, Utc::now(), &key)
            .expect("signed");
        assert_eq!(signed.host, "remote.example:8080");
        assert!(signed.digest.is_none());
        assert!(signed.signature.contains("headers=\"(request-target) host date\""));
    }

    #[test]
    fn verify_signature_rejects_altered_body() {
        let key = generate_test_key(KEY_ID);
        let now = Utc::now();
        let body = br#"{"type":"Create"}"#;
        let (headers, path) =
            build_signed_header_map("POST", "https://remote.example/inbox", Some(body), &key, now);

        let altered = br#"{"type":"Delete"}"#;
        match verify_signature("POST", &path, &headers, Some(altered), key.public_key_pem(), 300, now) {
            Err(AppError::InvalidSignature(msg)) => assert!(msg.contains("Digest mismatch")),
            other => panic!("expected digest mismatch, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_altered_date() {
        let key = generate_test_key(KEY_ID);
        let now = Utc::now();
        let body = br#"{"type":"Create"}"#;
        let (mut headers, path) =
            build_signed_header_map("POST", "https://remote.example/inbox", Some(body), &key, now);

        let shifted = (now - chrono::Duration::seconds(30))
            .format(HTTP_DATE_FORMAT)
            .to_string();
        headers.insert("date", HeaderValue::from_str(&shifted).expect("date"));

        match verify_signature("POST", &path, &headers, Some(body), key.public_key_pem(), 300, now) {
            Err(AppError::InvalidSignature(msg)) => {
                assert!(msg.contains("Signature verification failed"))
            }
            other => panic!("expected verification failure, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_altered_path() {
        let key = generate_test_key(KEY_ID);
        let now = Utc::now();
        let body = br#"{"type":"Create"}"#;
        let (headers, _path) =
            build_signed_header_map("POST", "https://remote.example/inbox", Some(body), &key, now);

        let result = verify_signature(
            "POST",
            "/u/other/inbox",
            &headers,
            Some(body),
            key.public_key_pem(),
            300,
            now,
        );
        assert!(matches!(result, Err(AppError::InvalidSignature(_))));
    }

    #[test]
    fn verify_signature_rejects_stale_date() {
        let key = generate_test_key(KEY_ID);
        let signed_at = Utc::now() - chrono::Duration::seconds(600);
        let body = br#"{"type":"Create"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &key,
            signed_at,
        );

        match verify_signature("POST", &path, &headers, Some(body), key.public_key_pem(), 300, Utc::now()) {
            Err(AppError::InvalidSignature(msg)) => assert!(msg.contains("too old")),
            other => panic!("expected stale date error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_other_key() {
        let key = generate_test_key(KEY_ID);
        let other = generate_test_key("https://evil.example/u/mallory#main-key");
        let now = Utc::now();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) =
            build_signed_header_map("POST", "https://remote.example/inbox", Some(body), &key, now);

        let result = verify_signature("POST", &path, &headers, Some(body), other.public_key_pem(), 300, now);
        assert!(matches!(result, Err(AppError::InvalidSignature(_))));
    }

    #[test]
    fn verify_signature_rejects_missing_digest_header_for_body() {
        let key = generate_test_key(KEY_ID);
        let now = Utc::now();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) =
            build_signed_header_map("POST", "https://remote.example/inbox", Some(body), &key, now);
        headers.remove("digest");

        match verify_signature("POST", &path, &headers, Some(body), key.public_key_pem(), 300, now) {
            Err(AppError::InvalidSignature(msg)) => assert!(msg.contains("Missing digest header")),
            other => panic!("expected missing Digest header error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_when_date_not_in_signed_headers() {
        let key = generate_test_key(KEY_ID);
        let now = Utc::now();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) =
            build_signed_header_map("POST", "https://remote.example/inbox", Some(body), &key, now);

        let signature_header = headers
            .get("signature")
            .expect("signature")
            .to_str()
            .expect("signature str");
        let parsed = parse_signature_header(signature_header).expect("parsed signature");
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"{}\",headers=\"(request-target) host digest\",signature=\"{}\"",
            parsed.key_id, parsed.algorithm, parsed.signature
        );
        headers.insert(
            "signature",
            HeaderValue::from_str(&tampered).expect("tampered signature"),
        );

        match verify_signature("POST", &path, &headers, Some(body), key.public_key_pem(), 300, now) {
            Err(AppError::InvalidSignature(msg)) => {
                assert!(msg.contains("Signed headers must include: date"))
            }
            other => panic!("expected missing signed date error, got: {other:?}"),
        }
    }

    #[test]
    fn local_key_round_trips_through_pem_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keys").join("private.pem");

        let generated = LocalKey::load_or_generate(&path, KEY_ID).unwrap();
        assert!(path.exists());

        let loaded = LocalKey::load_or_generate(&path, KEY_ID).unwrap();
        assert_eq!(generated.public_key_pem(), loaded.public_key_pem());
        assert_eq!(loaded.key_id(), KEY_ID);
    }

    #[test]
    fn extract_signature_key_id_reads_key_id() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_static(
                "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"ZmFrZQ==\"",
            ),
        );

        let key_id = extract_signature_key_id(&headers).expect("keyId should be parsed");
        assert_eq!(key_id, "https://remote.example/users/alice#main-key");
    }

    #[test]
    fn key_id_matches_actor_rejects_different_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }
}
