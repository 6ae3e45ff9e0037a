//! Time-boxed upload authorizations.
//!
//! An [`UploadAuthorization`] lets a client PUT one object straight into the
//! backing store.  It is bound to the content hash through a signed
//! `Content-MD5` header and to the existence policy through a signed
//! `If-Unmodified-Since` precondition:
//!
//! - `error`: the precondition is the earliest date the store accepts, so the
//!   write only succeeds while the key has never been written.
//! - `overwrite`: the precondition is "now", so one replacement goes through
//!   and later writes find the object modified after the cut-off.
//!
//! The store evaluates the precondition atomically when the write lands; that
//! check, not anything the gateway does, is what keeps many authorizations
//! for the same absent hash from creating the object twice.
//!
//! Signing itself sits behind [`UploadSigner`].  [`SigV4Signer`] implements
//! AWS Signature Version 4 query presigning:
//! 1. Build a canonical request
//! 2. Build a string-to-sign
//! 3. Derive a signing key via HMAC chain
//! 4. Compute the signature and append it to the URL

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use utoipa::ToSchema;

use crate::errors::GatewayError;
use crate::hash::{ContentHash, HashCodec};

type HmacSha256 = Hmac<Sha256>;

/// Validity window of an authorization (10 minutes).
pub const DEFAULT_EXPIRES_SECONDS: u64 = 600;

/// Earliest `If-Unmodified-Since` the store accepts (2021-09-28T16:00:00Z).
pub const MIN_UNMODIFIED_SINCE_MILLIS: i64 = 1_632_844_800_000;

/// Longest presign validity SigV4 allows (7 days).
const MAX_PRESIGNED_EXPIRES: u64 = 604_800;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

// ── Types ───────────────────────────────────────────────────────────

/// Existence policy accepted when issuing an authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadPolicy {
    /// Only create; fail at the store if the object exists.
    #[default]
    Error,
    /// Replace once.
    Overwrite,
}

impl FromStr for UploadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(UploadPolicy::Error),
            "overwrite" => Ok(UploadPolicy::Overwrite),
            other => Err(format!("unsupported exists policy: {other}")),
        }
    }
}

/// A signed capability for one conditional PUT.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadAuthorization {
    /// HTTP method the client must use (always `PUT`).
    pub method: String,
    /// Presigned URL.
    pub url: String,
    /// Headers the client must send verbatim.
    pub headers: BTreeMap<String, String>,
    /// Instant after which the store rejects the URL.
    #[schema(value_type = String)]
    pub expires: DateTime<Utc>,
    /// Hash this authorization was issued for.
    pub md5: String,
}

/// External signer contract: presign a PUT of `key` carrying `headers`.
pub trait UploadSigner: Send + Sync + 'static {
    /// Return a URL valid for `expires_in` seconds from `now`.
    fn presign_put(
        &self,
        key: &str,
        headers: &BTreeMap<String, String>,
        expires_in: u64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;
}

// ── Authorizer ──────────────────────────────────────────────────────

/// Issues [`UploadAuthorization`]s.
#[derive(Clone)]
pub struct UploadAuthorizer {
    signer: Arc<dyn UploadSigner>,
    codec: HashCodec,
    expires_seconds: u64,
    min_unmodified_since: DateTime<Utc>,
}

impl UploadAuthorizer {
    pub fn new(
        signer: Arc<dyn UploadSigner>,
        codec: HashCodec,
        expires_seconds: u64,
        min_unmodified_since: DateTime<Utc>,
    ) -> Self {
        Self {
            signer,
            codec,
            expires_seconds: expires_seconds.clamp(1, MAX_PRESIGNED_EXPIRES),
            min_unmodified_since,
        }
    }

    /// Authorizer with the default window and minimum precondition date.
    pub fn with_defaults(signer: Arc<dyn UploadSigner>, codec: HashCodec) -> Self {
        Self::new(
            signer,
            codec,
            DEFAULT_EXPIRES_SECONDS,
            default_min_unmodified_since(),
        )
    }

    /// Precondition timestamp for `policy` at `now`.
    pub fn precondition(&self, policy: UploadPolicy, now: DateTime<Utc>) -> DateTime<Utc> {
        match policy {
            UploadPolicy::Error => self.min_unmodified_since,
            UploadPolicy::Overwrite => now,
        }
    }

    /// Issue an authorization for `hash` under `policy`, valid from now.
    pub async fn authorize(
        &self,
        hash: &ContentHash,
        policy: UploadPolicy,
    ) -> Result<UploadAuthorization, GatewayError> {
        self.authorize_at(hash, policy, Utc::now()).await
    }

    /// Issue an authorization as of `now`.
    pub async fn authorize_at(
        &self,
        hash: &ContentHash,
        policy: UploadPolicy,
        now: DateTime<Utc>,
    ) -> Result<UploadAuthorization, GatewayError> {
        let content_md5 = hash.to_base64().ok_or_else(|| GatewayError::InvalidHash {
            hash: hash.to_string(),
        })?;

        let unmodified_since = self.precondition(policy, now);
        let mut headers = BTreeMap::new();
        headers.insert(
            "If-Unmodified-Since".to_string(),
            httpdate::fmt_http_date(unmodified_since.into()),
        );
        headers.insert("Content-MD5".to_string(), content_md5);

        let key = self.codec.to_key(hash);
        let url = self
            .signer
            .presign_put(&key, &headers, self.expires_seconds, now)
            .await?;

        debug!("Issued {:?} upload authorization for {}", policy, hash);
        metrics::counter!(crate::metrics::AUTHORIZATIONS_ISSUED_TOTAL).increment(1);

        Ok(UploadAuthorization {
            method: "PUT".to_string(),
            url,
            headers,
            expires: now + chrono::Duration::seconds(self.expires_seconds as i64),
            md5: hash.to_string(),
        })
    }
}

/// `MIN_UNMODIFIED_SINCE_MILLIS` as a timestamp.
pub fn default_min_unmodified_since() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(MIN_UNMODIFIED_SINCE_MILLIS)
        .single()
        .unwrap_or_default()
}

// ── SigV4 signer ────────────────────────────────────────────────────

/// Presigns PUT URLs with AWS Signature Version 4 (path-style addressing).
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    scheme: String,
    authority: String,
    base_path: String,
    bucket: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
}

impl SigV4Signer {
    /// Create a signer for `bucket` behind `endpoint` (e.g. `https://host:port`).
    pub fn new(
        endpoint: &str,
        bucket: &str,
        region: &str,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> anyhow::Result<Self> {
        let uri: http::Uri = endpoint
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid signer endpoint {endpoint}: {e}"))?;
        let scheme = uri.scheme_str().unwrap_or("https").to_string();
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow::anyhow!("signer endpoint has no host: {endpoint}"))?
            .as_str()
            .to_string();
        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            bucket: bucket.trim_matches('/').to_string(),
            region: region.to_string(),
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
        })
    }

    /// URI path for `key`, before encoding.
    fn object_path(&self, key: &str) -> String {
        if self.bucket.is_empty() {
            format!("{}/{}", self.base_path, key)
        } else {
            format!("{}/{}/{}", self.base_path, self.bucket, key)
        }
    }

    /// Synchronous presign; the trait method wraps this.
    pub fn presign(
        &self,
        method: &str,
        key: &str,
        headers: &BTreeMap<String, String>,
        expires_in: u64,
        now: DateTime<Utc>,
    ) -> String {
        let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);

        // Every header the client must send is signed, host included.
        let mut signing_headers: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        signing_headers.push(("host".to_string(), self.authority.clone()));
        signing_headers.sort();
        let signed_headers = signing_headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let credential = format!("{}/{credential_scope}", self.access_key_id);
        let query = format!(
            "X-Amz-Algorithm={ALGORITHM}&X-Amz-Credential={}&X-Amz-Date={amz_date}&X-Amz-Expires={expires_in}&X-Amz-SignedHeaders={}",
            s3_uri_encode(&credential, true),
            s3_uri_encode(&signed_headers, true),
        );

        let canonical_uri = s3_uri_encode_path(&self.object_path(key));
        let canonical_request = build_canonical_request(
            method,
            &canonical_uri,
            &query,
            &signing_headers,
            &signed_headers,
            UNSIGNED_PAYLOAD,
        );
        let string_to_sign = build_string_to_sign(&amz_date, &credential_scope, &canonical_request);
        let signing_key = derive_signing_key(&self.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = compute_signature(&signing_key, &string_to_sign);

        format!(
            "{}://{}{}?{}&X-Amz-Signature={}",
            self.scheme,
            self.authority,
            canonical_uri,
            build_canonical_query_string(&query),
            signature
        )
    }
}

impl UploadSigner for SigV4Signer {
    fn presign_put(
        &self,
        key: &str,
        headers: &BTreeMap<String, String>,
        expires_in: u64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let url = self.presign("PUT", key, headers, expires_in, now);
        Box::pin(async move { Ok(url) })
    }
}

// ── Verification ────────────────────────────────────────────────────

/// Why a presigned URL was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresignRejection {
    /// Missing or malformed `X-Amz-*` parameters.
    Malformed(String),
    /// `now` is past `X-Amz-Date + X-Amz-Expires`.
    Expired,
    /// The recomputed signature differs.
    SignatureDoesNotMatch,
}

/// Verify a presigned URL the way the store would.
///
/// `headers` are the (name, value) pairs the client sends; names are matched
/// case-insensitively against `X-Amz-SignedHeaders`.
pub fn verify_presigned_url(
    method: &str,
    url: &str,
    headers: &[(String, String)],
    secret_key: &str,
    now: DateTime<Utc>,
) -> Result<(), PresignRejection> {
    let uri: http::Uri = url
        .parse()
        .map_err(|_| PresignRejection::Malformed("unparseable url".to_string()))?;
    let query_string = uri.query().unwrap_or("");
    let params = parse_query_string(query_string);

    let get = |name: &str| {
        params
            .get(name)
            .map(|v| percent_decode(v))
            .ok_or_else(|| PresignRejection::Malformed(format!("missing {name}")))
    };

    if get("X-Amz-Algorithm")? != ALGORITHM {
        return Err(PresignRejection::Malformed("unsupported algorithm".to_string()));
    }
    let credential = get("X-Amz-Credential")?;
    let cred_parts: Vec<&str> = credential.splitn(5, '/').collect();
    if cred_parts.len() != 5 || cred_parts[4] != "aws4_request" {
        return Err(PresignRejection::Malformed("bad credential".to_string()));
    }
    let amz_date = get("X-Amz-Date")?;
    let expires: u64 = get("X-Amz-Expires")?
        .parse()
        .map_err(|_| PresignRejection::Malformed("bad expires".to_string()))?;
    let signed_headers = get("X-Amz-SignedHeaders")?;
    let signature = get("X-Amz-Signature")?;

    let signed_at = parse_amz_date(&amz_date)
        .ok_or_else(|| PresignRejection::Malformed("bad date".to_string()))?;
    if now > signed_at + chrono::Duration::seconds(expires as i64) {
        return Err(PresignRejection::Expired);
    }

    let mut lowered: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();
    if !lowered.iter().any(|(k, _)| k == "host") {
        if let Some(authority) = uri.authority() {
            lowered.push(("host".to_string(), authority.as_str().to_string()));
        }
    }

    let canonical_request = build_canonical_request(
        method,
        uri.path(),
        query_string,
        &lowered,
        &signed_headers,
        UNSIGNED_PAYLOAD,
    );
    let credential_scope = cred_parts[1..].join("/");
    let string_to_sign = build_string_to_sign(&amz_date, &credential_scope, &canonical_request);
    let signing_key = derive_signing_key(secret_key, cred_parts[1], cred_parts[2], cred_parts[3]);
    let computed = compute_signature(&signing_key, &string_to_sign);

    if crate::auth::constant_time_eq(&computed, &signature) {
        Ok(())
    } else {
        Err(PresignRejection::SignatureDoesNotMatch)
    }
}

// ── Canonical request construction ──────────────────────────────────

/// Build the canonical request string.
///
/// ```text
/// HTTPMethod + '\n' +
/// CanonicalURI + '\n' +
/// CanonicalQueryString + '\n' +
/// CanonicalHeaders + '\n' +
/// SignedHeaders + '\n' +
/// HashedPayload
/// ```
pub fn build_canonical_request(
    method: &str,
    uri: &str,
    query_string: &str,
    headers: &[(String, String)],
    signed_headers_str: &str,
    payload_hash: &str,
) -> String {
    let canonical_uri = if uri.is_empty() { "/" } else { uri };
    let canonical_query = build_canonical_query_string(query_string);

    let mut canonical_headers = String::new();
    for name in signed_headers_str.split(';') {
        if let Some((hname, hval)) = headers.iter().find(|(n, _)| n == name) {
            canonical_headers.push_str(hname);
            canonical_headers.push(':');
            canonical_headers.push_str(&collapse_whitespace(hval));
            canonical_headers.push('\n');
        }
    }

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers_str}\n{payload_hash}"
    )
}

/// Build the canonical query string from a raw query string.
///
/// Parameters are decoded, re-encoded with S3 rules, sorted by name then
/// value, and joined with `&`.  `X-Amz-Signature` is excluded.
pub fn build_canonical_query_string(query_string: &str) -> String {
    let mut params: Vec<(String, String)> = query_string
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| part.split_once('=').unwrap_or((part, "")))
        .filter(|(k, _)| *k != "X-Amz-Signature")
        .map(|(k, v)| {
            (
                s3_uri_encode(&percent_decode(k), true),
                s3_uri_encode(&percent_decode(v), true),
            )
        })
        .collect();

    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the string to sign.
///
/// ```text
/// AWS4-HMAC-SHA256 + '\n' +
/// Timestamp + '\n' +
/// CredentialScope + '\n' +
/// HexEncode(SHA256(CanonicalRequest))
/// ```
pub fn build_string_to_sign(
    timestamp: &str,
    credential_scope: &str,
    canonical_request: &str,
) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{timestamp}\n{credential_scope}\n{hash}")
}

/// Derive the signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC-SHA256("AWS4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, region)
/// kService = HMAC-SHA256(kRegion, service)
/// kSigning = HMAC-SHA256(kService, "aws4_request")
/// ```
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute the signature: HexEncode(HMAC-SHA256(SigningKey, StringToSign)).
pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

// ── URI encoding ────────────────────────────────────────────────────

/// S3-compatible URI encoding (RFC 3986 with S3 exceptions).
///
/// - Characters A-Z, a-z, 0-9, -, _, ., ~ are NOT encoded.
/// - All other bytes are percent-encoded with uppercase hex.
/// - `/` is left alone unless `encode_slash` is set.
pub fn s3_uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len() * 2);
    for byte in input.bytes() {
        let ch = byte as char;
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '~') {
            encoded.push(ch);
        } else if ch == '/' && !encode_slash {
            encoded.push('/');
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// URI-encode a path, segment by segment, preserving `/`.
pub fn s3_uri_encode_path(raw_path: &str) -> String {
    let encoded = s3_uri_encode(raw_path, false);
    if encoded.starts_with('/') {
        encoded
    } else {
        format!("/{encoded}")
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse a raw query string into a map (values left encoded).
fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    percent_encoding::percent_decode_str(s)
        .decode_utf8_lossy()
        .into_owned()
}

/// Collapse consecutive whitespace in a header value to a single space,
/// and trim leading/trailing whitespace.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an X-Amz-Date string (YYYYMMDDTHHMMSSZ).
fn parse_amz_date(date: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(date, AMZ_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
    const HASH: &str = "9e107d9d372bb6826bd81d3542a419d6";

    fn signer() -> SigV4Signer {
        SigV4Signer::new(
            "https://storage.example.com",
            "blobs",
            "auto",
            "AKIDEXAMPLE",
            SECRET,
        )
        .unwrap()
    }

    fn authorizer() -> UploadAuthorizer {
        UploadAuthorizer::with_defaults(Arc::new(signer()), HashCodec::default())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap()
    }

    fn client_headers(auth: &UploadAuthorization) -> Vec<(String, String)> {
        auth.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // ── derive_signing_key ──────────────────────────────────────────

    #[test]
    fn test_derive_signing_key() {
        let key = derive_signing_key(SECRET, "20130524", "us-east-1", "s3");
        assert_eq!(key.len(), 32);

        let secret = format!("AWS4{SECRET}");
        let k_date = hmac_sha256(secret.as_bytes(), b"20130524");
        let k_region = hmac_sha256(&k_date, b"us-east-1");
        let k_service = hmac_sha256(&k_region, b"s3");
        let expected = hmac_sha256(&k_service, b"aws4_request");
        assert_eq!(key, expected);
    }

    #[test]
    fn test_derive_signing_key_different_date() {
        let key1 = derive_signing_key("secret", "20260222", "us-east-1", "s3");
        let key2 = derive_signing_key("secret", "20260223", "us-east-1", "s3");
        assert_ne!(key1, key2);
    }

    // ── s3_uri_encode ───────────────────────────────────────────────

    #[test]
    fn test_uri_encode_unreserved() {
        assert_eq!(s3_uri_encode("A-Z_a-z.0~9", true), "A-Z_a-z.0~9");
    }

    #[test]
    fn test_uri_encode_slash() {
        assert_eq!(s3_uri_encode("path/to/key", true), "path%2Fto%2Fkey");
        assert_eq!(s3_uri_encode("path/to/key", false), "path/to/key");
    }

    #[test]
    fn test_uri_encode_special() {
        assert_eq!(s3_uri_encode("foo=bar&baz", true), "foo%3Dbar%26baz");
        assert_eq!(s3_uri_encode("a;b", true), "a%3Bb");
    }

    // ── canonical query ─────────────────────────────────────────────

    #[test]
    fn test_canonical_query_sorted() {
        assert_eq!(build_canonical_query_string("z=3&a=1&m=2"), "a=1&m=2&z=3");
    }

    #[test]
    fn test_canonical_query_excludes_signature() {
        assert_eq!(
            build_canonical_query_string("a=1&X-Amz-Signature=abc&b=2"),
            "a=1&b=2"
        );
    }

    #[test]
    fn test_canonical_query_does_not_double_encode() {
        assert_eq!(
            build_canonical_query_string("cred=AK%2F2026"),
            "cred=AK%2F2026"
        );
    }

    // ── policy ──────────────────────────────────────────────────────

    #[test]
    fn test_policy_parse() {
        assert_eq!("error".parse::<UploadPolicy>(), Ok(UploadPolicy::Error));
        assert_eq!(
            "overwrite".parse::<UploadPolicy>(),
            Ok(UploadPolicy::Overwrite)
        );
        assert!("skip".parse::<UploadPolicy>().is_err());
        assert!("".parse::<UploadPolicy>().is_err());
    }

    #[test]
    fn test_precondition_dates() {
        let auth = authorizer();
        let now = fixed_now();
        assert_eq!(auth.precondition(UploadPolicy::Overwrite, now), now);
        let min = auth.precondition(UploadPolicy::Error, now);
        assert_eq!(min.timestamp_millis(), MIN_UNMODIFIED_SINCE_MILLIS);
    }

    // ── authorize ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_authorize_error_policy() {
        let hash = ContentHash::normalize(HASH);
        let auth = authorizer()
            .authorize_at(&hash, UploadPolicy::Error, fixed_now())
            .await
            .unwrap();

        assert_eq!(auth.method, "PUT");
        assert_eq!(auth.md5, HASH);
        assert_eq!(
            auth.headers.get("If-Unmodified-Since").unwrap(),
            "Tue, 28 Sep 2021 16:00:00 GMT"
        );
        assert_eq!(
            auth.headers.get("Content-MD5").unwrap(),
            &hash.to_base64().unwrap()
        );
        assert!(auth
            .url
            .starts_with(&format!("https://storage.example.com/blobs/objects/{HASH}?")));
        assert!(auth.url.contains("X-Amz-Expires=600"));
        assert!(auth
            .url
            .contains("X-Amz-SignedHeaders=content-md5%3Bhost%3Bif-unmodified-since"));
        assert_eq!(auth.expires, fixed_now() + Duration::seconds(600));
    }

    #[tokio::test]
    async fn test_authorize_overwrite_uses_now() {
        let hash = ContentHash::normalize(HASH);
        let auth = authorizer()
            .authorize_at(&hash, UploadPolicy::Overwrite, fixed_now())
            .await
            .unwrap();
        assert_eq!(
            auth.headers.get("If-Unmodified-Since").unwrap(),
            "Sun, 22 Feb 2026 12:00:00 GMT"
        );
    }

    #[tokio::test]
    async fn test_authorize_rejects_degenerate_hash() {
        let hash = ContentHash::normalize("abc");
        let err = authorizer()
            .authorize_at(&hash, UploadPolicy::Error, fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidHash { .. }));
    }

    #[tokio::test]
    async fn test_authorize_is_repeatable() {
        let hash = ContentHash::normalize(HASH);
        let a = authorizer();
        let first = a
            .authorize_at(&hash, UploadPolicy::Error, fixed_now())
            .await
            .unwrap();
        let second = a
            .authorize_at(&hash, UploadPolicy::Error, fixed_now())
            .await
            .unwrap();
        assert_eq!(first.url, second.url);
    }

    // ── verification roundtrip ──────────────────────────────────────

    #[tokio::test]
    async fn test_presigned_url_verifies() {
        let hash = ContentHash::normalize(HASH);
        let auth = authorizer()
            .authorize_at(&hash, UploadPolicy::Error, fixed_now())
            .await
            .unwrap();
        let headers = client_headers(&auth);
        let at = fixed_now() + Duration::seconds(60);
        assert_eq!(
            verify_presigned_url("PUT", &auth.url, &headers, SECRET, at),
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_presigned_url_expires_after_window() {
        let hash = ContentHash::normalize(HASH);
        let auth = authorizer()
            .authorize_at(&hash, UploadPolicy::Error, fixed_now())
            .await
            .unwrap();
        let headers = client_headers(&auth);
        let late = fixed_now() + Duration::seconds(601);
        assert_eq!(
            verify_presigned_url("PUT", &auth.url, &headers, SECRET, late),
            Err(PresignRejection::Expired)
        );
    }

    #[tokio::test]
    async fn test_presigned_url_binds_headers() {
        let hash = ContentHash::normalize(HASH);
        let auth = authorizer()
            .authorize_at(&hash, UploadPolicy::Error, fixed_now())
            .await
            .unwrap();
        let mut headers = client_headers(&auth);
        // Claiming a different digest invalidates the signature.
        for (k, v) in headers.iter_mut() {
            if k == "Content-MD5" {
                *v = "1B2M2Y8AsgTpgAmY7PhCfg==".to_string();
            }
        }
        assert_eq!(
            verify_presigned_url("PUT", &auth.url, &headers, SECRET, fixed_now()),
            Err(PresignRejection::SignatureDoesNotMatch)
        );
        // So does the wrong secret or method.
        let headers = client_headers(&auth);
        assert_eq!(
            verify_presigned_url("PUT", &auth.url, &headers, "other", fixed_now()),
            Err(PresignRejection::SignatureDoesNotMatch)
        );
        assert_eq!(
            verify_presigned_url("GET", &auth.url, &headers, SECRET, fixed_now()),
            Err(PresignRejection::SignatureDoesNotMatch)
        );
    }

    // ── misc helpers ────────────────────────────────────────────────

    #[test]
    fn test_parse_amz_date() {
        let t = parse_amz_date("20260222T120000Z").unwrap();
        assert_eq!(t, fixed_now());
        assert!(parse_amz_date("not-a-date").is_none());
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  hello   world  "), "hello world");
    }

    #[test]
    fn test_signer_rejects_hostless_endpoint() {
        assert!(SigV4Signer::new("/just/a/path", "b", "auto", "ak", "sk").is_err());
    }
}
