//! Public projections of stored objects.
//!
//! A [`StoredObject`] is exposed to clients either as its bare hash or as a
//! detail record `{uploaded, size, md5}`.  Which one is chosen by the
//! caller through [`Projection`]; both are pure functions of the descriptor.

use std::str::FromStr;

use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use utoipa::ToSchema;

use crate::hash::{md5_base64, HashCodec};
use crate::storage::backend::StoredObject;

/// Detail record for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ObjectDetail {
    /// Time the store accepted the object (RFC 3339, millisecond precision).
    #[serde(serialize_with = "serialize_uploaded")]
    #[schema(value_type = String)]
    pub uploaded: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
    /// Normalized content hash.
    pub md5: String,
}

fn serialize_uploaded<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// One entry of an object listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ListEntry {
    Hash(String),
    Detail(ObjectDetail),
}

/// Which shape a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// Bare hash strings.
    #[default]
    Md5,
    /// [`ObjectDetail`] records.
    Object,
}

impl FromStr for Projection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" | "hash" => Ok(Projection::Md5),
            "object" => Ok(Projection::Object),
            other => Err(format!("unsupported return mode: {other}")),
        }
    }
}

impl Projection {
    /// Project `obj` into the selected shape.
    pub fn project(self, codec: &HashCodec, obj: &StoredObject) -> ListEntry {
        match self {
            Projection::Md5 => ListEntry::Hash(to_hash_projection(codec, obj)),
            Projection::Object => ListEntry::Detail(to_detail_projection(codec, obj)),
        }
    }
}

/// The object's hash, recovered from its key.
pub fn to_hash_projection(codec: &HashCodec, obj: &StoredObject) -> String {
    codec.to_hash(&obj.key).as_str().to_string()
}

/// The object's `{uploaded, size, md5}` record.
pub fn to_detail_projection(codec: &HashCodec, obj: &StoredObject) -> ObjectDetail {
    ObjectDetail {
        uploaded: obj.uploaded,
        size: obj.size,
        md5: to_hash_projection(codec, obj),
    }
}

/// Response headers describing `obj` for download and head responses.
pub fn object_headers(obj: &StoredObject) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-length", HeaderValue::from(obj.size));
    let last_modified = httpdate::fmt_http_date(obj.uploaded.into());
    if let Ok(val) = HeaderValue::from_str(&last_modified) {
        headers.insert("last-modified", val);
    }
    if let Some(ref digest) = obj.md5 {
        if let Ok(val) = HeaderValue::from_str(&md5_base64(digest)) {
            headers.insert("content-md5", val);
        }
        if let Ok(val) = HeaderValue::from_str(&format!("\"{}\"", hex::encode(digest))) {
            headers.insert("etag", val);
        }
    }
    if let Some(ref ct) = obj.content_type {
        if let Ok(val) = HeaderValue::from_str(ct) {
            headers.insert("content-type", val);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> StoredObject {
        StoredObject {
            key: "objects/d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 0,
            uploaded: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            md5: Some(crate::hash::md5_digest(b"")),
            content_type: None,
        }
    }

    #[test]
    fn test_projection_parse() {
        assert_eq!("md5".parse::<Projection>(), Ok(Projection::Md5));
        assert_eq!("hash".parse::<Projection>(), Ok(Projection::Md5));
        assert_eq!("object".parse::<Projection>(), Ok(Projection::Object));
        assert!("objects".parse::<Projection>().is_err());
    }

    #[test]
    fn test_hash_projection() {
        let codec = HashCodec::default();
        let entry = Projection::Md5.project(&codec, &sample());
        assert_eq!(
            serde_json::to_value(entry).unwrap(),
            serde_json::json!("d41d8cd98f00b204e9800998ecf8427e")
        );
    }

    #[test]
    fn test_detail_projection_json() {
        let codec = HashCodec::default();
        let entry = Projection::Object.project(&codec, &sample());
        assert_eq!(
            serde_json::to_value(entry).unwrap(),
            serde_json::json!({
                "uploaded": "2024-03-01T12:30:00.000Z",
                "size": 0,
                "md5": "d41d8cd98f00b204e9800998ecf8427e",
            })
        );
    }

    #[test]
    fn test_object_headers() {
        let headers = object_headers(&sample());
        assert_eq!(headers.get("content-length").unwrap(), "0");
        assert_eq!(
            headers.get("last-modified").unwrap(),
            "Fri, 01 Mar 2024 12:30:00 GMT"
        );
        assert_eq!(
            headers.get("content-md5").unwrap(),
            "1B2M2Y8AsgTpgAmY7PhCfg=="
        );
        assert!(headers.get("content-type").is_none());
    }

    #[test]
    fn test_object_headers_without_digest() {
        let mut obj = sample();
        obj.md5 = None;
        let headers = object_headers(&obj);
        assert!(headers.get("content-md5").is_none());
        assert!(headers.get("etag").is_none());
    }
}
