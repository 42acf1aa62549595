//! Image and content-blob records from the manifest database.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::kvdb::Bucket;
use crate::schema;

/// An image record (`v1/<ns>/images/<name>`).
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub namespace: String,
    /// Image name, keyed verbatim from the bucket.
    pub name: String,
    /// Target descriptor media type, e.g.
    /// `application/vnd.docker.distribution.manifest.list.v2+json`.
    pub media_type: String,
    /// Target descriptor digest.
    pub digest: String,
    /// Target descriptor size in bytes.
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    /// True when the support-container policy matches the image basename.
    pub support_container_image: bool,
}

impl Image {
    /// Decode an image record from its bucket. The target descriptor lives
    /// in a `target` sub-bucket.
    pub fn from_bucket(namespace: &str, name: &str, bucket: &Bucket<'_>) -> Image {
        let (created_at, updated_at) = schema::read_timestamps(bucket);
        let labels = schema::read_labels(bucket);

        let target = bucket.bucket(schema::KEY_TARGET);
        let (media_type, digest, size) = match target {
            Some(t) => (
                t.get_str(schema::KEY_MEDIA_TYPE).unwrap_or_default(),
                t.get_str(schema::KEY_DIGEST).unwrap_or_default(),
                schema::read_varint(&t, schema::KEY_SIZE),
            ),
            None => (String::new(), String::new(), 0),
        };

        Image {
            namespace: namespace.to_string(),
            name: name.to_string(),
            media_type,
            digest,
            size,
            created_at,
            updated_at,
            labels,
            support_container_image: false,
        }
    }
}

/// A content-blob record (`v1/<ns>/content/blob/<digest>`).
#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub namespace: String,
    /// Blob digest; the bucket key verbatim.
    pub digest: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
}

impl Content {
    /// Decode a blob record from its bucket.
    pub fn from_bucket(namespace: &str, digest: &str, bucket: &Bucket<'_>) -> Content {
        let (created_at, updated_at) = schema::read_timestamps(bucket);
        Content {
            namespace: namespace.to_string(),
            digest: digest.to_string(),
            size: schema::read_varint(bucket, schema::KEY_SIZE),
            created_at,
            updated_at,
            labels: schema::read_labels(bucket),
        }
    }
}
