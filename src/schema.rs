//! Bucket vocabulary and value decoders for containerd metadata.
//!
//! containerd partitions its manifest database under a version envelope:
//!
//! ```text
//! v1/<namespace>/containers/<id>            container record
//! v1/<namespace>/images/<name>              image record
//! v1/<namespace>/content/blob/<digest>      blob metadata
//! v1/<namespace>/snapshots/<snapshotter>/<key>   snapshot node (meta.db)
//! v1/snapshots/<key>                        snapshot node (metadata.db)
//! ```
//!
//! The snapshotter database (`metadata.db`) reuses the same envelope but is
//! not namespace-partitioned.
//!
//! Value encodings: timestamps are RFC3339 text with nanosecond precision,
//! sizes/ids/kinds are unsigned varints, labels are a sub-bucket of
//! `key -> value` pairs, and the container runtime spec is a protobuf `Any`
//! wrapping JSON.
//!
//! Everything here is a pure function over an open [`Bucket`]; no I/O.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use prost::Message;

use crate::kvdb::{Bucket, Entry, Tx};

// Envelope and object buckets.
pub const BUCKET_VERSION: &[u8] = b"v1";
pub const BUCKET_CONTAINERS: &[u8] = b"containers";
pub const BUCKET_IMAGES: &[u8] = b"images";
pub const BUCKET_CONTENT: &[u8] = b"content";
pub const BUCKET_BLOB: &[u8] = b"blob";
pub const BUCKET_SNAPSHOTS: &[u8] = b"snapshots";
pub const BUCKET_LEASES: &[u8] = b"leases";

// Per-entry field keys.
pub const KEY_CREATED_AT: &[u8] = b"createdat";
pub const KEY_UPDATED_AT: &[u8] = b"updatedat";
pub const KEY_LABELS: &[u8] = b"labels";
pub const KEY_IMAGE: &[u8] = b"image";
pub const KEY_SNAPSHOTTER: &[u8] = b"snapshotter";
pub const KEY_SNAPSHOT_KEY: &[u8] = b"snapshotKey";
pub const KEY_NAME: &[u8] = b"name";
pub const KEY_PARENT: &[u8] = b"parent";
pub const KEY_CHILDREN: &[u8] = b"children";
pub const KEY_SIZE: &[u8] = b"size";
pub const KEY_ID: &[u8] = b"id";
pub const KEY_KIND: &[u8] = b"kind";
pub const KEY_SPEC: &[u8] = b"spec";
pub const KEY_RUNTIME: &[u8] = b"runtime";
pub const KEY_EXTENSIONS: &[u8] = b"extensions";
pub const KEY_DIGEST: &[u8] = b"digest";
pub const KEY_MEDIA_TYPE: &[u8] = b"mediatype";
pub const KEY_TARGET: &[u8] = b"target";

/// Decode an unsigned varint (LEB128, as Go's `binary.Uvarint`).
///
/// Returns `None` on truncated or over-long input.
pub fn decode_varint(data: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for &byte in data {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

/// Decode a varint field of a bucket, defaulting to 0 when absent or
/// malformed (matching the tolerant reads of the live implementation).
pub fn read_varint(bucket: &Bucket<'_>, key: &[u8]) -> u64 {
    bucket
        .get(key)
        .and_then(decode_varint)
        .unwrap_or(0)
}

/// Parse an RFC3339-nanosecond timestamp value.
pub fn decode_timestamp(data: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(data).ok()?;
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read the `createdat` / `updatedat` pair of a record bucket.
pub fn read_timestamps(bucket: &Bucket<'_>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let created = bucket.get(KEY_CREATED_AT).and_then(decode_timestamp);
    let updated = bucket.get(KEY_UPDATED_AT).and_then(decode_timestamp);
    (created, updated)
}

/// Read the `labels` sub-bucket of a record into a map.
///
/// Label keys are unique within a record, so a map loses nothing; a
/// `BTreeMap` keeps serialized output deterministic.
pub fn read_labels(bucket: &Bucket<'_>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some(lbkt) = bucket.bucket(KEY_LABELS) {
        for entry in lbkt.iter() {
            if let Entry::Leaf(k, v) = entry {
                labels.insert(
                    String::from_utf8_lossy(k).into_owned(),
                    String::from_utf8_lossy(v).into_owned(),
                );
            }
        }
    }
    labels
}

/// Decode a protobuf `Any` wrapper into `(type_url, value)`.
pub fn decode_any(data: &[u8]) -> Option<(String, Vec<u8>)> {
    let any = prost_types::Any::decode(data).ok()?;
    Some((any.type_url, any.value))
}

/// Enumerate the namespaces of a manifest database view: every top-level
/// child bucket of the version envelope.
pub fn namespaces(tx: &Tx<'_>) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(v1) = tx.bucket(BUCKET_VERSION) {
        for entry in v1.iter() {
            if let Entry::Nested(name, _) = entry {
                out.push(String::from_utf8_lossy(name).into_owned());
            }
        }
    }
    out
}

/// `v1/<ns>/containers`
pub fn containers_bucket<'d>(tx: &Tx<'d>, ns: &str) -> Option<Bucket<'d>> {
    tx.bucket_path(&[BUCKET_VERSION, ns.as_bytes(), BUCKET_CONTAINERS])
}

/// `v1/<ns>/images`
pub fn images_bucket<'d>(tx: &Tx<'d>, ns: &str) -> Option<Bucket<'d>> {
    tx.bucket_path(&[BUCKET_VERSION, ns.as_bytes(), BUCKET_IMAGES])
}

/// `v1/<ns>/content/blob`
pub fn blobs_bucket<'d>(tx: &Tx<'d>, ns: &str) -> Option<Bucket<'d>> {
    tx.bucket_path(&[BUCKET_VERSION, ns.as_bytes(), BUCKET_CONTENT, BUCKET_BLOB])
}

/// `v1/<ns>/snapshots`
pub fn snapshotters_bucket<'d>(tx: &Tx<'d>, ns: &str) -> Option<Bucket<'d>> {
    tx.bucket_path(&[BUCKET_VERSION, ns.as_bytes(), BUCKET_SNAPSHOTS])
}

/// `v1/<ns>/snapshots/<snapshotter>/<key>`
pub fn snapshot_key_bucket<'d>(
    tx: &Tx<'d>,
    ns: &str,
    snapshotter: &str,
    key: &str,
) -> Option<Bucket<'d>> {
    tx.bucket_path(&[
        BUCKET_VERSION,
        ns.as_bytes(),
        BUCKET_SNAPSHOTS,
        snapshotter.as_bytes(),
        key.as_bytes(),
    ])
}

/// `v1/snapshots/<name>` in the snapshotter database (metadata.db).
pub fn snapshotter_snapshot_bucket<'d>(tx: &Tx<'d>, name: &str) -> Option<Bucket<'d>> {
    tx.bucket_path(&[BUCKET_VERSION, BUCKET_SNAPSHOTS, name.as_bytes()])
}
