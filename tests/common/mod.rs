//! Test fixtures: synthesized bolt databases and on-disk layouts.
//!
//! The fixture builder writes real bolt-format files (meta pages, a leaf
//! root page, inline nested buckets) so the whole read path is exercised
//! against the genuine format, without needing a live containerd.

// Each test binary compiles this module independently and uses a subset.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use prost::Message;

/// Page size declared in the fixture's meta pages. Large enough that every
/// nested bucket fits inline under a single root leaf page.
const PAGE_SIZE: usize = 16384;

const FLAG_LEAF_PAGE: u16 = 0x02;
const FLAG_META_PAGE: u16 = 0x04;
const FLAG_FREELIST_PAGE: u16 = 0x10;
const FLAG_BUCKET_LEAF: u32 = 0x01;

const MAGIC: u32 = 0xED0C_DAED;
const VERSION: u32 = 2;

/// A bucket under construction: ordered `key -> (value | nested bucket)`.
#[derive(Debug, Default)]
pub struct FixtureBucket {
    entries: BTreeMap<Vec<u8>, FixtureValue>,
}

#[derive(Debug)]
enum FixtureValue {
    Leaf(Vec<u8>),
    Bucket(FixtureBucket),
}

impl FixtureBucket {
    pub fn new() -> FixtureBucket {
        FixtureBucket::default()
    }

    /// Insert a plain key/value pair.
    pub fn leaf(&mut self, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.entries
            .insert(key.as_ref().to_vec(), FixtureValue::Leaf(value.into()));
        self
    }

    /// Get or create a nested bucket.
    pub fn bucket(&mut self, key: impl AsRef<[u8]>) -> &mut FixtureBucket {
        let entry = self
            .entries
            .entry(key.as_ref().to_vec())
            .or_insert_with(|| FixtureValue::Bucket(FixtureBucket::new()));
        match entry {
            FixtureValue::Bucket(b) => b,
            FixtureValue::Leaf(_) => panic!("fixture key holds a leaf, not a bucket"),
        }
    }

    /// Serialize as a leaf page (page header + elements + data), unpadded.
    fn to_leaf_page(&self, page_id: u64) -> Vec<u8> {
        let serialized: Vec<(Vec<u8>, Vec<u8>, bool)> = self
            .entries
            .iter()
            .map(|(k, v)| match v {
                FixtureValue::Leaf(data) => (k.clone(), data.clone(), false),
                FixtureValue::Bucket(b) => (k.clone(), b.to_inline_value(), true),
            })
            .collect();

        let count = serialized.len();
        let mut data_size = 0;
        for (k, v, _) in &serialized {
            data_size += k.len() + v.len();
        }

        let mut page = vec![0u8; 16 + count * 16 + data_size];
        page[0..8].copy_from_slice(&page_id.to_le_bytes());
        page[8..10].copy_from_slice(&FLAG_LEAF_PAGE.to_le_bytes());
        page[10..12].copy_from_slice(&(count as u16).to_le_bytes());

        let mut data_off = 16 + count * 16;
        for (i, (k, v, is_bucket)) in serialized.iter().enumerate() {
            let elem = 16 + i * 16;
            let flags: u32 = if *is_bucket { FLAG_BUCKET_LEAF } else { 0 };
            page[elem..elem + 4].copy_from_slice(&flags.to_le_bytes());
            page[elem + 4..elem + 8].copy_from_slice(&((data_off - elem) as u32).to_le_bytes());
            page[elem + 8..elem + 12].copy_from_slice(&(k.len() as u32).to_le_bytes());
            page[elem + 12..elem + 16].copy_from_slice(&(v.len() as u32).to_le_bytes());
            page[data_off..data_off + k.len()].copy_from_slice(k);
            data_off += k.len();
            page[data_off..data_off + v.len()].copy_from_slice(v);
            data_off += v.len();
        }
        page
    }

    /// Serialize as an inline bucket value: zeroed bucket header (root
    /// page id 0 marks the inline form) followed by a leaf page.
    fn to_inline_value(&self) -> Vec<u8> {
        let mut value = vec![0u8; 16];
        value.extend_from_slice(&self.to_leaf_page(0));
        value
    }
}

fn meta_page(page_id: u64, root: u64, txid: u64) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    page[0..8].copy_from_slice(&page_id.to_le_bytes());
    page[8..10].copy_from_slice(&FLAG_META_PAGE.to_le_bytes());
    let b = 16;
    page[b..b + 4].copy_from_slice(&MAGIC.to_le_bytes());
    page[b + 4..b + 8].copy_from_slice(&VERSION.to_le_bytes());
    page[b + 8..b + 12].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
    page[b + 16..b + 24].copy_from_slice(&root.to_le_bytes()); // root bucket pgid
    page[b + 32..b + 40].copy_from_slice(&3u64.to_le_bytes()); // freelist pgid
    page[b + 40..b + 48].copy_from_slice(&4u64.to_le_bytes()); // high-water pgid
    page[b + 48..b + 56].copy_from_slice(&txid.to_le_bytes());
    page
}

/// Write a four-page bolt database whose root bucket holds `root`.
pub fn write_bolt_db(path: &Path, root: &FixtureBucket) {
    let mut file = Vec::with_capacity(PAGE_SIZE * 4);
    file.extend_from_slice(&meta_page(0, 2, 0));
    file.extend_from_slice(&meta_page(1, 2, 1));

    let mut root_page = root.to_leaf_page(2);
    assert!(
        root_page.len() <= PAGE_SIZE,
        "fixture exceeds one page ({} bytes); raise PAGE_SIZE",
        root_page.len()
    );
    root_page.resize(PAGE_SIZE, 0);
    file.extend_from_slice(&root_page);

    let mut freelist = vec![0u8; PAGE_SIZE];
    freelist[0..8].copy_from_slice(&3u64.to_le_bytes());
    freelist[8..10].copy_from_slice(&FLAG_FREELIST_PAGE.to_le_bytes());
    file.extend_from_slice(&freelist);

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, file).unwrap();
}

/// LEB128-encode an unsigned varint the way the databases store sizes,
/// ids and kinds.
pub fn varint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

/// Encode an OCI runtime spec JSON document as the protobuf `Any` wrapper
/// containerd stores.
pub fn any_spec(json: &str) -> Vec<u8> {
    prost_types::Any {
        type_url: "types.containerd.io/opencontainers/runtime-spec/1/Spec".to_string(),
        value: json.as_bytes().to_vec(),
    }
    .encode_to_vec()
}

/// Populate a meta.db snapshot node.
pub fn snapshot_node(bucket: &mut FixtureBucket, name: &str, parent: &str) {
    bucket.leaf("name", name.as_bytes().to_vec());
    bucket.leaf("parent", parent.as_bytes().to_vec());
    bucket.leaf("createdat", b"2023-04-01T10:00:00.000000000Z".to_vec());
    bucket.leaf("updatedat", b"2023-04-01T10:00:00.000000000Z".to_vec());
}

/// Command executor that records argv and replays canned stdout, for
/// asserting the privileged command surface without running anything.
/// Clones share the call log, so a clone can be handed to an explorer
/// while the original stays behind for assertions.
#[derive(Default, Clone)]
pub struct RecordingExecutor {
    calls: std::sync::Arc<Mutex<Vec<Vec<String>>>>,
    pub stdout: BTreeMap<String, String>,
}

impl RecordingExecutor {
    pub fn argv_log(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl coldctr::CommandExecutor for RecordingExecutor {
    fn execute(&self, program: &str, args: &[&str]) -> coldctr::Result<coldctr::CommandOutput> {
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        self.calls.lock().unwrap().push(argv);
        Ok(coldctr::CommandOutput {
            stdout: self.stdout.get(program).cloned().unwrap_or_default(),
            stderr: String::new(),
        })
    }
}
