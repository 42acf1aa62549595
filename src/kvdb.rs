//! Read-only access to bolt-format key/value databases.
//!
//! containerd stores its metadata in single-file B+-tree databases (bbolt
//! format): `meta.db` for the manifest store and `metadata.db` for the
//! snapshotter store. On a dead disk there is no daemon to query, so this
//! module parses the file format directly.
//!
//! # File format
//!
//! The file is an array of fixed-size pages. Pages 0 and 1 are meta pages
//! (magic `0xED0CDAED`, format version 2); the valid meta page with the
//! highest transaction id points at the root bucket. Branch pages hold
//! `(pos, ksize, pgid)` elements, leaf pages hold `(flags, pos, ksize,
//! vsize)` elements, and small buckets are stored *inline*: the bucket's
//! value bytes contain a bucket header followed by a serialized leaf page.
//!
//! # Semantics
//!
//! - [`KvDb::open`] reads the whole file into memory and validates the meta
//!   pages. Forensic images are not live databases, so the meta checksum is
//!   not enforced; magic and version are.
//! - [`KvDb::view`] yields a read snapshot ([`Tx`]) from which buckets are
//!   traversed by key path and iterated in key-byte-lexicographic order.
//! - Traversal misses are absences, not errors: a missing key, a leaf where
//!   a bucket is expected, or a bucket where a leaf is expected all yield
//!   `None`. Structurally damaged pages are also treated as absent rather
//!   than failing the whole read.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{ExplorerError, Result};

const MAGIC: u32 = 0xED0C_DAED;
const VERSION: u32 = 2;

const PAGE_HEADER_SIZE: usize = 16;
const ELEMENT_SIZE: usize = 16;
const BUCKET_HEADER_SIZE: usize = 16;

const FLAG_BRANCH_PAGE: u16 = 0x01;
const FLAG_LEAF_PAGE: u16 = 0x02;
const FLAG_META_PAGE: u16 = 0x04;

/// Leaf element flag marking the value as a nested bucket.
const FLAG_BUCKET_LEAF: u32 = 0x01;

/// Page sizes probed when the first meta page is damaged and the page size
/// cannot be read from it.
const PROBE_PAGE_SIZES: [usize; 7] = [1024, 2048, 4096, 8192, 16384, 32768, 65536];

/// Tree traversal depth cap. Bolt trees are shallow; anything deeper on an
/// untrusted disk indicates page-level corruption or a crafted loop.
const MAX_DEPTH: usize = 100;

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    data.get(off..off + 8).map(|b| {
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

/// Meta page contents needed by a read-only view.
#[derive(Debug, Clone, Copy)]
struct MetaPage {
    page_size: usize,
    root: u64,
    txid: u64,
}

impl MetaPage {
    /// Parse and validate the meta struct at the start of a page's data
    /// area. Returns `None` if the bytes do not carry a valid meta.
    fn parse(page: &[u8]) -> Option<MetaPage> {
        let flags = read_u16(page, 8)?;
        if flags & FLAG_META_PAGE == 0 {
            return None;
        }
        let body = PAGE_HEADER_SIZE;
        if read_u32(page, body)? != MAGIC {
            return None;
        }
        if read_u32(page, body + 4)? != VERSION {
            return None;
        }
        let page_size = read_u32(page, body + 8)? as usize;
        if page_size < 512 {
            return None;
        }
        // meta layout: magic, version, pageSize, flags, root{pgid, sequence},
        // freelist, high-water pgid, txid, checksum
        let root = read_u64(page, body + 16)?;
        let txid = read_u64(page, body + 48)?;
        Some(MetaPage {
            page_size,
            root,
            txid,
        })
    }
}

/// Read-only handle to a bolt database file.
///
/// The whole file is read into memory at open time; metadata databases on
/// captured disks are small (megabytes). The handle holds a shared advisory
/// lock for its lifetime so a live writer elsewhere is detected rather than
/// raced.
#[derive(Debug)]
pub struct KvDb {
    path: PathBuf,
    data: Vec<u8>,
    page_size: usize,
    root: u64,
    // Keeps the shared flock alive until the handle is dropped.
    _file: File,
}

impl KvDb {
    /// Open a database file read-only.
    ///
    /// # Errors
    ///
    /// - [`ExplorerError::InputMissing`] when the path does not exist
    /// - [`ExplorerError::DbLocked`] when an exclusive lock is held on it
    /// - [`ExplorerError::DbInvalid`] when the magic/version check fails
    /// - [`ExplorerError::Io`] for any other read failure
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| ExplorerError::io(&path, e))?;

        #[cfg(unix)]
        {
            use rustix::fs::{flock, FlockOperation};
            if let Err(e) = flock(&file, FlockOperation::NonBlockingLockShared) {
                if e == rustix::io::Errno::WOULDBLOCK || e == rustix::io::Errno::AGAIN {
                    return Err(ExplorerError::DbLocked(path));
                }
                // Lock failures on odd filesystems are not fatal for a
                // read-only view of a captured image.
                tracing::debug!(path = %path.display(), error = %e, "flock unavailable");
            }
        }

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| ExplorerError::io(&path, e))?;

        let meta = Self::select_meta(&data).ok_or_else(|| ExplorerError::DbInvalid {
            path: path.clone(),
            reason: "no valid meta page (magic/version mismatch)".into(),
        })?;

        Ok(KvDb {
            path,
            data,
            page_size: meta.page_size,
            root: meta.root,
            _file: file,
        })
    }

    /// Pick the valid meta page with the highest transaction id.
    fn select_meta(data: &[u8]) -> Option<MetaPage> {
        let mut best: Option<MetaPage> = None;

        let meta0 = MetaPage::parse(data);
        if let Some(m) = meta0 {
            best = Some(m);
            // Page 1 lives page_size bytes in.
            if let Some(m1) = data.get(m.page_size..).and_then(MetaPage::parse) {
                if m1.txid > m.txid {
                    best = Some(m1);
                }
            }
        } else {
            // First meta page damaged: probe common page sizes for the
            // second one.
            for ps in PROBE_PAGE_SIZES {
                if let Some(m1) = data.get(ps..).and_then(MetaPage::parse) {
                    if m1.page_size == ps {
                        best = Some(m1);
                        break;
                    }
                }
            }
        }

        best
    }

    /// Path this database was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure within a read snapshot of the database.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = Tx { db: self };
        f(&tx)
    }

    /// Release the handle. Dropping has the same effect; this exists so the
    /// release point can be made explicit.
    pub fn close(self) {}

    /// Resolve a page id to its bytes, including overflow pages.
    fn page(&self, id: u64) -> Option<&[u8]> {
        let start = usize::try_from(id.checked_mul(self.page_size as u64)?).ok()?;
        let overflow = read_u32(&self.data, start.checked_add(12)?)? as usize;
        let pages = overflow.checked_add(1)?;
        let end = start.checked_add(pages.checked_mul(self.page_size)?)?;
        self.data.get(start..end.min(self.data.len()))
    }
}

/// A read snapshot of an open database.
#[derive(Debug, Clone, Copy)]
pub struct Tx<'d> {
    db: &'d KvDb,
}

impl<'d> Tx<'d> {
    /// The root bucket of the database.
    pub fn root(&self) -> Bucket<'d> {
        Bucket {
            db: self.db,
            node: Node::Page(self.db.root),
        }
    }

    /// Look up a top-level bucket by name.
    pub fn bucket(&self, name: &[u8]) -> Option<Bucket<'d>> {
        self.root().bucket(name)
    }

    /// Resolve a nested bucket path, returning `None` if any component is
    /// absent or is a plain key.
    pub fn bucket_path(&self, path: &[&[u8]]) -> Option<Bucket<'d>> {
        let mut bucket = self.root();
        for name in path {
            bucket = bucket.bucket(name)?;
        }
        Some(bucket)
    }
}

/// How a bucket's entries are stored.
#[derive(Debug, Clone, Copy)]
enum Node<'d> {
    /// Rooted at a real page.
    Page(u64),
    /// Inline bucket: a serialized leaf page inside the parent's value.
    Inline(&'d [u8]),
}

/// An ordered map of `key -> (value | nested bucket)` inside a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Bucket<'d> {
    db: &'d KvDb,
    node: Node<'d>,
}

/// A single bucket entry yielded during iteration.
#[derive(Debug)]
pub enum Entry<'d> {
    /// A plain key/value pair.
    Leaf(&'d [u8], &'d [u8]),
    /// A nested bucket.
    Nested(&'d [u8], Bucket<'d>),
}

impl<'d> Entry<'d> {
    /// The entry's key bytes.
    pub fn key(&self) -> &'d [u8] {
        match self {
            Entry::Leaf(k, _) => *k,
            Entry::Nested(k, _) => *k,
        }
    }
}

impl<'d> Bucket<'d> {
    fn root_page(&self) -> Option<&'d [u8]> {
        match self.node {
            Node::Page(id) => self.db.page(id),
            Node::Inline(page) => Some(page),
        }
    }

    /// Get the value stored under `key`, descending branch pages as needed.
    ///
    /// Returns `None` for a missing key and for a key that holds a nested
    /// bucket rather than a value.
    pub fn get(&self, key: &[u8]) -> Option<&'d [u8]> {
        match self.find(key)? {
            Entry::Leaf(_, v) => Some(v),
            Entry::Nested(..) => None,
        }
    }

    /// Get the value stored under `key`, decoded as UTF-8.
    pub fn get_str(&self, key: &[u8]) -> Option<String> {
        self.get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Get the nested bucket stored under `key`.
    ///
    /// Returns `None` for a missing key and for a key that holds a plain
    /// value rather than a bucket.
    pub fn bucket(&self, key: &[u8]) -> Option<Bucket<'d>> {
        match self.find(key)? {
            Entry::Nested(_, b) => Some(b),
            Entry::Leaf(..) => None,
        }
    }

    /// Locate the entry for `key`.
    fn find(&self, key: &[u8]) -> Option<Entry<'d>> {
        let mut page = self.root_page()?;
        for _ in 0..MAX_DEPTH {
            let flags = read_u16(page, 8)?;
            let count = read_u16(page, 10)? as usize;
            if flags & FLAG_LEAF_PAGE != 0 {
                for i in 0..count {
                    let entry = leaf_entry(self.db, page, i)?;
                    match entry.key().cmp(key) {
                        std::cmp::Ordering::Equal => return Some(entry),
                        std::cmp::Ordering::Greater => return None,
                        std::cmp::Ordering::Less => continue,
                    }
                }
                return None;
            } else if flags & FLAG_BRANCH_PAGE != 0 {
                // Descend into the rightmost child whose first key is <= key.
                let mut child: Option<u64> = None;
                for i in 0..count {
                    let (elem_key, pgid) = branch_entry(page, i)?;
                    if elem_key <= key {
                        child = Some(pgid);
                    } else {
                        break;
                    }
                }
                page = self.db.page(child?)?;
            } else {
                return None;
            }
        }
        tracing::warn!("bucket traversal exceeded depth limit; treating key as absent");
        None
    }

    /// Iterate the bucket's entries in key-byte-lexicographic order.
    pub fn iter(&self) -> BucketIter<'d> {
        let stack = match self.root_page() {
            Some(page) => vec![Frame { page, index: 0 }],
            None => Vec::new(),
        };
        BucketIter {
            db: self.db,
            stack,
        }
    }
}

struct Frame<'d> {
    page: &'d [u8],
    index: usize,
}

/// In-order iterator over a bucket's entries.
pub struct BucketIter<'d> {
    db: &'d KvDb,
    stack: Vec<Frame<'d>>,
}

impl<'d> Iterator for BucketIter<'d> {
    type Item = Entry<'d>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            let page = frame.page;
            let flags = read_u16(page, 8)?;
            let count = read_u16(page, 10)? as usize;

            if frame.index >= count {
                self.stack.pop();
                continue;
            }
            let i = frame.index;
            frame.index += 1;

            if flags & FLAG_LEAF_PAGE != 0 {
                match leaf_entry(self.db, page, i) {
                    Some(entry) => return Some(entry),
                    None => continue,
                }
            } else if flags & FLAG_BRANCH_PAGE != 0 {
                if self.stack.len() >= MAX_DEPTH {
                    tracing::warn!("bucket iteration exceeded depth limit; truncating");
                    self.stack.clear();
                    return None;
                }
                let (_, pgid) = branch_entry(page, i)?;
                match self.db.page(pgid) {
                    Some(child) => self.stack.push(Frame {
                        page: child,
                        index: 0,
                    }),
                    None => continue,
                }
            } else {
                self.stack.pop();
            }
        }
    }
}

/// Decode leaf element `i` of `page` into an [`Entry`].
fn leaf_entry<'d>(db: &'d KvDb, page: &'d [u8], i: usize) -> Option<Entry<'d>> {
    let elem = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
    let flags = read_u32(page, elem)?;
    let pos = read_u32(page, elem + 4)? as usize;
    let ksize = read_u32(page, elem + 8)? as usize;
    let vsize = read_u32(page, elem + 12)? as usize;

    let key_start = elem.checked_add(pos)?;
    let key = page.get(key_start..key_start.checked_add(ksize)?)?;
    let val_start = key_start + ksize;
    let value = page.get(val_start..val_start.checked_add(vsize)?)?;

    if flags & FLAG_BUCKET_LEAF != 0 {
        let root = read_u64(value, 0)?;
        let node = if root == 0 {
            // Inline bucket: a leaf page follows the bucket header.
            Node::Inline(value.get(BUCKET_HEADER_SIZE..)?)
        } else {
            Node::Page(root)
        };
        Some(Entry::Nested(key, Bucket { db, node }))
    } else {
        Some(Entry::Leaf(key, value))
    }
}

/// Decode branch element `i` of `page` into `(first_key, child_pgid)`.
fn branch_entry(page: &[u8], i: usize) -> Option<(&[u8], u64)> {
    let elem = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
    let pos = read_u32(page, elem)? as usize;
    let ksize = read_u32(page, elem + 4)? as usize;
    let pgid = read_u64(page, elem + 8)?;

    let key_start = elem.checked_add(pos)?;
    let key = page.get(key_start..key_start.checked_add(ksize)?)?;
    Some((key, pgid))
}
