//! Content-addressed file archive.
//!
//! A shared file is chunked into 8000-byte blocks; the block list is the
//! concatenation of each block's SHA-1 digest, and the file's content
//! address is the SHA-1 of that block list (the metafile hash). Files live
//! in one of three custody maps: shared locally, owned as a DHT primary, or
//! held as a redundant copy for the ring successor.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use murmur_core::{sha1_digest, ShaDigest, CHUNK_SIZE, DIGEST_LEN};
use tracing::debug;

use crate::StoreError;

/// Kilobytes of DHT budget one block occupies.
const BLOCK_COST_KB: u64 = 8;

/// A file whose blocks this node can serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    /// Logical filename (no directory, no download prefix).
    pub name: String,
    /// Where the bytes live on disk.
    pub path: PathBuf,
    /// Total size in bytes.
    pub size: u64,
    /// Concatenated 20-byte SHA-1 digests of each 8000-byte block.
    pub block_list: Vec<u8>,
    /// SHA-1 of the block list; the file's content address.
    pub metafile_hash: ShaDigest,
}

impl SharedFile {
    /// Chunks and hashes a file on disk.
    ///
    /// The logical name is the final path component.
    pub fn scan(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let mut block_list = Vec::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = read_up_to(&mut file, &mut buf)?;
            if read == 0 {
                break;
            }
            size += read as u64;
            block_list.extend_from_slice(sha1_digest(&buf[..read]).as_slice());
        }

        let metafile_hash = sha1_digest(&block_list);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!(name = %name, size, hash = %metafile_hash, "scanned file");
        Ok(Self {
            name,
            path,
            size,
            block_list,
            metafile_hash,
        })
    }

    /// Rebuilds a description from a received block list.
    pub fn from_block_list(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        size: u64,
        block_list: Vec<u8>,
    ) -> Result<Self, StoreError> {
        if block_list.len() % DIGEST_LEN != 0 {
            return Err(StoreError::MalformedBlockList(block_list.len()));
        }
        let metafile_hash = sha1_digest(&block_list);
        Ok(Self {
            name: name.into(),
            path: path.into(),
            size,
            block_list,
            metafile_hash,
        })
    }

    /// Number of blocks in the file.
    pub fn block_count(&self) -> usize {
        self.block_list.len() / DIGEST_LEN
    }

    /// The digest of block `index`, if in range.
    pub fn block_hash(&self, index: usize) -> Option<ShaDigest> {
        let start = index * DIGEST_LEN;
        ShaDigest::from_slice(self.block_list.get(start..start + DIGEST_LEN)?)
    }

    /// Reads block `index` (at most 8000 bytes) from disk.
    pub fn read_block(&self, index: usize) -> Result<Vec<u8>, StoreError> {
        if index >= self.block_count() {
            return Err(StoreError::BlockOutOfRange {
                index,
                blocks: self.block_count(),
            });
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start((index * CHUNK_SIZE) as u64))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let read = read_up_to(&mut file, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Kilobytes this file costs against the DHT budget: one unit per
    /// block plus one for the metafile.
    pub fn storage_cost_kb(&self) -> u64 {
        (self.block_count() as u64 + 1) * BLOCK_COST_KB
    }
}

/// Reads until the buffer is full or the file ends.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize, StoreError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Which custody map a file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Shared by the local user.
    Local,
    /// Owned by this node's DHT interval.
    DhtPrimary,
    /// Redundant copy held for the ring successor.
    DhtRedundant,
}

/// The three custody maps plus the DHT recency list.
#[derive(Debug, Default)]
pub struct FileArchive {
    local: BTreeMap<String, SharedFile>,
    dht_primary: BTreeMap<String, SharedFile>,
    dht_redundant: BTreeMap<String, SharedFile>,
    /// DHT-resident filenames, most recently touched first.
    recent: VecDeque<String>,
}

impl FileArchive {
    /// Creates an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: ArchiveKind) -> &BTreeMap<String, SharedFile> {
        match kind {
            ArchiveKind::Local => &self.local,
            ArchiveKind::DhtPrimary => &self.dht_primary,
            ArchiveKind::DhtRedundant => &self.dht_redundant,
        }
    }

    fn map_mut(&mut self, kind: ArchiveKind) -> &mut BTreeMap<String, SharedFile> {
        match kind {
            ArchiveKind::Local => &mut self.local,
            ArchiveKind::DhtPrimary => &mut self.dht_primary,
            ArchiveKind::DhtRedundant => &mut self.dht_redundant,
        }
    }

    /// Inserts a file into a custody map.
    ///
    /// A file entering one DHT map is removed from the other, so a name
    /// never appears in both. Local re-shares keep the first entry. DHT
    /// inserts count as a touch on the recency list. Returns the file the
    /// insert displaced from the other DHT map, if any.
    pub fn insert(&mut self, kind: ArchiveKind, file: SharedFile) -> Option<SharedFile> {
        let name = file.name.clone();
        let displaced = match kind {
            ArchiveKind::Local => {
                if self.local.contains_key(&name) {
                    debug!(name = %name, "file already in local archive");
                    return None;
                }
                self.local.insert(name, file);
                return None;
            }
            ArchiveKind::DhtPrimary => {
                let other = self.dht_redundant.remove(&name);
                self.dht_primary.insert(name.clone(), file);
                other
            }
            ArchiveKind::DhtRedundant => {
                let other = self.dht_primary.remove(&name);
                self.dht_redundant.insert(name.clone(), file);
                other
            }
        };
        self.touch(&name);
        displaced
    }

    /// Fetches a file from one custody map.
    pub fn get(&self, kind: ArchiveKind, name: &str) -> Option<&SharedFile> {
        self.map(kind).get(name)
    }

    /// Returns true when the name is present in the given map.
    pub fn contains(&self, kind: ArchiveKind, name: &str) -> bool {
        self.map(kind).contains_key(name)
    }

    /// Removes a file from one custody map.
    pub fn remove(&mut self, kind: ArchiveKind, name: &str) -> Option<SharedFile> {
        let removed = self.map_mut(kind).remove(name);
        if removed.is_some() && !matches!(kind, ArchiveKind::Local) {
            self.recent.retain(|n| n != name);
        }
        removed
    }

    /// Iterates one custody map's files.
    pub fn files(&self, kind: ArchiveKind) -> impl Iterator<Item = &SharedFile> {
        self.map(kind).values()
    }

    /// Drains the redundancy archive, returning its files.
    pub fn clear_redundant(&mut self) -> Vec<SharedFile> {
        let drained: Vec<SharedFile> = std::mem::take(&mut self.dht_redundant).into_values().collect();
        for file in &drained {
            self.recent.retain(|n| n != &file.name);
        }
        drained
    }

    /// Moves a DHT-resident name to the head of the recency list.
    pub fn touch(&mut self, name: &str) {
        self.recent.retain(|n| n != name);
        self.recent.push_front(name.to_string());
    }

    /// Content-addressed block lookup.
    ///
    /// Searches DHT-primary, then redundant, then local custody. A file
    /// whose metafile hash matches answers with its block list; otherwise
    /// the block list is scanned at digest strides and a matching stride
    /// answers with that block read from disk. Returns empty bytes when
    /// nothing matches. A hit on a DHT-held file refreshes its recency.
    pub fn find_block(&mut self, request: &ShaDigest) -> Result<Vec<u8>, StoreError> {
        for kind in [
            ArchiveKind::DhtPrimary,
            ArchiveKind::DhtRedundant,
            ArchiveKind::Local,
        ] {
            let mut hit: Option<(String, Option<usize>)> = None;
            for file in self.map(kind).values() {
                if file.metafile_hash == *request {
                    hit = Some((file.name.clone(), None));
                    break;
                }
                if let Some(index) = (0..file.block_count())
                    .find(|&i| file.block_hash(i).as_ref() == Some(request))
                {
                    hit = Some((file.name.clone(), Some(index)));
                    break;
                }
            }

            if let Some((name, index)) = hit {
                if !matches!(kind, ArchiveKind::Local) {
                    self.touch(&name);
                }
                let file = self.map(kind).get(&name).expect("hit came from this map");
                return match index {
                    None => {
                        debug!(name = %file.name, "serving block list metafile");
                        Ok(file.block_list.clone())
                    }
                    Some(i) => {
                        debug!(name = %file.name, block = i, "serving data block");
                        file.read_block(i)
                    }
                };
            }
        }
        Ok(Vec::new())
    }

    /// Kilobytes of DHT budget currently in use across both DHT maps.
    pub fn dht_usage_kb(&self) -> u64 {
        self.dht_primary
            .values()
            .chain(self.dht_redundant.values())
            .map(SharedFile::storage_cost_kb)
            .sum()
    }

    /// Evicts least-recently-touched DHT files until `incoming_kb` more
    /// kilobytes fit under `limit_kb`.
    ///
    /// Returns the evicted files; the caller unlinks them from disk.
    pub fn evict_for(&mut self, limit_kb: u64, incoming_kb: u64) -> Vec<SharedFile> {
        let mut evicted = Vec::new();
        while self.dht_usage_kb() + incoming_kb > limit_kb {
            let Some(name) = self.recent.pop_back() else {
                break;
            };
            let file = self
                .dht_primary
                .remove(&name)
                .or_else(|| self.dht_redundant.remove(&name));
            if let Some(file) = file {
                debug!(name = %file.name, "evicting DHT file");
                evicted.push(file);
            }
        }
        evicted
    }
}
