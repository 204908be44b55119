//! Bookkeeping for the single in-flight download.
//!
//! A download pulls one file from one target origin, block by block. The
//! first verified reply carries the block-list metafile; every subsequent
//! reply carries one data block, written straight to the output file. The
//! node layer owns verification and retransmission; this type owns the
//! pipeline state.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use murmur_core::{OriginId, ShaDigest, DIGEST_LEN};
use tracing::debug;

use crate::{SharedFile, StoreError};

/// Why a download is running; selects the output filename prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// Started by the user.
    User,
    /// Pulling a file this node now owns as DHT primary.
    DhtPrimaryFetch,
    /// Pulling a redundant copy for the ring successor.
    DhtRedundantFetch,
}

impl DownloadMode {
    /// Filename prefix for the mode.
    pub fn prefix(self) -> &'static str {
        match self {
            DownloadMode::User => "download_",
            DownloadMode::DhtPrimaryFetch => "dht_",
            DownloadMode::DhtRedundantFetch => "red_",
        }
    }
}

/// What to do after a verified block reply was applied.
#[derive(Debug)]
pub enum DownloadStep {
    /// Request the block with this hash next.
    RequestNext(ShaDigest),
    /// The file is complete; bookkeeping describes what was fetched.
    Complete(SharedFile),
}

/// State of the one active download.
#[derive(Debug)]
pub struct Download {
    /// Origin the blocks are requested from.
    pub target: OriginId,
    /// Hash the next reply must echo.
    pub expected: ShaDigest,
    /// The file's content address (first request sent).
    pub metafile_hash: ShaDigest,
    /// Logical name, without any prefix.
    pub logical_name: String,
    /// Why this download is running.
    pub mode: DownloadMode,
    output_path: PathBuf,
    block_list: Vec<u8>,
    blocks_written: u64,
    bytes_written: u64,
    writer: Option<File>,
}

impl Download {
    /// Starts download state for `metafile_hash` from `target`.
    ///
    /// The output file is `dir/<prefix><logical_name>`; it is created when
    /// the first data block arrives.
    pub fn new(
        target: OriginId,
        metafile_hash: ShaDigest,
        logical_name: impl Into<String>,
        mode: DownloadMode,
        dir: &Path,
    ) -> Self {
        let logical_name = logical_name.into();
        let output_path = dir.join(format!("{}{}", mode.prefix(), logical_name));
        Self {
            target,
            expected: metafile_hash,
            metafile_hash,
            logical_name,
            mode,
            output_path,
            block_list: Vec::new(),
            blocks_written: 0,
            bytes_written: 0,
            writer: None,
        }
    }

    /// Where the fetched bytes land.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Total blocks, known once the metafile has arrived.
    pub fn total_blocks(&self) -> u64 {
        (self.block_list.len() / DIGEST_LEN) as u64
    }

    /// Applies a reply that already passed origin/echo/hash verification.
    pub fn apply_verified(&mut self, data: &[u8]) -> Result<DownloadStep, StoreError> {
        if self.block_list.is_empty() && self.blocks_written == 0 {
            // First reply: the block-list metafile.
            if data.len() % DIGEST_LEN != 0 {
                return Err(StoreError::MalformedBlockList(data.len()));
            }
            self.block_list = data.to_vec();
            debug!(
                name = %self.logical_name,
                blocks = self.total_blocks(),
                "received metafile"
            );
            if self.total_blocks() == 0 {
                // Zero-block file: create the empty output and finish.
                File::create(&self.output_path)?;
                return Ok(DownloadStep::Complete(self.described()?));
            }
            self.expected = self.hash_at(0);
            return Ok(DownloadStep::RequestNext(self.expected));
        }

        // Data block: open the output on the first one, then append.
        if self.writer.is_none() {
            debug!(path = %self.output_path.display(), "creating output file");
            self.writer = Some(File::create(&self.output_path)?);
        }
        let writer = self.writer.as_mut().expect("writer just created");
        writer.write_all(data)?;
        self.blocks_written += 1;
        self.bytes_written += data.len() as u64;

        if self.blocks_written == self.total_blocks() {
            self.writer = None; // close
            debug!(name = %self.logical_name, "download complete");
            return Ok(DownloadStep::Complete(self.described()?));
        }

        let next = self.hash_at(self.blocks_written as usize);
        self.expected = next;
        Ok(DownloadStep::RequestNext(next))
    }

    fn hash_at(&self, index: usize) -> ShaDigest {
        let start = index * DIGEST_LEN;
        ShaDigest::from_slice(&self.block_list[start..start + DIGEST_LEN])
            .expect("block list length validated on arrival")
    }

    fn described(&self) -> Result<SharedFile, StoreError> {
        SharedFile::from_block_list(
            self.logical_name.clone(),
            self.output_path.clone(),
            self.bytes_written,
            self.block_list.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::{sha1_digest, CHUNK_SIZE};
    use tempfile::TempDir;

    fn blocks_and_metafile(sizes: &[usize]) -> (Vec<Vec<u8>>, Vec<u8>) {
        let blocks: Vec<Vec<u8>> = sizes.iter().map(|&n| vec![0x5au8; n]).collect();
        let mut metafile = Vec::new();
        for block in &blocks {
            metafile.extend_from_slice(sha1_digest(block).as_slice());
        }
        (blocks, metafile)
    }

    #[test]
    fn test_pipeline_three_blocks() {
        let dir = TempDir::new().unwrap();
        let (blocks, metafile) = blocks_and_metafile(&[CHUNK_SIZE, CHUNK_SIZE, 500]);
        let metafile_hash = sha1_digest(&metafile);

        let mut dl = Download::new(
            "target".into(),
            metafile_hash,
            "pull.bin",
            DownloadMode::User,
            dir.path(),
        );
        assert_eq!(dl.expected, metafile_hash);

        // Metafile reply sets up the block pipeline.
        let step = dl.apply_verified(&metafile).unwrap();
        let first = match step {
            DownloadStep::RequestNext(h) => h,
            other => panic!("unexpected step: {other:?}"),
        };
        assert_eq!(first, sha1_digest(&blocks[0]));
        assert_eq!(dl.total_blocks(), 3);

        // Feed the blocks.
        for (i, block) in blocks.iter().enumerate() {
            match dl.apply_verified(block).unwrap() {
                DownloadStep::RequestNext(next) => {
                    assert_eq!(next, sha1_digest(&blocks[i + 1]));
                }
                DownloadStep::Complete(file) => {
                    assert_eq!(i, 2);
                    assert_eq!(file.size, 16_500);
                    assert_eq!(file.metafile_hash, metafile_hash);
                }
            }
        }

        let written = std::fs::read(dir.path().join("download_pull.bin")).unwrap();
        assert_eq!(written.len(), 16_500);
    }

    #[test]
    fn test_mode_prefixes() {
        let dir = TempDir::new().unwrap();
        for (mode, prefix) in [
            (DownloadMode::User, "download_"),
            (DownloadMode::DhtPrimaryFetch, "dht_"),
            (DownloadMode::DhtRedundantFetch, "red_"),
        ] {
            let dl = Download::new(
                "t".into(),
                sha1_digest(b"m"),
                "x.bin",
                mode,
                dir.path(),
            );
            assert_eq!(
                dl.output_path(),
                dir.path().join(format!("{prefix}x.bin"))
            );
        }
    }

    #[test]
    fn test_malformed_metafile_rejected() {
        let dir = TempDir::new().unwrap();
        let mut dl = Download::new(
            "t".into(),
            sha1_digest(b"m"),
            "x.bin",
            DownloadMode::User,
            dir.path(),
        );
        assert!(matches!(
            dl.apply_verified(&[0u8; 30]),
            Err(StoreError::MalformedBlockList(30))
        ));
    }

    #[test]
    fn test_zero_block_file_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let mut dl = Download::new(
            "t".into(),
            sha1_digest(&[]),
            "empty.bin",
            DownloadMode::User,
            dir.path(),
        );
        match dl.apply_verified(&[]).unwrap() {
            DownloadStep::Complete(file) => assert_eq!(file.size, 0),
            other => panic!("unexpected step: {other:?}"),
        }
        assert!(dir.path().join("download_empty.bin").exists());
    }
}
