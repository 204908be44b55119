//! Murmur storage - rumor logs and the content-addressed file archive.
//!
//! Two unrelated kinds of state live here, both owned exclusively by the
//! node core:
//!
//! - [`rumors`]: the per-origin append-only gossip log with its vector
//!   status
//! - [`archive`]: shared files chunked into 8000-byte SHA-1-addressed
//!   blocks, split across local and DHT custody maps
//! - [`download`]: bookkeeping for the single in-flight block pipeline

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod archive;
pub mod download;
pub mod rumors;

pub use archive::{ArchiveKind, FileArchive, SharedFile};
pub use download::{Download, DownloadMode, DownloadStep};
pub use rumors::RumorStore;

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A metafile's length was not a multiple of the digest size.
    #[error("malformed block list: {0} bytes is not a whole number of digests")]
    MalformedBlockList(usize),

    /// A block index fell outside the file's block list.
    #[error("block index {index} out of range for {blocks} blocks")]
    BlockOutOfRange {
        /// Requested block index.
        index: usize,
        /// Number of blocks the file has.
        blocks: usize,
    },
}
