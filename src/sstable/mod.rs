//! Sorted String Table (SSTable) Module
//!
//! Immutable, sorted, block-structured on-disk tables built from sealed
//! memtables and searched with memory-mapped random reads.
//!
//! ## On-disk layout
//!
//! The format takes inspiration from the RocksDB "BlockBasedTable" format,
//! significantly simplified. All integers are little-endian. A file is `B`
//! fixed-size data blocks of `block_size` bytes followed by a 48-byte
//! footer:
//!
//! ```text
//! Data Block 0
//!   Key Entry 0.0
//!     prefix_bytes: u32      shared bytes with the current index key;
//!                            0 marks this entry AS an index key
//!     suffix_bytes: u32      remaining key bytes after the shared prefix
//!     value_bytes:  u64      value size
//!     key_suffix:   [u8]     raw key bytes, not NUL-terminated
//!     padding:      [u8]     zero fill to 8-byte alignment
//!     value:        [u8]     raw value bytes
//!     padding:      [u8]     zero fill to 8-byte alignment
//!   Key Entry 0.1
//!   ...
//!   Padding: zero fill up to the block footer
//!   Block Footer
//!     offsets:   [u64]       block-relative offsets of each index key
//!     idx_count:  u64        number of index keys in the block
//! Data Block 1
//! ...
//! File Footer (48 bytes)
//!   block_size | block_count | entry_count | key_bytes | value_bytes | magic
//! ```
//!
//! Keys are prefix-compressed against the most recent *index key*; index
//! keys reset the prefix and are recorded in the block footer so a lookup
//! can binary-chop to the right sub-block. Every block's first entry is an
//! index key. Padding is `8 − (n mod 8)` bytes — a full 8 when the field is
//! already aligned — which can add up to 16 bytes per entry.
//!
//! ## Concurrency model
//!
//! SSTables are immutable once written; reads open and map the file
//! per-lookup and never lock. The whole file is mapped for simplicity —
//! very large files or 32-bit address spaces would require per-block
//! mapping.
//!
//! ## Bloom filters
//!
//! A table built by a flush carries an in-memory scalable Bloom filter over
//! its keys and consults it before touching the file. The on-disk format
//! has no filter section, so a table opened from disk has none and is
//! always searched.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;
use tracing::info;

use crate::bloom::{FilterParams, ScalableFilter, ScalableParams};
use crate::clock;
use crate::memtable::Memtable;

/// File extension of SSTable files.
pub const FILE_EXT: &str = "kvsst";

/// Magic number closing every SSTable file.
pub const MAGIC: u64 = 0x6772_6567_6F72_7968;

/// Size of the file footer in bytes.
pub const FOOTER_SIZE: usize = 48;

/// Size of a serialized entry header in bytes.
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Seed for the per-table Bloom filters.
const FILTER_SEED: u64 = MAGIC;

/// Zero padding after a field of `n` bytes: `8 − (n mod 8)`, which inserts
/// a full 8 bytes when `n` is already aligned. Writer and reader compute
/// this identically, so the slack is part of the wire format.
fn padding_bytes(n: usize) -> usize {
    8 - (n % 8)
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Tried to build a table from a memtable that is still accepting
    /// writes.
    #[error("memtable is not sealed")]
    TableUnsealed,

    /// The file's magic number did not match.
    #[error("bad magic number")]
    BadMagic,

    /// The file name does not parse as `<timestamp>.kvsst`.
    #[error("not an SSTable file: {0}")]
    BadFileName(PathBuf),

    /// A single entry cannot fit in a block even uncompressed.
    #[error("entry of {0} bytes exceeds the block size")]
    EntryTooLarge(usize),

    /// Structural corruption detected while reading.
    #[error("corrupt SSTable: {0}")]
    Corrupt(&'static str),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for building SSTables.
#[derive(Debug, Clone)]
pub struct SSTableConfig {
    /// Size of each data block in bytes.
    pub max_block_size: usize,

    /// Directory where table files are created.
    pub base_dir: PathBuf,
}

impl Default for SSTableConfig {
    fn default() -> Self {
        Self {
            max_block_size: 4 * 1024 * 1024,
            base_dir: PathBuf::from("."),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Wire structures
// ------------------------------------------------------------------------------------------------

/// Per-entry header preceding the key suffix and value.
#[derive(Debug, Clone, Copy)]
struct EntryHeader {
    /// Bytes shared with the current index key; 0 marks an index key.
    prefix_bytes: u32,

    /// Remaining key bytes after the shared prefix.
    suffix_bytes: u32,

    /// Value size in bytes.
    value_bytes: u64,
}

impl EntryHeader {
    /// Total serialized size of the entry this header describes.
    fn entry_size(&self) -> usize {
        let suffix = self.suffix_bytes as usize;
        let value = self.value_bytes as usize;
        ENTRY_HEADER_SIZE + suffix + padding_bytes(suffix) + value + padding_bytes(value)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.prefix_bytes.to_le_bytes())?;
        w.write_all(&self.suffix_bytes.to_le_bytes())?;
        w.write_all(&self.value_bytes.to_le_bytes())?;
        Ok(())
    }

    /// Reads a header at `pos`, requiring it to fit below `limit`.
    fn read(data: &[u8], pos: usize, limit: usize) -> Result<Self, SSTableError> {
        if pos + ENTRY_HEADER_SIZE > limit {
            return Err(SSTableError::Corrupt("entry header overruns block"));
        }
        Ok(Self {
            prefix_bytes: read_u32(data, pos),
            suffix_bytes: read_u32(data, pos + 4),
            value_bytes: read_u64(data, pos + 8),
        })
    }
}

/// File footer: geometry, statistics, and the magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Size in bytes of each data block.
    pub block_size: u64,

    /// Number of data blocks in the file.
    pub block_count: u64,

    /// Total entries across all data blocks.
    pub entry_count: u64,

    /// Total key bytes before prefix compression.
    pub key_bytes: u64,

    /// Total value bytes in the file.
    pub value_bytes: u64,

    /// Fixed [`MAGIC`].
    pub magic: u64,
}

impl Footer {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for field in [
            self.block_size,
            self.block_count,
            self.entry_count,
            self.key_bytes,
            self.value_bytes,
            self.magic,
        ] {
            w.write_all(&field.to_le_bytes())?;
        }
        Ok(())
    }

    /// Decodes a footer from its 48-byte serialized form.
    fn read(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        Self {
            block_size: read_u64(buf, 0),
            block_count: read_u64(buf, 8),
            entry_count: read_u64(buf, 16),
            key_bytes: read_u64(buf, 24),
            value_bytes: read_u64(buf, 32),
            magic: read_u64(buf, 40),
        }
    }
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[pos..pos + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[pos..pos + 8]);
    u64::from_le_bytes(buf)
}

const ZEROS: [u8; 64] = [0u8; 64];

fn write_zeros<W: Write>(w: &mut W, mut count: usize) -> io::Result<()> {
    while count > 0 {
        let chunk = count.min(ZEROS.len());
        w.write_all(&ZEROS[..chunk])?;
        count -= chunk;
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// SSTable Core
// ------------------------------------------------------------------------------------------------

/// Handle to one immutable on-disk table.
///
/// Handles order by creation timestamp; the newest handle shadows older
/// ones for overlapping keys.
pub struct SSTable {
    /// Monotonic nanosecond creation timestamp, also the file stem.
    timestamp: u64,

    /// Path of the table file.
    path: PathBuf,

    /// Size of each data block.
    block_size: usize,

    /// Footer as written (or read back from disk).
    footer: Footer,

    /// Negative-lookup accelerator. Present only on tables built by this
    /// process; the on-disk format has no filter section.
    filter: Option<ScalableFilter>,
}

impl SSTable {
    /// Builds a table file from a sealed memtable, iterating its keys in
    /// ascending order.
    pub fn build(config: &SSTableConfig, table: &Memtable) -> Result<Self, SSTableError> {
        if !table.locked() {
            return Err(SSTableError::TableUnsealed);
        }

        let timestamp = clock::unique_ns();
        let path = config
            .base_dir
            .join(format!("{}.{}", timestamp, FILE_EXT));
        let block_size = config.max_block_size;

        let mut filter = ScalableFilter::new(ScalableParams {
            filter: FilterParams::with_seed(FILTER_SEED),
            ..ScalableParams::default()
        });

        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        let mut blocks: u64 = 0;
        let mut entries: u64 = 0;
        let mut key_bytes: u64 = 0;
        let mut value_bytes: u64 = 0;

        let mut prefix = String::new();
        let mut block_bytes: usize = 0;
        let mut idx_offsets: Vec<u64> = Vec::new();

        for node in table.iter() {
            let key = node.key();
            let value = table.value(node);

            filter.insert(key.as_bytes());

            // Uncompressed, the entry plus a one-slot index footer is the
            // least room it can ever need.
            let uncompressed = ENTRY_HEADER_SIZE
                + key.len()
                + padding_bytes(key.len())
                + value.len()
                + padding_bytes(value.len());
            if uncompressed + 16 > block_size {
                return Err(SSTableError::EntryTooLarge(key.len() + value.len()));
            }

            let mut hdr = header_for(&mut prefix, key, value.len() as u64);
            let mut idx_key = hdr.prefix_bytes == 0;

            let footer_need = 8 * (idx_offsets.len() + usize::from(idx_key) + 1);
            if block_bytes + hdr.entry_size() + footer_need > block_size {
                close_block(&mut writer, block_size, block_bytes, &idx_offsets)?;
                blocks += 1;
                block_bytes = 0;
                idx_offsets.clear();
                prefix.clear();

                // Re-encode against the fresh block so its first entry is
                // an index key.
                hdr = header_for(&mut prefix, key, value.len() as u64);
                idx_key = true;
            }

            if idx_key {
                idx_offsets.push(block_bytes as u64);
            }

            let suffix = &key.as_bytes()[hdr.prefix_bytes as usize..];
            hdr.write_to(&mut writer)?;
            writer.write_all(suffix)?;
            write_zeros(&mut writer, padding_bytes(suffix.len()))?;
            writer.write_all(value)?;
            write_zeros(&mut writer, padding_bytes(value.len()))?;
            block_bytes += hdr.entry_size();

            entries += 1;
            key_bytes += key.len() as u64;
            value_bytes += value.len() as u64;
        }

        if entries > 0 {
            close_block(&mut writer, block_size, block_bytes, &idx_offsets)?;
            blocks += 1;
        }

        let footer = Footer {
            block_size: block_size as u64,
            block_count: blocks,
            entry_count: entries,
            key_bytes,
            value_bytes,
            magic: MAGIC,
        };
        footer.write_to(&mut writer)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| SSTableError::Io(e.into_error()))?;
        file.sync_all()?;

        info!(
            path = %path.display(),
            blocks,
            entries,
            "built SSTable"
        );

        Ok(Self {
            timestamp,
            path,
            block_size,
            footer,
            filter: Some(filter),
        })
    }

    /// Opens an existing table file, parsing the creation timestamp back
    /// from the file stem and validating the footer.
    pub fn open(path: &Path) -> Result<Self, SSTableError> {
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
            return Err(SSTableError::BadFileName(path.to_path_buf()));
        }
        let timestamp = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| SSTableError::BadFileName(path.to_path_buf()))?;

        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_SIZE as u64 {
            return Err(SSTableError::Corrupt("file shorter than its footer"));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut buf = [0u8; FOOTER_SIZE];
        file.read_exact(&mut buf)?;
        let footer = Footer::read(&buf);

        if footer.magic != MAGIC {
            return Err(SSTableError::BadMagic);
        }
        if footer
            .block_count
            .checked_mul(footer.block_size)
            .map(|b| b + FOOTER_SIZE as u64)
            != Some(len)
        {
            return Err(SSTableError::Corrupt("footer geometry mismatch"));
        }

        info!(path = %path.display(), "opened SSTable");

        Ok(Self {
            timestamp,
            path: path.to_path_buf(),
            block_size: footer.block_size as usize,
            footer,
            filter: None,
        })
    }

    /// Creation timestamp (nanoseconds); also the file stem.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Path of the table file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Footer as written or read back.
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// Looks up `key`, returning a copy of its value if present.
    ///
    /// Maps the file read-only, locates the candidate block by scanning the
    /// block index keys, narrows to a sub-block via the in-block offset
    /// array, then walks entries until the reconstructed key matches or the
    /// next index key proves it absent. The mapping is dropped on return.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SSTableError> {
        if let Some(filter) = &self.filter {
            if !filter.might_contain(key.as_bytes()) {
                return Ok(None);
            }
        }

        let file = File::open(&self.path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let data: &[u8] = &mmap;

        if data.len() < FOOTER_SIZE {
            return Err(SSTableError::Corrupt("file shorter than its footer"));
        }
        let footer = Footer::read(&data[data.len() - FOOTER_SIZE..]);
        if footer.magic != MAGIC {
            return Err(SSTableError::BadMagic);
        }
        if footer
            .block_count
            .checked_mul(footer.block_size)
            .map(|b| b + FOOTER_SIZE as u64)
            != Some(data.len() as u64)
        {
            return Err(SSTableError::Corrupt("footer geometry mismatch"));
        }

        let block_size = footer.block_size as usize;
        let block_count = footer.block_count as usize;
        if block_count == 0 {
            return Ok(None);
        }
        if block_size < ENTRY_HEADER_SIZE + 16 {
            return Err(SSTableError::Corrupt("implausible block size"));
        }

        let target = key.as_bytes();

        // Stop at the first block whose index key exceeds the target; the
        // target, if present, lives in the block before it.
        let mut boundary = block_count;
        for block in 0..block_count {
            let base = block * block_size;
            let hdr = EntryHeader::read(data, base, base + block_size)?;
            if hdr.prefix_bytes != 0 {
                return Err(SSTableError::Corrupt("block does not start with an index key"));
            }
            let sb = hdr.suffix_bytes as usize;
            if base + ENTRY_HEADER_SIZE + sb > base + block_size {
                return Err(SSTableError::Corrupt("index key overruns block"));
            }
            let first = &data[base + ENTRY_HEADER_SIZE..base + ENTRY_HEADER_SIZE + sb];
            if target < first {
                boundary = block;
                break;
            }
        }
        if boundary == 0 {
            // The target precedes the first key of the file.
            return Ok(None);
        }
        let base = (boundary - 1) * block_size;

        // In-block index: ascending index-key offsets, then their count,
        // packed at the end of the block.
        let idx_count = read_u64(data, base + block_size - 8) as usize;
        if idx_count == 0 || idx_count > block_size / 8 - 1 {
            return Err(SSTableError::Corrupt("implausible index count"));
        }
        let data_end = base + block_size - 8 * (idx_count + 1);

        // Last index key not exceeding the target opens our sub-block.
        let mut entry_off = 0usize;
        let mut prefix: &[u8] = b"";
        for i in 0..idx_count {
            let off = read_u64(data, base + block_size - 8 * (1 + idx_count - i)) as usize;
            if off >= block_size {
                return Err(SSTableError::Corrupt("index offset outside block"));
            }
            let hdr = EntryHeader::read(data, base + off, data_end)?;
            if hdr.prefix_bytes != 0 {
                return Err(SSTableError::Corrupt("index offset is not an index key"));
            }
            let sb = hdr.suffix_bytes as usize;
            if base + off + ENTRY_HEADER_SIZE + sb > data_end {
                return Err(SSTableError::Corrupt("index key overruns block"));
            }
            let k = &data[base + off + ENTRY_HEADER_SIZE..base + off + ENTRY_HEADER_SIZE + sb];
            if target < k {
                break;
            }
            entry_off = off;
            prefix = k;
        }

        // Walk the sub-block until the reconstructed key matches or the
        // next index key (or the block's zero padding) proves it absent.
        let mut pos = base + entry_off;
        loop {
            let hdr = EntryHeader::read(data, pos, data_end)?;
            let pb = hdr.prefix_bytes as usize;
            let sb = hdr.suffix_bytes as usize;
            let vb = hdr.value_bytes as usize;

            if pb > prefix.len() {
                return Err(SSTableError::Corrupt("prefix length exceeds index key"));
            }
            if vb > block_size {
                return Err(SSTableError::Corrupt("implausible value size"));
            }
            let suffix_start = pos + ENTRY_HEADER_SIZE;
            if suffix_start + sb > data_end {
                return Err(SSTableError::Corrupt("key suffix overruns block"));
            }
            let suffix = &data[suffix_start..suffix_start + sb];

            if target.len() == pb + sb
                && target[..pb] == prefix[..pb]
                && target[pb..] == *suffix
            {
                let value_start = suffix_start + sb + padding_bytes(sb);
                if value_start + vb > data_end {
                    return Err(SSTableError::Corrupt("value overruns block"));
                }
                return Ok(Some(data[value_start..value_start + vb].to_vec()));
            }

            pos = suffix_start + sb + padding_bytes(sb) + vb + padding_bytes(vb);
            if pos + ENTRY_HEADER_SIZE > data_end {
                return Ok(None);
            }
            if read_u32(data, pos) == 0 {
                // Crossed into the next sub-block without a match.
                return Ok(None);
            }
        }
    }
}

impl PartialEq for SSTable {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl Eq for SSTable {}

impl PartialOrd for SSTable {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SSTable {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

// ------------------------------------------------------------------------------------------------
// Builder helpers
// ------------------------------------------------------------------------------------------------

/// Computes the header for `key` against the current index-key `prefix`.
/// An empty prefix adopts the key as the new index key (`prefix_bytes` 0).
fn header_for(prefix: &mut String, key: &str, value_bytes: u64) -> EntryHeader {
    let mut prefix_bytes = 0usize;
    if prefix.is_empty() {
        prefix.push_str(key);
    } else {
        let limit = prefix.len().min(key.len());
        let p = prefix.as_bytes();
        let k = key.as_bytes();
        while prefix_bytes < limit && p[prefix_bytes] == k[prefix_bytes] {
            prefix_bytes += 1;
        }
    }

    EntryHeader {
        prefix_bytes: prefix_bytes as u32,
        suffix_bytes: (key.len() - prefix_bytes) as u32,
        value_bytes,
    }
}

/// Zero-fills the block up to its footer, then writes the index-key offset
/// array and its count, completing exactly `block_size` bytes.
fn close_block<W: Write>(
    w: &mut W,
    block_size: usize,
    block_bytes: usize,
    idx_offsets: &[u64],
) -> io::Result<()> {
    let footer_bytes = 8 * (idx_offsets.len() + 1);
    write_zeros(w, block_size - footer_bytes - block_bytes)?;
    for off in idx_offsets {
        w.write_all(&off.to_le_bytes())?;
    }
    w.write_all(&(idx_offsets.len() as u64).to_le_bytes())?;
    Ok(())
}
