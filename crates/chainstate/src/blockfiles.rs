//! Raw block file discovery and framing.
//!
//! Block files are a sequence of `magic[4] | size[4 LE] | payload[size]`
//! records, zero-padded at the tail. The reader opens files read-only and
//! never writes; framing mismatches trigger a byte-by-byte resync to the
//! next magic match, and a file is abandoned after four consecutive
//! unparseable blocks.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use ledgerd_primitives::{sha256d, Hash256, HEADER_SIZE};

use crate::ChainError;

/// Location of a raw block inside the block file sequence. `offset` points
/// at the frame's magic bytes; `size` is the payload length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileCoord {
    pub file_number: u16,
    pub offset: u64,
    pub size: u32,
}

impl FileCoord {
    pub fn encode(&self) -> [u8; 14] {
        let mut out = [0u8; 14];
        out[0..2].copy_from_slice(&self.file_number.to_le_bytes());
        out[2..10].copy_from_slice(&self.offset.to_le_bytes());
        out[10..14].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 14 {
            return None;
        }
        let file_number = u16::from_le_bytes(bytes[0..2].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[2..10].try_into().ok()?);
        let size = u32::from_le_bytes(bytes[10..14].try_into().ok()?);
        Some(Self {
            file_number,
            offset,
            size,
        })
    }
}

pub fn blk_file_name(index: u16) -> String {
    format!("blk{index:05}.dat")
}

#[derive(Clone, Debug)]
struct BlockFileEntry {
    path: PathBuf,
    size: u64,
}

pub enum FrameAction {
    Continue,
    Halt,
}

pub struct BlockFileSet {
    dir: PathBuf,
    magic: [u8; 4],
    files: Vec<BlockFileEntry>,
    total_bytes: u64,
}

impl BlockFileSet {
    /// Probe `blk00000.dat`, `blk00001.dat`, ... until one is missing.
    pub fn detect(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Result<Self, ChainError> {
        let dir = dir.into();
        let mut set = Self {
            dir,
            magic,
            files: Vec::new(),
            total_bytes: 0,
        };
        set.refresh()?;
        Ok(set)
    }

    pub fn refresh(&mut self) -> Result<(), ChainError> {
        self.files.clear();
        self.total_bytes = 0;
        let mut index: u16 = 0;
        loop {
            let path = self.dir.join(blk_file_name(index));
            let Ok(metadata) = fs::metadata(&path) else {
                break;
            };
            let size = metadata.len();
            self.files.push(BlockFileEntry { path, size });
            self.total_bytes += size;
            if index == u16::MAX {
                break;
            }
            index += 1;
        }
        Ok(())
    }

    pub fn num_files(&self) -> u16 {
        self.files.len() as u16
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn file_size(&self, file_number: u16) -> Option<u64> {
        self.files.get(file_number as usize).map(|entry| entry.size)
    }

    pub fn file_path(&self, file_number: u16) -> Option<&Path> {
        self.files
            .get(file_number as usize)
            .map(|entry| entry.path.as_path())
    }

    /// Whether the file after the currently tracked final one has appeared.
    pub fn next_file_exists(&self) -> bool {
        let next = self.dir.join(blk_file_name(self.num_files()));
        next.exists()
    }

    /// Double-SHA256 of the first header in each file. Short files yield
    /// `None`; a magic mismatch means the files belong to another network.
    pub fn first_header_hashes(&self) -> Result<Vec<Option<Hash256>>, ChainError> {
        let mut hashes = Vec::with_capacity(self.files.len());
        for entry in &self.files {
            if entry.size < (8 + HEADER_SIZE) as u64 {
                ledgerd_log::log_warn!(
                    "file {} is less than {} bytes",
                    entry.path.display(),
                    8 + HEADER_SIZE
                );
                hashes.push(None);
                continue;
            }
            let mut file = File::open(&entry.path)?;
            let mut buf = [0u8; 8 + HEADER_SIZE];
            file.read_exact(&mut buf)?;
            if buf[0..4] != self.magic {
                ledgerd_log::log_error!(
                    "magic bytes mismatch, block file {} is for another network",
                    entry.path.display()
                );
                return Err(ChainError::NetworkMismatch);
            }
            hashes.push(Some(sha256d(&buf[8..])));
        }
        Ok(hashes)
    }

    /// Walk the frames of one file starting at `start_offset`, feeding each
    /// payload to `sink`. Returns the byte offset one past the last
    /// consumed frame (the `endOfLastBlockByte` high-water mark for the
    /// final file).
    ///
    /// A `Decode` error from the sink counts as an unparseable block: the
    /// scan resynchronizes on the next magic match and gives up on the file
    /// after four consecutive failures. Any other error aborts the scan.
    pub fn scan_file(
        &self,
        file_number: u16,
        start_offset: u64,
        sink: &mut dyn FnMut(&[u8], FileCoord) -> Result<FrameAction, ChainError>,
    ) -> Result<u64, ChainError> {
        let entry = self
            .files
            .get(file_number as usize)
            .ok_or(ChainError::MissingBlockData)?;
        let data = fs::read(&entry.path)?;
        let len = data.len();
        let mut loc = start_offset as usize;
        let mut failed_attempts = 0u32;

        if loc == 0 && len >= 4 && data[0..4] != self.magic && data[0..4] != [0u8; 4] {
            ledgerd_log::log_error!(
                "magic bytes mismatch, block file {} is for another network",
                entry.path.display()
            );
            return Err(ChainError::NetworkMismatch);
        }

        while loc + 8 <= len {
            if data[loc..loc + 4] != self.magic {
                match find_magic(&data[loc..], &self.magic) {
                    Some(skip) => {
                        ledgerd_log::log_warn!(
                            "skipped {skip} bytes to next magic match in {} at byte {loc}",
                            entry.path.display()
                        );
                        loc += skip;
                        continue;
                    }
                    // Zero padding to the end of the file.
                    None => break,
                }
            }

            let size =
                u32::from_le_bytes(data[loc + 4..loc + 8].try_into().expect("size slice")) as usize;
            if loc + 8 + size > len {
                // Partial frame at the tail; the node is still writing it.
                break;
            }

            let payload = &data[loc + 8..loc + 8 + size];
            let coord = FileCoord {
                file_number,
                offset: loc as u64,
                size: size as u32,
            };
            match sink(payload, coord) {
                Ok(FrameAction::Continue) => {
                    failed_attempts = 0;
                    loc += 8 + size;
                }
                Ok(FrameAction::Halt) => return Ok(loc as u64),
                Err(ChainError::Decode(err)) => {
                    ledgerd_log::log_error!(
                        "{err} (error encountered processing block at byte {loc} file {}, blocksize {size})",
                        entry.path.display()
                    );
                    failed_attempts += 1;
                    if failed_attempts >= 4 {
                        ledgerd_log::log_error!(
                            "giving up searching {} after finding 4 block headers with unparseable contents",
                            entry.path.display()
                        );
                        break;
                    }
                    match find_magic(&data[loc + 8..], &self.magic) {
                        Some(skip) => {
                            loc += 8 + skip;
                            ledgerd_log::log_error!("found another block header at {loc}");
                        }
                        None => {
                            ledgerd_log::log_error!("could not find another block in the file");
                            break;
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Ok(loc.min(len) as u64)
    }

    /// Read one raw block payload back by coordinate.
    pub fn read_block(&self, coord: &FileCoord) -> Result<Vec<u8>, ChainError> {
        let entry = self
            .files
            .get(coord.file_number as usize)
            .ok_or(ChainError::MissingBlockData)?;
        let mut file = File::open(&entry.path)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(coord.offset + 8))?;
        let mut buf = vec![0u8; coord.size as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn find_magic(data: &[u8], magic: &[u8; 4]) -> Option<usize> {
    data.windows(4).position(|window| window == magic)
}
