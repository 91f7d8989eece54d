//! In-memory chain of block headers.
//!
//! Headers live in an arena keyed by hash with parent-hash links only.
//! `organize` computes heights and cumulative work as a pass over the
//! arena, assigns per-height duplicate IDs in insertion order, and flips
//! the main-branch marks; it never traverses owning back-pointers.

use std::collections::{HashMap, HashSet};

use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::{BlockHeader, Hash256, HEADER_SIZE};
use primitive_types::U256;

use crate::blockfiles::FileCoord;

const UNSET_HEIGHT: u32 = u32::MAX;
const UNSET_DUP: u8 = u8::MAX;
const MAX_HEIGHT: u32 = (1 << 24) - 1;

#[derive(Debug)]
pub struct BlockCorruptionError {
    pub reason: &'static str,
}

impl std::fmt::Display for BlockCorruptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "corrupted header chain: {}", self.reason)
    }
}

impl std::error::Error for BlockCorruptionError {}

impl From<BlockCorruptionError> for crate::ChainError {
    fn from(err: BlockCorruptionError) -> Self {
        crate::ChainError::Corruption(err.reason)
    }
}

#[derive(Clone, Debug)]
pub struct HeaderRecord {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    pub duplicate_id: u8,
    pub is_main_branch: bool,
    pub chainwork: U256,
    pub file_coord: Option<FileCoord>,
    pub num_tx: u32,
}

impl HeaderRecord {
    pub fn is_organized(&self) -> bool {
        self.height != UNSET_HEIGHT
    }
}

/// Outcome of organizing the chain after new headers arrived.
#[derive(Clone, Debug)]
pub struct ReorgState {
    pub has_new_top: bool,
    pub prev_top_still_valid: bool,
    pub prev_top: Hash256,
    pub new_top: Hash256,
    pub reorg_branch_point: Hash256,
}

pub struct HeaderChain {
    genesis_hash: Hash256,
    records: HashMap<Hash256, HeaderRecord>,
    insertion_order: Vec<Hash256>,
    main_chain: Vec<Hash256>,
    top_hash: Option<Hash256>,
}

impl HeaderChain {
    pub fn new(genesis_hash: Hash256) -> Self {
        Self {
            genesis_hash,
            records: HashMap::new(),
            insertion_order: Vec::new(),
            main_chain: Vec::new(),
            top_hash: None,
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.insertion_order.clear();
        self.main_chain.clear();
        self.top_hash = None;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    /// Insert a header; returns false if it was already known.
    pub fn add_block(&mut self, hash: Hash256, header: BlockHeader) -> bool {
        if self.records.contains_key(&hash) {
            return false;
        }
        self.records.insert(
            hash,
            HeaderRecord {
                header,
                hash,
                height: UNSET_HEIGHT,
                duplicate_id: UNSET_DUP,
                is_main_branch: false,
                chainwork: U256::zero(),
                file_coord: None,
                num_tx: 0,
            },
        );
        self.insertion_order.push(hash);
        true
    }

    pub fn has_header_with_hash(&self, hash: &Hash256) -> bool {
        self.records.contains_key(hash)
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Option<&HeaderRecord> {
        self.records.get(hash)
    }

    pub fn header_by_hash_mut(&mut self, hash: &Hash256) -> Option<&mut HeaderRecord> {
        self.records.get_mut(hash)
    }

    pub fn header_by_height(&self, height: u32) -> Option<&HeaderRecord> {
        let hash = self.main_chain.get(height as usize)?;
        self.records.get(hash)
    }

    pub fn hash_at_height(&self, height: u32) -> Option<Hash256> {
        self.main_chain.get(height as usize).copied()
    }

    pub fn top(&self) -> Option<&HeaderRecord> {
        self.records.get(self.top_hash.as_ref()?)
    }

    pub fn top_height(&self) -> u32 {
        self.top().map(|record| record.height).unwrap_or(0)
    }

    pub fn get_genesis_block(&self) -> Option<&HeaderRecord> {
        self.records.get(&self.genesis_hash)
    }

    pub fn iter_records(&self) -> impl Iterator<Item = &HeaderRecord> {
        self.records.values()
    }

    pub fn organize(&mut self) -> Result<ReorgState, BlockCorruptionError> {
        self.organize_inner(false)
    }

    /// Reorganize from scratch, recomputing every height and mark.
    pub fn force_organize(&mut self) -> Result<ReorgState, BlockCorruptionError> {
        for record in self.records.values_mut() {
            record.height = UNSET_HEIGHT;
            record.chainwork = U256::zero();
            record.is_main_branch = false;
        }
        self.organize_inner(true)
    }

    fn organize_inner(&mut self, forced: bool) -> Result<ReorgState, BlockCorruptionError> {
        let genesis = self
            .records
            .get(&self.genesis_hash)
            .ok_or(BlockCorruptionError {
                reason: "genesis header missing",
            })?;
        if genesis.header.prev_block != [0u8; 32] {
            return Err(BlockCorruptionError {
                reason: "genesis header has a parent",
            });
        }

        self.resolve_heights()?;
        self.assign_duplicate_ids()?;

        let prev_top = self.top_hash;
        let best = self.select_best_tip(prev_top)?;
        self.mark_main_branch(best)?;

        let prev_top_hash = prev_top.unwrap_or(self.genesis_hash);
        let prev_top_still_valid = match prev_top {
            Some(hash) => self
                .records
                .get(&hash)
                .map(|record| record.is_main_branch)
                .unwrap_or(false),
            None => true,
        };
        let has_new_top = forced || prev_top != Some(best);

        let reorg_branch_point = if prev_top_still_valid {
            prev_top_hash
        } else {
            self.walk_back_to_main(prev_top_hash)?
        };

        self.top_hash = Some(best);

        Ok(ReorgState {
            has_new_top,
            prev_top_still_valid,
            prev_top: prev_top_hash,
            new_top: best,
            reorg_branch_point,
        })
    }

    fn resolve_heights(&mut self) -> Result<(), BlockCorruptionError> {
        let order: Vec<Hash256> = self.insertion_order.clone();
        for hash in order {
            if self
                .records
                .get(&hash)
                .map(|record| record.is_organized())
                .unwrap_or(true)
            {
                continue;
            }

            let mut stack = vec![hash];
            let mut on_stack: HashSet<Hash256> = HashSet::new();
            on_stack.insert(hash);

            while let Some(&current) = stack.last() {
                let record = self.records.get(&current).expect("stacked record");
                if record.is_organized() {
                    stack.pop();
                    continue;
                }

                if current == self.genesis_hash {
                    let work = block_proof(record.header.bits);
                    let record = self.records.get_mut(&current).expect("stacked record");
                    record.height = 0;
                    record.chainwork = work;
                    stack.pop();
                    continue;
                }

                let parent_hash = record.header.prev_block;
                let parent = match self.records.get(&parent_hash) {
                    Some(parent) => parent,
                    None => {
                        return Err(BlockCorruptionError {
                            reason: "missing parent header",
                        })
                    }
                };

                if parent.is_organized() {
                    let height = parent.height + 1;
                    if height > MAX_HEIGHT {
                        return Err(BlockCorruptionError {
                            reason: "block height exceeds maximum",
                        });
                    }
                    let work = parent.chainwork + block_proof(record.header.bits);
                    let record = self.records.get_mut(&current).expect("stacked record");
                    record.height = height;
                    record.chainwork = work;
                    stack.pop();
                } else {
                    if !on_stack.insert(parent_hash) {
                        return Err(BlockCorruptionError {
                            reason: "header chain cycle",
                        });
                    }
                    stack.push(parent_hash);
                }
            }
        }
        Ok(())
    }

    fn assign_duplicate_ids(&mut self) -> Result<(), BlockCorruptionError> {
        let mut next_dup: HashMap<u32, u16> = HashMap::new();
        for record in self.records.values() {
            if record.is_organized() && record.duplicate_id != UNSET_DUP {
                let next = next_dup.entry(record.height).or_insert(0);
                *next = (*next).max(record.duplicate_id as u16 + 1);
            }
        }
        let order: Vec<Hash256> = self.insertion_order.clone();
        for hash in order {
            let Some(record) = self.records.get(&hash) else {
                continue;
            };
            if !record.is_organized() || record.duplicate_id != UNSET_DUP {
                continue;
            }
            let height = record.height;
            let next = next_dup.entry(height).or_insert(0);
            if *next >= UNSET_DUP as u16 {
                return Err(BlockCorruptionError {
                    reason: "more than 255 duplicate headers at one height",
                });
            }
            let dup = *next as u8;
            *next += 1;
            self.records
                .get_mut(&hash)
                .expect("record present")
                .duplicate_id = dup;
        }
        Ok(())
    }

    fn select_best_tip(
        &self,
        prev_top: Option<Hash256>,
    ) -> Result<Hash256, BlockCorruptionError> {
        let mut best: Option<&HeaderRecord> = None;
        for record in self.records.values() {
            if !record.is_organized() {
                continue;
            }
            best = Some(match best {
                None => record,
                Some(current) => {
                    if record.chainwork > current.chainwork {
                        record
                    } else if record.chainwork < current.chainwork {
                        current
                    } else if Some(current.hash) == prev_top {
                        current
                    } else if Some(record.hash) == prev_top {
                        record
                    } else if current.is_main_branch {
                        current
                    } else if record.is_main_branch {
                        record
                    } else if record.hash < current.hash {
                        record
                    } else {
                        current
                    }
                }
            });
        }
        best.map(|record| record.hash).ok_or(BlockCorruptionError {
            reason: "no organized headers",
        })
    }

    fn mark_main_branch(&mut self, tip: Hash256) -> Result<(), BlockCorruptionError> {
        let tip_height = self
            .records
            .get(&tip)
            .map(|record| record.height)
            .ok_or(BlockCorruptionError {
                reason: "best tip missing",
            })?;

        let mut chain = vec![[0u8; 32]; tip_height as usize + 1];
        let mut current = tip;
        let mut steps = 0usize;
        loop {
            let record = self.records.get(&current).ok_or(BlockCorruptionError {
                reason: "missing parent header",
            })?;
            chain[record.height as usize] = current;
            if current == self.genesis_hash {
                break;
            }
            current = record.header.prev_block;
            steps += 1;
            if steps > self.records.len() {
                return Err(BlockCorruptionError {
                    reason: "header chain cycle",
                });
            }
        }

        let on_chain: HashSet<Hash256> = chain.iter().copied().collect();
        for record in self.records.values_mut() {
            record.is_main_branch = on_chain.contains(&record.hash);
        }
        self.main_chain = chain;
        Ok(())
    }

    fn walk_back_to_main(&self, from: Hash256) -> Result<Hash256, BlockCorruptionError> {
        let mut current = from;
        let mut steps = 0usize;
        loop {
            let record = self.records.get(&current).ok_or(BlockCorruptionError {
                reason: "missing parent header",
            })?;
            if record.is_main_branch {
                return Ok(current);
            }
            current = record.header.prev_block;
            steps += 1;
            if steps > self.records.len() {
                return Err(BlockCorruptionError {
                    reason: "header chain cycle",
                });
            }
        }
    }

    /// Branch-point query for a tip that may have left the main chain while
    /// the process was down.
    pub fn find_reorg_point_from_block(
        &self,
        old_top_hash: &Hash256,
    ) -> Result<ReorgState, BlockCorruptionError> {
        let old = self
            .records
            .get(old_top_hash)
            .ok_or(BlockCorruptionError {
                reason: "unknown previous top",
            })?;
        let new_top = self.top_hash.unwrap_or(self.genesis_hash);
        let prev_top_still_valid = old.is_main_branch;
        let reorg_branch_point = if prev_top_still_valid {
            *old_top_hash
        } else {
            self.walk_back_to_main(*old_top_hash)?
        };
        Ok(ReorgState {
            has_new_top: new_top != *old_top_hash,
            prev_top_still_valid,
            prev_top: *old_top_hash,
            new_top,
            reorg_branch_point,
        })
    }
}

fn compact_to_target(bits: u32) -> U256 {
    if bits & 0x0080_0000 != 0 {
        return U256::zero();
    }
    let exponent = (bits >> 24) as usize;
    let mantissa = U256::from(bits & 0x007f_ffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

pub fn block_proof(bits: u32) -> U256 {
    let target = compact_to_target(bits);
    if target.is_zero() {
        return U256::zero();
    }
    // (2^256 - 1 - target) / (target + 1) + 1 == 2^256 / (target + 1)
    (!target / (target + U256::one())) + U256::one()
}

/// Serialized layout of a Headers row.
pub fn encode_header_record(record: &HeaderRecord) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_bytes(&record.header.consensus_encode());
    encoder.write_u32_le(record.height);
    encoder.write_u8(record.duplicate_id);
    encoder.write_u8(if record.is_main_branch { 1 } else { 0 });
    match &record.file_coord {
        Some(coord) => {
            encoder.write_u8(1);
            encoder.write_bytes(&coord.encode());
        }
        None => encoder.write_u8(0),
    }
    encoder.write_u32_le(record.num_tx);
    encoder.into_inner()
}

pub fn decode_header_record(hash: Hash256, bytes: &[u8]) -> Result<HeaderRecord, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let header_bytes = decoder.read_fixed::<HEADER_SIZE>()?;
    let header = BlockHeader::consensus_decode(&header_bytes)?;
    let height = decoder.read_u32_le()?;
    let duplicate_id = decoder.read_u8()?;
    let is_main_branch = decoder.read_u8()? != 0;
    let file_coord = if decoder.read_u8()? != 0 {
        let coord_bytes = decoder.read_fixed::<14>()?;
        Some(
            FileCoord::decode(&coord_bytes)
                .ok_or(DecodeError::InvalidData("invalid file coordinate"))?,
        )
    } else {
        None
    };
    let num_tx = decoder.read_u32_le()?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(HeaderRecord {
        header,
        hash,
        height,
        duplicate_id,
        is_main_branch,
        chainwork: U256::zero(),
        file_coord,
        num_tx,
    })
}
