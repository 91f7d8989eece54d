//! The block data manager: ties files, headers, writer, filter and reorg
//! engine together and drives initial sync plus incremental updates.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::bounded;
use ledgerd_primitives::encoding::Decoder;
use ledgerd_primitives::{Block, BlockHeader, Hash256, ScrAddr, Transaction, HEADER_SIZE};
use ledgerd_storage::{delete_prefix_batched, Column, KeyValueStore, WriteBatch};

use crate::blockfiles::{BlockFileSet, FileCoord, FrameAction};
use crate::dbinfo::StoredDbInfo;
use crate::filter::{
    AddressFilter, PendingMerge, RegistrationHandle, ScanSubset, ScrAddrFilter, WalletBatch,
};
use crate::headerchain::{decode_header_record, encode_header_record, HeaderChain, HeaderRecord};
use crate::keys::{hgtx, hgtx_key, hgtx_height, TxKey, TxOutKey};
use crate::progress::{NullProgress, ProgressMeasurer, ProgressReporter};
use crate::reorg::{reassess_after_reorg, ReorgResult};
use crate::ssh::{StoredScriptHistory, StoredSubHistory, TxIOPair};
use crate::stxo::{StoredTxOut, UnspentTxOut};
use crate::writer::{BlockWriter, UPDATE_BYTES_THRESH};
use crate::ChainError;

const BULK_DELETE_CAP: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Main,
    Test,
}

impl Network {
    pub fn magic_bytes(self) -> [u8; 4] {
        match self {
            Network::Main => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Test => [0x0b, 0x11, 0x09, 0x07],
        }
    }

    pub fn genesis_block_hash(self) -> Hash256 {
        match self {
            Network::Main => [
                0x6f, 0xe2, 0x8c, 0x0a, 0xb6, 0xf1, 0xb3, 0x72, 0xc1, 0xa6, 0xa2, 0x46, 0xae,
                0x63, 0xf7, 0x4f, 0x93, 0x1e, 0x83, 0x65, 0xe1, 0x5a, 0x08, 0x9c, 0x68, 0xd6,
                0x19, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
            Network::Test => [
                0x43, 0x49, 0x7f, 0xd7, 0xf8, 0x26, 0x95, 0x71, 0x08, 0xf4, 0xa3, 0x0f, 0xd9,
                0xce, 0xc3, 0xae, 0xba, 0x79, 0x97, 0x20, 0x84, 0xe9, 0x0e, 0xad, 0x01, 0xea,
                0x33, 0x09, 0x00, 0x00, 0x00, 0x00,
            ],
        }
    }

    pub fn genesis_tx_hash(self) -> Hash256 {
        [
            0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76,
            0x8f, 0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa,
            0x4b, 0x1e, 0x5e, 0x4a,
        ]
    }
}

/// Immutable once the store is opened; a genesis or magic mismatch against
/// the stored DBINFO row is fatal on restart.
#[derive(Clone, Debug)]
pub struct Config {
    pub blk_file_dir: PathBuf,
    pub magic_bytes: [u8; 4],
    pub genesis_block_hash: Hash256,
    pub genesis_tx_hash: Hash256,
    pub super_node: bool,
    pub seconds_per_block: u32,
    pub timestamp_tolerance: u32,
    pub update_bytes_thresh: usize,
}

impl Config {
    pub fn for_network(network: Network, blk_file_dir: impl Into<PathBuf>) -> Self {
        Self {
            blk_file_dir: blk_file_dir.into(),
            magic_bytes: network.magic_bytes(),
            genesis_block_hash: network.genesis_block_hash(),
            genesis_tx_hash: network.genesis_tx_hash(),
            super_node: false,
            seconds_per_block: 600,
            timestamp_tolerance: 3600,
            update_bytes_thresh: UPDATE_BYTES_THRESH,
        }
    }
}

/// What an incremental ingest pass did.
#[derive(Clone, Debug, Default)]
pub struct UpdateResult {
    pub prev_top_height: u32,
    pub new_top_height: u32,
    pub prev_top_hash: Hash256,
    pub new_top_hash: Hash256,
    pub blocks_read: u32,
    pub reorg: Option<ReorgResult>,
    /// Transactions newly confirmed by this pass, for zero-conf purging.
    pub mined_tx_hashes: Vec<Hash256>,
}

pub struct BlockDataManager<S> {
    config: Config,
    store: Arc<S>,
    chain: RwLock<HeaderChain>,
    filter: Arc<ScrAddrFilter>,
    files: Mutex<BlockFileSet>,
    end_of_last_block_byte: AtomicU64,
    missing_block_hashes: Mutex<Vec<Hash256>>,
}

impl<S: KeyValueStore + 'static> BlockDataManager<S> {
    pub fn new(config: Config, store: Arc<S>) -> Result<Self, ChainError> {
        if config.genesis_block_hash == [0u8; 32] {
            return Err(ChainError::MissingGenesis);
        }

        let files = BlockFileSet::detect(&config.blk_file_dir, config.magic_bytes)?;

        match StoredDbInfo::load(&*store)? {
            Some(info) => {
                if info.magic_bytes != config.magic_bytes
                    || info.genesis_block_hash != config.genesis_block_hash
                {
                    return Err(ChainError::NetworkMismatch);
                }
            }
            None => {
                let mut batch = WriteBatch::new();
                StoredDbInfo::fresh(config.magic_bytes, config.genesis_block_hash).put(&mut batch);
                store.write_batch(&batch)?;
            }
        }

        let chain = HeaderChain::new(config.genesis_block_hash);
        let filter = Arc::new(ScrAddrFilter::new(config.super_node));

        Ok(Self {
            config,
            store,
            chain: RwLock::new(chain),
            filter,
            files: Mutex::new(files),
            end_of_last_block_byte: AtomicU64::new(0),
            missing_block_hashes: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn filter(&self) -> &Arc<ScrAddrFilter> {
        &self.filter
    }

    pub fn top_block_height(&self) -> u32 {
        self.chain.read().expect("chain lock").top_height()
    }

    pub fn top_block_hash(&self) -> Option<Hash256> {
        self.chain
            .read()
            .expect("chain lock")
            .top()
            .map(|record| record.hash)
    }

    pub fn end_of_last_block_byte(&self) -> u64 {
        self.end_of_last_block_byte.load(Ordering::Acquire)
    }

    pub fn missing_block_hashes(&self) -> Vec<Hash256> {
        self.missing_block_hashes
            .lock()
            .expect("missing hashes lock")
            .clone()
    }

    pub fn header_by_height(&self, height: u32) -> Option<HeaderRecord> {
        self.chain
            .read()
            .expect("chain lock")
            .header_by_height(height)
            .cloned()
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Option<HeaderRecord> {
        self.chain
            .read()
            .expect("chain lock")
            .header_by_hash(hash)
            .cloned()
    }

    pub fn has_header_with_hash(&self, hash: &Hash256) -> bool {
        self.chain
            .read()
            .expect("chain lock")
            .has_header_with_hash(hash)
    }

    pub fn main_duplicate_id_for_height(&self, height: u32) -> Option<u8> {
        self.chain
            .read()
            .expect("chain lock")
            .header_by_height(height)
            .map(|record| record.duplicate_id)
    }

    /// Timestamp of the main-chain header at `height`, clamped to genesis.
    pub fn block_time_by_height(&self, height: u32) -> Option<u32> {
        let chain = self.chain.read().expect("chain lock");
        let height = height.min(chain.top_height());
        chain
            .header_by_height(height)
            .map(|record| record.header.time)
    }

    /// Hint-and-walk search for a block near a wall-clock timestamp. The
    /// inter-block target and the match tolerance come from configuration.
    pub fn closest_block_height_for_time(&self, timestamp: u32) -> u32 {
        let chain = self.chain.read().expect("chain lock");
        let Some(genesis) = chain.get_genesis_block() else {
            return 0;
        };
        if timestamp < genesis.header.time {
            return 0;
        }
        let top = chain.top_height();
        if top == 0 {
            return 0;
        }

        let diff = timestamp - genesis.header.time;
        let mut hint = (diff / self.config.seconds_per_block.max(1)) as i64;
        if hint > top as i64 {
            hint = top as i64;
        }
        while hint > 0 {
            let Some(record) = chain.header_by_height(hint as u32) else {
                break;
            };
            if record.header.time < timestamp {
                break;
            }
            hint -= 1000;
        }
        if hint < 0 {
            return 0;
        }

        for height in hint as u32..top.saturating_sub(1) {
            let Some(record) = chain.header_by_height(height) else {
                break;
            };
            if record.header.time + self.config.timestamp_tolerance > timestamp {
                return height;
            }
        }
        top - 1
    }

    // ------------------------------------------------------------------
    // Initial sync

    pub fn do_initial_sync_on_load(
        &self,
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), ChainError> {
        ledgerd_log::log_info!("executing initial sync on load");
        self.build_and_scan(false, false, progress)
    }

    pub fn do_initial_sync_on_load_rescan(
        &self,
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), ChainError> {
        ledgerd_log::log_info!("executing initial sync on load with rescan");
        self.build_and_scan(true, false, progress)
    }

    pub fn do_initial_sync_on_load_rebuild(
        &self,
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), ChainError> {
        ledgerd_log::log_info!("executing initial sync on load with rebuild");
        self.build_and_scan(true, true, progress)
    }

    fn build_and_scan(
        &self,
        force_rescan: bool,
        force_rebuild: bool,
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), ChainError> {
        self.missing_block_hashes
            .lock()
            .expect("missing hashes lock")
            .clear();

        {
            let mut files = self.files.lock().expect("files lock");
            files.refresh()?;
            if files.num_files() == 0 {
                return Err(ChainError::NoBlockFiles);
            }
            ledgerd_log::log_info!("total blk*.dat files: {}", files.num_files());
        }

        if force_rebuild {
            ledgerd_log::log_warn!("clearing databases for clean build");
            self.destroy_and_reset()?;
            self.chain.write().expect("chain lock").clear();
            self.filter.reset_scan_heights();
        } else if self.chain.read().expect("chain lock").is_empty() {
            self.load_headers_from_store()?;
        }

        if force_rescan && !force_rebuild {
            self.delete_histories()?;
            self.filter.reset_scan_heights();
        }

        let dbinfo = StoredDbInfo::load(&*self.store)?.ok_or(ChainError::MissingGenesis)?;
        let last_top_block_hash = dbinfo.top_blk_hash;

        // Read every header the files hold beyond what the chain knows.
        let (start_file, start_offset) = self.find_header_scan_start()?;
        let end_byte = self.scan_headers_from_files(start_file, start_offset)?;
        self.end_of_last_block_byte.store(end_byte, Ordering::Release);

        {
            let mut chain = self.chain.write().expect("chain lock");
            if let Err(err) = chain.force_organize() {
                // A corrupted headers store gets nuked and rebuilt from the
                // files before giving up.
                ledgerd_log::log_error!("corrupted headers DB: {err}");
                chain.clear();
                drop(chain);
                let end_byte = self.scan_headers_from_files(0, 0)?;
                self.end_of_last_block_byte.store(end_byte, Ordering::Release);
                self.chain.write().expect("chain lock").force_organize()?;
            }
        }
        self.persist_headers()?;

        let top_height = self.top_block_height();
        ledgerd_log::log_info!("total number of blocks found: {}", top_height + 1);

        // Figure out where scanning restarts.
        let mut scan_from: u32 = 0;
        let mut have_prior_state = false;
        if last_top_block_hash != [0u8; 32] {
            let chain = self.chain.read().expect("chain lock");
            if let Some(record) = chain.header_by_hash(&last_top_block_hash) {
                have_prior_state = true;
                if record.is_main_branch {
                    scan_from = record.height + 1;
                } else {
                    // The tip we shut down on was orphaned while we were
                    // gone: undo to the branch point, rejoin the normal
                    // scan right above it.
                    let state = chain.find_reorg_point_from_block(&last_top_block_hash)?;
                    let branch_height = chain
                        .header_by_hash(&state.reorg_branch_point)
                        .map(|record| record.height)
                        .ok_or(ChainError::MissingHeader)?;
                    reassess_after_reorg(&*self.store, &chain, &state, &*self.filter, true)?;
                    scan_from = branch_height + 1;
                }
            }
        }

        if have_prior_state && dbinfo.top_scanned_blk_hash != [0u8; 32] {
            let chain = self.chain.read().expect("chain lock");
            match chain.header_by_hash(&dbinfo.top_scanned_blk_hash) {
                Some(record) => scan_from = scan_from.min(record.height + 1),
                None => scan_from = 0,
            }
        }

        if !self.filter.is_super_node() {
            if let Some(filter_from) = self.filter.scan_from() {
                scan_from = scan_from.min(filter_from);
            }
        }

        if scan_from <= top_height {
            ledgerd_log::log_warn!("scanning from {scan_from} to {top_height}");
            self.apply_block_range(scan_from, top_height, &*self.filter, false, progress)?;
        }

        Ok(())
    }

    fn load_headers_from_store(&self) -> Result<(), ChainError> {
        let rows = self.store.scan_prefix(Column::Headers, &[])?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut chain = self.chain.write().expect("chain lock");
        for (key, value) in rows {
            let hash: Hash256 = match key.as_slice().try_into() {
                Ok(hash) => hash,
                Err(_) => continue,
            };
            let record = match decode_header_record(hash, &value) {
                Ok(record) => record,
                Err(err) => {
                    ledgerd_log::log_error!("dropping unreadable header row: {err}");
                    continue;
                }
            };
            chain.add_block(hash, record.header.clone());
            let entry = chain.header_by_hash_mut(&hash).expect("just inserted");
            // Stored duplicate IDs are authoritative: every (height, dup)
            // key in the store was built with them.
            entry.duplicate_id = record.duplicate_id;
            entry.file_coord = record.file_coord;
            entry.num_tx = record.num_tx;
        }
        ledgerd_log::log_info!("loaded {} headers from the store", chain.len());
        Ok(())
    }

    fn persist_headers(&self) -> Result<(), ChainError> {
        let chain = self.chain.read().expect("chain lock");
        let mut batch = WriteBatch::new();
        for record in chain.iter_records() {
            batch.put(Column::Headers, record.hash, encode_header_record(record));
        }
        drop(chain);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    fn put_header_row(&self, hash: &Hash256) -> Result<(), ChainError> {
        let chain = self.chain.read().expect("chain lock");
        let Some(record) = chain.header_by_hash(hash) else {
            return Err(ChainError::MissingHeader);
        };
        let row = encode_header_record(record);
        drop(chain);
        self.store.put(Column::Headers, hash, &row)?;
        Ok(())
    }

    /// Which file/offset header reading resumes from: the file before the
    /// first one whose leading hash the chain does not recognize, scanned
    /// forward to its first unknown block.
    fn find_header_scan_start(&self) -> Result<(u16, u64), ChainError> {
        let files = self.files.lock().expect("files lock");
        if self.chain.read().expect("chain lock").is_empty() {
            return Ok((0, 0));
        }
        let first_hashes = files.first_header_hashes()?;
        let mut start_file = first_hashes.len() as u16;
        for (index, first_hash) in first_hashes.iter().enumerate() {
            let known = match first_hash {
                Some(hash) => self
                    .chain
                    .read()
                    .expect("chain lock")
                    .has_header_with_hash(hash),
                None => false,
            };
            if !known {
                start_file = index as u16;
                break;
            }
        }
        let start_file = start_file.saturating_sub(1);

        let offset = files.scan_file(start_file, 0, &mut |payload, _coord| {
            if payload.len() < HEADER_SIZE {
                return Err(ChainError::Decode(
                    ledgerd_primitives::encoding::DecodeError::UnexpectedEof,
                ));
            }
            let hash = ledgerd_primitives::sha256d(&payload[..HEADER_SIZE]);
            if self
                .chain
                .read()
                .expect("chain lock")
                .has_header_with_hash(&hash)
            {
                Ok(FrameAction::Continue)
            } else {
                Ok(FrameAction::Halt)
            }
        })?;

        ledgerd_log::log_info!(
            "first unrecognized hash file: {start_file}, offset of first unrecognized block: {offset}"
        );
        Ok((start_file, offset))
    }

    /// Read headers (plus coordinates and tx counts) out of the files into
    /// the chain. Returns the end-of-last-block byte of the final file.
    fn scan_headers_from_files(&self, start_file: u16, start_offset: u64) -> Result<u64, ChainError> {
        let files = self.files.lock().expect("files lock");
        let mut end_byte = 0u64;
        for file_number in start_file..files.num_files() {
            let offset = if file_number == start_file {
                start_offset
            } else {
                0
            };
            let mut chain = self.chain.write().expect("chain lock");
            end_byte = files.scan_file(file_number, offset, &mut |payload, coord| {
                if payload.len() <= HEADER_SIZE {
                    return Err(ChainError::Decode(
                        ledgerd_primitives::encoding::DecodeError::UnexpectedEof,
                    ));
                }
                let header = BlockHeader::consensus_decode(&payload[..HEADER_SIZE])
                    .map_err(ChainError::Decode)?;
                let hash = header.hash();
                let num_tx = Decoder::new(&payload[HEADER_SIZE..])
                    .read_varint()
                    .map_err(ChainError::Decode)? as u32;
                chain.add_block(hash, header);
                let record = chain.header_by_hash_mut(&hash).expect("just inserted");
                record.file_coord = Some(coord);
                record.num_tx = num_tx;
                Ok(FrameAction::Continue)
            })?;
            drop(chain);
        }
        Ok(end_byte)
    }

    // ------------------------------------------------------------------
    // Applying ranges

    /// Apply blocks `[start, end]` with the given filter. `ssh_only` is the
    /// side-scan mode: only SSH rows are written. Corrupt or incomplete
    /// blocks are skipped and remembered in `missing_block_hashes`.
    pub fn apply_block_range(
        &self,
        start: u32,
        end: u32,
        filter: &dyn AddressFilter,
        ssh_only: bool,
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), ChainError> {
        if start > end {
            return Ok(());
        }
        let mut writer = if ssh_only {
            BlockWriter::for_side_scan(&*self.store, self.config.update_bytes_thresh)
        } else {
            BlockWriter::new(&*self.store, self.config.update_bytes_thresh)
        };
        let total = (end - start + 1) as u64;
        let mut measurer = ProgressMeasurer::new(total);

        for height in start..=end {
            let (hash, duplicate_id, file_coord) = {
                let chain = self.chain.read().expect("chain lock");
                let record = chain
                    .header_by_height(height)
                    .ok_or(ChainError::MissingHeader)?;
                (record.hash, record.duplicate_id, record.file_coord)
            };

            let raw = self.fetch_raw_block(height, duplicate_id, file_coord)?;
            let Some(raw) = raw else {
                ledgerd_log::log_error!("no stored data for block at height {height}");
                self.push_missing_block_hash(hash);
                continue;
            };

            let block = match Block::consensus_decode(&raw) {
                Ok(block) => block,
                Err(err) => {
                    ledgerd_log::log_error!(
                        "{err} (error processing block at height {height}, size {}, top {end})",
                        raw.len()
                    );
                    self.push_missing_block_hash(hash);
                    continue;
                }
            };

            match writer.apply_block(&block, height, duplicate_id, Some(&raw), filter) {
                Ok(_) => {}
                Err(ChainError::MissingInput) => {
                    ledgerd_log::log_error!(
                        "missing referenced prior output in block at height {height}"
                    );
                    self.push_missing_block_hash(hash);
                }
                Err(err) => return Err(err),
            }

            measurer.advance((height - start + 1) as u64);
            measurer.report(progress);
        }

        writer.commit()?;
        Ok(())
    }

    fn fetch_raw_block(
        &self,
        height: u32,
        duplicate_id: u8,
        file_coord: Option<FileCoord>,
    ) -> Result<Option<Vec<u8>>, ChainError> {
        let key = hgtx_key(hgtx(height, duplicate_id));
        if let Some(raw) = self.store.get(Column::BlkData, &key)? {
            return Ok(Some(raw));
        }
        if let Some(coord) = file_coord {
            let files = self.files.lock().expect("files lock");
            return Ok(Some(files.read_block(&coord)?));
        }
        Ok(None)
    }

    fn push_missing_block_hash(&self, hash: Hash256) {
        self.missing_block_hashes
            .lock()
            .expect("missing hashes lock")
            .push(hash);
    }

    // ------------------------------------------------------------------
    // Incremental updates

    /// Ingest whatever new bytes the node appended to the block files.
    /// Returns what changed so the view layer can notify its consumers.
    pub fn read_blk_file_update(&self) -> Result<UpdateResult, ChainError> {
        self.check_for_merge()?;

        let prev_top_height = self.top_block_height();
        let prev_top_hash = self.top_block_hash().unwrap_or([0u8; 32]);
        let mut result = UpdateResult {
            prev_top_height,
            new_top_height: prev_top_height,
            prev_top_hash,
            new_top_hash: prev_top_hash,
            ..UpdateResult::default()
        };

        let mut frames: Vec<(Vec<u8>, FileCoord)> = Vec::new();
        {
            let mut files = self.files.lock().expect("files lock");
            let last_file = files.num_files().saturating_sub(1);
            files.refresh()?;
            if files.num_files() == 0 {
                ledgerd_log::log_error!("cannot open any block file for update");
                return Ok(result);
            }
            let mut sink = |payload: &[u8], coord: FileCoord| {
                frames.push((payload.to_vec(), coord));
                Ok(FrameAction::Continue)
            };
            let mut end_byte = files.scan_file(
                last_file,
                self.end_of_last_block_byte.load(Ordering::Acquire),
                &mut sink,
            )?;

            // A blkfile split: straddle into the new file(s).
            let mut next_file = last_file + 1;
            loop {
                while next_file < files.num_files() {
                    ledgerd_log::log_info!("new block file split, reading {}", next_file);
                    end_byte = files.scan_file(next_file, 0, &mut sink)?;
                    next_file += 1;
                }
                if files.next_file_exists() {
                    files.refresh()?;
                } else {
                    break;
                }
            }
            self.end_of_last_block_byte.store(end_byte, Ordering::Release);
        }

        if frames.is_empty() {
            return Ok(result);
        }

        for (payload, coord) in frames {
            match self.add_new_block_data(&payload, coord, &mut result) {
                Ok(()) => result.blocks_read += 1,
                Err(err) => ledgerd_log::log_error!("error adding block data: {err}"),
            }
        }

        result.new_top_height = self.top_block_height();
        result.new_top_hash = self.top_block_hash().unwrap_or(result.prev_top_hash);
        ledgerd_log::log_info!("added {} new blocks", result.blocks_read);
        Ok(result)
    }

    fn add_new_block_data(
        &self,
        payload: &[u8],
        coord: FileCoord,
        result: &mut UpdateResult,
    ) -> Result<(), ChainError> {
        if payload.len() <= HEADER_SIZE {
            return Err(ChainError::Decode(
                ledgerd_primitives::encoding::DecodeError::UnexpectedEof,
            ));
        }
        let header = BlockHeader::consensus_decode(&payload[..HEADER_SIZE])
            .map_err(ChainError::Decode)?;
        let hash = header.hash();

        let (state, height, duplicate_id) = {
            let mut chain = self.chain.write().expect("chain lock");
            chain.add_block(hash, header);
            let state = chain.organize()?;
            let record = chain.header_by_hash_mut(&hash).ok_or(ChainError::MissingHeader)?;
            record.file_coord = Some(coord);
            record.num_tx = Decoder::new(&payload[HEADER_SIZE..])
                .read_varint()
                .unwrap_or(0) as u32;
            (state, record.height, record.duplicate_id)
        };

        let block = match Block::consensus_decode(payload) {
            Ok(block) => block,
            Err(err) => {
                // Header is fine, contents are not: keep the raw row so the
                // chain stays navigable, remember the hash, move on.
                ledgerd_log::log_error!(
                    "{err} (error encountered processing block at byte {} file {}, blocksize {}, top {})",
                    coord.offset,
                    coord.file_number,
                    coord.size,
                    self.top_block_height()
                );
                self.store
                    .put(Column::BlkData, &hgtx_key(hgtx(height, duplicate_id)), payload)?;
                self.put_header_row(&hash)?;
                self.push_missing_block_hash(hash);
                return Ok(());
            }
        };

        if !state.prev_top_still_valid {
            ledgerd_log::log_warn!("blockchain reorganization detected");
            // The raw row must exist before the replay walks over it.
            self.store
                .put(Column::BlkData, &hgtx_key(hgtx(height, duplicate_id)), payload)?;
            let chain = self.chain.read().expect("chain lock");
            let reorg =
                reassess_after_reorg(&*self.store, &chain, &state, &*self.filter, false)?;
            drop(chain);
            ledgerd_log::log_info!(
                "{} blocks long reorg, branch point at {}",
                reorg.new_top_height.saturating_sub(reorg.branch_point_height),
                reorg.branch_point_height
            );
            result.mined_tx_hashes.extend(reorg.added_txes.iter().copied());
            result.reorg = Some(reorg);
        } else if state.has_new_top {
            let mut writer = BlockWriter::new(&*self.store, self.config.update_bytes_thresh);
            let sud = writer.apply_block(&block, height, duplicate_id, Some(payload), &*self.filter)?;
            writer.commit()?;
            let mut mined: BTreeSet<Hash256> = BTreeSet::new();
            for added in &sud.outpoints_added {
                mined.insert(added.outpoint.hash);
            }
            result.mined_tx_hashes.extend(mined);
            self.put_header_row(&hash)?;
        } else {
            ledgerd_log::log_warn!("block data did not extend the main chain");
            self.store
                .put(Column::BlkData, &hgtx_key(hgtx(height, duplicate_id)), payload)?;
            self.put_header_row(&hash)?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Address registration and side scans

    /// Register a batch of addresses. Brand-new addresses go live at once;
    /// pre-existing ones are back-filled by a side scan on a worker thread
    /// and merged in at the next ingest. The handle signals completion.
    pub fn register_addresses(
        self: Arc<Self>,
        batch: WalletBatch,
    ) -> Result<RegistrationHandle, ChainError> {
        let (done, receiver) = bounded(1);
        let handle = RegistrationHandle::new(receiver);

        let new_addrs: Vec<ScrAddr> = batch
            .scr_addrs
            .iter()
            .filter(|scr_addr| !self.filter.is_registered(scr_addr))
            .copied()
            .collect();

        if new_addrs.is_empty() {
            // Re-registering a known set is a no-op with empty side-scan
            // work.
            let _ = done.send(true);
            return Ok(handle);
        }

        let top = self.top_block_height();
        if batch.is_new || top == 0 {
            self.filter
                .insert_batch(new_addrs.into_iter().map(|scr_addr| (scr_addr, top)));
            let _ = done.send(true);
            return Ok(handle);
        }

        let manager = Arc::clone(&self);
        let wallet_id = batch.wallet_id.clone();
        std::thread::Builder::new()
            .name("side-scan".to_string())
            .spawn(move || {
                let subset = ScanSubset::new(new_addrs.iter().copied());
                match manager.apply_block_range(0, top, &subset, true, &mut NullProgress) {
                    Ok(()) => {
                        let addrs: HashMap<ScrAddr, u32> =
                            new_addrs.into_iter().map(|scr_addr| (scr_addr, 0)).collect();
                        manager.filter.queue_merge(PendingMerge {
                            addrs,
                            scanned_to: top,
                            wallet_id,
                            done,
                        });
                    }
                    Err(err) => {
                        ledgerd_log::log_error!("side scan for {wallet_id} failed: {err}");
                        let _ = done.send(false);
                    }
                }
            })
            .map_err(ChainError::Io)?;

        Ok(handle)
    }

    /// Fold finished side scans into the live filter. Called at the top of
    /// every incremental ingest so no block is applied during the merge
    /// window; closes any gap between the side scan's end height and the
    /// current tip first.
    pub fn check_for_merge(&self) -> Result<(), ChainError> {
        if !self.filter.has_pending_merge() {
            return Ok(());
        }
        for merge in self.filter.take_pending_merges() {
            let top = self.top_block_height();
            if merge.scanned_to < top {
                let subset = ScanSubset::new(merge.addrs.keys().copied());
                if let Err(err) = self.apply_block_range(
                    merge.scanned_to + 1,
                    top,
                    &subset,
                    true,
                    &mut NullProgress,
                ) {
                    let _ = merge.done.send(false);
                    return Err(err);
                }
            }
            self.filter.insert_batch(merge.addrs.clone());
            ledgerd_log::log_info!(
                "merged {} side-scanned addresses for {}",
                merge.addrs.len(),
                merge.wallet_id
            );
            let _ = merge.done.send(true);
        }
        Ok(())
    }

    /// Drop the SSH rows of the given addresses (before a re-registration
    /// with a different starting height, or on unregister).
    pub fn wipe_scr_addrs_ssh(&self, addrs: &[ScrAddr]) -> Result<usize, ChainError> {
        self.filter.wipe(&*self.store, addrs)
    }

    // ------------------------------------------------------------------
    // Maintenance

    /// Clear every SSH row and reset the scan marks; raw block and stxo
    /// rows stay.
    pub fn delete_histories(&self) -> Result<(), ChainError> {
        ledgerd_log::log_info!("clearing all script histories");
        let deleted = delete_prefix_batched(&*self.store, Column::ScriptHist, &[], BULK_DELETE_CAP)?
            + delete_prefix_batched(&*self.store, Column::SubHist, &[], BULK_DELETE_CAP)?;

        let mut info = StoredDbInfo::load(&*self.store)?.ok_or(ChainError::MissingGenesis)?;
        info.applied_to_height = 0;
        info.top_blk_height = 0;
        info.top_blk_hash = [0u8; 32];
        info.top_scanned_blk_hash = [0u8; 32];
        let mut batch = WriteBatch::new();
        info.put(&mut batch);
        self.store.write_batch(&batch)?;

        ledgerd_log::log_info!("deleted {deleted} SSH and sub-history entries");
        Ok(())
    }

    fn destroy_and_reset(&self) -> Result<(), ChainError> {
        ledgerd_log::log_warn!("destroying databases; will need to be rebuilt");
        for column in Column::ALL {
            delete_prefix_batched(&*self.store, column, &[], BULK_DELETE_CAP)?;
        }
        let mut batch = WriteBatch::new();
        StoredDbInfo::fresh(self.config.magic_bytes, self.config.genesis_block_hash)
            .put(&mut batch);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read paths

    pub fn db_info(&self) -> Result<StoredDbInfo, ChainError> {
        StoredDbInfo::load(&*self.store)?.ok_or(ChainError::MissingGenesis)
    }

    /// Height of the last block whose SSH rows are on disk.
    pub fn top_scanned_block(&self) -> Result<u32, ChainError> {
        let info = self.db_info()?;
        if info.applied_to_height > 0 {
            Ok(info.applied_to_height)
        } else {
            Ok(0)
        }
    }

    pub fn tx_key_for_hash(&self, txid: &Hash256) -> Result<Option<TxKey>, ChainError> {
        let Some(bytes) = self.store.get(Column::TxIndex, txid)? else {
            return Ok(None);
        };
        Ok(TxKey::from_slice(&bytes))
    }

    pub fn has_tx_with_hash(&self, txid: &Hash256) -> Result<bool, ChainError> {
        Ok(self.tx_key_for_hash(txid)?.is_some())
    }

    /// Fetch a transaction by its locator; parses the stored block row.
    pub fn tx_by_key(&self, key: &TxKey) -> Result<Option<(Transaction, Hash256)>, ChainError> {
        let raw_key = hgtx_key(key.hgtx());
        let Some(raw) = self.store.get(Column::BlkData, &raw_key)? else {
            return Ok(None);
        };
        let block = Block::consensus_decode(&raw)?;
        let Some(tx) = block.transactions.get(key.tx_index() as usize) else {
            return Ok(None);
        };
        let txid = tx.txid();
        Ok(Some((tx.clone(), txid)))
    }

    pub fn tx_by_hash(&self, txid: &Hash256) -> Result<Option<Transaction>, ChainError> {
        let Some(key) = self.tx_key_for_hash(txid)? else {
            return Ok(None);
        };
        Ok(self.tx_by_key(&key)?.map(|(tx, _)| tx))
    }

    /// Whether a confirmed transaction sits on the main branch.
    pub fn is_tx_main_branch(&self, txid: &Hash256) -> Result<bool, ChainError> {
        let Some(key) = self.tx_key_for_hash(txid)? else {
            return Ok(false);
        };
        let height = key.height();
        Ok(self.main_duplicate_id_for_height(height) == Some(key.duplicate_id()))
    }

    pub fn stored_tx_out(
        &self,
        height: u32,
        tx_index: u16,
        out_index: u16,
    ) -> Result<Option<StoredTxOut>, ChainError> {
        let Some(duplicate_id) = self.main_duplicate_id_for_height(height) else {
            return Ok(None);
        };
        let key = TxOutKey::new(TxKey::new(hgtx(height, duplicate_id), tx_index), out_index);
        let Some(bytes) = self.store.get(Column::Stxo, key.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(StoredTxOut::decode(&bytes)?))
    }

    /// The transaction that spent a given output, if any.
    pub fn spender_tx_for_tx_out(
        &self,
        height: u32,
        tx_index: u16,
        out_index: u16,
    ) -> Result<Option<(Transaction, Hash256)>, ChainError> {
        let Some(stxo) = self.stored_tx_out(height, tx_index, out_index)? else {
            return Ok(None);
        };
        let Some(spender) = stxo.spent_by else {
            return Ok(None);
        };
        self.tx_by_key(&spender.tx_key())
    }

    pub fn ssh_summary(&self, scr_addr: &ScrAddr) -> Result<Option<StoredScriptHistory>, ChainError> {
        let Some(bytes) = self.store.get(Column::ScriptHist, scr_addr.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(StoredScriptHistory::decode(&bytes)?))
    }

    /// Per-height TxIO counts for one address; the pager's raw material.
    pub fn ssh_height_summary(
        &self,
        scr_addr: &ScrAddr,
    ) -> Result<std::collections::BTreeMap<u32, u32>, ChainError> {
        let mut summary = std::collections::BTreeMap::new();
        let rows = self.store.scan_prefix(Column::SubHist, scr_addr.as_bytes())?;
        for (key, value) in rows {
            let Some((_, bucket_hgtx)) = crate::keys::parse_sub_hist_key(&key) else {
                continue;
            };
            let bucket = StoredSubHistory::decode(&value)?;
            if !bucket.txio.is_empty() {
                *summary.entry(hgtx_height(bucket_hgtx)).or_insert(0) += bucket.txio.len() as u32;
            }
        }
        Ok(summary)
    }

    /// All TxIOs of an address whose block height falls in `[start, end]`.
    pub fn txios_for_scr_addr(
        &self,
        scr_addr: &ScrAddr,
        start: u32,
        end: u32,
    ) -> Result<Vec<TxIOPair>, ChainError> {
        let mut txios = Vec::new();
        let rows = self.store.scan_prefix(Column::SubHist, scr_addr.as_bytes())?;
        for (key, value) in rows {
            let Some((_, bucket_hgtx)) = crate::keys::parse_sub_hist_key(&key) else {
                continue;
            };
            let height = hgtx_height(bucket_hgtx);
            if height < start || height > end {
                continue;
            }
            let bucket = StoredSubHistory::decode(&value)?;
            txios.extend(bucket.txio.into_values());
        }
        Ok(txios)
    }

    /// Confirmed unspent outputs of one address, keyed by their locator so
    /// callers can overlay zero-conf spends.
    pub fn unspent_tx_outs_for_scr_addr(
        &self,
        scr_addr: &ScrAddr,
    ) -> Result<Vec<(TxOutKey, UnspentTxOut)>, ChainError> {
        let mut utxos = Vec::new();
        let top = self.top_block_height();
        for txio in self.txios_for_scr_addr(scr_addr, 0, top)? {
            if txio.is_spent() {
                continue;
            }
            let key = txio.txout_key;
            let Some(bytes) = self.store.get(Column::Stxo, key.as_bytes())? else {
                continue;
            };
            let stxo = StoredTxOut::decode(&bytes)?;
            let Some((_, txid)) = self.tx_by_key(&key.tx_key())? else {
                continue;
            };
            utxos.push((
                key,
                UnspentTxOut {
                    tx_hash: txid,
                    tx_out_index: key.out_index() as u32,
                    height: key.tx_key().height(),
                    value: stxo.value,
                    script_pubkey: stxo.script_pubkey,
                },
            ));
        }
        Ok(utxos)
    }

    /// `(totalUnspent, totalTxioCount)` for one address, the full-balance
    /// query shape.
    pub fn addr_full_balance(&self, scr_addr: &ScrAddr) -> Result<(u64, u64), ChainError> {
        match self.ssh_summary(scr_addr)? {
            Some(summary) => Ok((summary.total_unspent, summary.total_txio_count)),
            None => Ok((0, 0)),
        }
    }
}
