use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Row families of the index. One byte-ordered namespace per family; the
/// composite keys inside stay big-endian so prefix scans walk in height
/// order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    Headers,
    BlkData,
    Stxo,
    TxIndex,
    ScriptHist,
    SubHist,
    Undo,
    Meta,
}

impl Column {
    pub const ALL: [Column; 8] = [
        Column::Headers,
        Column::BlkData,
        Column::Stxo,
        Column::TxIndex,
        Column::ScriptHist,
        Column::SubHist,
        Column::Undo,
        Column::Meta,
    ];

    pub const fn index(self) -> usize {
        match self {
            Column::Headers => 0,
            Column::BlkData => 1,
            Column::Stxo => 2,
            Column::TxIndex => 3,
            Column::ScriptHist => 4,
            Column::SubHist => 5,
            Column::Undo => 6,
            Column::Meta => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Headers => "headers",
            Column::BlkData => "blkdata",
            Column::Stxo => "stxo",
            Column::TxIndex => "tx_index",
            Column::ScriptHist => "script_hist",
            Column::SubHist => "sub_hist",
            Column::Undo => "undo",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 32]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteKey {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 32]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteValue {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    bytes: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        let key = key.into();
        let value = value.into();
        self.bytes += key.as_slice().len() + value.as_slice().len();
        self.ops.push(WriteOp::Put { column, key, value });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        let key = key.into();
        self.bytes += key.as_slice().len();
        self.ops.push(WriteOp::Delete { column, key });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Approximate payload size, used for commit pacing.
    pub fn approx_bytes(&self) -> usize {
        self.bytes
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}

/// Delete every key under `prefix`, at most `cap` keys per committed batch.
/// Iteration and deletion never interleave in the same pass.
pub fn delete_prefix_batched<S: KeyValueStore>(
    store: &S,
    column: Column,
    prefix: &[u8],
    cap: usize,
) -> Result<usize, StoreError> {
    let mut total = 0usize;
    loop {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        store.for_each_prefix(column, prefix, &mut |key, _| {
            if keys.len() < cap {
                keys.push(key.to_vec());
            }
            Ok(())
        })?;
        if keys.is_empty() {
            return Ok(total);
        }
        let full_pass = keys.len() < cap;
        let mut batch = WriteBatch::new();
        for key in keys {
            batch.delete(column, key);
            total += 1;
        }
        store.write_batch(&batch)?;
        if full_pass {
            return Ok(total);
        }
    }
}
