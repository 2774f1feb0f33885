//! Durable storage of client groups.
//!
//! The synchronizer and the resolver only see the [`AggregateStore`] trait.
//! Bulk reads report an outcome per key so that one bad record never hides
//! the others.
use crate::bucket::AddressBucket;
use crate::types::ClientGroup;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("batch of {size} records exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("store operation timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Per-key result of a bulk read.
#[derive(Debug)]
pub enum ReadOutcome {
    NotFound,
    Found(ClientGroup),
    Failed(StoreError),
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Reads every key, returning one outcome per key in the same order.
    /// An `Err` means the whole operation failed.
    async fn get_multi(&self, keys: &[AddressBucket]) -> Result<Vec<ReadOutcome>, StoreError>;

    async fn put_multi(&self, groups: &[ClientGroup]) -> Result<(), StoreError>;

    async fn get(&self, key: &AddressBucket) -> Result<Option<ClientGroup>, StoreError> {
        let outcome = self.get_multi(std::slice::from_ref(key)).await?.pop();
        match outcome {
            Some(ReadOutcome::Found(group)) => Ok(Some(group)),
            Some(ReadOutcome::NotFound) | None => Ok(None),
            Some(ReadOutcome::Failed(err)) => Err(err),
        }
    }
}

fn check_limit(size: usize, limit: Option<usize>) -> Result<(), StoreError> {
    match limit {
        Some(limit) if size > limit => Err(StoreError::BatchTooLarge { size, limit }),
        _ => Ok(()),
    }
}

/// In-memory store. Optionally enforces per-operation record limits the
/// way hosted key-value stores do.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<AddressBucket, ClientGroup>>,
    max_read: Option<usize>,
    max_write: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn with_limits(max_read: usize, max_write: usize) -> Self {
        MemoryStore {
            data: RwLock::new(HashMap::new()),
            max_read: Some(max_read),
            max_write: Some(max_write),
        }
    }

    /// Stores a record under `key` as-is, bypassing the bucket check. Lets
    /// callers seed malformed records.
    pub fn insert_raw(&self, key: AddressBucket, group: ClientGroup) {
        self.data.write().insert(key, group);
    }

    pub fn snapshot(&self) -> HashMap<AddressBucket, ClientGroup> {
        self.data.read().clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn get_multi(&self, keys: &[AddressBucket]) -> Result<Vec<ReadOutcome>, StoreError> {
        check_limit(keys.len(), self.max_read)?;
        let data = self.data.read();
        Ok(keys
            .iter()
            .map(|key| match data.get(key) {
                Some(group) => ReadOutcome::Found(group.clone()),
                None => ReadOutcome::NotFound,
            })
            .collect())
    }

    async fn put_multi(&self, groups: &[ClientGroup]) -> Result<(), StoreError> {
        check_limit(groups.len(), self.max_write)?;
        let mut data = self.data.write();
        for group in groups {
            data.insert(group.bucket, group.clone());
        }
        Ok(())
    }
}

#[derive(Clone)]
enum Compression {
    #[allow(dead_code)]
    None,
    // zstd with compression level
    Zstd(i32),
}

#[derive(Clone)]
struct Codec {
    compression: Compression,
    config: bincode::config::Configuration,
}

impl Codec {
    fn new(compression: Compression) -> Self {
        Codec {
            compression,
            // standard defaults to little-endian + varint
            config: bincode::config::standard(),
        }
    }

    fn write<T: Serialize, W: Write>(
        &self,
        writer: &mut W,
        value: &T,
    ) -> Result<usize, StoreError> {
        match self.compression {
            Compression::None => {
                let size = bincode::serde::encode_into_std_write(value, writer, self.config)?;
                writer.flush()?;
                Ok(size)
            }
            Compression::Zstd(level) => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
                let size = bincode::serde::encode_into_std_write(value, &mut encoder, self.config)?;
                encoder.finish()?.flush()?;
                Ok(size)
            }
        }
    }

    fn read<T: DeserializeOwned, R: Read>(&self, mut reader: R) -> Result<T, StoreError> {
        match self.compression {
            Compression::None => Ok(bincode::serde::decode_from_std_read(
                &mut reader,
                self.config,
            )?),
            Compression::Zstd(_) => {
                let mut decoder = zstd::stream::read::Decoder::new(reader)?;
                Ok(bincode::serde::decode_from_std_read(
                    &mut decoder,
                    self.config,
                )?)
            }
        }
    }
}

const RECORD_EXTENSION: &str = "grp";

/// One compressed file per client group under a directory. Every read goes
/// to disk, so several processes (an importer and a resolver) may share the
/// directory. Writes replace a record atomically with a rename; concurrent
/// writers of the same bucket resolve last-writer-wins.
#[derive(Clone)]
pub struct FileStore {
    dir: PathBuf,
    codec: Codec,
}

impl FileStore {
    /// Opens the store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        tracing::info!("opened store at {}", dir.display());

        Ok(FileStore {
            dir: dir.to_path_buf(),
            codec: Codec::new(Compression::Zstd(1)),
        })
    }

    /// Number of records currently on disk.
    pub fn len(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn record_path(&self, key: &AddressBucket) -> PathBuf {
        // Colons of IPv6 keys are not portable in file names.
        let name = key.to_string().replace(':', "_");
        self.dir.join(format!("{name}.{RECORD_EXTENSION}"))
    }

    fn read_record(&self, key: &AddressBucket) -> ReadOutcome {
        match File::open(self.record_path(key)) {
            Ok(file) => match self.codec.read(io::BufReader::new(file)) {
                Ok(group) => ReadOutcome::Found(group),
                Err(err) => ReadOutcome::Failed(err),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => ReadOutcome::NotFound,
            Err(err) => ReadOutcome::Failed(err.into()),
        }
    }

    fn write_record(&self, group: &ClientGroup) -> Result<(), StoreError> {
        let path = self.record_path(&group.bucket);
        // Unique per writer so two processes never share a temp file.
        let tmp_path = path.with_extension(format!("{}.tmp", rand::random::<u64>()));

        if let Err(err) = self.write_file(&tmp_path, group) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn write_file(&self, path: &Path, group: &ClientGroup) -> Result<(), StoreError> {
        let mut writer = io::BufWriter::new(File::create(path)?);
        self.codec.write(&mut writer, group)?;
        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

async fn blocking<T, F>(job: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?
}

#[async_trait]
impl AggregateStore for FileStore {
    async fn get_multi(&self, keys: &[AddressBucket]) -> Result<Vec<ReadOutcome>, StoreError> {
        let store = self.clone();
        let keys = keys.to_vec();
        blocking(move || Ok(keys.iter().map(|key| store.read_record(key)).collect())).await
    }

    async fn put_multi(&self, groups: &[ClientGroup]) -> Result<(), StoreError> {
        let store = self.clone();
        let groups = groups.to_vec();
        blocking(move || {
            for group in &groups {
                store.write_record(group)?;
            }
            tracing::debug!(
                groups = groups.len(),
                "stored client groups to {}",
                store.dir.display()
            );
            Ok(())
        })
        .await
    }
}
