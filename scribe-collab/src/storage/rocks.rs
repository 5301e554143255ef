//! RocksDB-backed version store.
//!
//! Column families:
//! - `documents`: latest document record per id (LZ4-compressed bincode)
//! - `versions` : version records keyed by `doc_id ‖ version` (big-endian)
//!
//! An append writes the version record and the advanced document record in
//! one `WriteBatch`, so a crash leaves either both or neither.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use scribe_core::{Document, DocumentVersion};
use uuid::Uuid;

use super::{advance, decode_record, encode_record, StoreError, VersionStore};

const CF_DOCUMENTS: &str = "documents";
const CF_VERSIONS: &str = "versions";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_VERSIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Durable [`VersionStore`] on RocksDB.
pub struct RocksVersionStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-check-write in `append_version` and `put_document`.
    write_lock: Mutex<()>,
}

impl RocksVersionStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Version store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4-compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                // Append-heavy, range-scanned by document id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn read_document(&self, id: Uuid) -> Result<Document, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode_record(&bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// `doc_id (16 bytes) ‖ version (8 bytes big-endian)`.
    fn version_key(doc_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

#[async_trait]
impl VersionStore for RocksVersionStore {
    async fn put_document(&self, doc: &Document) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.db
            .put_cf_opt(cf, doc.id.as_bytes(), encode_record(doc)?, &self.write_opts())?;
        Ok(())
    }

    async fn load_document(&self, id: Uuid) -> Result<Document, StoreError> {
        self.read_document(id)
    }

    async fn append_version(&self, version: &DocumentVersion) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_versions = self.cf(CF_VERSIONS)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut doc = self.read_document(version.document)?;
        advance(&mut doc, version)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf_versions,
            Self::version_key(version.document, version.version),
            encode_record(version)?,
        );
        batch.put_cf(cf_docs, doc.id.as_bytes(), encode_record(&doc)?);
        self.db.write_opt(batch, &self.write_opts())?;

        log::trace!("Persisted version {} of {}", version.version, version.document);
        Ok(())
    }

    async fn list_versions_since(&self, id: Uuid, since: u64) -> Result<Vec<DocumentVersion>, StoreError> {
        // Surface a missing document rather than an empty history.
        self.read_document(id)?;

        let cf = self.cf(CF_VERSIONS)?;
        let start_key = Self::version_key(id, since.saturating_add(1));

        let mut versions = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != id.as_bytes() {
                break;
            }
            versions.push(decode_record(&value)?);
        }

        Ok(versions)
    }

    async fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let doc: Document = decode_record(&value)?;
            if !doc.is_deleted() {
                ids.push(doc.id);
            }
        }

        Ok(ids)
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
