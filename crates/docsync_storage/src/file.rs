//! Durable file-backed store.
//!
//! The store directory holds a lock file and an append-only log. Each write
//! appends one framed record:
//!
//! ```text
//! | len: u32 LE | checksum: u32 LE | payload: canonical CBOR |
//! ```
//!
//! The payload is `{m: [mutation, ...]}`, so a multi-document write is
//! replayed entirely or not at all. On open the log is replayed into memory;
//! an incomplete or damaged final record is truncated away.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use docsync_codec::{doc, document_from_cbor, document_to_cbor, Document, Value};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::state::{Mutation, StoreState};
use crate::store::{LocalStore, UpdateOutcome};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "store.log";
const COMPACT_FILE: &str = "store.log.compact";
const HEADER_LEN: usize = 8;

/// A store persisted to a directory.
///
/// # Durability
///
/// Every successful write is appended to the log before it becomes
/// visible. With sync writes enabled (the default) the log is also
/// `fsync`ed, so acknowledged writes survive a crash.
///
/// # Example
///
/// ```no_run
/// use docsync_codec::doc;
/// use docsync_storage::{FileStore, LocalStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("sync-data")).unwrap();
/// store.insert_one("db", "notes", doc! { "text" => "hello" }).unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    _lock_file: File,
    log: Mutex<File>,
    state: RwLock<StoreState>,
    sync_writes: bool,
}

impl FileStore {
    /// Opens or creates a store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the directory lock
    /// - The log cannot be read
    /// - A record before the end of the log is damaged
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(dir.to_path_buf()));
        }

        let log_path = dir.join(LOG_FILE);
        let mut log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;

        let mut raw = Vec::new();
        log.read_to_end(&mut raw)?;
        let total = raw.len();
        let (state, valid_len, records) = replay(Bytes::from(raw))?;
        if valid_len < total {
            warn!(
                path = %log_path.display(),
                discarded = total - valid_len,
                "truncating torn tail of store log"
            );
            log.set_len(valid_len as u64)?;
            log.sync_all()?;
        }
        debug!(path = %dir.display(), records, "opened file store");

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock_file: lock_file,
            log: Mutex::new(log),
            state: RwLock::new(state),
            sync_writes: true,
        })
    }

    /// Enables or disables `fsync` after every write.
    #[must_use]
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// The store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Current size of the log in bytes.
    pub fn log_size(&self) -> StorageResult<u64> {
        Ok(self.log.lock().metadata()?.len())
    }

    /// Rewrites the log so it contains only the live documents.
    pub fn compact(&self) -> StorageResult<()> {
        let state = self.state.write();
        let mut log = self.log.lock();

        let compact_path = self.dir.join(COMPACT_FILE);
        {
            let mut out = File::create(&compact_path)?;
            let snapshot = state.snapshot();
            if !snapshot.is_empty() {
                out.write_all(&frame(&snapshot)?)?;
            }
            out.sync_all()?;
        }
        fs::rename(&compact_path, self.dir.join(LOG_FILE))?;
        *log = OpenOptions::new()
            .read(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        debug!(path = %self.dir.display(), "compacted store log");
        Ok(())
    }

    fn write<R>(
        &self,
        plan: impl FnOnce(&StoreState) -> StorageResult<(Vec<Mutation>, R)>,
    ) -> StorageResult<R> {
        let mut state = self.state.write();
        let (mutations, result) = plan(&*state)?;
        if mutations.is_empty() {
            return Ok(result);
        }
        {
            let mut log = self.log.lock();
            log.write_all(&frame(&mutations)?)?;
            if self.sync_writes {
                log.sync_data()?;
            }
        }
        state.apply(mutations);
        Ok(result)
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(payload);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn frame(mutations: &[Mutation]) -> StorageResult<Bytes> {
    let encoded: Vec<Value> = mutations.iter().map(|m| Value::Document(encode_mutation(m))).collect();
    let payload = document_to_cbor(&doc! { "m" => encoded })?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Corrupted("record exceeds 4 GiB".into()))?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(len);
    buf.put_u32_le(checksum(&payload));
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Replays framed records, returning the state, the length of the valid
/// prefix and the number of records applied.
fn replay(mut data: Bytes) -> StorageResult<(StoreState, usize, usize)> {
    let total = data.len();
    let mut state = StoreState::default();
    let mut records = 0;

    while data.has_remaining() {
        let offset = total - data.remaining();
        if data.remaining() < HEADER_LEN {
            return Ok((state, offset, records));
        }
        let mut header = data.slice(..HEADER_LEN);
        let len = header.get_u32_le() as usize;
        let expected = header.get_u32_le();
        if data.remaining() - HEADER_LEN < len {
            return Ok((state, offset, records));
        }
        data.advance(HEADER_LEN);
        let payload = data.split_to(len);

        if checksum(&payload) != expected {
            if data.has_remaining() {
                return Err(StorageError::Corrupted(format!(
                    "checksum mismatch in record at offset {offset}"
                )));
            }
            return Ok((state, offset, records));
        }

        let record = document_from_cbor(&payload)?;
        let items = record
            .get_array("m")
            .ok_or_else(|| StorageError::Corrupted(format!("record at offset {offset} has no mutations")))?;
        let mutations = items
            .iter()
            .map(|item| {
                item.as_document()
                    .ok_or_else(|| StorageError::Corrupted("mutation is not a document".into()))
                    .and_then(decode_mutation)
            })
            .collect::<StorageResult<Vec<_>>>()?;
        state.apply(mutations);
        records += 1;
    }
    Ok((state, total, records))
}

fn encode_mutation(mutation: &Mutation) -> Document {
    match mutation {
        Mutation::Put {
            database,
            collection,
            document,
        } => doc! {
            "op" => "put",
            "db" => database.as_str(),
            "coll" => collection.as_str(),
            "doc" => document.clone(),
        },
        Mutation::Delete {
            database,
            collection,
            id,
        } => doc! {
            "op" => "delete",
            "db" => database.as_str(),
            "coll" => collection.as_str(),
            "id" => id.clone(),
        },
        Mutation::Drop {
            database,
            collection,
        } => doc! {
            "op" => "drop",
            "db" => database.as_str(),
            "coll" => collection.as_str(),
        },
    }
}

fn decode_mutation(document: &Document) -> StorageResult<Mutation> {
    let database = document.require_str("db")?.to_string();
    let collection = document.require_str("coll")?.to_string();
    match document.require_str("op")? {
        "put" => Ok(Mutation::Put {
            database,
            collection,
            document: document.require_document("doc")?.clone(),
        }),
        "delete" => Ok(Mutation::Delete {
            database,
            collection,
            id: document
                .get("id")
                .cloned()
                .ok_or_else(|| StorageError::Corrupted("delete record without id".into()))?,
        }),
        "drop" => Ok(Mutation::Drop {
            database,
            collection,
        }),
        other => Err(StorageError::Corrupted(format!("unknown record op {other}"))),
    }
}

impl LocalStore for FileStore {
    fn insert_one(&self, database: &str, collection: &str, document: Document) -> StorageResult<Value> {
        let mut ids = self.insert_many(database, collection, vec![document])?;
        ids.pop()
            .ok_or_else(|| StorageError::Corrupted("insert produced no id".into()))
    }

    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StorageResult<Vec<Value>> {
        self.write(|s| s.plan_insert(database, collection, documents))
    }

    fn find(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Vec<Document>> {
        self.state.read().find(database, collection, filter, None)
    }

    fn find_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
    ) -> StorageResult<Option<Document>> {
        Ok(self
            .state
            .read()
            .find(database, collection, filter, Some(1))?
            .pop())
    }

    fn find_by_id(&self, database: &str, collection: &str, id: &Value) -> StorageResult<Option<Document>> {
        Ok(self.state.read().find_by_id(database, collection, id))
    }

    fn replace_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(StorageError::invalid_update("replacement contains operators"));
        }
        self.write(|s| s.plan_update(database, collection, filter, replacement, upsert, false))
    }

    fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        self.write(|s| s.plan_update(database, collection, filter, update, upsert, false))
    }

    fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        self.write(|s| s.plan_update(database, collection, filter, update, upsert, true))
    }

    fn delete_one(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Option<Document>> {
        Ok(self
            .write(|s| s.plan_delete(database, collection, filter, false))?
            .pop())
    }

    fn delete_many(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Vec<Document>> {
        self.write(|s| s.plan_delete(database, collection, filter, true))
    }

    fn collection_names(&self, database: &str) -> StorageResult<Vec<String>> {
        Ok(self.state.read().collection_names(database))
    }

    fn database_names(&self) -> StorageResult<Vec<String>> {
        Ok(self.state.read().database_names())
    }

    fn drop_collection(&self, database: &str, collection: &str) -> StorageResult<()> {
        self.write(|s| Ok((s.plan_drop(database, collection), ())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.insert_one("db", "c", doc! { "_id" => 1, "a" => "x" }).unwrap();
            store.insert_one("db", "c", doc! { "_id" => 2 }).unwrap();
            store
                .update_one("db", "c", &doc! { "_id" => 1 }, &doc! { "$set" => doc! { "a" => "y" } }, false)
                .unwrap();
            store.delete_one("db", "c", &doc! { "_id" => 2 }).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            store.find("db", "c", &doc! {}).unwrap(),
            vec![doc! { "_id" => 1, "a" => "y" }]
        );
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileStore::open(dir.path()).unwrap();
        assert!(matches!(FileStore::open(dir.path()), Err(StorageError::Locked(_))));
    }

    #[test]
    fn file_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let good_len = {
            let store = FileStore::open(dir.path()).unwrap();
            store.insert_one("db", "c", doc! { "_id" => 1 }).unwrap();
            store.log_size().unwrap()
        };
        {
            let mut log = OpenOptions::new()
                .append(true)
                .open(dir.path().join(LOG_FILE))
                .unwrap();
            log.write_all(&[0x20, 0, 0, 0, 1, 2]).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.count("db", "c", &doc! {}).unwrap(), 1);
        assert_eq!(store.log_size().unwrap(), good_len);
    }

    #[test]
    fn file_damaged_middle_record_is_an_error() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.insert_one("db", "c", doc! { "_id" => 1 }).unwrap();
            store.insert_one("db", "c", doc! { "_id" => 2 }).unwrap();
        }
        let path = dir.path().join(LOG_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_LEN] ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(FileStore::open(dir.path()), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_compact_keeps_live_documents() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap().with_sync_writes(false);
            for i in 0..20 {
                store.insert_one("db", "c", doc! { "_id" => i }).unwrap();
            }
            store.delete_many("db", "c", &doc! { "_id" => doc! { "$gte" => 5 } }).unwrap();
            let before = store.log_size().unwrap();
            store.compact().unwrap();
            assert!(store.log_size().unwrap() < before);
            store.insert_one("db", "c", doc! { "_id" => 100 }).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.count("db", "c", &doc! {}).unwrap(), 6);
    }

    #[test]
    fn file_drop_collection_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.insert_one("db", "a", doc! { "_id" => 1 }).unwrap();
            store.insert_one("db", "b", doc! { "_id" => 1 }).unwrap();
            store.drop_collection("db", "a").unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.collection_names("db").unwrap(), vec!["b".to_string()]);
    }
}
