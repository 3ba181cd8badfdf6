use crate::atomic::write_atomic;
use crate::event::{EventRecord, NewEvent};
use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FORMAT: u32 = 1;
const STATE_FILE: &str = "state.json";
const EVENTS_FILE: &str = "events.jsonl";
const LOCK_FILE: &str = ".lock";

/// On-disk snapshot document.
#[derive(Debug, Serialize, Deserialize)]
struct Document<S> {
    format: u32,
    revision: u64,
    event_head: u64,
    /// Bytes of the event log covered by this snapshot. Anything past this
    /// offset belongs to a transaction that never committed.
    log_len: u64,
    state: S,
}

/// Committed state as of one revision.
#[derive(Debug, Clone)]
pub struct Snapshot<S> {
    /// Entity collections.
    pub state: S,
    /// Number of committed write transactions.
    pub revision: u64,
    /// Sequence number of the last committed event, 0 when none.
    pub event_head: u64,
}

/// A snapshot together with the event log it commits.
#[derive(Debug, Clone)]
pub struct View<S> {
    /// State and counters.
    pub snapshot: Snapshot<S>,
    /// Every committed event, in sequence order.
    pub events: Vec<EventRecord>,
}

/// Mutable view of the ledger inside one transaction.
///
/// Changes and published events become durable together when the closure
/// returns `Ok`; an `Err` discards both.
#[derive(Debug)]
pub struct Txn<S> {
    state: S,
    now: DateTime<Utc>,
    head: u64,
    pending: Vec<EventRecord>,
    modified: bool,
}

impl<S> Txn<S> {
    /// Commit timestamp used for every record this transaction touches.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Read access to the state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Write access to the state. Marks the transaction as modifying.
    pub fn state_mut(&mut self) -> &mut S {
        self.modified = true;
        &mut self.state
    }

    /// Sequence number of the newest event, including ones published in this
    /// transaction.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Append an event; returns its sequence number.
    pub fn publish(&mut self, event: NewEvent) -> u64 {
        self.head += 1;
        self.pending.push(EventRecord {
            seq: self.head,
            topic: event.topic,
            source: event.source,
            audience: event.audience,
            payload: event.payload,
            timestamp: self.now,
        });
        self.head
    }

    /// Events published so far in this transaction.
    pub fn pending_events(&self) -> &[EventRecord] {
        &self.pending
    }
}

/// Directory-backed store of a state document plus an event log.
///
/// Safe to share between threads and to open from several processes on the
/// same directory.
pub struct Ledger<S> {
    root: PathBuf,
    state_path: PathBuf,
    log_path: PathBuf,
    lock_path: PathBuf,
    writer: Mutex<()>,
    _state: PhantomData<fn() -> S>,
}

impl<S> std::fmt::Debug for Ledger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("root", &self.root).finish()
    }
}

impl<S> Ledger<S>
where
    S: Serialize + DeserializeOwned + Default,
{
    /// Open (or initialize) the ledger under `root`.
    ///
    /// Fails with `ForemanError::Corrupt` when the snapshot or the committed
    /// part of the event log cannot be parsed. Nothing is repaired.
    pub fn open(root: impl Into<PathBuf>) -> ForemanResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let ledger = Self {
            state_path: root.join(STATE_FILE),
            log_path: root.join(EVENTS_FILE),
            lock_path: root.join(LOCK_FILE),
            root,
            writer: Mutex::new(()),
            _state: PhantomData,
        };

        {
            let _guard = ledger.writer.lock();
            let _lock = ledger.acquire_file_lock()?;
            if ledger.state_path.exists() {
                let doc = ledger.read_document()?;
                let events = ledger.read_log(doc.log_len)?;
                info!(
                    root = %ledger.root.display(),
                    revision = doc.revision,
                    events = events.len(),
                    "Ledger opened"
                );
            } else {
                ledger.write_document(&Document {
                    format: FORMAT,
                    revision: 0,
                    event_head: 0,
                    log_len: 0,
                    state: S::default(),
                })?;
                info!(root = %ledger.root.display(), "Ledger initialized");
            }
        }

        Ok(ledger)
    }

    /// Directory holding the ledger files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current committed state. Takes no lock.
    pub fn snapshot(&self) -> ForemanResult<Snapshot<S>> {
        let doc = self.read_document()?;
        Ok(Snapshot {
            state: doc.state,
            revision: doc.revision,
            event_head: doc.event_head,
        })
    }

    /// Committed state plus the matching event log. Takes no lock.
    pub fn view(&self) -> ForemanResult<View<S>> {
        let doc = self.read_document()?;
        let events = self.read_log(doc.log_len)?;
        Ok(View {
            snapshot: Snapshot {
                state: doc.state,
                revision: doc.revision,
                event_head: doc.event_head,
            },
            events,
        })
    }

    /// Run `f` as one serialized read-modify-write cycle.
    ///
    /// The closure sees the latest committed state. When it returns `Ok` and
    /// either touched the state or published events, the new events are
    /// appended and fsynced, then the snapshot is atomically replaced. A
    /// crash between the two leaves an uncommitted log tail that the next
    /// writer trims.
    pub fn transact<T, F>(&self, now: DateTime<Utc>, f: F) -> ForemanResult<T>
    where
        F: FnOnce(&mut Txn<S>) -> ForemanResult<T>,
    {
        let _guard = self.writer.lock();
        let _lock = self.acquire_file_lock()?;

        let doc = self.read_document()?;
        let mut txn = Txn {
            state: doc.state,
            now,
            head: doc.event_head,
            pending: Vec::new(),
            modified: false,
        };

        let out = f(&mut txn)?;

        if !txn.modified && txn.pending.is_empty() {
            return Ok(out);
        }

        let log_len = if txn.pending.is_empty() {
            doc.log_len
        } else {
            self.append_events(doc.log_len, &txn.pending)?
        };

        let next = Document {
            format: FORMAT,
            revision: doc.revision + 1,
            event_head: txn.head,
            log_len,
            state: txn.state,
        };
        self.write_document(&next)?;

        debug!(
            revision = next.revision,
            event_head = next.event_head,
            published = txn.pending.len(),
            "Transaction committed"
        );
        Ok(out)
    }

    /// Atomically write a derived artifact at `relative` under the root,
    /// creating parent directories as needed.
    pub fn write_artifact(&self, relative: &Path, contents: &[u8]) -> ForemanResult<PathBuf> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, contents)?;
        Ok(path)
    }

    fn acquire_file_lock(&self) -> ForemanResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        file.lock()?;
        Ok(file)
    }

    fn read_document(&self) -> ForemanResult<Document<S>> {
        let raw = fs::read(&self.state_path)?;
        let doc: Document<S> = serde_json::from_slice(&raw).map_err(|e| {
            ForemanError::Corrupt(format!("{}: {e}", self.state_path.display()))
        })?;
        if doc.format != FORMAT {
            return Err(ForemanError::Corrupt(format!(
                "{}: unsupported format {}",
                self.state_path.display(),
                doc.format
            )));
        }
        Ok(doc)
    }

    fn write_document(&self, doc: &Document<S>) -> ForemanResult<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.state_path, &bytes)
    }

    fn read_log(&self, log_len: u64) -> ForemanResult<Vec<EventRecord>> {
        if log_len == 0 {
            return Ok(Vec::new());
        }
        let bytes = match fs::read(&self.log_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ForemanError::Corrupt(format!(
                    "{} is missing but {log_len} bytes are committed",
                    self.log_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let committed = usize::try_from(log_len)
            .ok()
            .and_then(|len| bytes.get(..len))
            .ok_or_else(|| {
                ForemanError::Corrupt(format!(
                    "{} holds {} bytes, {log_len} committed",
                    self.log_path.display(),
                    bytes.len()
                ))
            })?;

        committed
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_slice(line).map_err(|e| {
                    ForemanError::Corrupt(format!("{}: {e}", self.log_path.display()))
                })
            })
            .collect()
    }

    fn append_events(&self, committed: u64, events: &[EventRecord]) -> ForemanResult<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.log_path)?;

        let actual = file.metadata()?.len();
        if actual < committed {
            return Err(ForemanError::Corrupt(format!(
                "{} holds {actual} bytes, {committed} committed",
                self.log_path.display()
            )));
        }
        if actual > committed {
            warn!(
                path = %self.log_path.display(),
                dropped = actual - committed,
                "Trimming uncommitted event log tail"
            );
            file.set_len(committed)?;
        }

        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        file.seek(SeekFrom::Start(committed))?;
        file.write_all(&buf)?;
        file.sync_data()?;

        Ok(committed + buf.len() as u64)
    }
}
