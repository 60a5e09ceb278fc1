//! Agent snapshots and where they live.
//!
//! A [`Checkpoint`] is a config record plus a named tensor payload. Stores
//! persist it; the [`CheckpointWriter`] moves the actual write off the tick
//! path onto a background thread.
//!
//! ## On-disk layout
//!
//! [`DirectoryStore`] writes one directory per snapshot under
//! `<root>/agents/`:
//!
//! ```text
//! <root>/agents/<unix-seconds>[-n]/config.json   # CheckpointMeta (serde_json)
//! <root>/agents/<unix-seconds>[-n]/tensors.bin   # BTreeMap<String, Tensor> (bincode)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agents::AgentKind;
use crate::core::{AgentRngState, CheckpointError};
use crate::nn::Matrix;

const CONFIG_FILE: &str = "config.json";
const TENSORS_FILE: &str = "tensors.bin";

/// Opaque reference to a stored checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A shaped numeric array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }
}

impl From<&Matrix> for Tensor {
    fn from(matrix: &Matrix) -> Self {
        Self {
            shape: matrix.shape().to_vec(),
            data: matrix.as_slice().to_vec(),
        }
    }
}

/// The config record of a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub agent: AgentKind,
    pub iterations: u64,
    pub epochs: u64,
    /// The agent's hyper-parameters, including layer shapes.
    pub config: serde_json::Value,
    pub rng: Option<AgentRngState>,
}

/// A complete agent snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub tensors: BTreeMap<String, Tensor>,
}

impl Checkpoint {
    /// Start a checkpoint for `agent` with its serialized config.
    pub fn new<C: Serialize>(agent: AgentKind, config: &C) -> Result<Self, CheckpointError> {
        Ok(Self {
            meta: CheckpointMeta {
                agent,
                iterations: 0,
                epochs: 0,
                config: serde_json::to_value(config)?,
                rng: None,
            },
            tensors: BTreeMap::new(),
        })
    }

    pub fn with_counters(mut self, iterations: u64, epochs: u64) -> Self {
        self.meta.iterations = iterations;
        self.meta.epochs = epochs;
        self
    }

    pub fn with_rng(mut self, rng: AgentRngState) -> Self {
        self.meta.rng = Some(rng);
        self
    }

    pub fn kind(&self) -> AgentKind {
        self.meta.agent
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn insert_matrix(&mut self, name: impl Into<String>, matrix: &Matrix) {
        self.insert(name, Tensor::from(matrix));
    }

    pub fn insert_vector(&mut self, name: impl Into<String>, data: Vec<f64>) {
        self.insert(name, Tensor::vector(data));
    }

    /// Fail unless this checkpoint was produced by an `expected` agent.
    pub fn expect_kind(&self, expected: AgentKind) -> Result<(), CheckpointError> {
        if self.meta.agent != expected {
            return Err(CheckpointError::AgentMismatch {
                expected: expected.to_string(),
                actual: self.meta.agent.to_string(),
            });
        }
        Ok(())
    }

    /// Deserialize the stored config record.
    pub fn config<C: DeserializeOwned>(&self) -> Result<C, CheckpointError> {
        Ok(serde_json::from_value(self.meta.config.clone())?)
    }

    /// Fetch a tensor and check its shape exactly.
    pub fn tensor(&self, name: &str, expected: &[usize]) -> Result<&Tensor, CheckpointError> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| CheckpointError::MissingTensor { name: name.to_string() })?;
        let elements: usize = tensor.shape.iter().product();
        if tensor.shape != expected || tensor.data.len() != elements {
            return Err(CheckpointError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape.clone(),
            });
        }
        Ok(tensor)
    }

    pub fn matrix(&self, name: &str, rows: usize, cols: usize) -> Result<Matrix, CheckpointError> {
        let tensor = self.tensor(name, &[rows, cols])?;
        Matrix::from_vec(rows, cols, tensor.data.clone()).ok_or_else(|| CheckpointError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![rows, cols],
            actual: vec![tensor.data.len()],
        })
    }

    pub fn vector(&self, name: &str, len: usize) -> Result<Vec<f64>, CheckpointError> {
        Ok(self.tensor(name, &[len])?.data.clone())
    }
}

/// Somewhere checkpoints can be persisted and read back.
///
/// `allocate` hands out the id synchronously so callers can record a
/// reference before the payload is written.
pub trait CheckpointStore: Send + Sync {
    fn allocate(&self) -> Result<CheckpointId, CheckpointError>;

    fn write(&self, id: &CheckpointId, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    fn read(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError>;

    /// Allocate and write in one step.
    fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointId, CheckpointError> {
        let id = self.allocate()?;
        self.write(&id, checkpoint)?;
        Ok(id)
    }
}

/// Filesystem store, one directory per snapshot.
#[derive(Clone, Debug)]
pub struct DirectoryStore {
    agents_dir: PathBuf,
}

impl DirectoryStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let agents_dir = root.as_ref().join("agents");
        fs::create_dir_all(&agents_dir)?;
        Ok(Self { agents_dir })
    }

    pub fn agents_dir(&self) -> &Path {
        &self.agents_dir
    }

    /// Directory holding checkpoint `id`.
    pub fn path_of(&self, id: &CheckpointId) -> PathBuf {
        PathBuf::from(id.as_str())
    }

    /// Read a checkpoint folder directly, without opening a store.
    pub fn read_path(dir: impl AsRef<Path>) -> Result<Checkpoint, CheckpointError> {
        let dir = dir.as_ref();
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(CheckpointError::NotFound {
                id: dir.to_string_lossy().into_owned(),
            });
        }
        let meta: CheckpointMeta = serde_json::from_slice(&fs::read(config_path)?)?;
        let tensors = bincode::deserialize(&fs::read(dir.join(TENSORS_FILE))?)?;
        Ok(Checkpoint { meta, tensors })
    }

    fn stamp() -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        secs.to_string()
    }
}

impl CheckpointStore for DirectoryStore {
    fn allocate(&self) -> Result<CheckpointId, CheckpointError> {
        let stamp = Self::stamp();
        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                stamp.clone()
            } else {
                format!("{stamp}-{suffix}")
            };
            let dir = self.agents_dir.join(name);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(CheckpointId::new(dir.to_string_lossy())),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write(&self, id: &CheckpointId, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self.path_of(id);
        fs::create_dir_all(&dir)?;
        let payload = bincode::serialize(&checkpoint.tensors)?;
        fs::write(dir.join(TENSORS_FILE), payload)?;
        fs::write(dir.join(CONFIG_FILE), serde_json::to_vec_pretty(&checkpoint.meta)?)?;
        Ok(())
    }

    fn read(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError> {
        Self::read_path(self.path_of(id))
    }
}

/// In-process store, used by tests and by evaluation runs that never touch disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next: AtomicU64,
    entries: Mutex<FxHashMap<CheckpointId, Checkpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints written so far.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for MemoryStore {
    fn allocate(&self) -> Result<CheckpointId, CheckpointError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(CheckpointId::new(format!("mem-{n}")))
    }

    fn write(&self, id: &CheckpointId, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CheckpointError::WriterClosed)?;
        entries.insert(id.clone(), checkpoint.clone());
        Ok(())
    }

    fn read(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| CheckpointError::WriterClosed)?;
        entries
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound { id: id.to_string() })
    }
}

enum WriterCommand {
    Write(CheckpointId, Box<Checkpoint>),
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Writes checkpoints on a background thread.
///
/// The caller hands over an owned snapshot, so the agent can keep mutating
/// its live state while the write is in flight. Dropping the writer drains
/// the queue and joins the thread.
pub struct CheckpointWriter {
    tx: mpsc::Sender<WriterCommand>,
    store: Arc<dyn CheckpointStore>,
    failures: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CheckpointWriter {
    pub fn spawn(store: Arc<dyn CheckpointStore>) -> Result<Self, CheckpointError> {
        let (tx, rx) = mpsc::channel::<WriterCommand>();
        let worker_store = Arc::clone(&store);
        let failures = Arc::new(AtomicU64::new(0));
        let worker_failures = Arc::clone(&failures);

        let handle = thread::Builder::new()
            .name("sepia-rl-checkpoint-writer".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        WriterCommand::Write(id, checkpoint) => {
                            match worker_store.write(&id, &checkpoint) {
                                Ok(()) => debug!(%id, agent = %checkpoint.kind(), "checkpoint written"),
                                Err(err) => {
                                    worker_failures.fetch_add(1, Ordering::Relaxed);
                                    warn!(%id, error = %err, "failed to write checkpoint");
                                }
                            }
                        }
                        WriterCommand::Flush(done) => {
                            let _ = done.send(());
                        }
                        WriterCommand::Shutdown => break,
                    }
                }
            })?;

        Ok(Self {
            tx,
            store,
            failures,
            handle: Some(handle),
        })
    }

    /// Reserve an id and queue the write. Returns without waiting for disk.
    pub fn submit(&self, checkpoint: Checkpoint) -> Result<CheckpointId, CheckpointError> {
        let id = self.store.allocate()?;
        self.tx
            .send(WriterCommand::Write(id.clone(), Box::new(checkpoint)))
            .map_err(|_| CheckpointError::WriterClosed)?;
        Ok(id)
    }

    /// Block until every queued write has been attempted.
    pub fn flush(&self) -> Result<(), CheckpointError> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(WriterCommand::Flush(done_tx))
            .map_err(|_| CheckpointError::WriterClosed)?;
        done_rx.recv().map_err(|_| CheckpointError::WriterClosed)
    }

    /// Flush, then read `id` back from the store.
    pub fn load(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError> {
        self.flush()?;
        self.store.read(id)
    }

    /// Number of background writes that failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("checkpoint writer thread panicked");
            }
        }
    }
}

impl fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::QTableConfig;

    fn sample_checkpoint() -> Checkpoint {
        let mut checkpoint = Checkpoint::new(AgentKind::QTable, &QTableConfig::default())
            .unwrap()
            .with_counters(12, 3);
        let matrix = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        checkpoint.insert_matrix("w", &matrix);
        checkpoint.insert_vector("v", vec![0.5, 0.25]);
        checkpoint
    }

    fn temp_root(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("sepia-rl-{tag}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn test_shape_checked_access() {
        let checkpoint = sample_checkpoint();
        assert_eq!(checkpoint.matrix("w", 2, 2).unwrap().get(1, 0), 3.0);
        assert_eq!(checkpoint.vector("v", 2).unwrap(), vec![0.5, 0.25]);

        assert!(matches!(
            checkpoint.matrix("w", 4, 1),
            Err(CheckpointError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            checkpoint.vector("missing", 1),
            Err(CheckpointError::MissingTensor { .. })
        ));
    }

    #[test]
    fn test_expect_kind() {
        let checkpoint = sample_checkpoint();
        assert!(checkpoint.expect_kind(AgentKind::QTable).is_ok());
        assert!(matches!(
            checkpoint.expect_kind(AgentKind::CrossEntropy),
            Err(CheckpointError::AgentMismatch { .. })
        ));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let id = store.save(&sample_checkpoint()).unwrap();
        assert_eq!(store.read(&id).unwrap(), sample_checkpoint());
        assert!(matches!(
            store.read(&CheckpointId::new("nope")),
            Err(CheckpointError::NotFound { .. })
        ));
    }

    #[test]
    fn test_directory_store_round_trip_and_unique_ids() {
        let root = temp_root("dir");
        let store = DirectoryStore::open(&root).unwrap();

        let a = store.save(&sample_checkpoint()).unwrap();
        let b = store.save(&sample_checkpoint()).unwrap();
        assert_ne!(a, b);
        assert!(store.path_of(&a).join(CONFIG_FILE).exists());
        assert!(store.path_of(&a).join(TENSORS_FILE).exists());
        assert_eq!(store.read(&b).unwrap(), sample_checkpoint());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_writer_flush_makes_writes_visible() {
        let store = Arc::new(MemoryStore::new());
        let writer = CheckpointWriter::spawn(store.clone()).unwrap();

        let ids: Vec<_> = (0..5).map(|_| writer.submit(sample_checkpoint()).unwrap()).collect();
        writer.flush().unwrap();

        assert_eq!(store.len(), 5);
        assert_eq!(writer.load(&ids[4]).unwrap(), sample_checkpoint());
        assert_eq!(writer.failures(), 0);
    }

    #[test]
    fn test_writer_drop_drains_queue() {
        let store = Arc::new(MemoryStore::new());
        {
            let writer = CheckpointWriter::spawn(store.clone()).unwrap();
            for _ in 0..3 {
                writer.submit(sample_checkpoint()).unwrap();
            }
        }
        assert_eq!(store.len(), 3);
    }
}
