use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Persisted marker for hashes the lookup service confirmed it does not know.
pub const NOT_FOUND_SENTINEL: &str = "not_found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedHash {
    Resolved(String),
    NotFound,
}

impl CachedHash {
    fn from_stored(value: &str) -> Self {
        if value == NOT_FOUND_SENTINEL {
            Self::NotFound
        } else {
            Self::Resolved(value.to_string())
        }
    }

    pub fn as_stored(&self) -> &str {
        match self {
            Self::Resolved(id) => id,
            Self::NotFound => NOT_FOUND_SENTINEL,
        }
    }
}

/// Trims, drops a `0x` prefix and upper-cases, so every spelling of one hash
/// shares a cache slot.
pub fn normalize_hash_key(hash: &str) -> String {
    let trimmed = hash.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    body.to_ascii_uppercase()
}

/// Where the hash cache lives between runs.
pub trait CacheBackend {
    /// `Ok(None)` means nothing has been persisted yet.
    fn load(&self) -> anyhow::Result<Option<BTreeMap<String, String>>>;
    fn save(&self, entries: &BTreeMap<String, String>) -> anyhow::Result<()>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheBackend for JsonFileBackend {
    fn load(&self) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading {}", self.path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", self.path.display()))?;
        let Some(object) = parsed.as_object() else {
            bail!("{} does not hold a JSON object", self.path.display());
        };
        let mut entries = BTreeMap::new();
        for (key, value) in object {
            match value.as_str() {
                Some(text) => {
                    entries.insert(key.clone(), text.to_string());
                }
                None => warn!(key = %key, "ignoring non-string cache entry"),
            }
        }
        Ok(Some(entries))
    }

    /// Stages the whole store next to the target and renames it into place,
    /// so an interrupted save leaves the previous file intact.
    fn save(&self, entries: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)?;
                parent
            }
            _ => Path::new("."),
        };
        let payload: Map<String, Value> = entries
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        let mut staged = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed staging {}", self.path.display()))?;
        staged.write_all(serde_json::to_string_pretty(&Value::Object(payload))?.as_bytes())?;
        staged.flush()?;
        staged
            .persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed writing {}", self.path.display()))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path().display().to_string()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: Option<BTreeMap<String, String>>,
    saves: usize,
}

/// In-process backend; clones share state so a test can inspect what was saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: BTreeMap<String, String>) -> Self {
        let backend = Self::default();
        if let Ok(mut state) = backend.state.lock() {
            state.entries = Some(entries);
        }
        backend
    }

    pub fn snapshot(&self) -> Option<BTreeMap<String, String>> {
        self.state.lock().ok().and_then(|state| state.entries.clone())
    }

    pub fn save_count(&self) -> usize {
        self.state.lock().map(|state| state.saves).unwrap_or(0)
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory cache lock poisoned"))?;
        Ok(state.entries.clone())
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory cache lock poisoned"))?;
        state.entries = Some(entries.clone());
        state.saves += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// In-memory mirror of the persisted hash resolutions. Loaded once, fully
/// rewritten on every flush, never evicted.
pub struct HashCache {
    backend: Box<dyn CacheBackend>,
    entries: BTreeMap<String, CachedHash>,
}

impl HashCache {
    /// Never fails: an unreadable or malformed store starts the run empty.
    pub fn load(backend: impl CacheBackend + 'static) -> Self {
        let entries = match backend.load() {
            Ok(Some(stored)) => {
                info!(
                    count = stored.len(),
                    store = %backend.describe(),
                    "Loaded hash cache entries"
                );
                stored
                    .into_iter()
                    .map(|(key, value)| (normalize_hash_key(&key), CachedHash::from_stored(&value)))
                    .collect()
            }
            Ok(None) => {
                info!(store = %backend.describe(), "Cache file not found, starting with empty cache.");
                BTreeMap::new()
            }
            Err(err) => {
                warn!(
                    store = %backend.describe(),
                    "Error loading cache: {err:#}. Starting with empty cache."
                );
                BTreeMap::new()
            }
        };
        Self {
            backend: Box::new(backend),
            entries,
        }
    }

    pub fn get(&self, hash: &str) -> Option<&CachedHash> {
        self.entries.get(&normalize_hash_key(hash))
    }

    pub fn insert(&mut self, hash: &str, value: CachedHash) {
        self.entries.insert(normalize_hash_key(hash), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        let stored: BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.as_stored().to_string()))
            .collect();
        self.backend
            .save(&stored)
            .with_context(|| format!("failed saving hash cache to {}", self.backend.describe()))
    }
}

impl std::fmt::Debug for HashCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashCache")
            .field("store", &self.backend.describe())
            .field("entries", &self.entries.len())
            .finish()
    }
}
