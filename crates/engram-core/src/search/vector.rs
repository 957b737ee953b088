//! In-Process Vector Index
//!
//! Keyed by memory id, unit-normalized on insert, brute-force cosine top-k
//! by default. Persistence is a side-file pair next to the database: a
//! binary file of float16 rows plus a JSON manifest with the id order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::encoding::to_unit_vector;
use crate::storage::StorageError;

/// A preselection hit from the index
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub memory_id: String,
    pub score: f32,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    memory_ids: Vec<String>,
    embedding_dim: usize,
}

struct Inner {
    vectors: HashMap<String, Vec<f32>>,
    cache_dirty: bool,
    cached_ids: Vec<String>,
    /// Row-major matrix of unit vectors matching `cached_ids`
    cached_matrix: Vec<f32>,
    #[cfg(feature = "ann")]
    ann: Option<AnnBackend>,
}

/// In-memory unit-vector index with side-file persistence
pub struct VectorStore {
    embedding_dim: usize,
    index_path: PathBuf,
    inner: Mutex<Inner>,
}

impl VectorStore {
    pub fn new(embedding_dim: usize, index_path: impl Into<PathBuf>) -> Self {
        Self {
            embedding_dim,
            index_path: index_path.into(),
            inner: Mutex::new(Inner {
                vectors: HashMap::new(),
                cache_dirty: true,
                cached_ids: Vec::new(),
                cached_matrix: Vec::new(),
                #[cfg(feature = "ann")]
                ann: AnnBackend::new(embedding_dim),
            }),
        }
    }

    /// Index backend name
    pub fn backend(&self) -> &'static str {
        #[cfg(feature = "ann")]
        {
            "usearch"
        }
        #[cfg(not(feature = "ann"))]
        {
            "in-process"
        }
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.lock().vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a vector; it is unit-normalized on the way in
    pub fn add(&self, memory_id: &str, vector: &[f32]) {
        let embedding = to_unit_vector(vector.to_vec());
        let mut inner = self.lock();
        #[cfg(feature = "ann")]
        if let Some(ann) = inner.ann.as_mut() {
            ann.add(memory_id, &embedding);
        }
        inner.vectors.insert(memory_id.to_string(), embedding);
        inner.cache_dirty = true;
    }

    /// Drop a batch of ids; missing ids are ignored
    pub fn remove_many(&self, memory_ids: &[String]) {
        let mut inner = self.lock();
        for memory_id in memory_ids {
            inner.vectors.remove(memory_id);
            #[cfg(feature = "ann")]
            if let Some(ann) = inner.ann.as_mut() {
                ann.remove(memory_id);
            }
        }
        inner.cache_dirty = true;
    }

    /// Top-k ids by cosine similarity against the query vector
    pub fn search(&self, query_vector: &[f32], top_k: usize) -> Vec<VectorHit> {
        if top_k == 0 {
            return Vec::new();
        }
        let query = to_unit_vector(query_vector.to_vec());
        let mut inner = self.lock();

        #[cfg(feature = "ann")]
        if let Some(ann) = inner.ann.as_ref() {
            return ann.search(&query, top_k);
        }

        inner.rebuild_cache();
        let dim = self.embedding_dim;
        if inner.cached_ids.is_empty() || query.len() != dim {
            return Vec::new();
        }
        let mut scored: Vec<VectorHit> = inner
            .cached_ids
            .iter()
            .enumerate()
            .map(|(row, memory_id)| {
                let offset = row * dim;
                let score = inner.cached_matrix[offset..offset + dim]
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                VectorHit {
                    memory_id: memory_id.clone(),
                    score,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    /// Persist the index: float16 rows at the index path, id manifest beside it
    pub fn save(&self) -> Result<(), StorageError> {
        let inner = self.lock();
        let mut memory_ids: Vec<String> = inner.vectors.keys().cloned().collect();
        memory_ids.sort();

        let mut rows: Vec<u8> = Vec::with_capacity(memory_ids.len() * self.embedding_dim * 2);
        for memory_id in &memory_ids {
            let vector = &inner.vectors[memory_id];
            for value in vector {
                rows.extend_from_slice(&f16::from_f32(*value).to_le_bytes());
            }
        }
        std::fs::write(&self.index_path, rows)?;

        let manifest = Manifest {
            memory_ids,
            embedding_dim: self.embedding_dim,
        };
        let manifest_json = serde_json::to_string(&manifest)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        std::fs::write(Self::manifest_path(&self.index_path), manifest_json)?;
        Ok(())
    }

    /// Load a previously saved index; a missing side-file is not an error
    pub fn load(&self) -> Result<usize, StorageError> {
        let manifest_path = Self::manifest_path(&self.index_path);
        if !manifest_path.exists() || !self.index_path.exists() {
            return Ok(0);
        }
        let manifest_json = std::fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = serde_json::from_str(&manifest_json)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        if manifest.embedding_dim != self.embedding_dim {
            return Err(StorageError::Codec(format!(
                "index dimension mismatch: expected {}, found {}",
                self.embedding_dim, manifest.embedding_dim
            )));
        }
        let rows = std::fs::read(&self.index_path)?;
        let row_bytes = self.embedding_dim * 2;
        if rows.len() != manifest.memory_ids.len() * row_bytes {
            return Err(StorageError::Codec("index payload truncated".into()));
        }

        let mut inner = self.lock();
        inner.vectors.clear();
        for (row, memory_id) in manifest.memory_ids.iter().enumerate() {
            let offset = row * row_bytes;
            let vector: Vec<f32> = rows[offset..offset + row_bytes]
                .chunks_exact(2)
                .map(|pair| f16::from_le_bytes([pair[0], pair[1]]).to_f32())
                .collect();
            #[cfg(feature = "ann")]
            if let Some(ann) = inner.ann.as_mut() {
                ann.add(memory_id, &vector);
            }
            inner.vectors.insert(memory_id.clone(), vector);
        }
        inner.cache_dirty = true;
        Ok(inner.vectors.len())
    }

    fn manifest_path(index_path: &Path) -> PathBuf {
        index_path.with_extension("manifest.json")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Index state has no invariants a panicked writer can break mid-update
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn rebuild_cache(&mut self) {
        if !self.cache_dirty {
            return;
        }
        self.cached_ids = self.vectors.keys().cloned().collect();
        self.cached_ids.sort();
        self.cached_matrix.clear();
        for memory_id in &self.cached_ids {
            self.cached_matrix.extend_from_slice(&self.vectors[memory_id]);
        }
        self.cache_dirty = false;
    }
}

// ============================================================================
// ANN BACKEND (optional)
// ============================================================================

#[cfg(feature = "ann")]
struct AnnBackend {
    index: usearch::Index,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

#[cfg(feature = "ann")]
impl AnnBackend {
    fn new(dimensions: usize) -> Option<Self> {
        let options = usearch::IndexOptions {
            dimensions,
            metric: usearch::MetricKind::Cos,
            quantization: usearch::ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = usearch::Index::new(&options).ok()?;
        index.reserve(1024).ok()?;
        Some(Self {
            index,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    fn add(&mut self, key: &str, vector: &[f32]) {
        if let Some(&existing) = self.key_to_id.get(key) {
            let _ = self.index.remove(existing);
        }
        if self.index.size() >= self.index.capacity() {
            let _ = self.index.reserve((self.index.capacity() * 2).max(16));
        }
        let id = *self.key_to_id.entry(key.to_string()).or_insert_with(|| {
            let id = self.next_id;
            self.next_id += 1;
            id
        });
        if self.index.add(id, vector).is_ok() {
            self.id_to_key.insert(id, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            let _ = self.index.remove(id);
        }
    }

    fn search(&self, query: &[f32], top_k: usize) -> Vec<VectorHit> {
        let Ok(matches) = self.index.search(query, top_k) else {
            return Vec::new();
        };
        matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(id, distance)| {
                self.id_to_key.get(id).map(|key| VectorHit {
                    memory_id: key.clone(),
                    score: 1.0 - distance,
                })
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
