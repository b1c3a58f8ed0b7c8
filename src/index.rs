//! Index aggregate and persisted layout.
//!
//! An index directory holds:
//!
//! ```text
//! <root>/
//! ├── manifest.json   # magic, version, dimension, bits, counts
//! ├── codec.bin       # trained residual codec parameters
//! ├── ivf.bin         # centroid table + posting lists
//! └── docs/           # one compressed blob per committed document
//!     ├── 0.bin
//!     └── ...
//! ```
//!
//! The manifest is written **last** on every mutation, so it is the source of
//! truth: blobs and postings above the manifest's recorded high-water id are
//! leftovers from an interrupted append and are pruned on open.

use crate::codec::ResidualCodec;
use crate::error::{LateError, Result};
use crate::ivf::IvfIndex;
use crate::store::{atomic_write, DocStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MANIFEST_MAGIC: &str = "lateral-index";
pub const FORMAT_VERSION: u32 = 1;

/// Index metadata, sufficient to reopen without re-deriving anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub magic: String,
    pub version: u32,
    pub dimension: usize,
    pub bits: u8,
    pub num_centroids: usize,
    pub num_documents: usize,
    /// Highest committed doc id; blobs above it are uncommitted leftovers.
    pub max_doc_id: Option<u32>,
}

/// Aggregate of centroid table, document store, codec, and manifest.
#[derive(Debug)]
pub struct Index {
    pub(crate) root: PathBuf,
    pub(crate) manifest: Manifest,
    pub(crate) codec: ResidualCodec,
    pub(crate) ivf: IvfIndex,
    pub(crate) store: DocStore,
}

/// Summary statistics for an index.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub num_documents: usize,
    pub num_vectors: usize,
    pub num_centroids: usize,
    pub dimension: usize,
    pub bits: u8,
}

impl Index {
    /// Open a persisted index, validating manifest/store consistency.
    pub fn open(root: &Path) -> Result<Self> {
        let manifest_path = root.join("manifest.json");
        let manifest: Manifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;

        if manifest.magic != MANIFEST_MAGIC {
            return Err(LateError::IndexCorrupt(format!(
                "bad manifest magic {:?}",
                manifest.magic
            )));
        }
        if manifest.version != FORMAT_VERSION {
            return Err(LateError::IndexCorrupt(format!(
                "unsupported format version {}",
                manifest.version
            )));
        }

        let codec: ResidualCodec = bincode::deserialize(&fs::read(root.join("codec.bin"))?)
            .map_err(|e| LateError::IndexCorrupt(format!("codec.bin: {e}")))?;
        let mut ivf: IvfIndex = bincode::deserialize(&fs::read(root.join("ivf.bin"))?)
            .map_err(|e| LateError::IndexCorrupt(format!("ivf.bin: {e}")))?;
        let mut store = DocStore::open(root)?;

        // Prune blobs and postings committed after the manifest's high-water
        // mark; they belong to an append that never finished.
        let high = manifest.max_doc_id;
        let orphans: Vec<u32> = store
            .doc_ids()
            .filter(|&id| high.map_or(true, |h| id > h))
            .collect();
        for id in orphans {
            store.delete(id)?;
            ivf.remove_document(id);
        }

        if store.len() != manifest.num_documents {
            return Err(LateError::IndexCorrupt(format!(
                "manifest records {} documents, store has {}",
                manifest.num_documents,
                store.len()
            )));
        }
        if codec.dimension() != manifest.dimension {
            return Err(LateError::IndexCorrupt(format!(
                "manifest dimension {} does not match codec dimension {}",
                manifest.dimension,
                codec.dimension()
            )));
        }
        if ivf.num_centroids() != manifest.num_centroids {
            return Err(LateError::IndexCorrupt(format!(
                "manifest records {} centroids, ivf table has {}",
                manifest.num_centroids,
                ivf.num_centroids()
            )));
        }

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            codec,
            ivf,
            store,
        })
    }

    /// Persist codec, centroid table, then the manifest (last).
    pub(crate) fn persist(&self) -> Result<()> {
        atomic_write(&self.root.join("codec.bin"), &bincode::serialize(&self.codec)?)?;
        atomic_write(&self.root.join("ivf.bin"), &bincode::serialize(&self.ivf)?)?;
        atomic_write(
            &self.root.join("manifest.json"),
            &serde_json::to_vec_pretty(&self.manifest)?,
        )?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dimension(&self) -> usize {
        self.manifest.dimension
    }

    pub fn num_centroids(&self) -> usize {
        self.manifest.num_centroids
    }

    pub fn num_documents(&self) -> usize {
        self.store.len()
    }

    /// Remove a document's blob and postings. Unknown ids are a no-op.
    pub fn delete_document(&mut self, doc_id: u32) -> Result<()> {
        if self.store.vector_count(doc_id).is_none() {
            return Ok(());
        }
        self.store.delete(doc_id)?;
        self.ivf.remove_document(doc_id);
        self.manifest.num_documents = self.store.len();
        self.persist()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            num_documents: self.store.len(),
            num_vectors: self.store.total_vectors(),
            num_centroids: self.manifest.num_centroids,
            dimension: self.manifest.dimension,
            bits: self.manifest.bits,
        }
    }
}

/// Shared handle holding the current immutable index snapshot.
///
/// Searchers clone the `Arc` and keep scoring against their snapshot while a
/// builder prepares and atomically swaps in a replacement.
#[derive(Debug)]
pub struct IndexHandle {
    current: RwLock<Arc<Index>>,
}

impl IndexHandle {
    pub fn new(index: Index) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Index> {
        self.current.read().clone()
    }

    /// Atomically publish a new snapshot.
    pub fn swap(&self, index: Index) {
        *self.current.write() = Arc::new(index);
    }
}
