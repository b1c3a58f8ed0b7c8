//! Index construction and incremental update.
//!
//! A build moves through `Empty -> Planning -> Encoding -> Clustering ->
//! Compressing -> Persisting -> Ready`. An `add` re-enters `Planning` to
//! decide append-vs-rebuild: below the staleness threshold the new documents
//! are assigned to the existing centroids (`AssignNew -> Compressing ->
//! Persisting`), above it the whole corpus is re-clustered with a recomputed
//! centroid count.
//!
//! Every full build stages into a sibling directory and swaps it over the
//! target at the end, so a failed or cancelled build leaves the prior
//! persisted index untouched. Appends write document blobs first and the
//! manifest last; blobs above the manifest's high-water id are pruned on the
//! next open.

use crate::codec::ResidualCodec;
use crate::distance::l2_normalize;
use crate::embed::{embed_batched, EmbedRole, Embedder};
use crate::error::{LateError, Result};
use crate::index::{Index, Manifest, FORMAT_VERSION, MANIFEST_MAGIC};
use crate::ivf::{suggested_centroid_count, IvfIndex};
use crate::store::{DocStore, StoredDocument};
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Build phases, in order. `AssignNew` replaces `Clustering` on appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Empty,
    Planning,
    Encoding,
    Clustering,
    AssignNew,
    Compressing,
    Persisting,
    Ready,
}

/// Cooperative cancellation flag, checked at batch boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Confirmation callback for overwriting an existing index directory.
pub type OverwriteConfirm = Box<dyn Fn(&Path) -> bool + Send + Sync>;

/// Build configuration.
pub struct BuildConfig {
    /// Residual bit-width, 1..=8.
    pub bits: u8,
    /// Centroid count override; `None` derives it from the corpus size.
    pub num_centroids: Option<usize>,
    /// Embedder batch size.
    pub batch_size: usize,
    /// Seed for clustering initialization.
    pub seed: u64,
    /// Appended fraction of the existing corpus at which an add triggers a
    /// full rebuild instead of an append.
    pub staleness_threshold: f64,
    /// Cap on vectors sampled for centroid and codec training.
    pub max_sample_vectors: usize,
    /// Whether building over an existing index directory is allowed.
    pub overwrite: bool,
    /// Consulted (non-interactively) before an overwrite proceeds.
    pub confirm_overwrite: Option<OverwriteConfirm>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            num_centroids: None,
            batch_size: 32,
            seed: 42,
            staleness_threshold: 0.5,
            max_sample_vectors: 65_536,
            overwrite: false,
            confirm_overwrite: None,
        }
    }
}

/// Orchestrates embedding, clustering, compression, and persistence.
///
/// Single-writer: one builder mutates one index at a time. Readers keep
/// searching a previous snapshot via `IndexHandle` until the swap.
pub struct IndexBuilder<'a> {
    embedder: &'a dyn Embedder,
    config: BuildConfig,
    cancel: CancellationToken,
    phase: BuildPhase,
}

/// One document's normalized token embeddings plus provenance.
struct EncodedDoc {
    doc_id: u32,
    vectors: Vec<Vec<f32>>,
    text: Option<String>,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(embedder: &'a dyn Embedder, config: BuildConfig) -> Self {
        Self {
            embedder,
            config,
            cancel: CancellationToken::new(),
            phase: BuildPhase::Empty,
        }
    }

    /// Token shared with callers that may cancel a long build.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: BuildPhase) {
        debug!(?phase, "build phase");
        self.phase = phase;
    }

    /// Build a fresh index over `corpus` at `path`.
    pub fn build_index(&mut self, corpus: &[String], path: &Path) -> Result<Index> {
        self.set_phase(BuildPhase::Planning);
        self.validate_config()?;
        self.check_overwrite(path)?;
        if corpus.is_empty() {
            return Err(LateError::InvalidParameter("empty corpus".to_string()));
        }

        self.set_phase(BuildPhase::Encoding);
        let docs = self.encode_corpus(corpus, 0)?;

        let index = self.build_from_embeddings(path, docs)?;
        self.set_phase(BuildPhase::Ready);
        Ok(index)
    }

    /// Add documents to an existing index, appending or rebuilding per the
    /// staleness policy. Consumes the index and returns its successor.
    pub fn add_to_index(&mut self, index: Index, new_docs: &[String]) -> Result<Index> {
        self.set_phase(BuildPhase::Planning);
        self.validate_config()?;
        if new_docs.is_empty() {
            self.set_phase(BuildPhase::Ready);
            return Ok(index);
        }

        let existing = index.num_documents();
        let fraction = new_docs.len() as f64 / existing.max(1) as f64;
        let rebuild = fraction >= self.config.staleness_threshold;
        info!(
            existing,
            added = new_docs.len(),
            fraction,
            threshold = self.config.staleness_threshold,
            rebuild,
            "add_to_index planning"
        );

        if rebuild {
            self.rebuild_with(index, new_docs)
        } else {
            self.append_to(index, new_docs)
        }
    }

    fn validate_config(&self) -> Result<()> {
        if !(1..=8).contains(&self.config.bits) {
            return Err(LateError::InvalidParameter(format!(
                "bits must be in 1..=8, got {}",
                self.config.bits
            )));
        }
        if !(0.0..=1.0).contains(&self.config.staleness_threshold) {
            return Err(LateError::InvalidParameter(
                "staleness_threshold must be in 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }

    fn check_overwrite(&self, path: &Path) -> Result<()> {
        if !path.join("manifest.json").exists() {
            return Ok(());
        }
        if !self.config.overwrite {
            return Err(LateError::InvalidParameter(format!(
                "index already exists at {} and overwrite is disabled",
                path.display()
            )));
        }
        if let Some(confirm) = &self.config.confirm_overwrite {
            if !confirm(path) {
                return Err(LateError::Cancelled);
            }
        }
        Ok(())
    }

    /// Embed a corpus with batching, normalization, and sequential ids
    /// starting at `first_id`.
    fn encode_corpus(&self, corpus: &[String], first_id: u32) -> Result<Vec<EncodedDoc>> {
        let cancel = self.cancel.clone();
        let embeddings = embed_batched(
            self.embedder,
            corpus,
            EmbedRole::Document,
            self.config.batch_size,
            &move || cancel.is_cancelled(),
        )?;

        let dim = self.embedder.dimension();
        let mut docs = Vec::with_capacity(corpus.len());
        for (i, (text, emb)) in corpus.iter().zip(embeddings).enumerate() {
            let mut vectors = emb.vectors;
            for v in &mut vectors {
                if v.len() != dim {
                    return Err(LateError::DimensionMismatch {
                        expected: dim,
                        got: v.len(),
                    });
                }
                l2_normalize(v);
            }
            docs.push(EncodedDoc {
                doc_id: first_id + i as u32,
                vectors,
                text: Some(text.clone()),
            });
        }
        Ok(docs)
    }

    /// Cluster, compress, and persist a full document set, then swap the
    /// staging directory over `path`.
    fn build_from_embeddings(&mut self, path: &Path, docs: Vec<EncodedDoc>) -> Result<Index> {
        let staging = path.with_extension("staging");
        let result = self.build_into_staging(&staging, &docs);
        match result {
            Ok(()) => {
                self.set_phase(BuildPhase::Persisting);
                swap_directories(&staging, path)?;
                Index::open(path)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    fn build_into_staging(&mut self, staging: &Path, docs: &[EncodedDoc]) -> Result<()> {
        let dim = self.embedder.dimension();
        let total_vectors: usize = docs.iter().map(|d| d.vectors.len()).sum();
        if total_vectors == 0 {
            return Err(LateError::InvalidParameter(
                "corpus produced no token embeddings".to_string(),
            ));
        }

        // Bounded training sample, taken in document order.
        let sample_count = total_vectors.min(self.config.max_sample_vectors);
        let mut sample = Vec::with_capacity(sample_count * dim);
        let mut taken = 0;
        'fill: for doc in docs {
            for v in &doc.vectors {
                sample.extend_from_slice(v);
                taken += 1;
                if taken == sample_count {
                    break 'fill;
                }
            }
        }

        self.set_phase(BuildPhase::Clustering);
        if self.cancel.is_cancelled() {
            return Err(LateError::Cancelled);
        }
        let requested = self
            .config
            .num_centroids
            .unwrap_or_else(|| suggested_centroid_count(total_vectors));
        let (mut ivf, assignments) =
            IvfIndex::build(&sample, taken, dim, requested, self.config.seed)?;
        if ivf.num_centroids() < requested {
            warn!(
                requested,
                actual = ivf.num_centroids(),
                "centroid count degraded by small training sample"
            );
        }

        // Codec trains on residuals of the same sample.
        let mut residuals = Vec::with_capacity(taken * dim);
        for (i, v) in sample.chunks_exact(dim).enumerate() {
            let centroid = ivf.centroid(assignments[i] as u32);
            residuals.extend(v.iter().zip(centroid).map(|(a, b)| a - b));
        }
        let codec = ResidualCodec::train(&residuals, taken, dim, self.config.bits)?;

        self.set_phase(BuildPhase::Compressing);
        if self.cancel.is_cancelled() {
            return Err(LateError::Cancelled);
        }
        let compressed: Vec<StoredDocument> = docs
            .par_iter()
            .map(|doc| compress_doc(doc, &ivf, &codec))
            .collect::<Result<_>>()?;

        for doc in &compressed {
            for (token_idx, v) in doc.vectors.iter().enumerate() {
                ivf.add_posting(v.centroid_id, doc.doc_id, token_idx as u32);
            }
        }

        self.set_phase(BuildPhase::Persisting);
        fs::create_dir_all(staging)?;
        let mut store = DocStore::create(staging)?;
        for (batch_no, batch) in compressed.chunks(64).enumerate() {
            if self.cancel.is_cancelled() {
                debug!(batch_no, "build cancelled while persisting");
                return Err(LateError::Cancelled);
            }
            for doc in batch {
                store.put(doc)?;
            }
        }

        let manifest = Manifest {
            magic: MANIFEST_MAGIC.to_string(),
            version: FORMAT_VERSION,
            dimension: dim,
            bits: codec.bits(),
            num_centroids: ivf.num_centroids(),
            num_documents: compressed.len(),
            max_doc_id: compressed.iter().map(|d| d.doc_id).max(),
        };
        let staged = Index {
            root: staging.to_path_buf(),
            manifest,
            codec,
            ivf,
            store,
        };
        staged.persist()
    }

    /// Append path: assign new tokens to existing centroids with the existing
    /// codec; the centroid table is reused unchanged.
    fn append_to(&mut self, mut index: Index, new_docs: &[String]) -> Result<Index> {
        if self.embedder.dimension() != index.dimension() {
            return Err(LateError::DimensionMismatch {
                expected: index.dimension(),
                got: self.embedder.dimension(),
            });
        }

        self.set_phase(BuildPhase::Encoding);
        let first_id = index.store.max_doc_id().map_or(0, |m| m + 1);
        let docs = self.encode_corpus(new_docs, first_id)?;

        self.set_phase(BuildPhase::AssignNew);
        if self.cancel.is_cancelled() {
            return Err(LateError::Cancelled);
        }
        let compressed: Vec<StoredDocument> = docs
            .par_iter()
            .map(|doc| compress_doc(doc, &index.ivf, &index.codec))
            .collect::<Result<_>>()?;

        self.set_phase(BuildPhase::Compressing);
        for doc in &compressed {
            for (token_idx, v) in doc.vectors.iter().enumerate() {
                index.ivf.add_posting(v.centroid_id, doc.doc_id, token_idx as u32);
            }
        }

        self.set_phase(BuildPhase::Persisting);
        for (batch_no, batch) in compressed.chunks(64).enumerate() {
            if self.cancel.is_cancelled() {
                // Committed blobs above the manifest high-water id are pruned
                // on the next open; the prior index stays intact.
                debug!(batch_no, "append cancelled while persisting");
                return Err(LateError::Cancelled);
            }
            for doc in batch {
                index.store.put(doc)?;
            }
        }

        index.manifest.num_documents = index.store.len();
        index.manifest.max_doc_id = index.store.max_doc_id();
        index.persist()?;

        self.set_phase(BuildPhase::Ready);
        Ok(index)
    }

    /// Rebuild path: decode every committed vector, merge the new documents'
    /// embeddings, and re-cluster with a recomputed centroid count.
    fn rebuild_with(&mut self, index: Index, new_docs: &[String]) -> Result<Index> {
        self.set_phase(BuildPhase::Encoding);
        let mut docs = Vec::with_capacity(index.num_documents() + new_docs.len());
        for doc_id in index.store.doc_ids().collect::<Vec<_>>() {
            let stored = index
                .store
                .get(doc_id)?
                .ok_or(LateError::DocumentNotFound(doc_id))?;
            let mut vectors = Vec::with_capacity(stored.vectors.len());
            for cv in &stored.vectors {
                let centroid = index.ivf.centroid(cv.centroid_id);
                let mut v = index.codec.decode(cv, centroid)?;
                l2_normalize(&mut v);
                vectors.push(v);
            }
            docs.push(EncodedDoc {
                doc_id,
                vectors,
                text: stored.text,
            });
        }

        let first_id = index.store.max_doc_id().map_or(0, |m| m + 1);
        docs.extend(self.encode_corpus(new_docs, first_id)?);

        let root = index.root.clone();
        // Drop the old index's store handle before the directory swap.
        drop(index);
        let rebuilt = self.build_from_embeddings(&root, docs)?;
        self.set_phase(BuildPhase::Ready);
        Ok(rebuilt)
    }
}

fn compress_doc(doc: &EncodedDoc, ivf: &IvfIndex, codec: &ResidualCodec) -> Result<StoredDocument> {
    let mut vectors = Vec::with_capacity(doc.vectors.len());
    for v in &doc.vectors {
        let centroid_id = ivf.assign(v)?;
        vectors.push(codec.encode(v, centroid_id, ivf.centroid(centroid_id))?);
    }
    Ok(StoredDocument {
        doc_id: doc.doc_id,
        vectors,
        text: doc.text.clone(),
    })
}

/// Replace `target` with `staging`, keeping the old tree until the new one is
/// in place.
fn swap_directories(staging: &Path, target: &Path) -> Result<()> {
    let old = target.with_extension("old");
    let _ = fs::remove_dir_all(&old);
    if target.exists() {
        fs::rename(target, &old)?;
    }
    fs::rename(staging, target)?;
    let _ = fs::remove_dir_all(&old);
    Ok(())
}
