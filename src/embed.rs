//! Embedding source boundary.
//!
//! `lateral` never runs an encoder itself. Token embeddings arrive through
//! the [`Embedder`] trait, injected at builder/searcher construction. This
//! keeps the index testable with synthetic vectors and keeps model caching a
//! concern of the implementor, not a process-wide singleton.

use crate::error::{LateError, Result};

/// Whether a text is encoded as a query or as a document.
///
/// Implementors typically apply different maximum-length truncation per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedRole {
    Query,
    Document,
}

/// How to interpret the model path handed to an embedder implementation.
///
/// Resolved once at load time; never re-inferred per call. The index itself
/// never branches on this; it exists so implementors can report what backs
/// them (see [`Embedder::kind`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderKind {
    /// A base pretrained encoder.
    BaseEncoder,
    /// A fine-tuned checkpoint layered on a base encoder.
    FineTunedCheckpoint,
}

/// Per-token embeddings for one text, after mask filtering.
///
/// `vectors` holds only the tokens whose keep flag was set; callers never see
/// masked positions. All vectors share the embedder's fixed dimension.
#[derive(Debug, Clone)]
pub struct TokenEmbeddings {
    pub vectors: Vec<Vec<f32>>,
}

impl TokenEmbeddings {
    /// Build from raw per-token vectors plus a keep mask, dropping masked tokens.
    ///
    /// `mask` must be index-aligned with `vectors`.
    pub fn from_masked(vectors: Vec<Vec<f32>>, mask: &[bool]) -> Self {
        debug_assert_eq!(vectors.len(), mask.len(), "mask not aligned with vectors");
        let vectors = vectors
            .into_iter()
            .zip(mask.iter())
            .filter_map(|(v, &keep)| keep.then_some(v))
            .collect();
        Self { vectors }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

/// External embedding source.
///
/// Implementations may block on device computation; callers batch requests
/// through [`embed_batched`] to amortize that overhead.
pub trait Embedder: Send + Sync {
    /// Embedding dimension D, fixed for the lifetime of the embedder.
    fn dimension(&self) -> usize;

    /// What kind of model backs this embedder, resolved once at load time.
    fn kind(&self) -> EncoderKind {
        EncoderKind::BaseEncoder
    }

    /// Encode a slice of texts under the given role.
    ///
    /// Returns one [`TokenEmbeddings`] per input text, index-aligned.
    fn embed(&self, texts: &[String], role: EmbedRole) -> Result<Vec<TokenEmbeddings>>;
}

/// Invoke an embedder over `texts` in fixed-size batches.
///
/// `check_cancel` runs at every batch boundary; a `true` return aborts with
/// [`LateError::Cancelled`] without issuing further embedder calls.
pub fn embed_batched(
    embedder: &dyn Embedder,
    texts: &[String],
    role: EmbedRole,
    batch_size: usize,
    check_cancel: &dyn Fn() -> bool,
) -> Result<Vec<TokenEmbeddings>> {
    if batch_size == 0 {
        return Err(LateError::InvalidParameter(
            "batch_size must be greater than 0".to_string(),
        ));
    }

    let mut out = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(batch_size) {
        if check_cancel() {
            return Err(LateError::Cancelled);
        }
        out.extend(embedder.embed(chunk, role)?);
    }
    Ok(out)
}
