//! `lateral`: compressed late-interaction retrieval.
//!
//! Documents and queries are bags of fixed-dimension token embeddings;
//! relevance is **maxsim** — for each query vector, the maximum cosine
//! similarity over the document's vectors, summed across query vectors.
//! Storing every token vector raw is prohibitive, so the index compresses
//! them:
//!
//! 1. **IVF**: token embeddings are partitioned into centroid-keyed buckets
//!    (centroid count near the power of two below `16·sqrt(n)`), and queries
//!    only probe the `nprobe` nearest buckets per query token.
//! 2. **Residual quantization**: each vector is stored as its nearest
//!    centroid id plus a 1–8-bit-per-component bucketized residual.
//!
//! The same coarse-search primitive drives a hard-negative miner that, for
//! each labeled training query, finds semantically-close passages that are
//! not marked relevant and emits deduplicated training triplets.
//!
//! The text encoder is **not** part of this crate: embeddings arrive through
//! the [`Embedder`] trait, so the index is testable with synthetic vectors.
//!
//! ```rust,ignore
//! use lateral::{BuildConfig, IndexBuilder, Searcher, SearchParams};
//!
//! let mut builder = IndexBuilder::new(&embedder, BuildConfig::default());
//! let index = builder.build_index(&corpus, path)?;
//!
//! let searcher = Searcher::new(std::sync::Arc::new(index), &embedder)?;
//! let hits = searcher.search("what is rust", 10, SearchParams::default())?;
//! ```

pub mod builder;
pub mod codec;
pub mod distance;
pub mod embed;
pub mod error;
pub mod export;
pub mod index;
pub mod ivf;
pub mod kmeans;
pub mod mining;
pub mod searcher;
pub mod simd;
pub mod store;

pub use builder::{BuildConfig, BuildPhase, CancellationToken, IndexBuilder};
pub use codec::{CompressedVector, ResidualCodec};
pub use embed::{EmbedRole, Embedder, EncoderKind, TokenEmbeddings};
pub use error::{LateError, Result};
pub use export::{TripletExporter, TripletRecord};
pub use index::{Index, IndexHandle, IndexStats};
pub use ivf::IvfIndex;
pub use mining::{HardNegativeMiner, LabeledQuery, MinedNegatives, MinerConfig};
pub use searcher::{SearchParams, SearchResult, Searcher};
