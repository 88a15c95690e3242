//! Frame embeddings and the similarity index built from them.
//!
//! # Architecture
//!
//! - `embeddings`: Pluggable image embedding providers
//! - `index`: Insert buffer with batched, transactional flushes and exact
//!   dot-product search over persisted vectors
//! - `codec`: Binary layout of a persisted vector

pub mod codec;
pub mod embeddings;
mod index;

pub use codec::{bytes_to_vector, vector_to_bytes, CodecError};
pub use embeddings::{
    create_provider, normalize, ColorHistogramEmbedder, EmbeddingError, EmbeddingProvider,
    ModelInfo,
};
pub use index::{FlushStats, IndexError, SearchResult, VectorEntry, VectorIndex, VectorStore};

#[cfg(feature = "clip")]
pub use embeddings::ClipEmbedder;
