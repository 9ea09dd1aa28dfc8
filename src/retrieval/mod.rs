//! Semantic recall over paged-out history: the embedding index, per-turn
//! auto-retrieve, and the background batch re-summarizer.

pub mod auto;
pub mod batch;
pub mod index;

pub use auto::AutoRetriever;
pub use batch::{AlwaysIdle, BatchOutcome, BatchProgress, BatchResummarizer, IdleGate};
pub use index::{EmbeddingIndex, IndexEntry, SearchHit};
