//! Context-management core for a tool-using LLM agent runtime.
//!
//! The crate keeps a model's prompt under a bounded token budget while
//! preserving conversational coherence, tool-call pairing, and on-demand
//! recall of paged-out history:
//!
//! - [`store`]: the message store and compactor. A bounded working buffer
//!   with high/low watermark compaction that spills older material into
//!   summarized, content-addressed pages on disk.
//! - [`overlay`]: a decorator that splices a fixed-width sensory status
//!   panel (context map, clock, config) into the prompt each turn.
//! - [`retrieval`]: an embedding index over page summaries, per-turn
//!   semantic auto-fill of the page slot, and a yield-aware batch
//!   re-summarizer with a shadow-swap index replacement protocol.
//! - [`marker`]: a streaming parser that lifts in-band `@@...@@` control
//!   directives out of model output without breaking incremental delivery.
//!
//! Provider wire protocols, tool execution, and policy enforcement live
//! outside; the core consumes a [`ChatDriver`], a [`Summarizer`], and an
//! [`EmbeddingProvider`].

pub mod driver;
pub mod embedding;
pub mod error;
pub mod events;
pub mod facts;
pub mod marker;
pub mod overlay;
pub mod retrieval;
pub mod router;
pub mod session;
pub mod store;
pub mod summarize;
pub mod thinking;
pub mod types;

pub use driver::{ChatDriver, ChatOptions, ChatOutcome, StreamChunk, Usage};
pub use embedding::{EmbedderFingerprint, EmbeddingProvider, HttpEmbedder};
pub use error::{DriverError, RetrievalError, StoreError};
pub use events::{CoreEvent, EventSender, SleepState};
pub use facts::LearnedFacts;
pub use marker::{Directive, MarkerEvent, MarkerParser, Parsed, Payload};
pub use overlay::{Channel, ChannelSource, SensoryOverlay, PANEL_WIDTH};
pub use retrieval::{
    AlwaysIdle, AutoRetriever, BatchOutcome, BatchResummarizer, EmbeddingIndex, IdleGate,
    SearchHit,
};
pub use router::DirectiveRouter;
pub use session::{SessionDirs, SessionMeta};
pub use store::{
    AnyStore, BudgetOverrides, EphemeralStore, MemoryKind, MessageStore, Page, PagedStore,
    StoreConfig, StoreStats,
};
pub use summarize::{DriverSummarizer, FixedSummarizer, Summarizer};
pub use thinking::{ThinkingDial, ThinkingTier};
pub use types::{Message, Role, SummarizedToolCall, ToolCall};
