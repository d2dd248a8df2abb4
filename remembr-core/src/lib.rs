pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod models;
pub mod retry;
pub mod tenancy;
pub mod tokens;

pub use config::RemembrConfig;
pub use embeddings::{
    EmbeddingError, EmbeddingProvider, HttpEmbeddingClient, HttpEmbeddingConfig,
};
pub use error::{DeletionStage, ErrorKind, MemoryError, Result};
pub use models::{
    Checkpoint, Embedding, Episode, EpisodeFilters, NewEpisode, NewSession, ScoredEpisode,
    Session, WindowEntry,
};
pub use retry::{with_retry, RetryPolicy};
pub use tenancy::{AuthorityLevel, MemoryScope, OwnerConstraint, TenancyContext};
