pub mod engine;
pub mod store;
pub mod subsystems;

pub use engine::{HealthReport, MemoryEngine, MemoryEngineBuilder, StoreOutcome, StoreRequest};
pub use store::{EpisodicStore, InMemoryEpisodicStore, ModelRegistry, PgEpisodicStore};
pub use subsystems::checkpoint::RestoreOutcome;
pub use subsystems::forget::{ForgetSessionOutcome, ForgetUserOutcome};
pub use subsystems::query::{MemoryQuery, MemoryQueryResult, WindowHit};
pub use subsystems::retrieve::{SearchHit, SearchMode, SearchRequest, SearchResponse};
pub use subsystems::window::{InMemoryWindowBackend, WindowBackend, WindowUsage};
