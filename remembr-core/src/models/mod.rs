pub mod checkpoint;
pub mod embedding;
pub mod episode;
pub mod session;
pub mod window;

pub use checkpoint::Checkpoint;
pub use embedding::Embedding;
pub use episode::{Episode, EpisodeFilters, NewEpisode, ScoredEpisode};
pub use session::{NewSession, Session};
pub use window::WindowEntry;
