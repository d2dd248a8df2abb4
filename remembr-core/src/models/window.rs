use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conversational turn held in the short-term window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub session_id: Uuid,
    pub sequence: u64,
    pub role: String,
    pub content: String,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
}
