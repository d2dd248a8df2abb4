use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::window::WindowEntry;

/// Immutable snapshot of a short-term window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub org_id: Uuid,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<WindowEntry>,
    pub message_count: i32,
}
