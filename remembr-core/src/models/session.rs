use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenancy::MemoryScope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub org_id: Uuid,
    pub team_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn scope(&self) -> MemoryScope {
        MemoryScope {
            org_id: self.org_id,
            team_id: self.team_id,
            user_id: self.user_id,
            agent_id: self.agent_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub scope: MemoryScope,
    pub metadata: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
}
