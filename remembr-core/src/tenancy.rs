//! Tenancy context consumed by every engine operation.
//!
//! The context is resolved by an external auth layer and trusted as-is.
//! The engine only derives the authority level and applies ownership rules.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Authority of the caller, from broadest to narrowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityLevel {
    Org,
    Team,
    User,
    Agent,
}

/// The tenancy scope stamped on stored records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryScope {
    pub org_id: Uuid,
    pub team_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
}

impl MemoryScope {
    pub fn org(org_id: Uuid) -> Self {
        Self {
            org_id,
            team_id: None,
            user_id: None,
            agent_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenancyContext {
    pub org_id: Uuid,
    pub team_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub authority: AuthorityLevel,
}

impl TenancyContext {
    /// Build a context at the most specific level the identity supports:
    /// agent, then user, otherwise org.
    pub fn from_identity(org_id: Uuid, user_id: Option<Uuid>, agent_id: Option<Uuid>) -> Self {
        let authority = if agent_id.is_some() {
            AuthorityLevel::Agent
        } else if user_id.is_some() {
            AuthorityLevel::User
        } else {
            AuthorityLevel::Org
        };

        Self {
            org_id,
            team_id: None,
            user_id,
            agent_id,
            authority,
        }
    }

    pub fn org_admin(org_id: Uuid) -> Self {
        Self::from_identity(org_id, None, None)
    }

    pub fn with_team(mut self, team_id: Uuid) -> Self {
        self.team_id = Some(team_id);
        self
    }

    /// Scope stamped on records written by this caller.
    pub fn scope(&self) -> MemoryScope {
        MemoryScope {
            org_id: self.org_id,
            team_id: self.team_id,
            user_id: self.user_id,
            agent_id: self.agent_id,
        }
    }

    /// Whether this caller may act on a record owned by `owner`.
    ///
    /// Org must always match. Below org level the caller is restricted to
    /// records that are unowned at its level or owned by it.
    pub fn can_access(&self, owner: &MemoryScope) -> bool {
        owner.org_id == self.org_id && self.owner_constraint().admits(owner)
    }

    /// The ownership rule of [`can_access`](Self::can_access) in a form
    /// stores can push into their queries.
    pub fn owner_constraint(&self) -> OwnerConstraint {
        let caller = |id: Option<Uuid>| Some(id.unwrap_or_else(Uuid::nil));
        match self.authority {
            AuthorityLevel::Org => OwnerConstraint::default(),
            AuthorityLevel::Team => OwnerConstraint {
                team_id: caller(self.team_id),
                ..Default::default()
            },
            AuthorityLevel::User => OwnerConstraint {
                user_id: caller(self.user_id),
                ..Default::default()
            },
            AuthorityLevel::Agent => OwnerConstraint {
                user_id: caller(self.user_id),
                agent_id: caller(self.agent_id),
                ..Default::default()
            },
        }
    }

    /// Fails with `AuthorityInsufficient` unless the caller holds `required`
    /// or a broader authority.
    pub fn require(&self, required: AuthorityLevel) -> Result<()> {
        if self.authority <= required {
            Ok(())
        } else {
            Err(MemoryError::AuthorityInsufficient {
                required,
                actual: self.authority,
            })
        }
    }
}

/// Ownership restriction within an org.
///
/// Each `Some(id)` admits records whose column is NULL or equal to `id`;
/// `None` leaves the column unrestricted. A caller without an id at a
/// restricted level is represented by the nil UUID, which no record carries,
/// so only unowned records pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnerConstraint {
    pub team_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
}

impl OwnerConstraint {
    pub fn is_unrestricted(&self) -> bool {
        self.team_id.is_none() && self.user_id.is_none() && self.agent_id.is_none()
    }

    pub fn admits(&self, owner: &MemoryScope) -> bool {
        column_admits(self.team_id, owner.team_id)
            && column_admits(self.user_id, owner.user_id)
            && column_admits(self.agent_id, owner.agent_id)
    }
}

fn column_admits(constraint: Option<Uuid>, owner: Option<Uuid>) -> bool {
    match (constraint, owner) {
        (None, _) | (_, None) => true,
        (Some(caller), Some(owner)) => caller == owner,
    }
}
