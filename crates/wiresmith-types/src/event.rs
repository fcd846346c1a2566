// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Change notifications published to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Backend, Peer, Server, User};

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    /// Entity was created.
    Created,
    /// Entity fields changed.
    Updated,
    /// Entity was removed.
    Deleted,
    /// Server interface came up.
    Started,
    /// Server interface went down.
    Stopped,
    /// Observed counters were refreshed.
    StatsUpdated,
}

/// Entity type discriminant, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// [`Backend`].
    Backend,
    /// [`Server`].
    Server,
    /// [`Peer`].
    Peer,
    /// [`User`].
    User,
}

/// Snapshot of the entity after the change (before it, for deletes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Entity {
    /// A backend with its URL masked.
    Backend(Backend),
    /// A server.
    Server(Server),
    /// A peer.
    Peer(Peer),
    /// A user.
    User(User),
}

impl Entity {
    /// Discriminant of this entity.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Backend(_) => EntityKind::Backend,
            Self::Server(_) => EntityKind::Server,
            Self::Peer(_) => EntityKind::Peer,
            Self::User(_) => EntityKind::User,
        }
    }

    /// Identifier of the wrapped entity.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Backend(b) => b.id,
            Self::Server(s) => s.id,
            Self::Peer(p) => p.id,
            Self::User(u) => u.id,
        }
    }
}

/// A published change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Monotonic publish sequence, shared across all entities.
    pub sequence: u64,
    /// What happened.
    pub action: ChangeAction,
    /// Entity snapshot.
    pub entity: Entity,
    /// User the change is attributed to.
    pub actor: Option<Uuid>,
    /// Publish time.
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Entity type of the event.
    pub fn kind(&self) -> EntityKind {
        self.entity.kind()
    }

    /// Entity id of the event.
    pub fn entity_id(&self) -> Uuid {
        self.entity.id()
    }
}
