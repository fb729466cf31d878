//! Event search (audit / inspection entry point).
//!
//! Searches are paginated by default and always pass through the entity's
//! event-stream authorizer before any event is exposed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_core::EntityId;
use cairn_events::EventEnvelope;

/// Pagination parameters for event searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    /// 0-based offset.
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchTarget {
    /// Events of one entity type, optionally a single entity.
    Entity {
        entity_type_name: String,
        entity_id: Option<EntityId>,
    },
    /// Events of one event type, across entities.
    EventType { type_name: String },
}

/// Search filter. `from`/`to` bound `createdAt` inclusively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSearchQuery {
    pub target: SearchTarget,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl EventSearchQuery {
    pub fn by_entity(entity_type_name: impl Into<String>) -> Self {
        Self::new(SearchTarget::Entity {
            entity_type_name: entity_type_name.into(),
            entity_id: None,
        })
    }

    pub fn by_entity_id(entity_type_name: impl Into<String>, entity_id: EntityId) -> Self {
        Self::new(SearchTarget::Entity {
            entity_type_name: entity_type_name.into(),
            entity_id: Some(entity_id),
        })
    }

    pub fn by_type(type_name: impl Into<String>) -> Self {
        Self::new(SearchTarget::EventType {
            type_name: type_name.into(),
        })
    }

    fn new(target: SearchTarget) -> Self {
        Self {
            target,
            from: None,
            to: None,
            pagination: Pagination::default(),
        }
    }

    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = Pagination::new(Some(pagination.limit), Some(pagination.offset));
        self
    }

    /// Whether an event (never a snapshot) matches target and time bounds.
    /// Pagination is applied by the provider.
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if !envelope.is_event() {
            return false;
        }
        let target_ok = match &self.target {
            SearchTarget::Entity {
                entity_type_name,
                entity_id,
            } => {
                &envelope.entity_type_name == entity_type_name
                    && entity_id.as_ref().is_none_or(|id| id == &envelope.entity_id)
            }
            SearchTarget::EventType { type_name } => &envelope.type_name == type_name,
        };
        target_ok
            && self.from.is_none_or(|from| envelope.created_at >= from)
            && self.to.is_none_or(|to| envelope.created_at <= to)
    }
}

/// Paginated search result, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSearchResult {
    pub events: Vec<EventEnvelope>,
    /// Matches across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}
