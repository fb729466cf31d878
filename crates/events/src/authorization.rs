//! Event-stream authorization hook.
//!
//! Role checks live outside the runtime. The only decision taken here is
//! whether the raw event stream of an entity type may be exposed to external
//! readers (event search / audit).

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Allow,
    Deny,
}

impl Access {
    pub fn is_allowed(self) -> bool {
        self == Access::Allow
    }
}

/// Decides access to the event stream of the named entity type.
pub type EventStreamAuthorizer = fn(entity_type_name: &str) -> Access;

pub fn allow_access(_entity_type_name: &str) -> Access {
    Access::Allow
}

pub fn deny_access(_entity_type_name: &str) -> Access {
    Access::Deny
}
