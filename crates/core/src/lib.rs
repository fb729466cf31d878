//! `cairn-core` — identity and versioning building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod version;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, RequestId};
pub use version::ExpectedVersion;
