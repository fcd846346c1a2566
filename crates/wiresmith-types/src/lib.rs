//! wiresmith-types: Shared data model for the wiresmith orchestration engine.
//!
//! This crate contains the entities, backend URL grammar, driver-facing
//! interface state and change events shared between the engine, its drivers
//! and whatever transport fronts it.

#![warn(missing_docs)]

pub mod backend_url;
pub mod event;
pub mod interface;
pub mod model;

pub use backend_url::{BackendUrl, UrlError, mask_backend_url, parse_backend_url};
pub use event::{ChangeAction, ChangeEvent, Entity, EntityKind};
pub use model::{Backend, BackendKind, Hook, HookTrigger, Peer, Server, ServerState, User};
