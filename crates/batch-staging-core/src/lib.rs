//! Core types for the batch staging subsystem.
//!
//! This crate defines the vocabulary shared by staging backends:
//! - `ResourceState`: lifecycle stage of a staged resource and its file suffix
//! - `ResourcePath`: composite, order-preserving resource addresses
//! - `ContextId`: the caller-supplied token that scopes open streams
//! - `PurgeContext`: accounting for one reclamation sweep
//! - `StagingConfig`: the configuration surface of a staging area

mod config;
mod context;
mod error;
mod path;
mod purge;
mod state;

pub mod category;

pub use config::{StagingConfig, DEFAULT_MEMORY_THRESHOLD, DEFAULT_TTL};
pub use context::ContextId;
pub use error::StagingError;
pub use path::{PathSegment, ResourcePath, NUMERIC_SEGMENT_WIDTH, PATH_SEPARATOR};
pub use purge::{PurgeContext, PurgeStats, DEFAULT_PROGRESS_INTERVAL};
pub use state::{ResourceState, LOCK_SUFFIX};
