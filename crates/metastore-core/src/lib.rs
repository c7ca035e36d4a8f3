//! # metastore-core
//!
//! Core types, traits, and abstractions for the metastore record pipeline.
//!
//! This crate provides the data model, the tenant context, message envelope
//! validation, and the capability traits that the storage backends in
//! `metastore-db` and the pipelines in `metastore-jobs` are written against.

pub mod context;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use context::RequestContext;
pub use error::{Error, Result};
pub use messaging::{
    await_decision, decode_legal_tag_changes, validate_message, AckDecision, AckReceiver,
    AckReplier, InboundMessage, OutboundMessage, SubscriptionHandle,
};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{extract_timestamp, new_v7};
