//! Agenda Types - Shared domain types
//!
//! This crate contains domain types used across the subscription engine:
//! - Tenant identity (the collaborator view of an account)
//! - Plans and billing cycles
//! - Subscription lifecycle and payment statuses
//! - Status summaries exposed to the UI layer

pub mod error;
pub mod plan;
pub mod status;
pub mod subscription;
pub mod tenant;

pub use error::*;
pub use plan::*;
pub use status::*;
pub use subscription::*;
pub use tenant::*;
