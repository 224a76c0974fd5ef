//! Agenda DB - Database abstractions
//!
//! SQLx-based persistence for the subscription engine.
//!
//! # Example
//!
//! ```rust,ignore
//! use agenda_db::{create_pool, run_migrations, Repositories};
//!
//! let pool = create_pool("postgres://localhost/agenda").await?;
//! run_migrations(&pool).await?;
//! let repos = Repositories::new(pool);
//!
//! let sub = repos.subscriptions.find_current_for_tenant(tenant_id).await?;
//! ```

pub mod error;
pub mod models;
pub mod pg;
pub mod pool;
pub mod repo;

pub use error::{DbError, DbResult, InvalidRow};
pub use models::*;
pub use pg::Repositories;
pub use pool::{create_pool, create_pool_with_options, run_migrations, DbPool, PoolOptions};
pub use repo::*;
