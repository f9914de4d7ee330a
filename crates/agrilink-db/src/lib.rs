//! # agrilink-db: Durable Outbox for the AgriLink Edge
//!
//! Local SQLite storage that holds every accepted telemetry message until
//! the cloud acknowledges it.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      agrilink-db Architecture                           │
//! │                                                                         │
//! │  agrilink-sync (ingestion, forwarder, gateway)                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    agrilink-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │     Pool      │    │  Repository   │    │  Migrations  │  │   │
//! │  │   │               │    │               │    │  (embedded)  │  │   │
//! │  │   │ SqlitePool    │◄───│ OutboxRepo    │    │ 001_outbox   │  │   │
//! │  │   │ writer lock   │    │               │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │               SQLite Database (WAL)  outbox.db                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Outbox repository
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agrilink_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("outbox.db")).await?;
//! let record = db.outbox().append(new_record).await?;
//! let batch = db.outbox().lease_batch(100, 1024 * 1024).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::outbox::{OutboxPolicy, OutboxRepository, RetryOutcome, DEFAULT_MAX_ATTEMPTS};
