//! # Repository Module
//!
//! Database repository implementations for the edge outbox.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  Ingestion / Forwarder / Gateway                                       │
//! │       │                                                                 │
//! │       │  db.outbox().lease_batch(100, 1 MiB)                           │
//! │       ▼                                                                 │
//! │  OutboxRepository                                                      │
//! │  ├── append / lease_batch / acknowledge / retry                        │
//! │  ├── recover_in_flight / purge_acked                                   │
//! │  └── count_by_status / list_dead_letters / requeue_dead_letter / get   │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`OutboxRepository`](outbox::OutboxRepository) - Telemetry outbox queue

pub mod outbox;
