//! Database layer for the eventfold event store.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. The `events` table and its dedup index are
//! created here; the store crate owns every read and write against them.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: concurrent readers with a single writer. The
//!   upsert-increment is one statement, so writers never hold a lock across
//!   a round trip to the application.
//! - **`r2d2` connection pool**: bounded connection reuse, safe to share
//!   between request workers without external locking.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so the schema ships with the code that depends on it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
