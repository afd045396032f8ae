//! SQLite persistence for Chime.
//!
//! [`SqliteTaskStore`] implements the scheduler's [`chime_scheduler::TaskStore`]
//! and adds the administrative operations the CLI needs.

mod db;
mod error;

pub use db::{SqliteTaskStore, TaskUpdate};
pub use error::SqliteStoreError;
