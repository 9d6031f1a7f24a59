//! Durable storage for sandbox records and audit events.

pub mod error;
pub mod repository;
pub mod sqlite;

/// Store error type.
pub use error::StoreError;
/// Repository contract and paging helpers.
pub use repository::{
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, Repository, SandboxStore, Transaction, page_offset,
    page_size,
};
/// SQLite-backed repository.
pub use sqlite::{SqliteRepository, SqliteTransaction};
