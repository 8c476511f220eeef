//! Storage backends for visitor identities, settings, interface texts and
//! banned words.
//!
//! `DbOperations` talks to Postgres; `MemoryStore` keeps everything in
//! process and backs local development and the test suite.

pub mod memory;
pub mod models;
pub mod operations;

pub use memory::MemoryStore;
pub use models::{BannedWordRow, IdentityRow, SettingRow, TextRow};
pub use operations::{DbOperations, DbPoolStatus};
