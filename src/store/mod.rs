/// SQLite persistence for worlds, modules and generation jobs.
///
/// Repository functions take a `&Connection` so a service can run several of
/// them inside one [`Database::with_tx`] transaction.

pub mod database;
pub mod error;
pub mod jobs;
pub mod modules;
pub mod row_helpers;
pub mod schema;
pub mod worlds;

pub use database::Database;
pub use error::StoreError;
