//! Data layer: Postgres storage, hot-value cache, pub/sub fabric.

pub mod cache;
pub mod error;
pub mod postgres;
pub mod topics;

pub use error::DataError;
pub use postgres::PostgresService;
