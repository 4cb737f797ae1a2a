pub mod concurrency;
pub mod config;
pub mod database;
pub mod error;
pub mod recovery;
pub mod schema;
pub mod storage;
pub mod transaction;

pub use config::StoreConfig;
pub use database::GraphStore;
pub use error::{Error, Result};
