pub mod aggregate;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metric;
pub mod migrate;
pub mod store;
pub mod worker;
