pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod model;
pub mod output;
pub mod platform;
pub mod reconciler;
pub mod runtime;
pub mod store;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::Catalog;
pub use config::Config;
pub use error::{Error, Result};
pub use model::{Scan, ScanId, ScanRequest, ScanStatus, ScanStatusReport};
pub use store::ScanStore;
pub use supervisor::{AdmittedScan, ResultSelector, Supervisor};
