#![forbid(unsafe_code)]

pub mod catalog;
pub mod merge;
pub mod model;
pub mod repair;
pub mod time;

pub use catalog::{CatalogEntry, CategoryCatalog};
pub use merge::{MergeStrategy, merge};
pub use repair::{RepairOptions, RepairOutcome, TrackerTrust, Violation, repair};
pub use time::Clock;
