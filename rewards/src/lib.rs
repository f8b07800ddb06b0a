pub mod api;
pub mod config;
pub mod driver;
pub mod metrics;
pub mod notify;
pub mod plans;
pub mod reconcile;
pub mod service;
pub mod sink;
pub mod storage;
pub mod store;

pub use driver::{Collaborators, CycleDriver, CycleHandle, DriverError, DriverTimings};
pub use service::CycleService;
