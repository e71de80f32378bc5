//! Task scheduling and iterative-service engine.
//!
//! Services decompose long-running procedures into waves of
//! content-addressed tasks, submitted through a round-scoped
//! [`TaskManager`] and driven to convergence by the [`ServiceRunner`]
//! reconciliation loop.

pub mod error;
pub mod grid;
pub mod manager;
pub mod procedures;
pub mod runner;
pub mod scan;
pub mod service;

pub use error::ServiceError;
pub use grid::{expand_grid, GridPoint, GridService, GridServiceInput, ScanAxis};
pub use manager::TaskManager;
pub use procedures::{parse_result, TaskPacket};
pub use runner::ServiceRunner;
pub use scan::{ConvergenceCriteria, ScanService, ScanServiceInput};
pub use service::{build_service, Service, ServiceInput};
