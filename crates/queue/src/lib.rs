pub mod adapter;
pub mod error;
pub mod http;
pub mod local;
pub mod sqs;

pub use adapter::{build_queue_adapter, AdapterTask, CompletedTask, QueueAdapter, ResultBlob};
pub use error::QueueError;
pub use http::HttpAdapter;
pub use local::{LocalAdapter, ProgramRegistry};
pub use sqs::SqsAdapter;
