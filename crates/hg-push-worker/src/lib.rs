pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod reporter;
pub mod transport;
pub mod worker;

pub use config::{UnroutablePolicy, WorkerConfig};
pub use consumer::{Disposition, PushConsumer};
pub use error::{Result, WorkerError};
pub use handler::PushHandler;
pub use reporter::ErrorReporter;
pub use worker::Worker;
