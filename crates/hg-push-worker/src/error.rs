use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Push handling kept failing past the retry ceiling
    #[error("Push handling failed {retries} times in a row (max {max_retries}): {source:#}")]
    Escalated {
        retries: u32,
        max_retries: u32,
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Broker closed the delivery stream")]
    StreamClosed,

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn is_escalation(&self) -> bool {
        matches!(self, WorkerError::Escalated { .. })
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
