use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Malformed push message: {0}")]
    MalformedPush(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
