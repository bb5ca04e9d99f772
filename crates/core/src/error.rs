use thiserror::Error;

#[derive(Error, Debug)]
pub enum EdgeflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("{0}")]
    Other(String),
}
