use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("aria2c binary not found: {0}")]
    BinaryNotFound(String),
    #[error("failed to launch aria2c: {0}")]
    Launch(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected to aria2")]
    NotConnected,
    #[error("aria2 rpc error: {0}")]
    Rpc(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
