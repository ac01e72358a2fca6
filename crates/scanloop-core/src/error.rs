//! Error taxonomy shared across the workspace.
//!
//! The executor and the webhook notifier are designed to never let one of
//! these escape their processing loops — failures degrade to recorded
//! terminal states on the run/delivery rows instead. The enqueue and trigger
//! paths do return errors (`TaskNotFound` in particular) and expect the HTTP
//! layer to translate them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanloopError {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("webhook delivery error: {0}")]
    Delivery(String),

    #[error("batch runner error: {0}")]
    Runner(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScanloopError>;
