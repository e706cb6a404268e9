use thiserror::Error;

/// Top-level error for the `queue-cli` binary's `main`.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Connector(#[from] queue_common::ConnectorError),

    #[error(transparent)]
    Store(#[from] queue_common::StoreError),

    #[error(transparent)]
    Worker(#[from] queue_worker::MainError),

    #[error("invalid payload argument {0:?}, expected key=value")]
    InvalidPayload(String),
}
