use thiserror::Error;

/// Top-level error returned from the worker binary's `main`.
#[derive(Error, Debug)]
pub enum MainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Connector(#[from] queue_common::ConnectorError),

    #[error("failed to start serving health/metrics routes")]
    Serve(#[from] std::io::Error),
}
