use crate::app::CounterResponse;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures that end a counter request with a 500.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("table store is not configured")]
    Configuration,

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Reason carried by a failed response. Detail stays in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Configuration,
    Server,
    MethodNotAllowed,
}

impl FailureReason {
    pub fn message(self) -> &'static str {
        match self {
            FailureReason::Configuration => "Configuration error",
            FailureReason::Server => "Server error",
            FailureReason::MethodNotAllowed => "Method not allowed",
        }
    }
}

impl From<&CounterError> for FailureReason {
    fn from(err: &CounterError) -> Self {
        match err {
            CounterError::Configuration => FailureReason::Configuration,
            CounterError::Store(_) => FailureReason::Server,
        }
    }
}

impl IntoResponse for CounterError {
    fn into_response(self) -> Response {
        match &self {
            CounterError::Configuration => {
                tracing::error!("COSMOS_CONNECTION_STRING missing or unusable");
            }
            CounterError::Store(e) => tracing::error!("Counter update failed: {:?}", e),
        }
        CounterResponse::Failure {
            reason: FailureReason::from(&self),
        }
        .into_response()
    }
}
