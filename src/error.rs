use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlightError {
    #[error("vehicle link unavailable")]
    LinkUnavailable,

    #[error("link error: {0}")]
    Link(String),

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("mode switch to {requested} failed, vehicle reports {observed}")]
    ModeSwitchFailed { requested: String, observed: String },

    #[error("cancelled")]
    Cancelled,
}

impl FlightError {
    pub fn link(detail: impl std::fmt::Display) -> Self {
        Self::Link(detail.to_string())
    }

    pub fn precondition(detail: impl Into<String>) -> Self {
        Self::PreconditionFailed(detail.into())
    }
}

pub type FlightResult<T> = Result<T, FlightError>;
