//! Pipeline-level error taxonomy.
//!
//! Only failures that leave the Builder without a usable entry artifact are
//! surfaced as `Err`. Parse failures, per-asset failures and healing render
//! failures are recovered inside their stage and reported as warnings.

use thiserror::Error;

pub type PipelineResultOf<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required credential or capability is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The Router could not produce a strategy. No default strategy exists.
    #[error("routing error: {0}")]
    Routing(String),

    /// The Builder did not produce an initial file set.
    #[error("build error: {0}")]
    Build(String),

    /// A mandatory stage could not reach any external service.
    #[error("catastrophic failure in {stage}: {message}")]
    Catastrophic { stage: String, message: String },

    #[error("deadline of {limit_ms}ms exceeded before stage '{stage}'")]
    DeadlineExceeded { stage: String, limit_ms: u128 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn catastrophic(stage: &str, err: &anyhow::Error) -> Self {
        Self::Catastrophic {
            stage: stage.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// Short machine-readable kind, used in events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Routing(_) => "routing",
            Self::Build(_) => "build",
            Self::Catastrophic { .. } => "catastrophic",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineError;

    #[test]
    fn catastrophic_keeps_error_chain() {
        let err = anyhow::anyhow!("connection refused").context("vision request failed");
        let wrapped = PipelineError::catastrophic("builder", &err);
        assert_eq!(wrapped.kind(), "catastrophic");
        assert_eq!(
            wrapped.to_string(),
            "catastrophic failure in builder: vision request failed: connection refused"
        );
    }

    #[test]
    fn deadline_message_names_stage() {
        let err = PipelineError::DeadlineExceeded {
            stage: "builder".to_string(),
            limit_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "deadline of 1500ms exceeded before stage 'builder'"
        );
    }
}
