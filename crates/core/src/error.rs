/// The four ways a generation request can end other than success.
///
/// Backends and helpers return `anyhow::Error`; the engine classifies those
/// into one of these kinds at its boundaries with [`GenerationError::classify`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    /// The request references something unknown or incompatible.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Weights are missing, unreadable, or could not be placed on the device.
    #[error("Resource error: {0}")]
    Resource(String),

    /// A pipeline shape or post-stage failed while running.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The session asked the worker to stop.
    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource(message.into())
    }

    /// Recover the kind carried by an `anyhow::Error`, treating anything
    /// else as a runtime failure.
    pub fn classify(err: anyhow::Error) -> Self {
        match err.downcast::<GenerationError>() {
            Ok(kind) => kind,
            Err(other) => Self::Runtime(format!("{other:#}")),
        }
    }

    /// Wrap a loader failure as a resource error unless it already has a kind.
    pub fn from_load(err: anyhow::Error) -> Self {
        match err.downcast::<GenerationError>() {
            Ok(kind) => kind,
            Err(other) => Self::Resource(format!("{other:#}")),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short machine-readable name used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Resource(_) => "resource_error",
            Self::Runtime(_) => "runtime_error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn classify_keeps_existing_kind() {
        let err = anyhow::Error::new(GenerationError::configuration("unknown model"));
        assert_matches!(GenerationError::classify(err), GenerationError::Configuration(m) if m == "unknown model");
    }

    #[test]
    fn classify_wraps_foreign_errors_as_runtime() {
        let err = anyhow::anyhow!("shape mismatch").context("denoising");
        assert_matches!(GenerationError::classify(err), GenerationError::Runtime(m) if m.contains("shape mismatch"));
    }

    #[test]
    fn load_failures_become_resource_errors() {
        let err = anyhow::anyhow!("file not found");
        assert_matches!(GenerationError::from_load(err), GenerationError::Resource(_));
        let cancelled = anyhow::Error::new(GenerationError::Cancelled);
        assert!(GenerationError::from_load(cancelled).is_cancelled());
    }
}
