use conduit_core::cancel::Cancelled;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run cancelled")]
    Cancelled,

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl From<Cancelled> for EngineError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(EngineError::Unavailable("no model".into()).to_string(), "engine unavailable: no model");
        assert_eq!(EngineError::from(Cancelled).to_string(), "run cancelled");
        assert_eq!(EngineError::Internal("model overloaded".into()).to_string(), "model overloaded");
    }
}
