pub type RasterFxResult<T> = Result<T, RasterFxError>;

#[derive(thiserror::Error, Debug)]
pub enum RasterFxError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("context error: {0}")]
    Context(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RasterFxError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn context(msg: impl Into<String>) -> Self {
        Self::Context(msg.into())
    }

    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Errors raised because the backend holds no usable context.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Context(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            RasterFxError::validation("x")
                .to_string()
                .contains("validation error:")
        );
        assert!(
            RasterFxError::context("x")
                .to_string()
                .contains("context error:")
        );
        assert!(
            RasterFxError::pipeline("x")
                .to_string()
                .contains("pipeline error:")
        );
        assert!(
            RasterFxError::config("x")
                .to_string()
                .contains("config error:")
        );
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = RasterFxError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
        assert!(!err.is_context());
    }
}
