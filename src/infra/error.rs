use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("redis error: {message}")]
    Redis { message: String },
}

impl InfraError {
    pub fn redis(message: impl Into<String>) -> Self {
        Self::Redis {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
