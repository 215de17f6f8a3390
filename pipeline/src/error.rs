//! Error types for the pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by storage backends
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Object store error: {message}")]
    ObjectStore { message: String },

    #[error("Storage backend error: {backend} - {message}")]
    Backend { backend: String, message: String },
}

impl StorageError {
    /// Create a new object store error
    pub fn object_store<S: Into<String>>(message: S) -> Self {
        Self::ObjectStore {
            message: message.into(),
        }
    }

    /// Create a new backend-specific error
    pub fn backend<S: Into<String>, M: Into<String>>(backend: S, message: M) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Io(_) => true,
            StorageError::Database(_) => true,
            StorageError::Redis(_) => true,
            StorageError::ObjectStore { .. } => true,
            StorageError::Serialization(_) => false,
            StorageError::Backend { .. } => false,
        }
    }

    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "io",
            StorageError::Serialization(_) => "serialization",
            StorageError::Database(_) => "database",
            StorageError::Redis(_) => "document_store",
            StorageError::ObjectStore { .. } => "object_store",
            StorageError::Backend { .. } => "backend",
        }
    }
}

/// Pipeline error kinds
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source connection error: {source_name} - {message}")]
    SourceConnection { source_name: String, message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Configuration loading error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a new source connection error
    pub fn source_connection<S: Into<String>, M: Into<String>>(source_name: S, message: M) -> Self {
        Self::SourceConnection {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::SourceConnection { .. } => true,
            PipelineError::Network(_) => true,
            PipelineError::WebSocket(_) => true,
            PipelineError::Io(_) => true,
            PipelineError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error condemns the batch being transformed rather than the I/O around it
    pub fn is_batch_failure(&self) -> bool {
        matches!(self, PipelineError::Decode { .. })
    }

    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::SourceConnection { .. } => "source_connection",
            PipelineError::Decode { .. } => "decode",
            PipelineError::Storage(e) => e.category(),
            PipelineError::Configuration { .. } => "config",
            PipelineError::Config(_) => "config",
            PipelineError::Network(_) => "network",
            PipelineError::WebSocket(_) => "network",
            PipelineError::Serialization(_) => "serialization",
            PipelineError::Io(_) => "io",
            PipelineError::Internal(_) => "internal",
        }
    }

    /// Get the severity level for this error
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::Configuration { .. } => ErrorSeverity::Critical,
            PipelineError::Config(_) => ErrorSeverity::Critical,
            PipelineError::Internal(_) => ErrorSeverity::High,
            PipelineError::Storage(_) => ErrorSeverity::High,
            PipelineError::Decode { .. } => ErrorSeverity::Medium,
            PipelineError::SourceConnection { .. } => ErrorSeverity::Low,
            PipelineError::Network(_) => ErrorSeverity::Low,
            PipelineError::WebSocket(_) => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels for alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Check if this severity requires immediate attention
    pub fn requires_immediate_attention(&self) -> bool {
        matches!(self, ErrorSeverity::High | ErrorSeverity::Critical)
    }
}
