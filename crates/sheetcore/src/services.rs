//! Contracts for the external collaborators node handlers call out to.

use async_trait::async_trait;
use thiserror::Error;

use crate::NodeError;

#[derive(Error, Debug, Clone)]
pub enum FileStoreError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage rejected request: {0}")]
    Rejected(String),
}

impl From<FileStoreError> for NodeError {
    fn from(e: FileStoreError) -> Self {
        match e {
            FileStoreError::NotFound(_) => NodeError::Configuration(e.to_string()),
            FileStoreError::Unavailable(_) => NodeError::Transient(e.to_string()),
            FileStoreError::Rejected(_) => NodeError::Fatal(e.to_string()),
        }
    }
}

/// Blob storage used by input and generator nodes
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<(), FileStoreError>;

    async fn download(&self, path: &str) -> Result<Vec<u8>, FileStoreError>;
}

#[derive(Error, Debug, Clone)]
pub enum AiError {
    /// Rate limits, timeouts, 5xx responses
    #[error("AI provider temporarily unavailable: {0}")]
    Transient(String),

    /// Bad credentials, unknown model, malformed request
    #[error("AI provider rejected request: {0}")]
    Rejected(String),

    #[error("Unsupported AI provider: {0}")]
    UnsupportedProvider(String),
}

impl From<AiError> for NodeError {
    fn from(e: AiError) -> Self {
        match e {
            AiError::Transient(_) => NodeError::Transient(e.to_string()),
            AiError::Rejected(_) => NodeError::Fatal(e.to_string()),
            AiError::UnsupportedProvider(_) => NodeError::Configuration(e.to_string()),
        }
    }
}

/// Request sent to an AI provider
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub provider: String,
    pub model: String,
    pub system_message: String,
    pub prompt: String,
}

/// Gateway to whichever AI provider a node is configured for
#[async_trait]
pub trait AiGateway: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, AiError>;
}
