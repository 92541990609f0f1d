use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unsupported content type {0}")]
    Unsupported(String),
    #[error("content is not valid text")]
    InvalidText,
}

/// Capability boundary for pulling plain text out of uploaded documents.
/// PDF/DOCX parsing lives behind this trait with an external implementation;
/// the built-in one handles text formats only.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, content_type: &str, bytes: &[u8]) -> Result<String, ExtractError>;
}

pub struct PlainTextExtractor;

impl ContentExtractor for PlainTextExtractor {
    fn extract(&self, content_type: &str, bytes: &[u8]) -> Result<String, ExtractError> {
        match content_type {
            "text/plain" | "text/markdown" => std::str::from_utf8(bytes)
                .map(|s| s.trim().to_string())
                .map_err(|_| ExtractError::InvalidText),
            other => Err(ExtractError::Unsupported(other.to_string())),
        }
    }
}
