pub mod config;
pub mod engine;
pub mod imaging;
pub mod llm;
pub mod server;
pub mod session;
pub mod speech;
pub mod utils;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ParleyError {
    #[error("Engine load error: {0}")]
    EngineLoadError(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Transcription error: {0}")]
    TranscriptionError(String),

    #[error("Generation error: {0}")]
    GenerationError(String),

    #[error("Synthesis error: {0}")]
    SynthesisError(String),

    #[error("Image generation error: {0}")]
    ImageGenerationError(String),

    #[error("Image explanation error: {0}")]
    ImageExplanationError(String),

    #[error("Audio processing error: {0}")]
    AudioProcessingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid turn transition: {0}")]
    InvalidTransition(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ParleyError {
    fn from(e: std::io::Error) -> Self {
        ParleyError::IOError(e.to_string())
    }
}

impl From<reqwest::Error> for ParleyError {
    fn from(e: reqwest::Error) -> Self {
        ParleyError::HttpError(e.to_string())
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(e: serde_json::Error) -> Self {
        ParleyError::ProtocolError(e.to_string())
    }
}

impl ParleyError {
    /// Check if this error is recoverable
    ///
    /// Every per-turn error is recovered at the turn boundary; this tells the
    /// caller whether retrying the same request could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Weights or service unreachable, a retry will load again
            ParleyError::EngineLoadError(_) => true,
            // Disabled in configuration
            ParleyError::EngineUnavailable(_) => false,
            ParleyError::TranscriptionError(_) => true,
            ParleyError::GenerationError(_) => true,
            ParleyError::SynthesisError(_) => true,
            ParleyError::ImageGenerationError(_) => true,
            ParleyError::ImageExplanationError(_) => true,
            ParleyError::AudioProcessingError(_) => true,
            ParleyError::ConfigError(_) => false,
            ParleyError::ProtocolError(_) => true,
            ParleyError::InvalidTransition(_) => true,
            ParleyError::HttpError(_) => true,
            ParleyError::IOError(_) => false,
            ParleyError::ChannelError(_) => false,
            ParleyError::Cancelled => true,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            ParleyError::EngineLoadError(_) => {
                "Failed to load an AI engine. Please check that the model service is running.".to_string()
            }
            ParleyError::EngineUnavailable(_) => {
                "This feature is not enabled on the server.".to_string()
            }
            ParleyError::TranscriptionError(_) => {
                "Speech recognition failed. Please try again.".to_string()
            }
            ParleyError::GenerationError(_) => {
                "AI response generation failed. Please try again.".to_string()
            }
            ParleyError::SynthesisError(_) => {
                "Text-to-speech failed. Response will be shown as text.".to_string()
            }
            ParleyError::ImageGenerationError(_) => {
                "Image generation failed.".to_string()
            }
            ParleyError::ImageExplanationError(_) => {
                "Could not describe the attached image.".to_string()
            }
            ParleyError::AudioProcessingError(_) => {
                "Audio processing failed. Please try again.".to_string()
            }
            ParleyError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            ParleyError::ProtocolError(_) => {
                "Malformed message received.".to_string()
            }
            ParleyError::InvalidTransition(_) => {
                "The conversation is busy. Please try again.".to_string()
            }
            ParleyError::HttpError(_) => {
                "Could not reach a model service. Please try again.".to_string()
            }
            ParleyError::IOError(_) => {
                "File system error occurred.".to_string()
            }
            ParleyError::ChannelError(_) => {
                "Internal communication error. Please reconnect.".to_string()
            }
            ParleyError::Cancelled => {
                "Cancelled.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
