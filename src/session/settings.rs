//! Per-session configuration, changed by the client between turns

use crate::config::ServerConfig;
use crate::imaging::CharacterType;
use crate::llm::prompts::{
    build_system_prompt, extract_character_description, DEFAULT_SYSTEM_PROMPT,
};
use crate::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Voice,
    Text,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Voice => write!(f, "voice"),
            OutputMode::Text => write!(f, "text"),
        }
    }
}

impl FromStr for OutputMode {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voice" => Ok(OutputMode::Voice),
            "text" => Ok(OutputMode::Text),
            other => Err(ParleyError::ProtocolError(format!("Unknown output mode: {}", other))),
        }
    }
}

/// Display name and portrait reference for one side of the conversation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterIdentity {
    pub name: Option<String>,
    pub image: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub output_mode: OutputMode,
    pub llm_model: String,
    pub llm_host: String,
    /// None uses the TTS engine's default voice
    pub voice: Option<String>,
    pub use_context: bool,
    pub include_imagegen: bool,
    /// Prompt as sent by the client, before image instructions are added
    pub base_prompt: String,
    pub character_description: Option<String>,
    pub user_character: CharacterIdentity,
    pub assistant_character: CharacterIdentity,
    pub call_mode: bool,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            output_mode: OutputMode::Voice,
            llm_model: config.llm.model.clone(),
            llm_host: config.llm.host.clone(),
            voice: None,
            use_context: true,
            include_imagegen: true,
            base_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            character_description: None,
            user_character: CharacterIdentity::default(),
            assistant_character: CharacterIdentity::default(),
            call_mode: false,
        }
    }

    /// Replace the character prompt and re-extract the appearance used in image prompts
    pub fn set_system_prompt(&mut self, prompt: &str) {
        self.base_prompt = prompt.trim().to_string();
        self.character_description = extract_character_description(prompt);
    }

    /// The system prompt for the next request
    pub fn system_prompt(&self, image_generation_available: bool) -> String {
        build_system_prompt(
            &self.base_prompt,
            image_generation_available && self.include_imagegen,
        )
    }

    pub fn set_character(
        &mut self,
        kind: CharacterType,
        name: Option<String>,
        image: Option<String>,
    ) {
        let identity = match kind {
            CharacterType::User => &mut self.user_character,
            CharacterType::Assistant => &mut self.assistant_character,
        };
        if name.is_some() {
            identity.name = name;
        }
        if image.is_some() {
            identity.image = image;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_config() {
        let settings = SessionSettings::from_config(&ServerConfig::default());
        assert_eq!(settings.output_mode, OutputMode::Voice);
        assert_eq!(settings.llm_model, "glm-4.7:cloud");
        assert!(settings.use_context);
        assert!(settings.include_imagegen);
    }

    #[test]
    fn test_system_prompt_tracks_flags() {
        let mut settings = SessionSettings::from_config(&ServerConfig::default());
        settings.set_system_prompt("You are Ada.\n### Character Description\nShort grey hair.\n");
        assert_eq!(settings.character_description.as_deref(), Some("Short grey hair."));

        assert!(settings.system_prompt(true).contains("IMAGE GENERATION"));
        assert!(!settings.system_prompt(false).contains("IMAGE GENERATION"));

        settings.include_imagegen = false;
        assert!(!settings.system_prompt(true).contains("IMAGE GENERATION"));
    }

    #[test]
    fn test_output_mode_parse() {
        assert_eq!("Text".parse::<OutputMode>().unwrap(), OutputMode::Text);
        assert!("video".parse::<OutputMode>().is_err());
    }

    #[test]
    fn test_set_character_keeps_unspecified_fields() {
        let mut settings = SessionSettings::from_config(&ServerConfig::default());
        settings.set_character(CharacterType::Assistant, Some("Ada".into()), None);
        settings.set_character(CharacterType::Assistant, None, Some("assistant_1.png".into()));
        assert_eq!(settings.assistant_character.name.as_deref(), Some("Ada"));
        assert_eq!(settings.assistant_character.image.as_deref(), Some("assistant_1.png"));
        assert_eq!(settings.user_character, CharacterIdentity::default());
    }
}
