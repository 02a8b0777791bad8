//! System prompts and prompt templates

use super::ChatMessage;
use regex::Regex;
use std::sync::LazyLock;

/// Used until the client sends its own character prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly conversational companion. \
Your replies are read aloud, so keep them natural, warm and reasonably short. \
Avoid markdown, bullet lists and code unless explicitly asked.";

/// Appended to the system prompt while image generation is available and enabled
pub const IMAGE_GENERATION_INSTRUCTIONS: &str = r#"IMAGE GENERATION:
You can show the user a picture by writing an [IMAGE: description] tag in your reply.
Use it when the user asks for a selfie, photo or picture, or when showing something would help.

Examples:
- User: "Send me a selfie!" Reply: "Here you go! [IMAGE: taking a selfie, smiling at camera, casual pose]"
- User: "What are you wearing?" Reply: "Have a look. [IMAGE: full body shot, standing, showing outfit]"
- Unprompted: "The sunset is gorgeous tonight. [IMAGE: watching the sunset, golden hour light, scenic view]"

Your character's appearance is added to the picture automatically, so describe only the scene, pose and setting."#;

/// Condenses a free-form image request into keyword form for the generator
pub const IMAGE_PROMPT_OPTIMIZER: &str = "You are a concise image prompt optimizer. \
Convert descriptions into short, focused image prompts using comma-separated keywords. \
Focus on: pose, action, clothing, setting, lighting. Maximum 40 words. No full sentences.";

static CHARACTER_DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)### Character Description\s*\n(.+?)(?:\n###|\z)")
        .expect("valid character description regex")
});

/// Pull the `### Character Description` section out of a character prompt
pub fn extract_character_description(prompt: &str) -> Option<String> {
    CHARACTER_DESCRIPTION
        .captures(prompt)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The system prompt actually sent to the model
pub fn build_system_prompt(base: &str, include_image_generation: bool) -> String {
    let base = if base.trim().is_empty() {
        DEFAULT_SYSTEM_PROMPT
    } else {
        base.trim()
    };

    if include_image_generation {
        format!("{}\n\n{}", base, IMAGE_GENERATION_INSTRUCTIONS)
    } else {
        base.to_string()
    }
}

/// Merge an image explainer description into the user's text
pub fn describe_attachment(user_text: &str, description: &str) -> String {
    let note = format!(
        "[The user attached an image with the following description: {}]",
        description.trim()
    );
    if user_text.trim().is_empty() {
        note
    } else {
        format!("{}\n\n{}", user_text.trim(), note)
    }
}

/// Used when an image is attached but cannot be described
pub fn undescribed_attachment(user_text: &str) -> String {
    let note = "[An image was attached but it could not be described]";
    if user_text.trim().is_empty() {
        note.to_string()
    } else {
        format!("{}\n\n{}", user_text.trim(), note)
    }
}

/// Prefix the scene with the character's appearance
pub fn compose_image_prompt(character_description: Option<&str>, scene: &str) -> String {
    match character_description.map(str::trim).filter(|d| !d.is_empty()) {
        Some(description) => format!("{}, {}", description, scene.trim()),
        None => scene.trim().to_string(),
    }
}

/// Messages asking the chat model to condense an image request
pub fn image_prompt_request(raw: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(IMAGE_PROMPT_OPTIMIZER),
        ChatMessage::user(format!(
            "Optimize this image description into a concise prompt:\n{}",
            raw.trim()
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;

    const CARD: &str = "You are Mira.\n\n### Character Description\nA tall woman with red hair, green eyes.\n\n### Personality\nCheerful.";

    #[test]
    fn test_extract_character_description() {
        assert_eq!(
            extract_character_description(CARD).as_deref(),
            Some("A tall woman with red hair, green eyes.")
        );
        assert_eq!(
            extract_character_description("### Character Description\nShort and last").as_deref(),
            Some("Short and last")
        );
        assert!(extract_character_description("No sections here").is_none());
    }

    #[test]
    fn test_build_system_prompt() {
        let plain = build_system_prompt(CARD, false);
        assert!(!plain.contains("IMAGE GENERATION"));

        let with_images = build_system_prompt(CARD, true);
        assert!(with_images.starts_with("You are Mira."));
        assert!(with_images.contains("[IMAGE: description]"));

        assert_eq!(build_system_prompt("  ", false), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_attachment_text() {
        assert_eq!(
            describe_attachment("What is this?", "a cat on a sofa"),
            "What is this?\n\n[The user attached an image with the following description: a cat on a sofa]"
        );
        assert!(describe_attachment("", "a cat").starts_with("[The user attached"));
        assert!(undescribed_attachment("hi").starts_with("hi\n\n"));
    }

    #[test]
    fn test_image_prompts() {
        assert_eq!(compose_image_prompt(Some("red hair"), " beach "), "red hair, beach");
        assert_eq!(compose_image_prompt(Some(" "), "beach"), "beach");
        assert_eq!(compose_image_prompt(None, "beach"), "beach");

        let request = image_prompt_request("sitting in a cafe");
        assert_eq!(request.len(), 2);
        assert_eq!(request[0].role, ChatRole::System);
        assert!(request[1].content.ends_with("sitting in a cafe"));
    }
}
