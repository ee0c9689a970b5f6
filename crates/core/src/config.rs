//! Pure transforms over the session configuration.
//!
//! The controller never edits a [`LiveConfig`] in place; every change is a
//! function from the old config to the new one.

use gemini_realtime::{
    Content, FunctionDeclaration, GenerationConfig, LiveConfig, Part, ResponseModality,
    SpeechConfig, Tool,
};

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
/// Voice used when the configured one is rejected by the service.
pub const DEFAULT_FALLBACK_VOICE: &str = "en-US-Neural2-D";
pub const DEFAULT_VOICE: &str = "Zephyr";
/// Prebuilt voices offered to users.
pub const VOICES: &[&str] = &["Puck", "Charon", "Kore", "Fenrir", "Aoede", "Zephyr"];

/// An audio-responding config for `model` speaking with `voice`.
pub fn default_config(model: &str, voice: &str) -> LiveConfig {
    with_voice(LiveConfig::new(model), voice)
}

/// Sets the prebuilt voice. Audio output is enabled when no modality was set.
pub fn with_voice(mut config: LiveConfig, voice: &str) -> LiveConfig {
    let generation = config.generation_config.get_or_insert_with(GenerationConfig::default);
    if generation.response_modalities.is_empty() {
        generation.response_modalities.push(ResponseModality::Audio);
    }
    generation.speech_config = Some(SpeechConfig::prebuilt(voice));
    config
}

/// Switches the session to text-only responses and drops the voice.
pub fn text_only(mut config: LiveConfig) -> LiveConfig {
    let generation = config.generation_config.get_or_insert_with(GenerationConfig::default);
    generation.response_modalities = vec![ResponseModality::Text];
    generation.speech_config = None;
    config
}

/// Replaces the function declarations advertised to the model.
///
/// Built-in tools (search, code execution) are kept alongside a non-empty
/// list. An empty list clears every tool, built-ins included.
pub fn with_function_declarations(
    mut config: LiveConfig,
    declarations: Vec<FunctionDeclaration>,
) -> LiveConfig {
    if declarations.is_empty() {
        config.tools.clear();
        return config;
    }
    config
        .tools
        .retain(|tool| !matches!(tool, Tool::FunctionDeclarations(_)));
    config.tools.insert(0, Tool::FunctionDeclarations(declarations));
    config
}

/// Adds a built-in tool unless it is already present.
pub fn with_builtin_tool(mut config: LiveConfig, tool: Tool) -> LiveConfig {
    if !config.tools.contains(&tool) {
        config.tools.push(tool);
    }
    config
}

pub fn with_system_instruction(mut config: LiveConfig, text: impl Into<String>) -> LiveConfig {
    config.system_instruction = Some(Content::from_parts(vec![Part::text(text)]));
    config
}

/// Names of all declared functions, in declaration order.
pub fn function_names(config: &LiveConfig) -> Vec<&str> {
    config
        .tools
        .iter()
        .filter_map(|tool| match tool {
            Tool::FunctionDeclarations(decls) => Some(decls),
            _ => None,
        })
        .flatten()
        .map(|decl| decl.name.as_str())
        .collect()
}
