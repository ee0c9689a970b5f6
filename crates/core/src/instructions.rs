//! Tutor persona and system-instruction assembly.

use crate::config::{function_names, with_system_instruction, with_voice};
use gemini_realtime::LiveConfig;

/// Who the tutor is talking to and what it teaches from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TutorProfile {
    /// The learner's name, used throughout the instruction.
    pub name: String,
    /// Prebuilt voice; `None` keeps whatever the config already has.
    pub voice: Option<String>,
    /// Raw text of the study material, embedded verbatim.
    pub document: Option<String>,
}

impl TutorProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    fn has_document(&self) -> bool {
        self.document.as_deref().is_some_and(|d| !d.trim().is_empty())
    }
}

/// Builds the tutor instruction for `profile`.
///
/// # Arguments
/// * `profile` - Learner name and optional source document
/// * `tools` - Names of the functions the model may call
pub fn build_system_instruction(profile: &TutorProfile, tools: &[&str]) -> String {
    let name = if profile.name.trim().is_empty() {
        "the student"
    } else {
        profile.name.trim()
    };

    let mut text = format!(
        "You are Vozia, an interactive AI tutor speaking with {name}. Your persona is friendly, \
         encouraging, patient, and knowledgeable, with a slightly enthusiastic tone. Do not be overly formal.\n\
         Your primary goal is to help {name} learn. Start by asking if {name} is studying for something \
         specific (like a test) or just wants to understand the topic better, so you can adjust your style. "
    );

    match profile.document.as_deref() {
        Some(document) if profile.has_document() => text.push_str(&format!(
            "You have been provided with the following document content to use as the base of your teaching:\n\
             ---\n{document}\n---\n\
             Base your answers primarily on this text content and explicitly mention you are using the \
             provided material. If no relevant information is found in the document, use your general knowledge. "
        )),
        _ => text.push_str(&format!(
            "If context from a document {name} provided is available, base your answers primarily on that \
             context and explicitly mention you are using the provided material. If no context is available \
             or relevant, use your general knowledge. "
        )),
    }

    text.push_str(&format!(
        "Keep your spoken responses relatively concise unless asked for more detail. Ask questions \
         frequently to check {name}'s understanding and keep the session interactive.\n\
         If {name} interrupts, stop speaking immediately and listen.\n\
         After explaining a concept or answering a question, offer a brief quiz question to reinforce \
         learning. Then ask {name} if they have more questions on that topic.\n\
         When {name} indicates they are satisfied with the current topic, ask if they want to discuss \
         another topic or end the session."
    ));

    if !tools.is_empty() {
        text.push_str(&format!(
            "\nYou can call these tools when they help the lesson: {}.",
            tools.join(", ")
        ));
    }
    text
}

/// Applies `profile` to `config`: rebuilds the system instruction and sets
/// the profile's voice, if any.
pub fn apply_profile(config: LiveConfig, profile: &TutorProfile) -> LiveConfig {
    let instruction = build_system_instruction(profile, &function_names(&config));
    let config = with_system_instruction(config, instruction);
    match profile.voice.as_deref() {
        Some(voice) => with_voice(config, voice),
        None => config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MODEL, default_config, with_function_declarations};
    use gemini_realtime::{FunctionDeclaration, Part};

    fn instruction_of(config: &LiveConfig) -> &str {
        match &config.system_instruction.as_ref().unwrap().parts[0] {
            Part::Text(text) => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn instruction_addresses_the_learner() {
        let text = build_system_instruction(&TutorProfile::new("Ada"), &[]);
        assert!(text.starts_with("You are Vozia, an interactive AI tutor speaking with Ada."));
        assert!(text.contains("If Ada interrupts, stop speaking immediately"));
        assert!(!text.contains("---"));
        assert!(!text.contains("tools"));
    }

    #[test]
    fn document_is_embedded_between_markers() {
        let profile = TutorProfile::new("Ada").with_document("Mitochondria make ATP.");
        let text = build_system_instruction(&profile, &[]);
        assert!(text.contains("---\nMitochondria make ATP.\n---"));
        assert!(text.contains("Base your answers primarily on this text content"));
    }

    #[test]
    fn blank_document_counts_as_missing() {
        let profile = TutorProfile::new("Ada").with_document("  \n");
        let text = build_system_instruction(&profile, &[]);
        assert!(text.contains("If context from a document Ada provided is available"));
    }

    #[test]
    fn blank_name_gets_a_neutral_address() {
        let text = build_system_instruction(&TutorProfile::new(" "), &[]);
        assert!(text.contains("speaking with the student."));
    }

    #[test]
    fn tools_are_listed() {
        let text =
            build_system_instruction(&TutorProfile::new("Ada"), &["create_quiz", "display_graph"]);
        assert!(text.ends_with("create_quiz, display_graph."));
    }

    #[test]
    fn apply_profile_sets_voice_and_instruction() {
        let config = with_function_declarations(
            default_config(DEFAULT_MODEL, "Puck"),
            vec![FunctionDeclaration {
                name: "create_quiz".into(),
                description: "quiz".into(),
                parameters: serde_json::Value::Null,
            }],
        );
        let profile = TutorProfile::new("Lin").with_voice("Kore");
        let config = apply_profile(config, &profile);

        assert_eq!(config.voice_name(), Some("Kore"));
        assert!(instruction_of(&config).contains("speaking with Lin"));
        assert!(instruction_of(&config).ends_with("create_quiz."));

        // no voice in the profile leaves the configured one alone
        let config = apply_profile(config, &TutorProfile::new("Lin"));
        assert_eq!(config.voice_name(), Some("Kore"));
    }
}
