//! Command line arguments and session assembly.

use crate::config::Config;
use clap::Parser;
use clap::builder::PossibleValuesParser;
use gemini_realtime::{FunctionDeclaration, LiveConfig, Tool};
use std::path::PathBuf;
use vozia_core::TutorProfile;
use vozia_core::config::{
    DEFAULT_VOICE, VOICES, default_config, text_only, with_builtin_tool,
    with_function_declarations,
};

#[derive(Parser, Debug)]
#[command(name = "vozia")]
#[command(version, about = "Talk to the Vozia tutor over the Gemini Live API", long_about = None)]
pub struct Args {
    /// Name the tutor uses to address you
    #[arg(short, long, default_value = "Student")]
    pub name: String,

    /// Prebuilt voice to speak with
    #[arg(short, long, value_parser = PossibleValuesParser::new(VOICES))]
    pub voice: Option<String>,

    /// Study material to teach from
    #[arg(short, long, value_name = "FILE", conflicts_with = "document_url")]
    pub document: Option<PathBuf>,

    /// Fetch the study material from a URL
    #[arg(long, value_name = "URL")]
    pub document_url: Option<String>,

    /// Model name, overriding LIVE_MODEL
    #[arg(short, long)]
    pub model: Option<String>,

    /// Ask for text replies instead of speech
    #[arg(long)]
    pub text_only: bool,

    /// Do not offer Google Search to the model
    #[arg(long)]
    pub no_search: bool,
}

impl Args {
    /// Voice to request: the command line wins over the environment.
    pub fn voice<'a>(&'a self, config: &'a Config) -> &'a str {
        self.voice
            .as_deref()
            .or(config.voice.as_deref())
            .unwrap_or(DEFAULT_VOICE)
    }

    pub fn model<'a>(&'a self, config: &'a Config) -> &'a str {
        self.model.as_deref().unwrap_or(&config.model)
    }

    pub fn profile(&self, config: &Config, document: Option<String>) -> TutorProfile {
        let profile = TutorProfile::new(self.name.clone());
        let profile = match document {
            Some(document) => profile.with_document(document),
            None => profile,
        };
        if self.text_only {
            profile
        } else {
            profile.with_voice(self.voice(config))
        }
    }

    /// The session config before the tutor profile is applied.
    pub fn live_config(
        &self,
        config: &Config,
        declarations: Vec<FunctionDeclaration>,
    ) -> LiveConfig {
        let mut live = default_config(self.model(config), self.voice(config));
        if self.text_only {
            live = text_only(live);
        }
        live = with_function_declarations(live, declarations);
        if !self.no_search {
            live = with_builtin_tool(live, Tool::google_search());
        }
        live
    }
}
