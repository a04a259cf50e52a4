use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::record::{EntryKind, ValidationPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub deck: DeckConfig,
    pub package: PackageConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub validation: ValidationPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Path to the existing local collection. Never created by a run.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeckConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PackageConfig {
    /// Destination of the export artifact (`.apkg`). Written atomically.
    pub output: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub sheet_id: String,
    /// Tabs to fetch, in order; each maps to one record kind.
    pub tabs: Vec<TabConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TabConfig {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Directory where synthesized assets are cached. Unset disables the
    /// cache entirely.
    #[serde(default)]
    pub media_dir: Option<PathBuf>,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default = "default_tts_model")]
    pub model_id: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            media_dir: None,
            voice_id: None,
            model_id: default_tts_model(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_tts_model() -> String {
    "eleven_multilingual_v2".to_string()
}
fn default_concurrency() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    30
}

impl AudioConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled" && self.media_dir.is_some()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SyncError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| SyncError::Config(format!("failed to parse config file: {}", e)))?;

    if config.deck.name.trim().is_empty() {
        return Err(SyncError::Config("deck.name must not be empty".into()));
    }

    if config.source.sheet_id.trim().is_empty() {
        return Err(SyncError::Config("source.sheet_id must not be empty".into()));
    }

    if config.source.tabs.is_empty() {
        return Err(SyncError::Config("source.tabs must list at least one tab".into()));
    }

    if config.audio.concurrency == 0 {
        return Err(SyncError::Config("audio.concurrency must be >= 1".into()));
    }

    match config.audio.provider.as_str() {
        "disabled" | "elevenlabs" => {}
        other => {
            return Err(SyncError::Config(format!(
                "unknown audio provider: '{}'. Must be disabled or elevenlabs.",
                other
            )))
        }
    }

    if config.audio.provider == "elevenlabs" && config.audio.voice_id.is_none() {
        return Err(SyncError::Config(
            "audio.voice_id must be set when provider is 'elevenlabs'".into(),
        ));
    }

    if config.validation.version != 1 {
        return Err(SyncError::Config(format!(
            "unsupported validation policy version: {}",
            config.validation.version
        )));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UnknownColumns;

    fn base_toml() -> String {
        r#"
[store]
path = "/tmp/collection.anki2"

[deck]
name = "Greek Vocabulary"

[package]
output = "/tmp/greek.apkg"

[source]
sheet_id = "sheet-123"
tabs = [
  { name = "Words", kind = "word" },
  { name = "Verbs", kind = "verb" },
]
"#
        .to_string()
    }

    fn parse(toml_text: &str) -> Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decksync.toml");
        std::fs::write(&path, toml_text).unwrap();
        load_config(&path)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&base_toml()).unwrap();
        assert_eq!(config.audio.provider, "disabled");
        assert!(!config.audio.is_enabled());
        assert_eq!(config.audio.concurrency, 4);
        assert_eq!(config.validation.version, 1);
        assert_eq!(config.validation.unknown_columns, UnknownColumns::Ignore);
        assert_eq!(config.source.tabs[0].kind, EntryKind::Word);
    }

    #[test]
    fn test_enabled_audio_requires_voice() {
        let toml_text = format!(
            "{}\n[audio]\nprovider = \"elevenlabs\"\nmedia_dir = \"/tmp/media\"\n",
            base_toml()
        );
        let err = parse(&toml_text).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let toml_text = format!("{}\n[audio]\nprovider = \"espeak\"\n", base_toml());
        assert!(parse(&toml_text).is_err());
    }

    #[test]
    fn test_validation_policy_parsed() {
        let toml_text = format!(
            "{}\n[validation]\nversion = 1\nunknown_columns = \"reject\"\n\n\
             [validation.required]\nword = [\"Greek\", \"English\", \"Gender\"]\n",
            base_toml()
        );
        let config = parse(&toml_text).unwrap();
        assert_eq!(config.validation.unknown_columns, UnknownColumns::Reject);
        assert_eq!(
            config.validation.required.get("word").unwrap(),
            &vec!["Greek".to_string(), "English".to_string(), "Gender".to_string()]
        );
    }

    #[test]
    fn test_unsupported_policy_version() {
        let toml_text = format!("{}\n[validation]\nversion = 2\n", base_toml());
        assert!(parse(&toml_text).is_err());
    }
}
