use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use kestrel_llm::DEFAULT_BASE_URL;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::GenerationOptions;

pub const SETTINGS_DIRECTORY_NAME: &str = "kestrel";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "KESTREL_";

const MAX_TEMPERATURE: f64 = 2.0;

/// Where local annotations and the session list are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub response_style: String,
    pub response_length: String,
    pub search_depth: u32,
    pub custom_instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub storage: StorageBackend,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let options = GenerationOptions::default();
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_style: options.response_style,
            response_length: options.response_length,
            search_depth: options.search_depth,
            custom_instructions: options.custom_instructions,
            data_dir: None,
            storage: StorageBackend::default(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();

        self.base_url = non_blank_or(&self.base_url, &defaults.base_url)
            .trim_end_matches('/')
            .to_string();
        self.response_style = non_blank_or(&self.response_style, &defaults.response_style);
        self.response_length = non_blank_or(&self.response_length, &defaults.response_length);
        self.custom_instructions = self.custom_instructions.trim().to_string();

        self.temperature = if self.temperature.is_finite() {
            self.temperature.clamp(0.0, MAX_TEMPERATURE)
        } else {
            defaults.temperature
        };
        self.max_tokens = self.max_tokens.max(1);
        self.search_depth = self.search_depth.max(1);

        self.data_dir = self
            .data_dir
            .filter(|path| !path.as_os_str().is_empty());

        self
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_style: self.response_style.clone(),
            response_length: self.response_length.clone(),
            search_depth: self.search_depth,
            custom_instructions: self.custom_instructions.clone(),
        }
    }

    /// Directory for local stores; the platform data directory unless overridden.
    pub fn data_directory(&self) -> PathBuf {
        match &self.data_dir {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".kestrel")),
        }
    }
}

fn non_blank_or(value: &str, fallback: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// Live settings snapshot backed by a JSON file.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".kestrel"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_sources(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the settings file if present, then `KESTREL_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn load_from_sources(path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults and environment");
        }

        match Self::figment(path).extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn normalization_restores_blank_fields_and_clamps_ranges() {
        let settings = ClientSettings {
            base_url: " http://example.test/api/ ".to_string(),
            temperature: 9.0,
            max_tokens: 0,
            response_style: "  ".to_string(),
            response_length: String::new(),
            search_depth: 0,
            custom_instructions: "  be brief  ".to_string(),
            data_dir: Some(PathBuf::new()),
            storage: StorageBackend::Sqlite,
        }
        .normalized();

        assert_eq!(settings.base_url, "http://example.test/api");
        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.max_tokens, 1);
        assert_eq!(settings.response_style, "balanced");
        assert_eq!(settings.response_length, "medium");
        assert_eq!(settings.search_depth, 1);
        assert_eq!(settings.custom_instructions, "be brief");
        assert!(settings.data_dir.is_none());
        assert_eq!(settings.storage, StorageBackend::Sqlite);
    }

    #[test]
    fn non_finite_temperature_falls_back_to_default() {
        let settings = ClientSettings {
            temperature: f64::NAN,
            ..ClientSettings::default()
        }
        .normalized();
        assert_eq!(settings.temperature, 0.7);
    }

    #[test]
    fn generation_options_mirror_settings() {
        let settings = ClientSettings {
            temperature: 0.2,
            custom_instructions: "Answer in French.".to_string(),
            ..ClientSettings::default()
        };
        let options = settings.generation_options();
        assert_eq!(options.temperature, 0.2);
        assert_eq!(options.custom_instructions, "Answer in French.");
        assert_eq!(options.max_tokens, 2048);
    }

    #[test]
    fn file_and_environment_are_layered_over_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{ "base_url": "http://file.test/api", "temperature": 0.3, "storage": "sqlite" }"#,
            )?;
            jail.set_env("KESTREL_TEMPERATURE", "1.1");
            jail.set_env("KESTREL_SEARCH_DEPTH", "40");

            let store = SettingsStore::new(PathBuf::from("settings.json"));
            let settings = store.settings();

            assert_eq!(settings.base_url, "http://file.test/api");
            assert_eq!(settings.temperature, 1.1);
            assert_eq!(settings.search_depth, 40);
            assert_eq!(settings.storage, StorageBackend::Sqlite);
            assert_eq!(settings.response_style, "balanced");
            Ok(())
        });
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", "{ not json")?;
            let store = SettingsStore::new(PathBuf::from("settings.json"));
            assert_eq!(*store.settings(), ClientSettings::default());
            Ok(())
        });
    }

    #[test]
    fn update_persists_atomically_and_swaps_snapshot() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join(SETTINGS_FILE_NAME);
            let store = SettingsStore::new(path.clone());

            store
                .update(ClientSettings {
                    temperature: 5.0,
                    custom_instructions: "Keep it short.".to_string(),
                    ..ClientSettings::default()
                })
                .unwrap();

            assert_eq!(store.settings().temperature, 2.0);
            assert!(path.exists());
            assert!(!path.with_extension("json.tmp").exists());

            let reloaded = SettingsStore::new(path);
            assert_eq!(reloaded.settings().custom_instructions, "Keep it short.");
            assert_eq!(reloaded.settings().temperature, 2.0);
            Ok(())
        });
    }
}
