use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_chat::{GenerationOptions, ModelSelection};
use parley_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_USER_ID: &str = "local-user";
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "parley.db";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Persona id to prompt text.
    #[serde(default)]
    pub personas: BTreeMap<String, String>,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            system_prompt: String::new(),
            personas: BTreeMap::new(),
            user_id: default_user_id(),
            database_path: default_database_path(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl Settings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
    }

    pub fn model_selection(&self) -> Option<ModelSelection> {
        (!self.model.is_empty()).then(|| ModelSelection::new(&self.model, &self.provider_id))
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            system_prompt: (!self.system_prompt.is_empty()).then(|| self.system_prompt.clone()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn api_key(&self) -> Option<String> {
        (!self.api_key.is_empty()).then(|| self.api_key.clone())
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(&self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(&self.endpoint, default_endpoint);
        self.model = non_blank_or(&self.model, default_model);
        self.system_prompt = self.system_prompt.trim().to_string();
        self.user_id = non_blank_or(&self.user_id, default_user_id);
        self.database_path = non_blank_or(&self.database_path, default_database_path);

        // Blank ids or prompts can never be selected.
        self.personas = self
            .personas
            .into_iter()
            .map(|(id, prompt)| (id.trim().to_string(), prompt.trim().to_string()))
            .filter(|(id, prompt)| !id.is_empty() && !prompt.is_empty())
            .collect();

        self.temperature = self
            .temperature
            .filter(|temperature| temperature.is_finite())
            .map(|temperature| temperature.clamp(0.0, 2.0));
        self.max_tokens = self.max_tokens.filter(|max_tokens| *max_tokens > 0);
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
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

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file, then `PARLEY_*` variables.
    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(EncodeSnafu {
            stage: "encode-settings",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteSnafu {
            stage: "write-settings-temp",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(ReplaceSnafu {
            stage: "replace-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create {path:?} on `{stage}`: {source}"))]
    CreateDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings as JSON on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write {path:?} on `{stage}`: {source}"))]
    Write {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot move {from:?} over {to:?} on `{stage}`: {source}"))]
    Replace {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: &str, fallback: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}

fn default_database_path() -> String {
    SettingsStore::default_config_dir()
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}
