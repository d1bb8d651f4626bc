//! Environment configuration

use crate::core::conversation::FailedReplyPolicy;
use di::inject;
use di::injectable;
use log::warn;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";
pub const DEFAULT_MODEL: &str = "Llama-3.2-1B-Instruct-Q4_K_M";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_address: String,
    pub model_dir: PathBuf,
    pub default_model: String,
    pub autoload_model: bool,
    pub context_size: usize,
    pub system_prompt: String,
    pub temperature: f32,
    pub failed_reply_policy: FailedReplyPolicy,
    pub session_idle_timeout: Duration,
    pub cors_origins: Vec<String>,
}

#[injectable]
impl Settings {
    #[inject]
    pub fn create() -> Settings {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }
}

impl Settings {
    /// Builds the settings from a key lookup, falling back to defaults for missing or invalid
    /// values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Settings {
        let defaults = Settings::default();

        let temperature = parse_or(&lookup, "TEMPERATURE", defaults.temperature);
        let temperature = match validate_temperature(temperature) {
            Ok(temperature) => temperature,
            Err(_) => {
                warn!("TEMPERATURE {temperature} is out of range, using {DEFAULT_TEMPERATURE}");
                DEFAULT_TEMPERATURE
            }
        };

        Settings {
            bind_address: lookup("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            model_dir: lookup("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            default_model: lookup("DEFAULT_MODEL").unwrap_or(defaults.default_model),
            autoload_model: parse_or(&lookup, "AUTOLOAD_MODEL", defaults.autoload_model),
            context_size: parse_or(&lookup, "CONTEXT_SIZE", defaults.context_size),
            system_prompt: lookup("SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
            temperature,
            failed_reply_policy: parse_or(
                &lookup,
                "FAILED_REPLY_POLICY",
                defaults.failed_reply_policy,
            ),
            session_idle_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SESSION_IDLE_TIMEOUT_SECS",
                defaults.session_idle_timeout.as_secs(),
            )),
            cors_origins: lookup("CORS_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_address: "0.0.0.0:3000".to_owned(),
            model_dir: PathBuf::from("models"),
            default_model: DEFAULT_MODEL.to_owned(),
            autoload_model: false,
            context_size: 32_768,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            temperature: DEFAULT_TEMPERATURE,
            failed_reply_policy: FailedReplyPolicy::KeepUserTurn,
            session_idle_timeout: Duration::from_secs(3600),
            cors_origins: vec![
                "http://localhost:3000".to_owned(),
                "http://localhost:5173".to_owned(),
            ],
        }
    }
}

/// Accepts sampling temperatures in `0.0..=2.0`.
pub fn validate_temperature(temperature: f32) -> Result<f32, String> {
    if (0.0..=2.0).contains(&temperature) {
        Ok(temperature)
    } else {
        Err(format!(
            "temperature must be between 0 and 2, got {temperature}"
        ))
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid value `{raw}` for {key}");
            default
        }),
    }
}
