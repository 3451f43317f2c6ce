//! Environment-driven ambient configuration: LLM connection details and
//! tracing setup. Kept inside the harness crate rather than a shared config
//! crate since the harness is the only consumer.

use std::env;
use std::sync::Once;

use tracing_subscriber::{prelude::*, EnvFilter};

/// Load `.env` from the current directory into the process environment
/// (without overwriting variables already set). Idempotent.
fn load_dotenv() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let path = env::current_dir().map(|d| d.join(".env")).unwrap_or_else(|_| ".env".into());
        if let Ok(content) = std::fs::read_to_string(&path) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some(eq_pos) = line.find('=') else { continue };
                let key = line[..eq_pos].trim();
                let mut value = line[eq_pos + 1..].trim();
                if let Some(hash_pos) = value.find('#') {
                    let before_hash = value[..hash_pos].trim_end();
                    if !before_hash.contains('"') && !before_hash.contains('\'') {
                        value = before_hash;
                    }
                }
                if (value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\''))
                {
                    value = &value[1..value.len() - 1];
                }
                if !key.is_empty() && env::var(key).is_err() {
                    #[allow(unsafe_code)]
                    unsafe {
                        env::set_var(key, value);
                    }
                }
            }
        }
    });
}

fn env_or(primary: &str, aliases: &[&str], default: impl FnOnce() -> String) -> String {
    env::var(primary)
        .ok()
        .or_else(|| aliases.iter().find_map(|a| env::var(a).ok()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(default)
}

fn env_bool(primary: &str, aliases: &[&str], default: bool) -> bool {
    let v = env::var(primary).ok().or_else(|| aliases.iter().find_map(|a| env::var(a).ok()));
    match v.as_deref() {
        Some(s) => !matches!(s.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off"),
        None => default,
    }
}

/// LLM endpoint configuration, resolved from `SKILLLITE_*` env vars with
/// `OPENAI_*` fallbacks for drop-in compatibility with OpenAI-shaped tooling.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        Self {
            api_base: env_or("SKILLLITE_API_BASE", &["OPENAI_API_BASE", "OPENAI_BASE_URL", "BASE_URL"], || {
                "http://localhost:11434/v1".to_string()
            }),
            api_key: env_or("SKILLLITE_API_KEY", &["OPENAI_API_KEY", "API_KEY"], String::new),
            model: env_or("SKILLLITE_MODEL", &["OPENAI_MODEL", "MODEL"], || "qwen2.5:7b".to_string()),
        }
    }
}

/// Initialize the global tracing subscriber. Call once at process startup;
/// a second call is a harmless no-op (`try_init` swallows the "already set"
/// error).
pub fn init_tracing() {
    load_dotenv();
    let quiet = env_bool("SKILLLITE_QUIET", &["SKILLBOX_QUIET"], false);
    let log_json = env_bool("SKILLLITE_LOG_JSON", &["SKILLBOX_LOG_JSON"], false);
    let level = if quiet {
        "skilllite_agent=warn".to_string()
    } else {
        env_or("SKILLLITE_LOG_LEVEL", &["SKILLBOX_LOG_LEVEL"], || "skilllite_agent=info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true).with_thread_ids(false))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn llm_config_falls_back_to_openai_aliases() {
        // SKILLLITE_API_KEY is not set in the test environment; the default
        // constructor must not panic even with an empty key.
        let cfg = LlmConfig::from_env();
        assert!(!cfg.model.is_empty());
    }
}
