use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::ai_provider::{AIConfig, AIProvider};
use crate::core::{LetterError, Result};
use crate::generator::FALLBACK_LETTER;

pub const DEFAULT_SCHEDULE_HOURS: [u32; 3] = [2, 3, 4];
pub const MIN_GENERATION_TIMEOUT: u64 = 60;

/// Runtime settings read once from the environment at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub storage_path: PathBuf,
    pub backup_path: PathBuf,
    pub providers: HashMap<String, ProviderConfig>,
    pub system_prompt_mari: Option<String>,
    pub system_prompt_ura: Option<String>,
    pub debug_mode: bool,
    pub log_level: Option<String>,
    pub max_daily_requests: u32,
    pub max_daily_generations: u32,
    pub batch_schedule_hours: Vec<u32>,
    /// Seconds allowed for one letter generation.
    pub generation_timeout: u64,
    pub max_concurrent_generations: usize,
    pub async_letter_enabled: bool,
    pub letter_min_affinity: u8,
    /// Content stored in place of a letter whose generation failed.
    pub letter_fallback: String,
    #[serde(skip)]
    parse_problems: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub default_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to their
    /// defaults and are reported later by `validate`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut problems = Vec::new();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("mari");
        let storage_path = get("STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("letters.json"));
        let backup_path = get("BACKUP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("backup"));

        let mut providers = HashMap::new();
        for provider in [AIProvider::Together, AIProvider::Groq, AIProvider::Gemini] {
            let prefix = provider.to_string().to_uppercase();
            providers.insert(
                provider.to_string(),
                ProviderConfig {
                    default_model: get(&format!("{}_MODEL", prefix))
                        .unwrap_or_else(|| provider.default_model().to_string()),
                    host: get(&format!("{}_BASE_URL", prefix)),
                    api_key: get(provider.api_key_var()),
                },
            );
        }

        let batch_schedule_hours = match get("BATCH_SCHEDULE_HOURS") {
            Some(raw) => parse_hours(&raw, &mut problems),
            None => DEFAULT_SCHEDULE_HOURS.to_vec(),
        };

        Config {
            data_dir,
            storage_path,
            backup_path,
            providers,
            system_prompt_mari: get("SYSTEM_PROMPT_MARI"),
            system_prompt_ura: get("SYSTEM_PROMPT_URA"),
            debug_mode: parse_or("DEBUG_MODE", get("DEBUG_MODE"), false, parse_bool, &mut problems),
            log_level: get("LOG_LEVEL"),
            max_daily_requests: parse_or("MAX_DAILY_REQUESTS", get("MAX_DAILY_REQUESTS"), 1, |v| v.parse().ok(), &mut problems),
            max_daily_generations: parse_or("MAX_DAILY_GENERATIONS", get("MAX_DAILY_GENERATIONS"), 100, |v| v.parse().ok(), &mut problems),
            batch_schedule_hours,
            generation_timeout: parse_or("GENERATION_TIMEOUT", get("GENERATION_TIMEOUT"), 300, |v| v.parse().ok(), &mut problems),
            max_concurrent_generations: parse_or("MAX_CONCURRENT_GENERATIONS", get("MAX_CONCURRENT_GENERATIONS"), 3, |v| v.parse().ok(), &mut problems),
            async_letter_enabled: parse_or("ASYNC_LETTER_ENABLED", get("ASYNC_LETTER_ENABLED"), true, parse_bool, &mut problems),
            letter_min_affinity: parse_or("LETTER_MIN_AFFINITY", get("LETTER_MIN_AFFINITY"), 40, |v| v.parse().ok(), &mut problems),
            letter_fallback: get("LETTER_FALLBACK").unwrap_or_else(|| FALLBACK_LETTER.to_string()),
            parse_problems: problems,
        }
    }

    /// Every problem found, joined into one error.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(LetterError::Config(problems.join("; ")))
        }
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems = self.parse_problems.clone();

        if self.batch_schedule_hours.is_empty() {
            problems.push("BATCH_SCHEDULE_HOURS must list at least one hour".to_string());
        }
        for hour in &self.batch_schedule_hours {
            if *hour > 23 {
                problems.push(format!("BATCH_SCHEDULE_HOURS entry {} is not in 0..=23", hour));
            }
        }
        if self.generation_timeout < MIN_GENERATION_TIMEOUT {
            problems.push(format!(
                "GENERATION_TIMEOUT must be at least {} seconds (got {})",
                MIN_GENERATION_TIMEOUT, self.generation_timeout
            ));
        }
        if self.max_concurrent_generations < 1 {
            problems.push("MAX_CONCURRENT_GENERATIONS must be at least 1".to_string());
        }
        if self.max_daily_requests < 1 {
            problems.push("MAX_DAILY_REQUESTS must be at least 1".to_string());
        }
        if self.letter_min_affinity > 100 {
            problems.push(format!("LETTER_MIN_AFFINITY must be 0..=100 (got {})", self.letter_min_affinity));
        }

        problems
    }

    pub fn get_provider(&self, provider: AIProvider) -> Option<&ProviderConfig> {
        self.providers.get(&provider.to_string())
    }

    pub fn get_ai_config(&self, provider: AIProvider, model: Option<String>) -> Result<AIConfig> {
        let provider_config = self
            .get_provider(provider)
            .ok_or_else(|| LetterError::Config(format!("Unknown provider: {}", provider)))?;

        let mut config = AIConfig::new(provider);
        config.model = model.unwrap_or_else(|| provider_config.default_model.clone());
        config.api_key = provider_config.api_key.clone();
        config.base_url = provider_config.host.clone();
        config.timeout_secs = self.generation_timeout;
        Ok(config)
    }

    pub fn has_api_key(&self, provider: AIProvider) -> bool {
        self.get_provider(provider)
            .and_then(|p| p.api_key.as_ref())
            .is_some_and(|key| !key.is_empty())
    }

    /// Settings safe to print; API keys are reduced to set / not set.
    pub fn redacted_summary(&self) -> Vec<(String, String)> {
        let mut lines = vec![
            ("storage_path".to_string(), self.storage_path.display().to_string()),
            ("backup_path".to_string(), self.backup_path.display().to_string()),
            ("async_letter_enabled".to_string(), self.async_letter_enabled.to_string()),
            (
                "batch_schedule_hours".to_string(),
                self.batch_schedule_hours
                    .iter()
                    .map(|h| h.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("max_daily_requests".to_string(), self.max_daily_requests.to_string()),
            ("max_daily_generations".to_string(), self.max_daily_generations.to_string()),
            ("max_concurrent_generations".to_string(), self.max_concurrent_generations.to_string()),
            ("generation_timeout".to_string(), format!("{}s", self.generation_timeout)),
            ("letter_min_affinity".to_string(), self.letter_min_affinity.to_string()),
            ("debug_mode".to_string(), self.debug_mode.to_string()),
        ];

        for provider in [AIProvider::Together, AIProvider::Groq, AIProvider::Gemini] {
            if let Some(p) = self.get_provider(provider) {
                let key_state = if self.has_api_key(provider) { "key set" } else { "key not set" };
                lines.push((format!("{}", provider), format!("{} ({})", p.default_model, key_state)));
            }
        }

        lines
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T, parse: impl Fn(&str) -> Option<T>, problems: &mut Vec<String>) -> T {
    match raw {
        None => default,
        Some(value) => parse(&value).unwrap_or_else(|| {
            problems.push(format!("{} has invalid value {:?}", key, value));
            default
        }),
    }
}

fn parse_hours(raw: &str, problems: &mut Vec<String>) -> Vec<u32> {
    let mut hours = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.parse::<u32>() {
            Ok(hour) => hours.push(hour),
            Err(_) => problems.push(format!("BATCH_SCHEDULE_HOURS entry {:?} is not a number", entry)),
        }
    }
    hours.sort_unstable();
    hours.dedup();

    if hours.is_empty() {
        problems.push(format!("BATCH_SCHEDULE_HOURS {:?} has no usable hours", raw));
        return DEFAULT_SCHEDULE_HOURS.to_vec();
    }
    hours
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.max_daily_requests, 1);
        assert_eq!(config.batch_schedule_hours, vec![2, 3, 4]);
        assert_eq!(config.generation_timeout, 300);
        assert_eq!(config.max_concurrent_generations, 3);
        assert_eq!(config.max_daily_generations, 100);
        assert_eq!(config.letter_min_affinity, 40);
        assert!(config.async_letter_enabled);
        assert!(!config.debug_mode);
        assert!(config.storage_path.ends_with("mari/letters.json"));
        assert_eq!(config.letter_fallback, FALLBACK_LETTER);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_letter_fallback_override() {
        let config = config_from(&[("LETTER_FALLBACK", "  今夜は書けなかった。  ")]);
        assert_eq!(config.letter_fallback, "今夜は書けなかった。");

        let blank = config_from(&[("LETTER_FALLBACK", "   ")]);
        assert_eq!(blank.letter_fallback, FALLBACK_LETTER);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("MAX_DAILY_REQUESTS", "3"),
            ("BATCH_SCHEDULE_HOURS", " 4, 2,2 ,3 "),
            ("STORAGE_PATH", "/tmp/mari/letters.json"),
            ("DEBUG_MODE", "true"),
            ("ASYNC_LETTER_ENABLED", "false"),
            ("GROQ_API_KEY", "gsk-test"),
            ("GROQ_MODEL", "llama-3.1-8b-instant"),
        ]);
        assert_eq!(config.max_daily_requests, 3);
        assert_eq!(config.batch_schedule_hours, vec![2, 3, 4]);
        assert_eq!(config.storage_path, PathBuf::from("/tmp/mari/letters.json"));
        assert!(config.debug_mode);
        assert!(!config.async_letter_enabled);
        assert!(config.has_api_key(AIProvider::Groq));
        assert!(!config.has_api_key(AIProvider::Together));

        let ai = config.get_ai_config(AIProvider::Groq, None).unwrap();
        assert_eq!(ai.model, "llama-3.1-8b-instant");
        assert_eq!(ai.api_key.as_deref(), Some("gsk-test"));
        assert_eq!(ai.timeout_secs, 300);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = config_from(&[
            ("BATCH_SCHEDULE_HOURS", "2,25,x"),
            ("GENERATION_TIMEOUT", "30"),
            ("MAX_CONCURRENT_GENERATIONS", "0"),
            ("MAX_DAILY_REQUESTS", "lots"),
        ]);
        let problems = config.problems();
        assert_eq!(problems.len(), 5, "{:?}", problems);
        assert_eq!(config.max_daily_requests, 1);

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("GENERATION_TIMEOUT"));
        assert!(message.contains("25"));
        assert!(message.contains("MAX_CONCURRENT_GENERATIONS"));
    }

    #[test]
    fn test_unusable_hours_fall_back() {
        let config = config_from(&[("BATCH_SCHEDULE_HOURS", "soon")]);
        assert_eq!(config.batch_schedule_hours, vec![2, 3, 4]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_hides_keys() {
        let config = config_from(&[("GEMINI_API_KEY", "super-secret")]);
        let summary = config.redacted_summary();
        assert!(summary.iter().all(|(_, v)| !v.contains("super-secret")));
        assert!(summary.iter().any(|(k, v)| k == "gemini" && v.contains("key set")));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("super-secret"));
    }
}
