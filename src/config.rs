use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub webhook_secret: String,
    pub signature_validation: bool,
    pub async_processing: bool,
    pub dispatch_queue_capacity: usize,
    pub dispatch_timeout_seconds: u64,
    pub max_payload_bytes: usize,
    pub ip_limit_per_minute: u32,
    pub dedup_ttl_seconds: i64,
    pub github_token: String,
    pub github_api_base: String,
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_timeout_seconds: u64,
    pub llm_min_interval_ms: u64,
    pub prompts_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub repositories_file: PathBuf,
    pub analyzed_label: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let signature_validation = env_bool("TRIAGE_SIGNATURE_VALIDATION", true);
        let webhook_secret = if signature_validation {
            required_env("GITHUB_WEBHOOK_SECRET")?
        } else {
            env::var("GITHUB_WEBHOOK_SECRET").unwrap_or_default()
        };

        let config = Self {
            bind_addr: env::var("TRIAGE_BIND").unwrap_or_else(|_| "0.0.0.0:9000".to_string()),
            webhook_secret,
            signature_validation,
            async_processing: env_bool("TRIAGE_ASYNC_PROCESSING", true),
            dispatch_queue_capacity: env_usize("TRIAGE_DISPATCH_QUEUE_CAPACITY", 1024)?,
            dispatch_timeout_seconds: env_u64("TRIAGE_DISPATCH_TIMEOUT_SECONDS", 300)?,
            max_payload_bytes: env_usize("TRIAGE_MAX_PAYLOAD_BYTES", 1_048_576)?,
            ip_limit_per_minute: env_u32("TRIAGE_IP_RATE_PER_MINUTE", 100)?,
            dedup_ttl_seconds: env_i64("TRIAGE_DEDUP_TTL_SECONDS", 3_600)?,
            github_token: required_env("GITHUB_TOKEN")?,
            github_api_base: env::var("GITHUB_API_BASE")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            llm_api_base: env::var("TRIAGE_LLM_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key: env::var("TRIAGE_LLM_API_KEY")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            llm_model: env::var("TRIAGE_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_timeout_seconds: env_u64("TRIAGE_LLM_TIMEOUT_SECONDS", 60)?,
            llm_min_interval_ms: env_u64("TRIAGE_LLM_MIN_INTERVAL_MS", 1_000)?,
            prompts_dir: env_path("TRIAGE_PROMPTS_DIR", "./prompts"),
            outputs_dir: env_path("TRIAGE_OUTPUTS_DIR", "./outputs"),
            repositories_file: env_path("TRIAGE_REPOSITORIES_FILE", "./repositories.toml"),
            analyzed_label: env::var("TRIAGE_ANALYZED_LABEL")
                .unwrap_or_else(|_| "clide-analyzed".to_string()),
        };

        if config.dispatch_queue_capacity == 0 {
            return Err(anyhow!(
                "TRIAGE_DISPATCH_QUEUE_CAPACITY must be a positive integer"
            ));
        }

        if config.dedup_ttl_seconds <= 0 {
            return Err(anyhow!(
                "TRIAGE_DEDUP_TTL_SECONDS must be a positive integer"
            ));
        }

        Ok(config)
    }
}

fn required_env(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("missing required env var: {name}"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("required env var {name} cannot be empty"));
    }
    Ok(value)
}

fn env_path(name: &str, default: &str) -> PathBuf {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<u32>()
                .with_context(|| format!("invalid u32 for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<u64>()
                .with_context(|| format!("invalid u64 for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<i64>()
                .with_context(|| format!("invalid i64 for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<usize>()
                .with_context(|| format!("invalid usize for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Baseline config for unit tests; endpoints point at an unroutable
/// address so an accidental real call fails fast.
#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        webhook_secret: "test-secret".to_string(),
        signature_validation: true,
        async_processing: false,
        dispatch_queue_capacity: 16,
        dispatch_timeout_seconds: 5,
        max_payload_bytes: 1_048_576,
        ip_limit_per_minute: 100,
        dedup_ttl_seconds: 3_600,
        github_token: "test-token".to_string(),
        github_api_base: "http://127.0.0.1:1".to_string(),
        llm_api_base: "http://127.0.0.1:1".to_string(),
        llm_api_key: None,
        llm_model: "test-model".to_string(),
        llm_timeout_seconds: 5,
        llm_min_interval_ms: 0,
        prompts_dir: PathBuf::from("./prompts"),
        outputs_dir: PathBuf::from("./outputs"),
        repositories_file: PathBuf::from("./repositories.toml"),
        analyzed_label: "clide-analyzed".to_string(),
    }
}
