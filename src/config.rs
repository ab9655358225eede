use std::time::Duration;

use crate::constants::{
    DEFAULT_BASE_URL, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, DEFAULT_READ_TIMEOUT_SECS,
    DEFAULT_RETRY_BASE_MS, DEFAULT_TEMPERATURE, PLAN_PATH,
};

/// Runtime configuration for the coach client.
#[derive(Debug, Clone)]
pub struct CoachConfig {
    pub base_url: String,
    pub plan_path: String,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub connect_timeout: Duration,
    /// Maximum silence between two body reads, not a cap on the whole stream.
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            plan_path: PLAN_PATH.to_string(),
            model: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
            system_prompt: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
        }
    }
}

impl CoachConfig {
    pub fn endpoint(&self) -> String {
        join_url(&self.base_url, &self.plan_path)
    }

    pub fn generation(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt.clone(),
        }
    }
}

/// Per-session generation settings sent with every turn.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        CoachConfig::default().generation()
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
