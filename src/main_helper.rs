use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::CoachConfig;
use crate::constants::{
    DEFAULT_BASE_URL, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, DEFAULT_READ_TIMEOUT_SECS,
    DEFAULT_RETRY_BASE_MS, DEFAULT_TEMPERATURE, PLAN_PATH,
};
use crate::types::{CoachError, Result};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Streaming client for the CUDA kernel coach", long_about = None)]
pub struct Args {
    #[arg(long, env = "CUDAGENT_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
    #[arg(long, default_value = PLAN_PATH)]
    pub plan_path: String,
    #[arg(long, env = "LLM_MODEL")]
    pub model: Option<String>,
    #[arg(long, env = "LLM_TEMPERATURE", default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,
    #[arg(long, env = "LLM_MAX_TOKENS")]
    pub max_tokens: Option<u32>,
    #[arg(long, env = "CUDAGENT_SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,
    #[arg(long, env = "LLM_TIMEOUT", default_value_t = DEFAULT_READ_TIMEOUT_SECS)]
    pub read_timeout_secs: u64,
    #[arg(long, env = "LLM_CONNECT_TIMEOUT", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
    #[arg(long, env = "LLM_RETRY_MAX", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    #[arg(long, env = "LLM_RETRY_BASE_MS", default_value_t = DEFAULT_RETRY_BASE_MS)]
    pub retry_base_ms: u64,
    /// Run a single turn with this prompt and exit
    #[arg(long)]
    pub prompt: Option<String>,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}

impl From<&Args> for CoachConfig {
    fn from(args: &Args) -> Self {
        Self {
            base_url: args.base_url.clone(),
            plan_path: args.plan_path.clone(),
            model: args.model.clone(),
            temperature: args.temperature,
            max_tokens: args.max_tokens,
            system_prompt: args.system_prompt.clone(),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            read_timeout: Duration::from_secs(args.read_timeout_secs),
            max_retries: args.max_retries,
            retry_base_ms: args.retry_base_ms,
        }
    }
}

pub fn build_http_client(config: &CoachConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .map_err(|e| CoachError::Network(e).into())
}
