pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504, 520];

/// Stream wire format
pub const DATA_MARKER: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
pub const FRAME_DELIMITER: &[u8] = b"\n\n";
pub const ERROR_TAG: &str = "[error]";

/// Coach service endpoints
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const PLAN_PATH: &str = "/v1/coach/plan";
pub const HEALTH_PATH: &str = "/health";

/// Generation defaults
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;

/// Session observers that fall this far behind start losing events
pub const SESSION_EVENT_CAPACITY: usize = 256;

/// Log snippet length for unparseable or oversized payloads
pub const LOG_SNIPPET_CHARS: usize = 200;
