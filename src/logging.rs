use std::panic;
use std::path::Path;

use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use crate::types::{StreamEvent, TurnId};

pub const DEFAULT_LOG_FILTER: &str = "cudagent=info";
pub const LOG_FILE_NAME: &str = "cudagent.log";

/// Installs the global subscriber: env filter, daily-rolling file output and
/// the span-trace error layer. Keep the returned guard alive for the process.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    std::fs::create_dir_all(log_dir)?;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    Ok(guard)
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-turn stream counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetric {
    pub chunks: usize,
    pub bytes: usize,
    pub frames: usize,
    pub deltas: usize,
    pub text_chars: usize,
    pub errors: usize,
    pub pings: usize,
    pub dropped_tail_bytes: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len;
    }

    pub fn record_frames(&mut self, count: usize) {
        self.frames += count;
    }

    pub fn record_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => {
                self.deltas += 1;
                self.text_chars += text.chars().count();
            }
            StreamEvent::ErrorEvent(_) => self.errors += 1,
            StreamEvent::StatusPing => self.pings += 1,
            StreamEvent::Termination => {}
        }
    }

    pub fn log_summary(&self, turn_id: &TurnId, outcome: impl std::fmt::Display) {
        info!(
            target: "flight_recorder",
            "[TURN END] TurnID: {} | Outcome: {} | Chunks: {} ({} bytes) | Frames: {} | Deltas: {} ({} chars) | Errors: {} | Pings: {} | Dropped tail: {} bytes",
            turn_id.short(),
            outcome,
            self.chunks,
            self.bytes,
            self.frames,
            self.deltas,
            self.text_chars,
            self.errors,
            self.pings,
            self.dropped_tail_bytes
        );
    }
}
