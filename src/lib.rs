pub mod classify;
pub mod config;
pub mod constants;
pub mod framing;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod session;
pub mod str_utils;
pub mod streaming;
pub mod transcript;
pub mod transport;
pub mod types;

pub use types::*;

pub use config::{CoachConfig, GenerationParams};
pub use main_helper::Args;
pub use session::{Session, SessionEvent};
pub use streaming::{TurnReport, TurnState};
pub use transport::{ChunkStream, HttpTransport, Transport};
