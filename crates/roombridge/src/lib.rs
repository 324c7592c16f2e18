//! roombridge: relays H.264 video tracks from a source room into a destination room

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod relay;
pub mod session;
pub mod track;

pub use config::Config;
pub use dispatcher::{Dispatch, Supervisor, SupervisorSummary, TrackDispatcher};
pub use error::{ConfigError, ReadError, RelayError, SessionError};
