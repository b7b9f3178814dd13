pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod notifier;
pub mod player;
pub mod runtime;
pub mod service;
pub mod simulated;
pub mod sink;
pub mod tasks;
pub mod web_audio;

pub use error::SessionError;
pub use player::PlaybackSession;
pub use service::{ServiceSettings, SessionService};
pub use web_audio::WebAudioSession;
