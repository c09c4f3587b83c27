pub mod audio;
pub mod config;
pub mod doctor;
pub mod envelope;
pub mod events;
pub mod meter;
pub mod monitor;
pub mod playback;
pub mod service;
pub mod state;
pub mod synth;
pub mod telemetry;

pub use config::{AppConfig, ConfigStore, EchoParams, ParamsUpdate};
pub use playback::{TriggerError, TriggerOrigin};
pub use service::{Service, StatusSnapshot};
pub use state::SharedState;
