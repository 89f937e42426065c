pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod envelope;
pub mod error;
pub mod events;
pub mod model;
pub mod paths;
pub mod secrets;
pub mod sensors;
pub mod streaming;
pub mod users;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EngineConfig, IngestConfig, LoggingConfig, SecretsConfig, SonosenseConfig, StoreConfig,
    StreamingConfig, CONFIG_TEMPLATE,
};
pub use context::RequestContext;
pub use db::Database;
pub use envelope::MotionEnvelope;
pub use error::CoreError;
pub use events::EventStore;
pub use model::{
    duration_minutes, validate_sensor_id, ActionTaken, EventType, MotionEvent, QuietHours,
    Sensor, Session, SessionStatus, SpotifyConfig, User,
};
pub use secrets::{SecretStore, TokenBundle};
pub use sensors::SensorStore;
pub use streaming::{Device, PlaybackState, RefreshedToken, StartPlayback, StreamingApi};
pub use users::UserStore;
