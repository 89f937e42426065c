//! Cross-cutting request context threaded through dispatcher calls.

use rand::Rng;

/// Identifiers attached to every log line emitted while processing one
/// motion event. Built up as the pipeline resolves the sensor, user and
/// session; never stored globally.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub sensor_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl RequestContext {
    /// New context with a fresh random request id.
    #[must_use]
    pub fn new() -> Self {
        let id: u64 = rand::thread_rng().gen();
        Self {
            request_id: format!("{id:016x}"),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sensor(mut self, sensor_id: impl Into<String>) -> Self {
        self.sensor_id = Some(sensor_id.into());
        self
    }

    pub fn set_user(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    pub fn set_session(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    /// Tracing span carrying the context identifiers.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "motion_event",
            request_id = %self.request_id,
            sensor_id = self.sensor_id.as_deref().unwrap_or(""),
            user_id = self.user_id.as_deref().unwrap_or(""),
        )
    }
}
