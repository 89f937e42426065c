//! Scheduled pass that keeps every connected user's access token fresh.

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use sonosense_core::clock::Clock;
use sonosense_core::error::{CoreError, Result};
use sonosense_core::model::User;
use sonosense_core::secrets::SecretStore;
use sonosense_core::streaming::StreamingApi;
use sonosense_core::users::UserStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One failed user in a refresh pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshFailure {
    pub user_id: String,
    pub message: String,
}

/// Per-pass summary emitted after every refresh pass.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub users_queried: usize,
    pub tokens_refreshed: usize,
    pub tokens_skipped: usize,
    pub failures: usize,
    pub errors: Vec<RefreshFailure>,
}

/// Periodically refreshes access tokens for all active connected users,
/// writing the updated bundle back to the secret store.
pub struct TokenRefresher {
    users: UserStore,
    secrets: Arc<SecretStore>,
    streaming: Arc<dyn StreamingApi>,
    clock: Arc<dyn Clock>,
    client_id: String,
    client_secret: String,
    buffer_minutes: u32,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl TokenRefresher {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        users: UserStore,
        secrets: Arc<SecretStore>,
        streaming: Arc<dyn StreamingApi>,
        clock: Arc<dyn Clock>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        buffer_minutes: u32,
        interval: Duration,
        cancel_token: Option<CancellationToken>,
    ) -> Self {
        Self {
            users,
            secrets,
            streaming,
            clock,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            buffer_minutes,
            interval,
            cancel_token: cancel_token.unwrap_or_default(),
        }
    }

    /// Start the refresher in a background task.
    #[must_use]
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the refresh loop until cancelled.
    pub async fn run(&self) {
        info!("Starting token refresher (interval: {:?})", self.interval);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!("Token refresher shutting down");
                    break;
                }
                () = tokio::time::sleep(self.interval) => {
                    match self.refresh_once().await {
                        Ok(summary) => {
                            info!(
                                "Refresh pass complete: queried={} refreshed={} skipped={} failures={}",
                                summary.users_queried,
                                summary.tokens_refreshed,
                                summary.tokens_skipped,
                                summary.failures
                            );
                        }
                        Err(e) => error!("Refresh pass failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass over all active connected users.
    ///
    /// Per-user failures are collected and never stop the pass. After a
    /// pass, every user not in the error list has a token valid for more
    /// than the configured buffer.
    ///
    /// # Errors
    ///
    /// Returns an error only when the user listing itself fails.
    pub async fn refresh_once(&self) -> Result<RefreshSummary> {
        let users = self.users.list_active_connected().await?;
        let mut summary = RefreshSummary {
            users_queried: users.len(),
            ..RefreshSummary::default()
        };

        for user in users {
            match self.refresh_user(&user).await {
                Ok(true) => {
                    summary.tokens_refreshed += 1;
                    info!("Token refreshed for user {}", user.user_id);
                }
                Ok(false) => {
                    summary.tokens_skipped += 1;
                    debug!("Token refresh skipped for user {} (still fresh)", user.user_id);
                }
                Err(e) => {
                    summary.failures += 1;
                    warn!("Token refresh failed for user {}: {}", user.user_id, e);
                    summary.errors.push(RefreshFailure {
                        user_id: user.user_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(summary)
    }

    /// Refresh one user's token; `Ok(false)` means it was still fresh.
    async fn refresh_user(&self, user: &User) -> Result<bool> {
        let secret_ref = user.spotify_token_secret_ref.as_deref().ok_or_else(|| {
            CoreError::NoSpotifyCredentials {
                user_id: user.user_id.clone(),
            }
        })?;

        let bundle = self.secrets.get(secret_ref).await?;
        if bundle.refresh_token.is_empty() {
            return Err(CoreError::NoSpotifyCredentials {
                user_id: user.user_id.clone(),
            });
        }

        let now = self.clock.now();
        match bundle.expires_at_utc() {
            Some(expires_at) => {
                let remaining = expires_at - now;
                if remaining > ChronoDuration::minutes(i64::from(self.buffer_minutes)) {
                    return Ok(false);
                }
            }
            None => {
                if bundle.expires_at.is_some() {
                    warn!(
                        "Could not parse expires_at for user {}, refreshing anyway",
                        user.user_id
                    );
                }
            }
        }

        let refreshed = self
            .streaming
            .refresh_token(&bundle.refresh_token, &self.client_id, &self.client_secret)
            .await?;

        // Merge into the existing bundle: the refresh token and any unknown
        // fields are kept as-is.
        let mut updated = bundle;
        updated.access_token = refreshed.access_token;
        updated.expires_at =
            Some((now + ChronoDuration::seconds(refreshed.expires_in_secs)).to_rfc3339());
        updated.scope = refreshed.scope.or(updated.scope);
        updated.token_type = Some("Bearer".into());
        updated.last_refreshed = Some(now.to_rfc3339());

        self.secrets.put(secret_ref, &updated).await?;
        Ok(true)
    }
}
