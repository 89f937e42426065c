//! Per-user OAuth token bundles, held outside the primary store.
//!
//! Each user's bundle lives in its own JSON file keyed by an opaque secret
//! ref. A small in-memory cache with entry-local TTL and LRU eviction
//! absorbs the dispatcher's read bursts; the token refresher is the only
//! writer and invalidates on write.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A user's streaming credentials as stored in the secret store.
///
/// Unknown fields are carried through the refresh write-back untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBundle {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// ISO-8601 expiry of `access_token`.
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub last_refreshed: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenBundle {
    /// Parse `expires_at`; `None` when absent or unparseable.
    #[must_use]
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

struct CachedBundle {
    bundle: TokenBundle,
    fetched_at: Instant,
}

/// File-backed secret store with a TTL/LRU read cache.
pub struct SecretStore {
    dir: PathBuf,
    cache_ttl: Duration,
    cache_capacity: usize,
    cache: RwLock<HashMap<String, CachedBundle>>,
}

fn validate_secret_ref(secret_ref: &str) -> Result<()> {
    if secret_ref.is_empty()
        || !secret_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CoreError::Validation {
            field: "secretRef".into(),
            message: "only letters, digits, '_' and '-' are allowed".into(),
        });
    }
    Ok(())
}

impl SecretStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: PathBuf, cache_ttl: Duration, cache_capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        info!("Secret store at {:?}", dir);
        Ok(Self {
            dir,
            cache_ttl,
            cache_capacity,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn path_for(&self, secret_ref: &str) -> PathBuf {
        self.dir.join(format!("{secret_ref}.json"))
    }

    /// Read a bundle, serving from cache when fresh.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SecretNotFound`] when no entry exists for the
    /// ref, or an IO/JSON error if the file cannot be read.
    pub async fn get(&self, secret_ref: &str) -> Result<TokenBundle> {
        validate_secret_ref(secret_ref)?;

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(secret_ref) {
                if entry.fetched_at.elapsed() < self.cache_ttl {
                    debug!("Secret cache hit for {}", secret_ref);
                    return Ok(entry.bundle.clone());
                }
            }
        }

        let path = self.path_for(secret_ref);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::SecretNotFound {
                    secret_ref: secret_ref.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let bundle: TokenBundle = serde_json::from_str(&raw)?;

        self.insert_cached(secret_ref, bundle.clone()).await;
        Ok(bundle)
    }

    /// Write a bundle back and refresh the cache entry.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails.
    pub async fn put(&self, secret_ref: &str, bundle: &TokenBundle) -> Result<()> {
        validate_secret_ref(secret_ref)?;

        let raw = serde_json::to_string_pretty(bundle)?;
        tokio::fs::write(self.path_for(secret_ref), raw).await?;
        self.insert_cached(secret_ref, bundle.clone()).await;
        debug!("Secret updated for {}", secret_ref);
        Ok(())
    }

    /// Drop a ref's cache entry so the next read goes to disk.
    pub async fn invalidate(&self, secret_ref: &str) {
        self.cache.write().await.remove(secret_ref);
    }

    async fn insert_cached(&self, secret_ref: &str, bundle: TokenBundle) {
        let mut cache = self.cache.write().await;
        if cache.len() >= self.cache_capacity && !cache.contains_key(secret_ref) {
            // Evict the least recently fetched entry.
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.fetched_at)
                .map(|(key, _)| key.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            secret_ref.to_owned(),
            CachedBundle {
                bundle,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn store(ttl_secs: u64, capacity: usize) -> (tempfile::TempDir, SecretStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::new(
            dir.path().to_path_buf(),
            Duration::from_secs(ttl_secs),
            capacity,
        )
        .unwrap();
        (dir, store)
    }

    fn bundle(access: &str) -> TokenBundle {
        TokenBundle {
            access_token: access.into(),
            refresh_token: "refresh".into(),
            expires_at: Some("2026-01-17T20:00:00Z".into()),
            scope: Some("user-modify-playback-state".into()),
            token_type: Some("Bearer".into()),
            last_refreshed: None,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, store) = store(300, 16);
        store.put("spotify-tokens-u1", &bundle("tok")).await.unwrap();

        let loaded = store.get("spotify-tokens-u1").await.unwrap();
        assert_eq!(loaded.access_token, "tok");
        assert!(loaded.expires_at_utc().is_some());
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let (_dir, store) = store(300, 16);
        assert!(matches!(
            store.get("absent").await,
            Err(CoreError::SecretNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal_refs() {
        let (_dir, store) = store(300, 16);
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put("a/b", &bundle("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_serves_stale_file_until_invalidated() {
        let (dir, store) = store(300, 16);
        store.put("u1", &bundle("one")).await.unwrap();

        // Overwrite the file behind the store's back.
        let raw = serde_json::to_string(&bundle("two")).unwrap();
        std::fs::write(dir.path().join("u1.json"), raw).unwrap();

        // Cached value still served.
        assert_eq!(store.get("u1").await.unwrap().access_token, "one");

        store.invalidate("u1").await;
        assert_eq!(store.get("u1").await.unwrap().access_token, "two");
    }

    #[tokio::test]
    async fn test_lru_eviction_bounds_cache() {
        let (dir, store) = store(300, 2);
        store.put("a", &bundle("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.put("b", &bundle("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.put("c", &bundle("c")).await.unwrap();

        // "a" was evicted; a direct file edit is now visible for it but not
        // for the still-cached "c".
        std::fs::write(
            dir.path().join("a.json"),
            serde_json::to_string(&bundle("a2")).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("c.json"),
            serde_json::to_string(&bundle("c2")).unwrap(),
        )
        .unwrap();

        assert_eq!(store.get("a").await.unwrap().access_token, "a2");
        assert_eq!(store.get("c").await.unwrap().access_token, "c");
    }

    #[tokio::test]
    async fn test_unknown_fields_preserved() {
        let (dir, store) = store(300, 16);
        std::fs::write(
            dir.path().join("u1.json"),
            r#"{"accessToken":"t","refreshToken":"r","customField":42}"#,
        )
        .unwrap();

        let loaded = store.get("u1").await.unwrap();
        assert_eq!(loaded.extra.get("customField").unwrap(), 42);

        store.put("u1", &loaded).await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("u1.json")).unwrap();
        assert!(raw.contains("customField"));
    }
}
