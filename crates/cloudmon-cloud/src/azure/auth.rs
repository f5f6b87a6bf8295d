use crate::error::{CloudError, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use chrono::{DateTime, Duration, Utc};
use cloudmon_common::Provider;
use serde_json::Value;
use std::future::Future;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Bearer token cache. The lock is held across the refresh so concurrent
/// callers that miss together share one token request.
pub struct TokenCache {
    refresh_buffer: Duration,
    slot: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(refresh_buffer_secs: i64) -> Self {
        Self {
            refresh_buffer: Duration::seconds(refresh_buffer_secs.max(0)),
            slot: Mutex::new(None),
        }
    }

    /// Return the cached token while more than the refresh buffer remains
    /// before expiry, otherwise run `fetch` and cache its result.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.expires_at - Utc::now() > self.refresh_buffer {
                return Ok(cached.token.clone());
            }
        }

        let fresh = fetch().await?;
        let token = fresh.token.clone();
        *slot = Some(fresh);
        Ok(token)
    }
}

/// OAuth2 client-credentials grant against the tenant's v2 token endpoint.
pub async fn request_token(
    http: &RetryingHttpClient,
    authority_host: &str,
    tenant_id: &str,
    client_id: &str,
    client_secret: &str,
    scope: &str,
) -> Result<AccessToken> {
    let url = format!(
        "{}/{}/oauth2/v2.0/token",
        authority_host.trim_end_matches('/'),
        tenant_id
    );
    let request = HttpRequest::post(url).form(vec![
        ("grant_type".to_string(), "client_credentials".to_string()),
        ("client_id".to_string(), client_id.to_string()),
        ("client_secret".to_string(), client_secret.to_string()),
        ("scope".to_string(), scope.to_string()),
    ]);

    let body = http.request(&request).await.map_err(|e| CloudError::Auth {
        provider: Provider::Azure,
        message: e.to_string(),
    })?;

    let token = body
        .get("access_token")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CloudError::Auth {
            provider: Provider::Azure,
            message: "token response carries no access_token".to_string(),
        })?;
    // Some endpoints send expires_in as a string.
    let expires_in = match body.get("expires_in") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .unwrap_or(3600);

    Ok(AccessToken {
        token: token.to_string(),
        expires_at: Utc::now() + Duration::seconds(expires_in),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn should_reuse_token_until_refresh_buffer() {
        let cache = TokenCache::new(120);
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            let token = cache
                .get_or_refresh(|| async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(AccessToken {
                        token: "t1".into(),
                        expires_at: Utc::now() + Duration::minutes(60),
                    })
                })
                .await
                .unwrap();
            assert_eq!(token, "t1");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_refresh_token_inside_buffer() {
        let cache = TokenCache::new(120);
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_refresh(|| async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(AccessToken {
                        token: "short".into(),
                        expires_at: Utc::now() + Duration::seconds(60),
                    })
                })
                .await
                .unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_collapse_concurrent_misses_into_one_fetch() {
        let cache = Arc::new(TokenCache::new(0));
        let fetches = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let cache = cache.clone();
                let fetches = fetches.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_refresh(|| async {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok(AccessToken {
                                token: "shared".into(),
                                expires_at: Utc::now() + Duration::minutes(10),
                            })
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }
}
