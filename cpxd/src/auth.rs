//! Access-token refresh coordination.
//!
//! One token serves every outbound RPC. The refresher keeps it fresh in
//! the background so callers never block on the happy path: a token is
//! served only while it has at least [`EXPIRY_MARGIN`] of validity left,
//! refreshes are single-flight with a hard wall-clock deadline, and a
//! failed refresh opens a cooldown window during which callers proceed
//! unauthenticated and surface the auth error at the RPC layer instead of
//! hammering the token endpoint.

use crate::cancel::{CancelSource, CancelToken};
use async_trait::async_trait;
use cpx_common::config::AuthSource;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A served token must outlive the service moment by this margin.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// After a failed refresh, no new refresh starts for this long.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(60);

/// Wall-clock budget for one refresh, retries included.
pub const REFRESH_DEADLINE: Duration = Duration::from_secs(10);

/// The delayed background refresh fires this long before `not_after`
/// would stop the token being served.
const SCHEDULE_MARGIN: Duration = Duration::from_secs(120);

/// Minimum backoff between HTTP attempts inside one refresh.
const MIN_ATTEMPT_BACKOFF: Duration = Duration::from_millis(200);

/// Token material produced by a credential source.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub token_type: String,
    pub access_token: String,
    pub expires_in: Duration,
}

/// One of the four credential backends.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn fetch(&self, client: &reqwest::Client) -> Result<TokenResponse, String>;
}

#[derive(Debug, Clone)]
struct AccessToken {
    token_type: String,
    value: String,
    not_after: Instant,
}

#[derive(Default)]
struct RefreshState {
    token: Option<AccessToken>,
    last_failure: Option<Instant>,
    /// Cancels the scheduled background refresh.
    scheduled: Option<CancelSource>,
    /// Memoised identity for the current token value.
    account: Option<(String, String)>,
}

/// Process-wide credential coordinator.
pub struct TokenRefresher {
    source: Option<Arc<dyn TokenSource>>,
    client: reqwest::Client,
    state: Mutex<RefreshState>,
    /// Serialises refreshes; waiters queue on this lock.
    refresh_gate: tokio::sync::Mutex<()>,
    /// Bumped on shutdown so scheduled refreshes become no-ops.
    generation: AtomicU64,
    shutdown: CancelSource,
    shutdown_token: CancelToken,
    tokeninfo_url: String,
}

impl TokenRefresher {
    pub fn new(config: &AuthSource, scope: &str) -> Arc<Self> {
        let source = build_source(config, scope);
        let (shutdown, shutdown_token) = CancelSource::new();
        Arc::new(Self {
            source,
            client: reqwest::Client::new(),
            state: Mutex::new(RefreshState::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            shutdown,
            shutdown_token,
            tokeninfo_url: "https://oauth2.googleapis.com/tokeninfo".to_string(),
        })
    }

    /// Build around an injected source (tests).
    pub fn with_source(source: Arc<dyn TokenSource>) -> Arc<Self> {
        let (shutdown, shutdown_token) = CancelSource::new();
        Arc::new(Self {
            source: Some(source),
            client: reqwest::Client::new(),
            state: Mutex::new(RefreshState::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            shutdown,
            shutdown_token,
            tokeninfo_url: "https://oauth2.googleapis.com/tokeninfo".to_string(),
        })
    }

    /// Whether any credential source is configured at all.
    pub fn enabled(&self) -> bool {
        self.source.is_some()
    }

    /// `"<token_type> <token>"` while the token has [`EXPIRY_MARGIN`] of
    /// life left; `None` otherwise. `not_after` already carries the margin
    /// (it is set to `now + expires_in − EXPIRY_MARGIN` at install), so a
    /// token served here is valid for at least the margin past now.
    pub fn get_authorization(&self) -> Option<String> {
        let state = self.state.lock().expect("auth state lock");
        let token = state.token.as_ref()?;
        if Instant::now() < token.not_after {
            Some(format!("{} {}", token.token_type, token.value))
        } else {
            None
        }
    }

    /// True iff the token is missing or near expiry and the failure
    /// cooldown has elapsed.
    pub fn should_refresh(&self) -> bool {
        if self.source.is_none() || self.shutdown_token.is_cancelled() {
            return false;
        }
        let state = self.state.lock().expect("auth state lock");
        let now = Instant::now();
        if let Some(failed_at) = state.last_failure {
            if now.duration_since(failed_at) < FAILURE_COOLDOWN {
                return false;
            }
        }
        match &state.token {
            None => true,
            Some(token) => token.not_after.saturating_duration_since(now) < EXPIRY_MARGIN,
        }
    }

    /// Queue behind an in-flight refresh, or start one if needed.
    /// Resolves once a refresh attempt has settled (either way) or no
    /// refresh was needed.
    pub async fn run_after_refresh(self: &Arc<Self>) {
        if !self.should_refresh() {
            return;
        }
        // Single-flight: the gate holder refreshes; queued callers re-check
        // and find the fresh token (or the cooldown) once they get the lock.
        let _gate = self.refresh_gate.lock().await;
        if !self.should_refresh() {
            return;
        }
        self.refresh_once().await;
    }

    /// Cancel pending and in-flight refresh work. Idempotent.
    pub fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
        let mut state = self.state.lock().expect("auth state lock");
        if let Some(scheduled) = state.scheduled.take() {
            scheduled.cancel();
        }
    }

    /// One refresh attempt loop under the deadline. Caller holds the gate.
    async fn refresh_once(self: &Arc<Self>) {
        let Some(source) = self.source.clone() else {
            return;
        };

        let deadline = Instant::now() + REFRESH_DEADLINE;
        let mut backoff = MIN_ATTEMPT_BACKOFF;
        let mut last_err = String::new();

        loop {
            if self.shutdown_token.is_cancelled() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let attempt = tokio::time::timeout(remaining, source.fetch(&self.client));
            let outcome = tokio::select! {
                _ = self.shutdown_token.cancelled() => return,
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(Ok(resp)) => {
                    self.install_token(resp);
                    return;
                }
                Ok(Err(e)) => {
                    last_err = e;
                    debug!(source = source.kind(), error = %last_err, "token fetch attempt failed");
                }
                Err(_) => {
                    last_err = "attempt timed out".to_string();
                    break;
                }
            }

            tokio::time::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())))
                .await;
            backoff = backoff.saturating_mul(2);
        }

        warn!(
            source = source.kind(),
            error = %last_err,
            cooldown_secs = FAILURE_COOLDOWN.as_secs(),
            "token refresh failed; entering cooldown"
        );
        let mut state = self.state.lock().expect("auth state lock");
        state.last_failure = Some(Instant::now());
    }

    fn install_token(self: &Arc<Self>, resp: TokenResponse) {
        let now = Instant::now();
        let not_after = now + resp.expires_in.saturating_sub(EXPIRY_MARGIN);
        let refresh_in = resp.expires_in.saturating_sub(SCHEDULE_MARGIN);

        info!(
            token_type = %resp.token_type,
            expires_in_secs = resp.expires_in.as_secs(),
            "access token refreshed"
        );

        let (scheduled_src, scheduled_token) = CancelSource::new();
        {
            let mut state = self.state.lock().expect("auth state lock");
            state.token = Some(AccessToken {
                token_type: resp.token_type,
                value: resp.access_token,
                not_after,
            });
            state.last_failure = None;
            state.account = None;
            if let Some(old) = state.scheduled.replace(scheduled_src) {
                old.cancel();
            }
        }

        // Background refresh lands with a margin before the old token
        // becomes unservable.
        let this = Arc::clone(self);
        let generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::select! {
                _ = scheduled_token.cancelled() => {}
                _ = tokio::time::sleep(refresh_in) => {
                    if this.generation.load(Ordering::SeqCst) == generation {
                        this.run_after_refresh().await;
                    }
                }
            }
        });
    }

    /// Email associated with the current token, via the token-info
    /// endpoint. Memoised for the token's lifetime.
    pub async fn get_account(&self) -> Option<String> {
        let token_value = {
            let state = self.state.lock().expect("auth state lock");
            let token = state.token.as_ref()?;
            if let Some((for_token, account)) = &state.account {
                if *for_token == token.value {
                    return Some(account.clone());
                }
            }
            token.value.clone()
        };

        #[derive(Deserialize)]
        struct TokenInfo {
            email: Option<String>,
        }

        let resp = self
            .client
            .get(&self.tokeninfo_url)
            .query(&[("access_token", token_value.as_str())])
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .ok()?;
        let info: TokenInfo = resp.json().await.ok()?;
        let email = info.email?;

        let mut state = self.state.lock().expect("auth state lock");
        state.account = Some((token_value, email.clone()));
        Some(email)
    }

    /// Snapshot for the status page, token value redacted.
    pub fn status(&self) -> serde_json::Value {
        let state = self.state.lock().expect("auth state lock");
        serde_json::json!({
            "source": self.source.as_ref().map(|s| s.kind()).unwrap_or("none"),
            "has_token": state.token.is_some(),
            "valid_for_secs": state.token.as_ref().map(|t| {
                t.not_after.saturating_duration_since(Instant::now()).as_secs()
            }),
            "in_cooldown": state.last_failure.map(|at| {
                Instant::now().duration_since(at) < FAILURE_COOLDOWN
            }).unwrap_or(false),
            "account": state.account.as_ref().map(|(_, a)| a.clone()),
        })
    }
}

fn build_source(config: &AuthSource, scope: &str) -> Option<Arc<dyn TokenSource>> {
    match config {
        AuthSource::None => None,
        AuthSource::GceMetadata { service_account } => Some(Arc::new(GceMetadataSource {
            service_account: service_account.clone(),
        })),
        AuthSource::ServiceAccountJson { key_path } => Some(Arc::new(ServiceAccountJsonSource {
            key_path: key_path.clone(),
            scope: scope.to_string(),
        })),
        AuthSource::RefreshToken {
            client_id,
            client_secret,
            refresh_token,
            token_uri,
        } => Some(Arc::new(RefreshTokenSource {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            refresh_token: refresh_token.clone(),
            token_uri: token_uri.clone(),
        })),
        AuthSource::LocalAuthBroker {
            port,
            secret,
            account_id,
        } => Some(Arc::new(LocalAuthBrokerSource {
            port: *port,
            secret: secret.clone(),
            account_id: account_id.clone(),
            scopes: vec![scope.to_string()],
        })),
    }
}

// ── Credential sources ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct OAuthTokenBody {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn default_expires_in() -> u64 {
    3600
}

impl From<OAuthTokenBody> for TokenResponse {
    fn from(body: OAuthTokenBody) -> Self {
        Self {
            token_type: body.token_type,
            access_token: body.access_token,
            expires_in: Duration::from_secs(body.expires_in),
        }
    }
}

/// GCE metadata server token for an attached service account.
struct GceMetadataSource {
    service_account: String,
}

#[async_trait]
impl TokenSource for GceMetadataSource {
    fn kind(&self) -> &'static str {
        "gce_metadata"
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<TokenResponse, String> {
        let url = format!(
            "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/{}/token",
            self.service_account
        );
        let resp = client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| format!("metadata request: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("metadata server returned {}", resp.status()));
        }
        let body: OAuthTokenBody = resp.json().await.map_err(|e| format!("parse token: {e}"))?;
        Ok(body.into())
    }
}

/// Service-account JSON key exchanged via a signed JWT grant.
struct ServiceAccountJsonSource {
    key_path: std::path::PathBuf,
    scope: String,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(serde::Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[async_trait]
impl TokenSource for ServiceAccountJsonSource {
    fn kind(&self) -> &'static str {
        "service_account_json"
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<TokenResponse, String> {
        let raw = tokio::fs::read_to_string(&self.key_path)
            .await
            .map_err(|e| format!("read key {}: {e}", self.key_path.display()))?;
        let key: ServiceAccountKey =
            serde_json::from_str(&raw).map_err(|e| format!("parse key json: {e}"))?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map_err(|e| e.to_string())?
            .as_secs();
        let claims = JwtClaims {
            iss: key.client_email.clone(),
            scope: self.scope.clone(),
            aud: key.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
                .map_err(|e| format!("private key: {e}"))?,
        )
        .map_err(|e| format!("sign jwt: {e}"))?;

        let resp = client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| format!("token request: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("token endpoint returned {}", resp.status()));
        }
        let body: OAuthTokenBody = resp.json().await.map_err(|e| format!("parse token: {e}"))?;
        Ok(body.into())
    }
}

/// Stored OAuth2 refresh token.
struct RefreshTokenSource {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_uri: String,
}

#[async_trait]
impl TokenSource for RefreshTokenSource {
    fn kind(&self) -> &'static str {
        "refresh_token"
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<TokenResponse, String> {
        let resp = client
            .post(&self.token_uri)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| format!("token request: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("token endpoint returned {}", resp.status()));
        }
        let body: OAuthTokenBody = resp.json().await.map_err(|e| format!("parse token: {e}"))?;
        Ok(body.into())
    }
}

/// Local auth broker speaking the LUCI local-auth RPC.
struct LocalAuthBrokerSource {
    port: u16,
    secret: String,
    account_id: String,
    scopes: Vec<String>,
}

#[derive(Deserialize)]
struct BrokerTokenBody {
    access_token: String,
    /// Absolute unix expiry, per the broker protocol.
    expiry: u64,
}

#[async_trait]
impl TokenSource for LocalAuthBrokerSource {
    fn kind(&self) -> &'static str {
        "local_auth_broker"
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<TokenResponse, String> {
        let url = format!(
            "http://127.0.0.1:{}/rpc/LuciLocalAuthService.GetOAuthToken",
            self.port
        );
        let resp = client
            .post(&url)
            .json(&serde_json::json!({
                "scopes": self.scopes,
                "secret": self.secret,
                "account_id": self.account_id,
            }))
            .send()
            .await
            .map_err(|e| format!("broker request: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("broker returned {}", resp.status()));
        }
        let body: BrokerTokenBody = resp.json().await.map_err(|e| format!("parse token: {e}"))?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map_err(|e| e.to_string())?
            .as_secs();
        Ok(TokenResponse {
            token_type: "Bearer".to_string(),
            access_token: body.access_token,
            expires_in: Duration::from_secs(body.expiry.saturating_sub(now)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Scripted source: a queue of results, each taking `latency`.
    struct MockSource {
        results: Mutex<Vec<Result<TokenResponse, String>>>,
        latency: Duration,
        fetches: AtomicU32,
    }

    impl MockSource {
        fn new(results: Vec<Result<TokenResponse, String>>) -> Self {
            Self {
                results: Mutex::new(results),
                latency: Duration::ZERO,
                fetches: AtomicU32::new(0),
            }
        }

        fn ok(expires_in: Duration) -> Result<TokenResponse, String> {
            Ok(TokenResponse {
                token_type: "Bearer".to_string(),
                access_token: "tok".to_string(),
                expires_in,
            })
        }

        fn fetch_count(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for MockSource {
        fn kind(&self) -> &'static str {
            "mock"
        }

        async fn fetch(&self, _client: &reqwest::Client) -> Result<TokenResponse, String> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Err("no more scripted results".to_string())
            } else {
                results.remove(0)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorization_served_with_margin() {
        let source = Arc::new(MockSource::new(vec![MockSource::ok(Duration::from_secs(
            3600,
        ))]));
        let refresher = TokenRefresher::with_source(source);

        assert!(refresher.get_authorization().is_none());
        assert!(refresher.should_refresh());

        refresher.run_after_refresh().await;
        let auth = refresher.get_authorization().expect("token installed");
        assert_eq!(auth, "Bearer tok");
        assert!(!refresher.should_refresh());
        refresher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_not_served_past_margin() {
        // expires_in 70s → not_after = now + 10s; served now, not after 15s.
        let source = Arc::new(MockSource::new(vec![MockSource::ok(Duration::from_secs(
            70,
        ))]));
        let refresher = TokenRefresher::with_source(source);
        refresher.run_after_refresh().await;
        assert!(refresher.get_authorization().is_some());

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(refresher.get_authorization().is_none());
        refresher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_refresh() {
        let source = Arc::new(MockSource {
            results: Mutex::new(vec![MockSource::ok(Duration::from_secs(3600))]),
            latency: Duration::from_millis(100),
            fetches: AtomicU32::new(0),
        });
        let refresher = TokenRefresher::with_source(source.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = Arc::clone(&refresher);
            handles.push(tokio::spawn(async move { r.run_after_refresh().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(source.fetch_count(), 1, "one refresh serves all callers");
        refresher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_opens_cooldown() {
        let source = Arc::new(MockSource::new(vec![
            Err("boom".to_string()),
            Err("boom".to_string()),
            Err("boom".to_string()),
            Err("boom".to_string()),
            Err("boom".to_string()),
            Err("boom".to_string()),
            Err("boom".to_string()),
            Err("boom".to_string()),
        ]));
        let refresher = TokenRefresher::with_source(source.clone());

        refresher.run_after_refresh().await;
        assert!(refresher.get_authorization().is_none());
        // Cooldown open: no refresh wanted, and another call fetches nothing.
        assert!(!refresher.should_refresh());
        let fetches = source.fetch_count();
        refresher.run_after_refresh().await;
        assert_eq!(source.fetch_count(), fetches);

        // Cooldown over: refresh wanted again.
        tokio::time::advance(FAILURE_COOLDOWN + Duration::from_secs(1)).await;
        assert!(refresher.should_refresh());
        refresher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_fires_before_expiry() {
        let source = Arc::new(MockSource::new(vec![
            MockSource::ok(Duration::from_secs(3600)),
            MockSource::ok(Duration::from_secs(3600)),
        ]));
        let refresher = TokenRefresher::with_source(source.clone());
        refresher.run_after_refresh().await;
        assert_eq!(source.fetch_count(), 1);

        // The delayed refresh is scheduled at expires_in − 120 s.
        tokio::time::advance(Duration::from_secs(3600 - 120 + 1)).await;
        // Let the spawned task run to completion.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(source.fetch_count(), 2, "background refresh fired");
        assert!(refresher.get_authorization().is_some());
        refresher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_scheduled_refresh() {
        let source = Arc::new(MockSource::new(vec![
            MockSource::ok(Duration::from_secs(3600)),
            MockSource::ok(Duration::from_secs(3600)),
        ]));
        let refresher = TokenRefresher::with_source(source.clone());
        refresher.run_after_refresh().await;
        refresher.shutdown();

        tokio::time::advance(Duration::from_secs(4000)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(source.fetch_count(), 1, "no refresh after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let refresher =
            TokenRefresher::with_source(Arc::new(MockSource::new(vec![])));
        refresher.shutdown();
        refresher.shutdown();
        assert!(!refresher.should_refresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_deadline_caps_attempts() {
        // Every attempt takes 4s and fails; the 10s deadline allows at
        // most a few attempts, then the cooldown opens.
        let source = Arc::new(MockSource {
            results: Mutex::new(vec![
                Err("slow fail".to_string()),
                Err("slow fail".to_string()),
                Err("slow fail".to_string()),
                Err("slow fail".to_string()),
            ]),
            latency: Duration::from_secs(4),
            fetches: AtomicU32::new(0),
        });
        let refresher = TokenRefresher::with_source(source.clone());
        let started = Instant::now();
        refresher.run_after_refresh().await;
        let elapsed = Instant::now().duration_since(started);
        assert!(
            elapsed <= REFRESH_DEADLINE + Duration::from_secs(5),
            "refresh must respect its deadline, took {elapsed:?}"
        );
        assert!(!refresher.should_refresh(), "cooldown stamped");
        refresher.shutdown();
    }
}
