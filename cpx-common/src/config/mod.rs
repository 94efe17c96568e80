//! Configuration for the compiler proxy.
//!
//! All knobs come from `GOMA_*` environment variables read once at startup.
//! Parsing problems accumulate and surface as one [`ConfigError`] so a bad
//! environment fails fast with the full list.

pub mod env;

pub use env::{EnvError, EnvParser};

use crate::errors::ConfigError;
use crate::types::FallbackPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Which credential source feeds the token refresher.
///
/// Exactly one (or none, for unauthenticated servers) may be configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSource {
    /// No authentication; requests go out without an Authorization header.
    None,
    /// GCE metadata server token for the named service account.
    GceMetadata { service_account: String },
    /// Service-account JSON key; refresh builds an RS256 JWT grant.
    ServiceAccountJson { key_path: PathBuf },
    /// Stored OAuth2 refresh token.
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_uri: String,
    },
    /// Local auth broker speaking the LUCI local-auth RPC.
    LocalAuthBroker {
        port: u16,
        secret: String,
        account_id: String,
    },
}

impl AuthSource {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthSource::None => "none",
            AuthSource::GceMetadata { .. } => "gce_metadata",
            AuthSource::ServiceAccountJson { .. } => "service_account_json",
            AuthSource::RefreshToken { .. } => "refresh_token",
            AuthSource::LocalAuthBroker { .. } => "local_auth_broker",
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local socket the wrapper connects to.
    pub socket_path: PathBuf,
    /// Base URL of the remote exec service.
    pub server_url: String,
    /// OAuth scope requested during token refresh.
    pub auth_scope: String,
    pub auth_source: AuthSource,
    pub fallback_policy: FallbackPolicy,
    /// Cap on concurrent blob upload RPCs across all tasks.
    pub max_concurrent_uploads: usize,
    /// Cap on concurrent output download RPCs per task.
    pub max_concurrent_downloads: usize,
    /// Time to first response byte before the healthz probe fires.
    pub http_initial_timeout: Duration,
    /// Allowed gap between response bytes.
    pub http_read_timeout: Duration,
    /// One-shot extension granted when healthz says the remote is alive.
    pub http_check_timeout: Duration,
    /// Retries per exec call on 5xx/transport errors.
    pub rpc_retry_budget: u32,
    /// Minimum backoff between rpc retries; doubles per attempt.
    pub rpc_retry_backoff: Duration,
    /// Root for persisted caches and per-task staging directories.
    pub cache_dir: PathBuf,
    /// Port for the status HTTP server; 0 disables it.
    pub status_port: u16,
    /// Where failed requests are dumped for debugging.
    pub request_dump_dir: Option<PathBuf>,
    /// How many failed-request dumps to retain.
    pub request_dump_keep: usize,
    /// Enables the persistent local-output cache.
    pub local_output_cache: bool,
}

impl ProxyConfig {
    /// Read configuration from `GOMA_*` variables, validating as we go.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut p = EnvParser::new();

        let socket_path = p.get_path("COMPILER_PROXY_SOCKET_NAME", "/tmp/cpxd.sock", false);
        let server_url = p.get_string("SERVER_URL", "https://build-exec.example.com");
        let auth_scope = p.get_string(
            "AUTH_SCOPE",
            "https://www.googleapis.com/auth/userinfo.email",
        );

        let fallback_policy = {
            let raw = p.get_string("FALLBACK_POLICY", "on_error");
            raw.parse::<FallbackPolicy>()
                .map_err(ConfigError::Invalid)?
        };

        let max_concurrent_uploads = p.get_u64_range("MAX_CONCURRENT_UPLOADS", 64, 1, 4096) as usize;
        let max_concurrent_downloads =
            p.get_u64_range("MAX_CONCURRENT_DOWNLOADS", 16, 1, 1024) as usize;

        let http_initial_timeout =
            Duration::from_secs(p.get_u64_range("HTTP_INITIAL_TIMEOUT_SECS", 20, 1, 3600));
        let http_read_timeout =
            Duration::from_secs(p.get_u64_range("HTTP_READ_TIMEOUT_SECS", 60, 1, 3600));
        let http_check_timeout =
            Duration::from_secs(p.get_u64_range("HTTP_CHECK_TIMEOUT_SECS", 30, 1, 3600));
        let rpc_retry_budget = p.get_u64_range("RPC_RETRY_BUDGET", 3, 0, 16) as u32;
        let rpc_retry_backoff =
            Duration::from_millis(p.get_u64_range("RPC_RETRY_BACKOFF_MS", 500, 10, 60_000));

        let cache_dir = p.get_path("CACHE_DIR", "~/.cache/cpx", false);
        let status_port = p.get_u64_range("STATUS_PORT", 19080, 0, 65535) as u16;

        let request_dump_dir = p.get_optional_path("REQUEST_DUMP_DIR");
        let request_dump_keep = p.get_u64_range("REQUEST_DUMP_KEEP", 16, 1, 1024) as usize;
        let local_output_cache = p.get_bool("LOCAL_OUTPUT_CACHE", false);

        let auth_source = Self::auth_source_from_env(&mut p)?;

        if p.has_errors() {
            let joined = p
                .take_errors()
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConfigError::Invalid(joined));
        }

        Ok(Self {
            socket_path,
            server_url,
            auth_scope,
            auth_source,
            fallback_policy,
            max_concurrent_uploads,
            max_concurrent_downloads,
            http_initial_timeout,
            http_read_timeout,
            http_check_timeout,
            rpc_retry_budget,
            rpc_retry_backoff,
            cache_dir,
            status_port,
            request_dump_dir,
            request_dump_keep,
            local_output_cache,
        })
    }

    /// Select the credential source; configuring more than one is a
    /// startup error rather than a silent priority pick.
    fn auth_source_from_env(p: &mut EnvParser) -> Result<AuthSource, ConfigError> {
        let gce = p.get_optional_string("GCE_SERVICE_ACCOUNT");
        let sa_json = p.get_optional_path("SERVICE_ACCOUNT_JSON_FILE");
        let oauth_enabled = p.get_bool("OAUTH2_ENABLED", false);
        let luci_enabled = p.get_bool("LOCAL_AUTH_ENABLED", false);

        let configured = [
            gce.is_some(),
            sa_json.is_some(),
            oauth_enabled,
            luci_enabled,
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if configured > 1 {
            return Err(ConfigError::ConflictingAuth(
                "more than one of GCE_SERVICE_ACCOUNT, SERVICE_ACCOUNT_JSON_FILE, \
                 OAUTH2_ENABLED, LOCAL_AUTH_ENABLED is set"
                    .to_string(),
            ));
        }

        if let Some(service_account) = gce {
            return Ok(AuthSource::GceMetadata { service_account });
        }
        if let Some(key_path) = sa_json {
            return Ok(AuthSource::ServiceAccountJson { key_path });
        }
        if oauth_enabled {
            let client_id = p.get_string("OAUTH2_CLIENT_ID", "");
            let client_secret = p.get_string("OAUTH2_CLIENT_SECRET", "");
            let refresh_token = p.get_string("OAUTH2_REFRESH_TOKEN", "");
            let token_uri = p.get_string("OAUTH2_TOKEN_URI", "https://oauth2.googleapis.com/token");
            if client_id.is_empty() || refresh_token.is_empty() {
                return Err(ConfigError::Invalid(
                    "OAUTH2_ENABLED requires OAUTH2_CLIENT_ID and OAUTH2_REFRESH_TOKEN".to_string(),
                ));
            }
            return Ok(AuthSource::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
                token_uri,
            });
        }
        if luci_enabled {
            let port = p.get_u64_range("LOCAL_AUTH_PORT", 0, 0, 65535) as u16;
            let secret = p.get_string("LOCAL_AUTH_SECRET", "");
            let account_id = p.get_string("LOCAL_AUTH_ACCOUNT_ID", "");
            if port == 0 || secret.is_empty() {
                return Err(ConfigError::Invalid(
                    "LOCAL_AUTH_ENABLED requires LOCAL_AUTH_PORT and LOCAL_AUTH_SECRET".to_string(),
                ));
            }
            return Ok(AuthSource::LocalAuthBroker {
                port,
                secret,
                account_id,
            });
        }

        Ok(AuthSource::None)
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::env;

    fn clear_auth_env() {
        for var in [
            "GOMA_GCE_SERVICE_ACCOUNT",
            "GOMA_SERVICE_ACCOUNT_JSON_FILE",
            "GOMA_OAUTH2_ENABLED",
            "GOMA_OAUTH2_CLIENT_ID",
            "GOMA_OAUTH2_CLIENT_SECRET",
            "GOMA_OAUTH2_REFRESH_TOKEN",
            "GOMA_LOCAL_AUTH_ENABLED",
            "GOMA_LOCAL_AUTH_PORT",
            "GOMA_LOCAL_AUTH_SECRET",
            "GOMA_FALLBACK_POLICY",
        ] {
            // SAFETY: tests are serialized via env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: tests are serialized via env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_default_config_has_no_auth() {
        let _guard = env_test_lock();
        clear_auth_env();

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.auth_source, AuthSource::None);
        assert_eq!(config.fallback_policy, FallbackPolicy::OnError);
        assert_eq!(config.max_concurrent_uploads, 64);
    }

    #[test]
    fn test_gce_auth_selected() {
        let _guard = env_test_lock();
        clear_auth_env();
        set_env("GOMA_GCE_SERVICE_ACCOUNT", "default");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(
            config.auth_source,
            AuthSource::GceMetadata {
                service_account: "default".to_string()
            }
        );
        clear_auth_env();
    }

    #[test]
    fn test_conflicting_auth_rejected() {
        let _guard = env_test_lock();
        clear_auth_env();
        set_env("GOMA_GCE_SERVICE_ACCOUNT", "default");
        set_env("GOMA_OAUTH2_ENABLED", "1");

        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingAuth(_)));
        clear_auth_env();
    }

    #[test]
    fn test_oauth_requires_client_id_and_token() {
        let _guard = env_test_lock();
        clear_auth_env();
        set_env("GOMA_OAUTH2_ENABLED", "1");

        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        clear_auth_env();
    }

    #[test]
    fn test_fallback_policy_from_env() {
        let _guard = env_test_lock();
        clear_auth_env();
        set_env("GOMA_FALLBACK_POLICY", "fast");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.fallback_policy, FallbackPolicy::Fast);
        clear_auth_env();
    }
}
