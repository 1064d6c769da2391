//! Server configuration, loaded from environment variables at startup.

/// Runtime configuration for forgepool-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8088"`).
    pub bind_address: String,

    /// Path to the persisted backend registry file.
    pub registry_file: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Default `maxUsages` applied to a backend before its driver reports
    /// its own capability during `init()`.
    pub default_max_usages: u32,

    /// Bounded retry count for backend initialization (spec §4.3).
    pub max_backend_init_attempts: u32,

    /// Registry-wide stagnation deadline in minutes (spec §5).
    pub max_timeout_minutes: u64,

    /// Per-request deadline in minutes (spec §5).
    pub per_request_timeout_minutes: u64,

    /// Fail every open request on registry-wide stagnation rather than only
    /// those whose own deadline passed (Design Notes Open Question #2).
    pub fail_all_on_stagnation: bool,

    /// Optional bearer token required for admin endpoints. When `None`,
    /// admin endpoints are unauthenticated.
    pub admin_api_token: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("FORGEPOOL_BIND", "0.0.0.0:8088"),
            registry_file: env_or("FORGEPOOL_REGISTRY_FILE", "forgepool-backends.toml"),
            log_level: env_or("FORGEPOOL_LOG", "info"),
            log_json: std::env::var("FORGEPOOL_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            default_max_usages: parse_env("FORGEPOOL_DEFAULT_MAX_USAGES", 1),
            max_backend_init_attempts: parse_env("FORGEPOOL_MAX_INIT_ATTEMPTS", 5),
            max_timeout_minutes: parse_env("FORGEPOOL_MAX_TIMEOUT_MINUTES", 10),
            per_request_timeout_minutes: parse_env("FORGEPOOL_PER_REQUEST_TIMEOUT_MINUTES", 5),
            fail_all_on_stagnation: std::env::var("FORGEPOOL_FAIL_ALL_ON_STAGNATION")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            admin_api_token: std::env::var("FORGEPOOL_ADMIN_TOKEN").ok(),
        }
    }

    pub fn registry_config(&self) -> forgepool_core::RegistryConfig {
        forgepool_core::RegistryConfig {
            max_backend_init_attempts: self.max_backend_init_attempts,
            max_timeout_minutes: self.max_timeout_minutes,
            per_request_timeout_minutes: self.per_request_timeout_minutes,
            fail_all_on_stagnation: self.fail_all_on_stagnation,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
