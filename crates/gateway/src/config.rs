use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use soilrepo_auth::OidcConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub api_prefix: String,
    pub api_key: Option<String>,
    pub sqlite_path: PathBuf,
    pub sample_table: Option<String>,
    pub schema_cache_ttl: Duration,
    pub lab_db_path: PathBuf,
    pub canonical_db_url: Option<String>,
    pub pg_query_timeout: Duration,
    pub oidc: Option<OidcConfig>,
    pub session_cookie: String,
    pub session_ttl: Duration,
    pub max_upload_bytes: usize,
    pub metrics_require_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("SOILREPO_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("SOILREPO_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "SOILREPO_BIND_ADDR",
        )?;

        let api_prefix = parse_prefix(kv.get("SOILREPO_API_PREFIX"))?;
        let api_key = optional(kv, "SOILREPO_API_KEY");
        let oidc = match optional(kv, "SOILREPO_OIDC_ISSUER") {
            Some(issuer) => Some(parse_oidc_config(kv, issuer)?),
            None => None,
        };

        if !bind_addr.ip().is_loopback() && api_key.is_none() && oidc.is_none() {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                message: "non-local bind requires SOILREPO_API_KEY or SOILREPO_OIDC_ISSUER; refuse startup"
                    .to_string(),
            });
        }

        let sqlite_path = PathBuf::from(require_nonempty(kv, "SOILREPO_SQLITE_PATH")?);
        let sample_table = optional(kv, "SOILREPO_SAMPLE_TABLE");
        let schema_cache_ttl_secs = parse_u64(
            kv.get("SOILREPO_SCHEMA_CACHE_TTL_SECS"),
            60,
            "SOILREPO_SCHEMA_CACHE_TTL_SECS",
        )?;
        let lab_db_path = optional(kv, "SOILREPO_LAB_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| sqlite_path.clone());

        let canonical_db_url = optional(kv, "SOILREPO_CANONICAL_DB_URL");
        let pg_query_timeout_ms = parse_u64(
            kv.get("SOILREPO_PG_QUERY_TIMEOUT_MS"),
            5000,
            "SOILREPO_PG_QUERY_TIMEOUT_MS",
        )?;
        if pg_query_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SOILREPO_PG_QUERY_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let session_cookie = optional(kv, "SOILREPO_SESSION_COOKIE")
            .unwrap_or_else(|| "soilrepo_session".to_string());
        if !session_cookie
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SOILREPO_SESSION_COOKIE must be a plain cookie name".to_string(),
            });
        }
        let session_ttl_secs = parse_u64(
            kv.get("SOILREPO_SESSION_TTL_SECS"),
            24 * 60 * 60,
            "SOILREPO_SESSION_TTL_SECS",
        )?;

        let max_upload_bytes = parse_usize(
            kv.get("SOILREPO_MAX_UPLOAD_BYTES"),
            20 * 1024 * 1024,
            "SOILREPO_MAX_UPLOAD_BYTES",
        )?;
        if max_upload_bytes == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SOILREPO_MAX_UPLOAD_BYTES must be >= 1".to_string(),
            });
        }

        let metrics_require_auth = match kv.get("SOILREPO_METRICS_REQUIRE_AUTH") {
            None => false,
            Some(v) if v.trim().is_empty() => false,
            Some(v) => parse_bool(Some(v)).ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SOILREPO_METRICS_REQUIRE_AUTH must be true or false".to_string(),
            })?,
        };

        Ok(Self {
            bind_addr,
            api_prefix,
            api_key,
            sqlite_path,
            sample_table,
            schema_cache_ttl: Duration::from_secs(schema_cache_ttl_secs),
            lab_db_path,
            canonical_db_url,
            pg_query_timeout: Duration::from_millis(pg_query_timeout_ms),
            oidc,
            session_cookie,
            session_ttl: Duration::from_secs(session_ttl_secs),
            max_upload_bytes,
            metrics_require_auth,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn optional(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

/// `/api/v1`, `api/v1/` and ` /api/v1 ` all become `/api/v1`; empty means no prefix.
fn parse_prefix(value: Option<&String>) -> Result<String, StartupError> {
    let Some(raw) = value else {
        return Ok("/api/v1".to_string());
    };
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if trimmed
        .split('/')
        .any(|segment| segment.is_empty() || segment.contains(['{', '}', '*', '?', '#']))
    {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "SOILREPO_API_PREFIX must be a plain path such as /api/v1".to_string(),
        });
    }
    Ok(format!("/{trimmed}"))
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_oidc_config(
    kv: &HashMap<String, String>,
    issuer: String,
) -> Result<OidcConfig, StartupError> {
    let audience = optional(kv, "SOILREPO_OIDC_AUDIENCE");
    let client_id = optional(kv, "SOILREPO_OIDC_CLIENT_ID");
    if audience.is_none() && client_id.is_none() {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc requires SOILREPO_OIDC_AUDIENCE or SOILREPO_OIDC_CLIENT_ID".to_string(),
        });
    }

    let jwks_timeout_ms = parse_u64(
        kv.get("SOILREPO_OIDC_JWKS_TIMEOUT_MS"),
        5000,
        "SOILREPO_OIDC_JWKS_TIMEOUT_MS",
    )?;
    let jwks_refresh_ttl_secs = parse_u64(
        kv.get("SOILREPO_OIDC_JWKS_REFRESH_TTL_SECS"),
        300,
        "SOILREPO_OIDC_JWKS_REFRESH_TTL_SECS",
    )?;
    let clock_skew_secs = parse_u64(
        kv.get("SOILREPO_OIDC_CLOCK_SKEW_SECS"),
        60,
        "SOILREPO_OIDC_CLOCK_SKEW_SECS",
    )?;

    Ok(OidcConfig {
        issuer,
        audience,
        client_id,
        jwks_url: optional(kv, "SOILREPO_OIDC_JWKS_URL"),
        jwks_json: optional(kv, "SOILREPO_OIDC_JWKS_JSON"),
        jwks_timeout: Duration::from_millis(jwks_timeout_ms),
        jwks_refresh_ttl: Duration::from_secs(jwks_refresh_ttl_secs),
        clock_skew: Duration::from_secs(clock_skew_secs),
    })
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
