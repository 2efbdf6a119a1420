//! Configuration types and loading
//!
//! Precedence: environment variables > TOML file > defaults. The TOML file is
//! optional; a deployment can run from environment variables alone.
//! Secrets (client secret, inbound bearer secret) are read from env vars or
//! from `*_file` paths, never from the TOML body itself.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "token-proxy.toml";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TOKEN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Root configuration
#[derive(Debug)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub proxy: ProxyConfig,
    /// Listener for /health and /metrics; disabled when absent
    pub admin_addr: Option<SocketAddr>,
}

/// Client-credentials grant settings
#[derive(Debug)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub token_url: String,
    pub timeout_secs: u64,
}

/// Inbound listener and target API settings
#[derive(Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub target_api_base_url: String,
    /// Shared secret callers must present; `None` disables the check
    pub incoming_bearer_token: Option<Secret<String>>,
    pub timeout_secs: u64,
    pub max_connections: usize,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    oauth: FileOAuth,
    #[serde(default)]
    proxy: FileProxy,
    #[serde(default)]
    admin: FileAdmin,
}

#[derive(Debug, Default, Deserialize)]
struct FileOAuth {
    client_id: Option<String>,
    token_url: Option<String>,
    client_secret_file: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileProxy {
    listen_addr: Option<SocketAddr>,
    target_api_base_url: Option<String>,
    incoming_bearer_token_file: Option<PathBuf>,
    timeout_secs: Option<u64>,
    max_connections: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FileAdmin {
    listen_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from an optional TOML file, then overlay environment variables.
    pub fn load(path: Option<&Path>) -> common::Result<Self> {
        let file = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                toml::from_str(&contents)?
            }
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Resolve config file path from CLI arg, CONFIG_PATH env var, or the
    /// default file name if that file exists in the working directory.
    pub fn resolve_path(cli_path: Option<&str>) -> Option<PathBuf> {
        if let Some(p) = cli_path {
            return Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return Some(PathBuf::from(p));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        default.exists().then_some(default)
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> common::Result<Self> {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let client_id = var("OAUTH_CLIENT_ID")
            .or(file.oauth.client_id)
            .ok_or(common::Error::Missing("OAUTH_CLIENT_ID"))?;

        let client_secret = match var("OAUTH_CLIENT_SECRET") {
            Some(secret) => Some(secret),
            None => read_secret_file(file.oauth.client_secret_file.as_deref(), "client_secret_file")?,
        }
        .map(Secret::new)
        .ok_or(common::Error::Missing("OAUTH_CLIENT_SECRET"))?;

        let token_url = var("OAUTH_TOKEN_URL")
            .or(file.oauth.token_url)
            .ok_or(common::Error::Missing("OAUTH_TOKEN_URL"))?;
        validate_url("OAUTH_TOKEN_URL", &token_url)?;

        let target_api_base_url = var("TARGET_API_BASE_URL")
            .or(file.proxy.target_api_base_url)
            .ok_or(common::Error::Missing("TARGET_API_BASE_URL"))?;
        validate_url("TARGET_API_BASE_URL", &target_api_base_url)?;

        // An explicitly empty INCOMING_BEARER_TOKEN disables the check even if a file is configured.
        let incoming_bearer_token = match env("INCOMING_BEARER_TOKEN") {
            Some(token) => Some(token),
            None => read_secret_file(
                file.proxy.incoming_bearer_token_file.as_deref(),
                "incoming_bearer_token_file",
            )?,
        }
        .map(Secret::new)
        .filter(|token| !token.is_empty());

        let mut listen_addr = file
            .proxy
            .listen_addr
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)));
        if let Some(port) = var("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|e| common::Error::Config(format!("invalid PORT {port:?}: {e}")))?;
            listen_addr.set_port(port);
        }

        let admin_addr = match var("ADMIN_ADDR") {
            Some(addr) => Some(addr.trim().parse().map_err(|e| {
                common::Error::Config(format!("invalid ADMIN_ADDR {addr:?}: {e}"))
            })?),
            None => file.admin.listen_addr,
        };

        let timeout_secs = file.proxy.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(common::Error::Config(
                "proxy.timeout_secs must be greater than 0".into(),
            ));
        }

        let token_timeout_secs = file.oauth.timeout_secs.unwrap_or(DEFAULT_TOKEN_TIMEOUT_SECS);
        if token_timeout_secs == 0 {
            return Err(common::Error::Config(
                "oauth.timeout_secs must be greater than 0".into(),
            ));
        }

        let max_connections = file.proxy.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(common::Error::Config(
                "proxy.max_connections must be greater than 0".into(),
            ));
        }

        Ok(Config {
            oauth: OAuthConfig {
                client_id,
                client_secret,
                token_url,
                timeout_secs: token_timeout_secs,
            },
            proxy: ProxyConfig {
                listen_addr,
                target_api_base_url,
                incoming_bearer_token,
                timeout_secs,
                max_connections,
            },
            admin_addr,
        })
    }
}

fn validate_url(name: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {url}"
        )))
    }
}

/// Read a secret from a file, trimmed. Empty content yields `None`.
fn read_secret_file(path: Option<&Path>, field: &str) -> common::Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!("failed to read {field} {}: {e}", path.display()))
    })?;
    let value = contents.trim().to_owned();
    Ok((!value.is_empty()).then_some(value))
}
