//! Configuration loading and precedence resolution.
//!
//! Three knobs only: bind address, port, and the extractor's base URL.
//! Precedence is CLI flag > environment variable > config file > built-in
//! default (§4.13, §6). Grounded on the teacher's `config.rs` (TOML via
//! `serde`, `anyhow::Context`-wrapped load errors), cut down to the handful
//! of fields this spec actually exposes.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_PORT: u16 = 3311;
const DEFAULT_API_URL: &str = "http://kekik_api:3310";

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub api_url: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {path:?}"))?;
        toml::from_str(&raw).with_context(|| format!("parse config {path:?}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub bind: SocketAddr,
    pub api_url: String,
}

fn default_bind() -> SocketAddr {
    format!("0.0.0.0:{DEFAULT_PORT}").parse().expect("default bind parses")
}

fn bind_from_port(port: u16) -> SocketAddr {
    format!("0.0.0.0:{port}").parse().expect("port-derived bind parses")
}

/// Resolves the final bind address and extractor URL from CLI flags,
/// environment variables, and an optional parsed config file, in that order
/// of precedence. `env_bind`/`env_port`/`env_api_url` are threaded in rather
/// than read from `std::env` directly so precedence can be unit tested
/// without mutating process-global environment state.
pub fn resolve(
    cli_bind: Option<SocketAddr>,
    cli_api_url: Option<String>,
    env_bind: Option<String>,
    env_port: Option<String>,
    env_api_url: Option<String>,
    file: Option<&FileConfig>,
) -> Result<ResolvedConfig> {
    let bind = if let Some(bind) = cli_bind {
        bind
    } else if let Some(raw) = env_bind {
        raw.parse().with_context(|| format!("parse BIND {raw}"))?
    } else if let Some(port) = env_port.and_then(|raw| raw.parse::<u16>().ok()) {
        bind_from_port(port)
    } else if let Some(file) = file {
        if let Some(raw) = file.bind.as_ref() {
            raw.parse().with_context(|| format!("parse config bind {raw}"))?
        } else if let Some(port) = file.port {
            bind_from_port(port)
        } else {
            default_bind()
        }
    } else {
        default_bind()
    };

    let api_url = cli_api_url
        .or(env_api_url)
        .or_else(|| file.and_then(|f| f.api_url.clone()))
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    Ok(ResolvedConfig { bind, api_url })
}

/// Resolves using the real process environment; the thin entry point
/// `startup::run` actually calls.
pub fn resolve_from_env(
    cli_bind: Option<SocketAddr>,
    cli_api_url: Option<String>,
    file: Option<&FileConfig>,
) -> Result<ResolvedConfig> {
    resolve(
        cli_bind,
        cli_api_url,
        std::env::var("BIND").ok(),
        std::env::var("PORT").ok(),
        std::env::var("API_URL").ok(),
        file,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_set() {
        let resolved = resolve(None, None, None, None, None, None).unwrap();
        assert_eq!(resolved.bind, default_bind());
        assert_eq!(resolved.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn file_overrides_default() {
        let file = FileConfig { bind: None, port: Some(4000), api_url: Some("http://file:1".into()) };
        let resolved = resolve(None, None, None, None, None, Some(&file)).unwrap();
        assert_eq!(resolved.bind, bind_from_port(4000));
        assert_eq!(resolved.api_url, "http://file:1");
    }

    #[test]
    fn env_overrides_file() {
        let file = FileConfig { bind: None, port: Some(4000), api_url: Some("http://file:1".into()) };
        let resolved = resolve(
            None,
            None,
            None,
            Some("5000".to_string()),
            Some("http://env:2".to_string()),
            Some(&file),
        )
        .unwrap();
        assert_eq!(resolved.bind, bind_from_port(5000));
        assert_eq!(resolved.api_url, "http://env:2");
    }

    #[test]
    fn env_bind_overrides_env_port() {
        let resolved = resolve(
            None,
            None,
            Some("127.0.0.1:9999".to_string()),
            Some("5000".to_string()),
            None,
            None,
        )
        .unwrap();
        assert_eq!(resolved.bind, "127.0.0.1:9999".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn cli_overrides_everything() {
        let file = FileConfig { bind: None, port: Some(4000), api_url: Some("http://file:1".into()) };
        let resolved = resolve(
            Some("127.0.0.1:1234".parse().unwrap()),
            Some("http://cli:3".to_string()),
            Some("127.0.0.1:9999".to_string()),
            Some("5000".to_string()),
            Some("http://env:2".to_string()),
            Some(&file),
        )
        .unwrap();
        assert_eq!(resolved.bind, "127.0.0.1:1234".parse::<SocketAddr>().unwrap());
        assert_eq!(resolved.api_url, "http://cli:3");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("wps-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        std::fs::write(&path, "not valid = [toml").unwrap();
        let err = FileConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("parse config"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = FileConfig::load(Path::new("/nonexistent/watch-party.toml")).unwrap_err();
        assert!(err.to_string().contains("read config"));
    }
}
