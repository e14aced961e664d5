//! Server configuration loaded from TOML.
//!
//! Parsing collects diagnostics instead of failing on the first problem, so
//! a single run reports every configuration error at once.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::providers::{factories, Provider};

/// Listen address used when the `server` block does not set one.
pub const DEFAULT_LISTEN: &str = "localhost:7922";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One configuration problem, in the shape the CLI prints.
#[derive(Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}\n  {}", label, self.summary, self.detail)
    }
}

/// Collected configuration problems.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.entries.push(Diagnostic {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
        });
    }

    pub fn warning(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.entries.push(Diagnostic {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
        });
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: RawServer,
    #[serde(default, rename = "target")]
    targets: Vec<RawTarget>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    listen: Option<String>,
    host_key: PathBuf,
    authorized_key: String,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    addr: String,
    #[serde(rename = "type")]
    kind: String,
    /// Provider-specific fields, handed to the factory untouched.
    #[serde(flatten)]
    options: toml::Table,
}

/// Fully validated runtime configuration.
pub struct Config {
    pub listen: String,
    pub host_key: russh::keys::PrivateKey,
    /// SHA-256 digest of the authorized public key blob.
    pub authorized_key: [u8; 32],
    /// Configured providers by virtual target address.
    pub providers: HashMap<String, Arc<dyn Provider>>,
}

/// Parse and validate the configuration file.
///
/// Every problem found lands in the returned diagnostics; the config is
/// only returned when none of them is an error.
pub fn load(path: &Path) -> (Option<Config>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            diags.error(
                "Cannot read configuration file",
                format!("Failed to read {}: {}", path.display(), err),
            );
            return (None, diags);
        }
    };

    let raw: RawConfig = match toml::from_str(&content) {
        Ok(raw) => raw,
        Err(err) => {
            diags.error(
                "Invalid configuration file",
                format!("Failed to parse {}: {}", path.display(), err),
            );
            return (None, diags);
        }
    };

    let host_key = match russh::keys::load_secret_key(&raw.server.host_key, None) {
        Ok(key) => Some(key),
        Err(err) => {
            diags.error(
                "Cannot load host key",
                format!(
                    "Failed to load host key from {}: {}",
                    raw.server.host_key.display(),
                    err
                ),
            );
            None
        }
    };

    let authorized_key = match authorized_key_digest(&raw.server.authorized_key) {
        Ok(digest) => Some(digest),
        Err(err) => {
            diags.error("Invalid authorized key", format!("{err:#}"));
            None
        }
    };

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for target in &raw.targets {
        if providers.contains_key(&target.addr) {
            diags.error(
                "Duplicate target address",
                format!("A target with address '{}' is defined more than once", target.addr),
            );
            continue;
        }
        let Some(factory) = factories().get(target.kind.as_str()) else {
            diags.error(
                "Unknown target type",
                format!("Target '{}' has unknown type '{}'", target.addr, target.kind),
            );
            continue;
        };
        let (provider, target_diags) = factory(&target.addr, &target.options);
        diags.extend(target_diags);
        if let Some(provider) = provider {
            providers.insert(target.addr.clone(), provider);
        }
    }

    if diags.has_errors() {
        return (None, diags);
    }
    let (Some(host_key), Some(authorized_key)) = (host_key, authorized_key) else {
        return (None, diags);
    };

    let config = Config {
        listen: raw
            .server
            .listen
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
        host_key,
        authorized_key,
        providers,
    };
    (Some(config), diags)
}

/// Digest the key blob of an OpenSSH `ssh-ed25519 AAAA... comment` line.
pub fn authorized_key_digest(line: &str) -> Result<[u8; 32]> {
    let mut parts = line.split_whitespace();
    let _key_type = parts
        .next()
        .ok_or_else(|| anyhow!("authorized key is empty"))?;
    let key_data = parts
        .next()
        .ok_or_else(|| anyhow!("authorized key has no key data field"))?;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(key_data)
        .context("authorized key data is not valid base64")?;
    Ok(Sha256::digest(&blob).into())
}

/// Parse a duration string like "500ms", "30s", "5m" or "1h".
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (number, unit): (&str, fn(u64) -> Duration) = if let Some(number) = value.strip_suffix("ms")
    {
        (number, Duration::from_millis)
    } else if let Some(number) = value.strip_suffix('s') {
        (number, Duration::from_secs)
    } else if let Some(number) = value.strip_suffix('m') {
        (number, |minutes| Duration::from_secs(minutes * 60))
    } else if let Some(number) = value.strip_suffix('h') {
        (number, |hours| Duration::from_secs(hours * 3600))
    } else {
        return Err(anyhow!("duration '{value}' is missing a unit (ms, s, m, h)"));
    };
    let number: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{value}'"))?;
    Ok(unit(number))
}
