//! Configuration loading: TOML file or profile, environment overrides, secrets.

use anyhow::{bail, Context, Result};
use keeper_chain::SigningKey;
use regex_lite::Regex;
use std::path::Path;
use std::sync::OnceLock;

use super::keeper::KeeperConfig;
use crate::error::KeeperError;

/// Load the keeper configuration.
///
/// Reads the TOML file named by `KEEPER_CONFIG` when set (with `${VAR}`
/// expansion), otherwise the profile named by `KEEPER_PROFILE`. Endpoint
/// overrides from the environment are applied last, then the result is
/// validated.
pub fn load_config() -> Result<KeeperConfig> {
    let mut config = match std::env::var("KEEPER_CONFIG") {
        Ok(path) if !path.is_empty() => load_file(&path)?,
        _ => KeeperConfig::from_env(),
    };

    apply_env_overrides(&mut config);
    config.validate().map_err(KeeperError::Config)?;
    Ok(config)
}

/// Parse a TOML configuration file after environment expansion.
pub fn load_file(path: impl AsRef<Path>) -> Result<KeeperConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_toml(&raw).with_context(|| format!("Failed to parse config file {}", path.display()))
}

pub fn parse_toml(raw: &str) -> Result<KeeperConfig> {
    Ok(toml::from_str(&expand_env(raw))?)
}

fn apply_env_overrides(config: &mut KeeperConfig) {
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    if let Some(rpc) = var("KEEPER_RPC_URL") {
        config.chain.rpc_url = rpc;
    }
    if let Some(ws) = var("KEEPER_WS_URL") {
        config.chain.ws_url = Some(ws);
    }
    if let Some(contract) = var("KEEPER_CONTRACT") {
        config.chain.contract_address = contract;
    }
    if let Some(dry_run) = var("KEEPER_DRY_RUN") {
        config.monitor.dry_run = matches!(dry_run.as_str(), "1" | "true" | "yes");
    }
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|_| unreachable!())
    })
}

/// Expand `${VAR_NAME}` patterns with environment variable values.
/// Unset variables are left as written.
pub fn expand_env(s: &str) -> String {
    env_pattern()
        .replace_all(s, |caps: &regex_lite::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Secrets read from the environment, never from the config file.
#[derive(Clone, Default)]
pub struct KeeperSecrets {
    pub mnemonic: Option<String>,
    pub private_key: Option<String>,
    pub price_api_key: Option<String>,
}

impl std::fmt::Debug for KeeperSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperSecrets")
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("price_api_key", &self.price_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl KeeperSecrets {
    /// `KEEPER_MNEMONIC`, `KEEPER_PRIVATE_KEY`, `COINGECKO_API_KEY`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            mnemonic: var("KEEPER_MNEMONIC"),
            private_key: var("KEEPER_PRIVATE_KEY"),
            price_api_key: var("COINGECKO_API_KEY"),
        }
    }

    /// The keeper key. A mnemonic takes precedence over a raw key.
    pub fn signing_key(&self, coin_type: u32) -> Result<SigningKey> {
        match (&self.mnemonic, &self.private_key) {
            (Some(mnemonic), _) => SigningKey::from_mnemonic(mnemonic, coin_type),
            (None, Some(key)) => SigningKey::from_hex(key),
            (None, None) => bail!("KEEPER_MNEMONIC or KEEPER_PRIVATE_KEY must be set"),
        }
    }
}
