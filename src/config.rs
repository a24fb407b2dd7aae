use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_IMAPS_PORT, DEFAULT_MAILBOX, DEFAULT_SEARCH};

/// Authentication method for the IMAP session
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Plain LOGIN with `password`
    #[default]
    Password,
    /// SASL XOAUTH2 with a bearer token obtained elsewhere
    OAuth2 { access_token: String },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password => f.write_str("Password"),
            AuthMethod::OAuth2 { .. } => f
                .debug_struct("OAuth2")
                .field("access_token", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything needed for one notifier session.
///
/// Consumed once per `start`: the connection gets its own copy, so edits made
/// through `Notifier::config_mut` only apply to the next start.
#[derive(Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(alias = "username")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth: AuthMethod,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Skip certificate verification (self-signed test servers only)
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_mailbox", alias = "box")]
    pub mailbox: String,
    /// IMAP SEARCH criteria, joined with spaces
    #[serde(default = "default_search")]
    pub search: Vec<String>,
    #[serde(default = "default_true", alias = "markSeen")]
    pub mark_seen: bool,
}

impl std::fmt::Debug for NotifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("auth", &self.auth)
            .field("tls", &self.tls)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("mailbox", &self.mailbox)
            .field("search", &self.search)
            .field("mark_seen", &self.mark_seen)
            .finish()
    }
}

fn default_imap_port() -> u16 {
    DEFAULT_IMAPS_PORT
}

fn default_true() -> bool {
    true
}

fn default_mailbox() -> String {
    DEFAULT_MAILBOX.to_string()
}

fn default_search() -> Vec<String> {
    vec![DEFAULT_SEARCH.to_string()]
}

impl NotifierConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_imap_port(),
            user: user.into(),
            password: password.into(),
            auth: AuthMethod::Password,
            tls: true,
            accept_invalid_certs: false,
            mailbox: default_mailbox(),
            search: default_search(),
            mark_seen: true,
        }
    }

    /// The SEARCH criteria as sent on the wire.
    pub fn search_criteria(&self) -> String {
        self.search.join(" ")
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("host must not be empty");
        }
        if self.user.trim().is_empty() {
            anyhow::bail!("user must not be empty");
        }
        if self.mailbox.trim().is_empty() {
            anyhow::bail!("mailbox must not be empty");
        }
        if self.search.iter().all(|c| c.trim().is_empty()) {
            anyhow::bail!("search must contain at least one criterion");
        }
        Ok(())
    }

    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("mail-notifier");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 host = \"imap.example.com\"\n\
                 user = \"you@example.com\"\n\
                 password = \"secret\"\n\
                 mailbox = \"INBOX\"\n\
                 search = [\"UNSEEN\"]",
                path.display()
            );
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: NotifierConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}
