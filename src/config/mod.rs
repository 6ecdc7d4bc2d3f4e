//! Manages application configuration loaded from environment variables.
//!
//! This module defines the `Config` struct which holds all runtime
//! settings and provides the `from_env` function to populate it. It
//! supports loading variables from a `.env` file via the `dotenv`
//! crate and provides default values for every setting, so a bare
//! `mailbin` starts an in-memory server on the standard dev ports.

use anyhow::{anyhow, Context, Result};
use std::env;
use tracing::info;

/// Which mailbox store backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    File,
}

/// Holds the application's runtime configuration settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// SMTP listener address. (`MAILBIN_SMTP_HOST`, default "0.0.0.0")
    pub smtp_bind_address: String,
    /// SMTP listener port. (`MAILBIN_SMTP_PORT`, default 2525)
    pub smtp_port: u16,
    /// Per-command read deadline in seconds. (`MAILBIN_SMTP_TIMEOUT`, default 30)
    pub smtp_timeout_secs: u64,

    /// Management API address. (`MAILBIN_API_HOST`, default "0.0.0.0")
    pub api_bind_address: String,
    /// Management API port. (`MAILBIN_API_PORT`, default 8080)
    pub api_port: u16,

    /// Offer STARTTLS. (`MAILBIN_ENABLE_TLS`, default false)
    pub enable_tls: bool,
    /// PEM certificate chain path. (`MAILBIN_TLS_CERT_FILE`)
    pub tls_cert_file: String,
    /// PEM private key path. (`MAILBIN_TLS_KEY_FILE`)
    pub tls_key_file: String,

    /// When non-empty, `/api` requests must carry this `X-API-Key`.
    /// (`MAILBIN_API_KEY`)
    pub api_key: String,
    /// Offer AUTH PLAIN/LOGIN. Credentials are NOT validated; this
    /// exists for client compatibility only. (`MAILBIN_ENABLE_AUTH`,
    /// default false)
    pub enable_auth: bool,
    /// Permissive CORS on the management API. (`MAILBIN_ENABLE_CORS`,
    /// default true)
    pub enable_cors: bool,
    /// Management API request budget per minute.
    /// (`MAILBIN_RATE_LIMIT`, default 100)
    pub rate_limit_per_minute: u32,

    /// Store selection. (`MAILBIN_STORAGE`: "memory" or "file",
    /// default memory)
    pub storage_kind: StorageKind,
    /// Mailbox file for file-backed storage. (`MAILBIN_STORAGE_FILE`,
    /// default "emails.json")
    pub storage_file: String,
    /// Mailbox capacity before FIFO eviction. (`MAILBIN_MAX_MESSAGES`,
    /// default 1000)
    pub max_messages: usize,

    /// Webhook request deadline in seconds. (`MAILBIN_WEBHOOK_TIMEOUT`,
    /// default 10)
    pub webhook_timeout_secs: u64,
    /// POST webhooks registered at startup.
    /// (`MAILBIN_WEBHOOK_URLS`, comma-separated, default empty)
    pub webhook_urls: Vec<String>,

    /// Outbound relay for `POST /api/send`. (`MAILBIN_RELAY_HOST`,
    /// `MAILBIN_RELAY_PORT` default 587, `MAILBIN_RELAY_USERNAME`,
    /// `MAILBIN_RELAY_PASSWORD`, `MAILBIN_RELAY_FROM`)
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_username: String,
    pub relay_password: String,
    pub relay_from: String,
}

impl Config {
    /// Loads configuration settings from environment variables.
    ///
    /// Reads variables prefixed with `MAILBIN_`, loading a `.env`
    /// file first if one exists. Every setting has a default.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if a set variable cannot be parsed as its
    /// expected type.
    pub fn from_env() -> Result<Self> {
        // Attempt to load variables from a .env file, if it exists.
        let _ = dotenv::dotenv();

        let config = Config {
            smtp_bind_address: env_or("MAILBIN_SMTP_HOST", "0.0.0.0"),
            smtp_port: parse_env("MAILBIN_SMTP_PORT", 2525)?,
            smtp_timeout_secs: parse_env("MAILBIN_SMTP_TIMEOUT", 30)?,

            api_bind_address: env_or("MAILBIN_API_HOST", "0.0.0.0"),
            api_port: parse_env("MAILBIN_API_PORT", 8080)?,

            enable_tls: bool_env("MAILBIN_ENABLE_TLS", false)?,
            tls_cert_file: env_or("MAILBIN_TLS_CERT_FILE", ""),
            tls_key_file: env_or("MAILBIN_TLS_KEY_FILE", ""),

            api_key: env_or("MAILBIN_API_KEY", ""),
            enable_auth: bool_env("MAILBIN_ENABLE_AUTH", false)?,
            enable_cors: bool_env("MAILBIN_ENABLE_CORS", true)?,
            rate_limit_per_minute: parse_env("MAILBIN_RATE_LIMIT", 100)?,

            storage_kind: match env_or("MAILBIN_STORAGE", "memory").as_str() {
                "file" => StorageKind::File,
                _ => StorageKind::Memory,
            },
            storage_file: env_or("MAILBIN_STORAGE_FILE", "emails.json"),
            max_messages: parse_env("MAILBIN_MAX_MESSAGES", 1000)?,

            webhook_timeout_secs: parse_env("MAILBIN_WEBHOOK_TIMEOUT", 10)?,
            webhook_urls: list_env("MAILBIN_WEBHOOK_URLS"),

            relay_host: env_or("MAILBIN_RELAY_HOST", ""),
            relay_port: parse_env("MAILBIN_RELAY_PORT", 587)?,
            relay_username: env_or("MAILBIN_RELAY_USERNAME", ""),
            relay_password: env_or("MAILBIN_RELAY_PASSWORD", ""),
            relay_from: env_or("MAILBIN_RELAY_FROM", ""),
        };

        info!(
            smtp = %format!("{}:{}", config.smtp_bind_address, config.smtp_port),
            api = %format!("{}:{}", config.api_bind_address, config.api_port),
            storage = ?config.storage_kind,
            max_messages = config.max_messages,
            tls = config.enable_tls,
            auth = config.enable_auth,
            webhooks = config.webhook_urls.len(),
            "configuration loaded"
        );

        Ok(config)
    }
}

/// Returns the variable's value, or `default` when it is unset or
/// empty.
fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parses the variable into `T`, defaulting when unset or empty and
/// failing loudly when set to something unparsable.
fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) if !value.is_empty() => value
            .parse::<T>()
            .with_context(|| format!("{key} ('{value}') is not a valid value")),
        _ => Ok(default),
    }
}

fn bool_env(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => match value.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => other
                .parse::<bool>()
                .map_err(|_| anyhow!("{key} ('{other}') must be a boolean")),
        },
        _ => Ok(default),
    }
}

/// Parses a comma-separated variable into a list, trimming whitespace
/// and dropping empty entries.
fn list_env(key: &str) -> Vec<String> {
    env::var(key)
        .map(|value| {
            value
                .split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
