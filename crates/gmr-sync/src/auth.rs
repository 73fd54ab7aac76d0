//! Trigger authentication for batch entry points.
//!
//! Any one valid credential authorizes a call: the cron bearer secret, a
//! signed webhook, the admin API key header, or the worker callback key header.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";
pub const WORKER_CALLBACK_KEY_HEADER: &str = "x-worker-callback-key";

const SIGNATURE_PREFIX: &str = "sha256=";
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    CronSecret,
    SignedWebhook,
    AdminApiKey,
    WorkerCallback,
    /// Operator invocation from the command line; never reaches HTTP auth.
    Cli,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CronSecret => "cron_secret",
            Self::SignedWebhook => "signed_webhook",
            Self::AdminApiKey => "admin_api_key",
            Self::WorkerCallback => "worker_callback",
            Self::Cli => "cli",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no trigger credentials presented")]
    MissingCredentials,
    #[error("trigger credentials rejected")]
    InvalidCredentials,
    #[error("webhook timestamp outside the accepted window")]
    StaleTimestamp,
}

/// Raw credential material extracted from a request.
#[derive(Debug, Clone, Default)]
pub struct TriggerCredentials {
    pub bearer: Option<String>,
    pub admin_api_key: Option<String>,
    pub worker_callback_key: Option<String>,
    pub webhook_timestamp: Option<String>,
    pub webhook_signature: Option<String>,
    pub body: Vec<u8>,
}

impl TriggerCredentials {
    pub fn is_empty(&self) -> bool {
        self.bearer.is_none()
            && self.admin_api_key.is_none()
            && self.worker_callback_key.is_none()
            && self.webhook_signature.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub cron_secret: Option<String>,
    pub webhook_signing_key: Option<String>,
    pub admin_api_key: Option<String>,
    pub worker_callback_key: Option<String>,
    pub webhook_tolerance_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cron_secret: None,
            webhook_signing_key: None,
            admin_api_key: None,
            worker_callback_key: None,
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
        }
    }
}

impl AuthConfig {
    pub fn from_env() -> Self {
        Self {
            cron_secret: non_empty_env("CRON_SECRET"),
            webhook_signing_key: non_empty_env("WEBHOOK_SIGNING_KEY"),
            admin_api_key: non_empty_env("ADMIN_API_KEY"),
            worker_callback_key: non_empty_env("WORKER_CALLBACK_KEY"),
            webhook_tolerance_secs: std::env::var("WEBHOOK_TOLERANCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct TriggerAuthenticator {
    config: AuthConfig,
}

impl TriggerAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn cron_secret(&self) -> Option<&str> {
        self.config.cron_secret.as_deref()
    }

    pub fn authenticate(
        &self,
        credentials: &TriggerCredentials,
        now: DateTime<Utc>,
    ) -> Result<TriggerSource, AuthError> {
        if credentials.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        if matches_secret(credentials.bearer.as_deref(), self.config.cron_secret.as_deref()) {
            return Ok(TriggerSource::CronSecret);
        }
        if matches_secret(
            credentials.admin_api_key.as_deref(),
            self.config.admin_api_key.as_deref(),
        ) {
            return Ok(TriggerSource::AdminApiKey);
        }
        if matches_secret(
            credentials.worker_callback_key.as_deref(),
            self.config.worker_callback_key.as_deref(),
        ) {
            return Ok(TriggerSource::WorkerCallback);
        }

        if let (Some(key), Some(signature)) = (
            self.config.webhook_signing_key.as_deref(),
            credentials.webhook_signature.as_deref(),
        ) {
            let timestamp = credentials
                .webhook_timestamp
                .as_deref()
                .ok_or(AuthError::InvalidCredentials)?;
            let sent_at: i64 = timestamp
                .trim()
                .parse()
                .map_err(|_| AuthError::InvalidCredentials)?;
            if (now.timestamp() - sent_at).abs() > self.config.webhook_tolerance_secs {
                return Err(AuthError::StaleTimestamp);
            }
            if verify_webhook(key, timestamp.trim(), &credentials.body, signature) {
                return Ok(TriggerSource::SignedWebhook);
            }
        }

        Err(AuthError::InvalidCredentials)
    }
}

/// `sha256=<hex>` over `"{timestamp}.{body}"`.
pub fn sign_webhook(key: &str, timestamp: &str, body: &[u8]) -> Option<String> {
    let mac = new_mac(key, timestamp, body)?;
    Some(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn verify_webhook(key: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_sig) = signature.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    new_mac(key, timestamp, body).is_some_and(|mac| mac.verify_slice(&expected).is_ok())
}

fn new_mac(key: &str, timestamp: &str, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Some(mac)
}

fn matches_secret(presented: Option<&str>, expected: Option<&str>) -> bool {
    match (presented, expected) {
        (Some(presented), Some(expected)) => {
            constant_time_eq(presented.trim().as_bytes(), expected.as_bytes())
        }
        _ => false,
    }
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
