//! MLS platform adapters: field exclusion rules, metadata namespace and
//! token retrieval for each hosting platform.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use resync_core::adapter::PlatformAdapter;
use resync_core::config::HttpConfig;
use resync_core::error::AppError;
use resync_core::models::{AuthToken, Credentials};
use serde::Deserialize;
use tracing::debug;

/// Platform-specific fields that carry no portable data.
fn is_vendor_field(field: &str) -> bool {
    field.starts_with("X_")
}

/// A token handed out once and never refreshed.
fn static_token(credentials: &Credentials) -> Result<AuthToken, AppError> {
    Ok(AuthToken {
        access_token: credentials.access_token()?,
        expires_at: DateTime::<Utc>::MAX_UTC,
    })
}

/// UtahRealEstate.com, static bearer token.
#[derive(Debug, Clone, Default)]
pub struct UtahRealEstate;

#[async_trait]
impl PlatformAdapter for UtahRealEstate {
    fn name(&self) -> &'static str {
        "utahRealEstate"
    }

    fn entity_namespace(&self) -> &str {
        "Odata.Models"
    }

    fn excludes_metadata_field(&self, field: &str) -> bool {
        is_vendor_field(field)
    }

    fn excludes_json_field(&self, field: &str) -> bool {
        field == "Directions" || self.excludes_metadata_field(field)
    }

    async fn fetch_auth(&self, credentials: &Credentials) -> Result<AuthToken, AppError> {
        static_token(credentials)
    }
}

/// Bridge Interactive, static server token.
#[derive(Debug, Clone, Default)]
pub struct BridgeInteractive;

impl BridgeInteractive {
    const VENDOR_FIELDS: &'static [&'static str] = &["BridgeModificationTimestamp", "FeedTypes"];
}

#[async_trait]
impl PlatformAdapter for BridgeInteractive {
    fn name(&self) -> &'static str {
        "bridgeInteractive"
    }

    fn entity_namespace(&self) -> &str {
        "org.reso.metadata"
    }

    fn excludes_metadata_field(&self, field: &str) -> bool {
        is_vendor_field(field) || Self::VENDOR_FIELDS.contains(&field)
    }

    async fn fetch_auth(&self, credentials: &Credentials) -> Result<AuthToken, AppError> {
        static_token(credentials)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Lifetime in seconds.
    expires_in: i64,
}

/// CoreLogic Trestle, OAuth2 client-credentials flow.
#[derive(Clone)]
pub struct Trestle {
    client: Client,
}

impl Trestle {
    const DEFAULT_TOKEN_ENDPOINT: &'static str =
        "https://api-trestle.corelogic.com/trestle/oidc/connect/token";
    const DEFAULT_SCOPE: &'static str = "api";

    pub fn new(config: &HttpConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PlatformAdapter for Trestle {
    fn name(&self) -> &'static str {
        "trestle"
    }

    fn entity_namespace(&self) -> &str {
        "CoreLogic.DataStandard.RESO.DD"
    }

    fn excludes_metadata_field(&self, field: &str) -> bool {
        is_vendor_field(field)
    }

    fn check_credentials(&self, credentials: &Credentials) -> Result<(), AppError> {
        credentials.client_id()?;
        credentials.client_secret()?;
        Ok(())
    }

    async fn fetch_auth(&self, credentials: &Credentials) -> Result<AuthToken, AppError> {
        let endpoint = credentials
            .token_endpoint
            .as_deref()
            .unwrap_or(Self::DEFAULT_TOKEN_ENDPOINT);
        let scope = credentials.scope.as_deref().unwrap_or(Self::DEFAULT_SCOPE);
        let client_id = credentials.client_id()?;
        let client_secret = credentials.client_secret()?;

        let resp = self
            .client
            .post(endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await
            .map_err(|e| AppError::NetworkError(format!("Token request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::ClientError(format!(
                "Token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AppError::ClientError(format!("Invalid token response: {}", e)))?;

        debug!(expires_in = token.expires_in, "Obtained Trestle token");
        Ok(AuthToken {
            expires_at: token_expiry(Utc::now(), token.expires_in)?,
            access_token: token.access_token,
        })
    }
}

/// `now + expires_in` seconds, rejecting lifetimes chrono cannot represent.
fn token_expiry(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, AppError> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            AppError::ClientError(format!("Token lifetime out of range: {}s", expires_in))
        })
}

pub type PlatformConstructor = fn(&HttpConfig) -> Result<Arc<dyn PlatformAdapter>, AppError>;

fn build_utah_real_estate(_: &HttpConfig) -> Result<Arc<dyn PlatformAdapter>, AppError> {
    Ok(Arc::new(UtahRealEstate))
}

fn build_trestle(http: &HttpConfig) -> Result<Arc<dyn PlatformAdapter>, AppError> {
    Ok(Arc::new(Trestle::new(http)?))
}

fn build_bridge_interactive(_: &HttpConfig) -> Result<Arc<dyn PlatformAdapter>, AppError> {
    Ok(Arc::new(BridgeInteractive))
}

/// Registry of platform adapters keyed by the `platform` tag of
/// `sources.toml`.
///
/// # Examples
///
/// ```
/// use resync_client::PlatformRegistry;
///
/// let registry = PlatformRegistry::with_builtins();
/// assert!(registry.contains("trestle"));
/// assert!(!registry.contains("mystery"));
/// ```
pub struct PlatformRegistry {
    constructors: BTreeMap<String, PlatformConstructor>,
}

impl PlatformRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry holding `utahRealEstate`, `trestle` and `bridgeInteractive`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("utahRealEstate", build_utah_real_estate);
        registry.register("trestle", build_trestle);
        registry.register("bridgeInteractive", build_bridge_interactive);
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, constructor: PlatformConstructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Builds the adapter registered under `tag`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unknown tag.
    pub fn build(&self, tag: &str, http: &HttpConfig) -> Result<Arc<dyn PlatformAdapter>, AppError> {
        let constructor = self.constructors.get(tag).ok_or_else(|| {
            AppError::Config(format!(
                "unknown platform '{}', expected one of: {}",
                tag,
                self.tags().join(", ")
            ))
        })?;
        constructor(http)
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
