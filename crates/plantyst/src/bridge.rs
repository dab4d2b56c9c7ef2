//! Network bridge: the SDK's only way to reach the API.
//!
//! [`HttpBridge`] sends requests with `reqwest` and signs them according to
//! its [`Auth`] mode. Cancelling a send means dropping its future.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::{Map, Value};

use crate::clock::{Clock, SystemClock};
use crate::context::CommunicationSetup;

/// Audience claim of every issued token.
pub const JWT_AUDIENCE: &str = "https://my.plantyst.com/";

/// Lifetime of an issued token, in seconds.
const JWT_LIFETIME_SECS: i64 = 60;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request-specific token claims.
pub type Claims = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// JSON body, JSON answer.
    #[default]
    Post,
    /// Query-string parameters, HAL+JSON answer.
    Get,
}

/// One call to an API endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRequest {
    pub method: Method,
    /// Endpoint name, appended to the base API URL.
    pub endpoint: String,
    /// Query-string parameters, sent in order.
    pub params: Vec<(String, String)>,
    pub body: Value,
    pub claims: Option<Claims>,
}

impl BridgeRequest {
    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            endpoint: endpoint.into(),
            params: Vec::new(),
            body,
            claims: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            endpoint: endpoint.into(),
            params: Vec::new(),
            body: Value::Null,
            claims: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_claims(mut self, claims: Option<Claims>) -> Self {
        self.claims = claims;
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Cannot sign request: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("{0}")]
    Other(String),
}

/// Transport capability used by the fetch engine and the providers.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn send(&self, request: BridgeRequest) -> Result<Value, BridgeError>;
}

/// Credentials for signed (HS256) tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtSettings {
    /// Issuer claim.
    pub application: String,
    /// `AccessKey` claim.
    pub key: String,
    /// Base64-encoded HMAC secret.
    pub secret: String,
}

/// How requests are authorized.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Auth {
    #[default]
    None,
    /// `Authorization: Token <token>`.
    Token(String),
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// `Authorization: Token <signed JWT>`, minted per request.
    Jwt(JwtSettings),
}

/// Mint an HS256 token carrying the standard claims plus `claims`.
pub fn jwt_token(
    settings: &JwtSettings,
    claims: Option<&Claims>,
    now: DateTime<Utc>,
) -> Result<String, BridgeError> {
    let issued = now.timestamp();
    let mut claim_set = Claims::new();
    claim_set.insert("iss".into(), Value::String(settings.application.clone()));
    claim_set.insert("aud".into(), Value::String(JWT_AUDIENCE.into()));
    claim_set.insert("nbf".into(), Value::from(issued));
    claim_set.insert("exp".into(), Value::from(issued + JWT_LIFETIME_SECS));
    claim_set.insert("AccessKey".into(), Value::String(settings.key.clone()));
    if let Some(extra) = claims {
        claim_set.extend(extra.clone());
    }

    let key = EncodingKey::from_base64_secret(settings.secret.trim())?;
    Ok(encode(&Header::new(Algorithm::HS256), &claim_set, &key)?)
}

/// `reqwest`-backed bridge.
#[derive(Clone)]
pub struct HttpBridge {
    client: reqwest::Client,
    base_url: String,
    auth: Auth,
    clock: Arc<dyn Clock>,
}

impl HttpBridge {
    pub fn new(communication: &CommunicationSetup, auth: Auth) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: communication.base_api_url.clone(),
            auth,
            clock: Arc::new(SystemClock),
        })
    }

    /// Time source for token validity windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `Authorization` header value for a request, if any.
    pub fn authorization(&self, claims: Option<&Claims>) -> Result<Option<String>, BridgeError> {
        Ok(match &self.auth {
            Auth::None => None,
            Auth::Token(token) => Some(format!("Token {token}")),
            Auth::Bearer(token) => Some(format!("Bearer {token}")),
            Auth::Jwt(settings) => Some(format!(
                "Token {}",
                jwt_token(settings, claims, self.clock.now())?
            )),
        })
    }
}

#[async_trait]
impl Bridge for HttpBridge {
    async fn send(&self, request: BridgeRequest) -> Result<Value, BridgeError> {
        let url = format!("{}{}", self.base_url, request.endpoint);
        let mut builder = match request.method {
            Method::Post => self
                .client
                .post(&url)
                .header(ACCEPT, "application/json")
                .json(&request.body),
            Method::Get => self
                .client
                .get(&url)
                .header(ACCEPT, "application/hal+json"),
        };
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(value) = self.authorization(request.claims.as_ref())? {
            builder = builder.header(AUTHORIZATION, value);
        }

        tracing::debug!("{:?} {url}", request.method);
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}
