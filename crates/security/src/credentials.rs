//! Credential providers — pluggable signers for outbound adapter requests.
//!
//! Each provider produces the headers that authenticate one upstream:
//! bearer token, static API-key header, HTTP basic, an HMAC-SHA256-signed
//! app-identity JWT, or nothing. The invocation engine applies the headers
//! to every request it builds.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use agentmesh_config::AuthConfig;
use agentmesh_core::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of an app-identity JWT.
const JWT_TTL_SECONDS: i64 = 600;

/// A signer producing authentication headers for one upstream.
pub trait CredentialProvider: Send + Sync {
    /// Header name/value pairs to attach to each outbound request.
    fn headers(&self) -> Result<Vec<(String, String)>>;
}

/// `Authorization: Bearer <token>`.
pub struct BearerCredentials {
    token: String,
}

impl CredentialProvider for BearerCredentials {
    fn headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![(
            "Authorization".into(),
            format!("Bearer {}", self.token),
        )])
    }
}

/// A static key in a configurable header (e.g. `x-api-key` for Harness,
/// `X-JFrog-Art-Api` for Xray).
pub struct ApiKeyCredentials {
    header: String,
    key: String,
}

impl CredentialProvider for ApiKeyCredentials {
    fn headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![(self.header.clone(), self.key.clone())])
    }
}

/// HTTP basic auth.
pub struct BasicCredentials {
    username: String,
    password: String,
}

impl CredentialProvider for BasicCredentials {
    fn headers(&self) -> Result<Vec<(String, String)>> {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        Ok(vec![("Authorization".into(), format!("Basic {encoded}"))])
    }
}

/// App-identity JWT, HMAC-SHA256 signed, minted fresh per request.
pub struct AppJwtCredentials {
    app_id: String,
    secret: String,
}

impl AppJwtCredentials {
    fn mint(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = serde_json::json!({
            "iss": self.app_id,
            "iat": now,
            "exp": now + JWT_TTL_SECONDS,
        });
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{header}.{payload}");

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Internal(format!("JWT key init failed: {e}")))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }
}

impl CredentialProvider for AppJwtCredentials {
    fn headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![(
            "Authorization".into(),
            format!("Bearer {}", self.mint()?),
        )])
    }
}

/// Attaches nothing.
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn headers(&self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

/// Build a provider from adapter configuration.
pub fn from_config(auth: &AuthConfig) -> Box<dyn CredentialProvider> {
    match auth {
        AuthConfig::Bearer { token } => Box::new(BearerCredentials {
            token: token.clone(),
        }),
        AuthConfig::ApiKey { header, key } => Box::new(ApiKeyCredentials {
            header: header.clone(),
            key: key.clone(),
        }),
        AuthConfig::Basic { username, password } => Box::new(BasicCredentials {
            username: username.clone(),
            password: password.clone(),
        }),
        AuthConfig::AppJwt { app_id, secret } => Box::new(AppJwtCredentials {
            app_id: app_id.clone(),
            secret: secret.clone(),
        }),
        AuthConfig::None => Box::new(NoCredentials),
    }
}
