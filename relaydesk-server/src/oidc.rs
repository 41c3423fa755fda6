//! OpenID Connect client (authorization code + PKCE, public client).

use serde::{Deserialize, Serialize};

/// Provider key under which tokens are stored.
pub const PROVIDER: &str = "oidc";

const SCOPE: &str = "openid profile email offline_access";

#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// The refresh token or code was rejected; the user must sign in again.
    #[error("grant rejected by the identity provider: {0}")]
    InvalidGrant(String),
    #[error("identity provider error {error}: {description}")]
    Provider { error: String, description: String },
    #[error("identity provider unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected identity provider response: {0}")]
    BadResponse(String),
}

/// Token endpoint response, plus the absolute expiry we compute on receipt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenSet {
    fn stamped(mut self, now: i64) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = self.expires_in.map(|secs| now + secs);
        }
        self
    }

    /// Tokens without an expiry never expire.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Identity claims read from the id token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

/// What `/auth/login` needs to remember until the callback.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub code_verifier: String,
}

#[derive(Clone)]
pub struct OidcClient {
    issuer: String,
    client_id: String,
    http: reqwest::Client,
}

impl OidcClient {
    pub fn new(issuer: &str, client_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            issuer: issuer.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            http,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn authorization_endpoint(&self) -> String {
        format!("{}/auth", self.issuer)
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/token", self.issuer)
    }

    pub fn end_session_endpoint(&self) -> String {
        format!("{}/session/end", self.issuer)
    }

    /// Build the provider redirect with a fresh state and PKCE pair.
    pub fn authorization_request(&self, redirect_uri: &str) -> AuthorizationRequest {
        let (code_verifier, code_challenge) = generate_pkce();
        let state = generate_random_string(16);
        let url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256&prompt={}",
            self.authorization_endpoint(),
            urlencod(&self.client_id),
            urlencod(redirect_uri),
            urlencod(SCOPE),
            urlencod(&state),
            urlencod(&code_challenge),
            urlencod("login consent"),
        );
        AuthorizationRequest {
            url,
            state,
            code_verifier,
        }
    }

    pub fn end_session_url(&self, post_logout_redirect_uri: &str) -> String {
        format!(
            "{}?client_id={}&post_logout_redirect_uri={}",
            self.end_session_endpoint(),
            urlencod(&self.client_id),
            urlencod(post_logout_redirect_uri),
        )
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, OidcError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        self.token_request(&params).await
    }

    /// Refresh an access token. A response without a new refresh token keeps
    /// the old one.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, OidcError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        let mut token = self.token_request(&params).await?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, OidcError> {
        let resp = self
            .http
            .post(self.token_endpoint())
            .form(params)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(token_error(status.as_u16(), &body));
        }
        let token: TokenSet = serde_json::from_str(&body)
            .map_err(|e| OidcError::BadResponse(format!("token response: {e}")))?;
        Ok(token.stamped(chrono::Utc::now().timestamp()))
    }
}

fn token_error(status: u16, body: &str) -> OidcError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) if err.error == "invalid_grant" => {
            OidcError::InvalidGrant(err.error_description.unwrap_or(err.error))
        }
        Ok(err) => OidcError::Provider {
            error: err.error,
            description: err.error_description.unwrap_or_default(),
        },
        Err(_) => OidcError::BadResponse(format!("token endpoint returned {status}")),
    }
}

/// Read the claims of an id token. The signature is not verified: the token
/// came straight from the token endpoint over TLS.
pub fn decode_id_token_claims(id_token: &str) -> Result<Claims, OidcError> {
    use base64::Engine;
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| OidcError::BadResponse("id token is not a JWT".into()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| OidcError::BadResponse(format!("id token payload: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| OidcError::BadResponse(format!("id token claims: {e}")))
}

pub fn generate_pkce() -> (String, String) {
    use base64::Engine;
    use sha2::{Digest, Sha256};
    let verifier = generate_random_string(32);
    let hash = Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash);
    (verifier, challenge)
}

pub fn generate_random_string(len: usize) -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&bytes)
}

pub fn urlencod(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}
