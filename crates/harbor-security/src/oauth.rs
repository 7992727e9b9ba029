use crate::SecurityError;
use chrono::{DateTime, Duration, Utc};
use harbor_core::{OAuthCredentials, OAuthProfile};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse,
    TokenUrl,
};
use serde::{Deserialize, Serialize};

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthPkceSession {
    pub authorization_url: String,
    pub csrf_state: String,
    pub pkce_verifier: String,
}

impl std::fmt::Debug for OAuthPkceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthPkceSession")
            .field("authorization_url", &self.authorization_url)
            .field("csrf_state", &"[REDACTED]")
            .field("pkce_verifier", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthTokenResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_secs: Option<u64>,
}

impl OAuthTokenResult {
    /// Providers may omit the refresh token on refresh; the previous one stays valid then.
    pub fn into_credentials(
        self,
        previous_refresh_token: Option<String>,
        issued_at: DateTime<Utc>,
    ) -> OAuthCredentials {
        OAuthCredentials {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh_token),
            expires_at: self
                .expires_in_secs
                .and_then(|secs| i64::try_from(secs).ok())
                .map(|secs| issued_at + Duration::seconds(secs)),
        }
    }
}

impl std::fmt::Debug for OAuthTokenResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenResult")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in_secs", &self.expires_in_secs)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OAuthWorkflow {
    profile: OAuthProfile,
    http_client: reqwest::Client,
}

const REJECTED_SCOPES: &[&str] = &["*", "admin", "root", "full_access"];

impl OAuthWorkflow {
    pub fn new(profile: OAuthProfile) -> Result<Self, SecurityError> {
        validate_profile(&profile)?;

        // Token endpoints must not be followed through redirects.
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            profile,
            http_client,
        })
    }

    pub fn profile(&self) -> &OAuthProfile {
        &self.profile
    }

    pub fn begin_pkce_session(&self) -> Result<OAuthPkceSession, SecurityError> {
        let client = self.client()?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut auth_request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in &self.profile.scopes {
            auth_request = auth_request.add_scope(Scope::new(scope.clone()));
        }
        for (name, value) in &self.profile.extra_auth_params {
            auth_request = auth_request.add_extra_param(name.clone(), value.clone());
        }

        let (auth_url, csrf_state) = auth_request.url();

        Ok(OAuthPkceSession {
            authorization_url: auth_url.to_string(),
            csrf_state: csrf_state.secret().to_string(),
            pkce_verifier: pkce_verifier.secret().to_string(),
        })
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<OAuthTokenResult, SecurityError> {
        let token = self
            .client()?
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(|err| SecurityError::OAuth(err.to_string()))?;

        Ok(OAuthTokenResult {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token.refresh_token().map(|token| token.secret().to_string()),
            expires_in_secs: token.expires_in().map(|duration| duration.as_secs()),
        })
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenResult, SecurityError> {
        let refresh_token = RefreshToken::new(refresh_token.to_string());
        let token = self
            .client()?
            .exchange_refresh_token(&refresh_token)
            .request_async(&self.http_client)
            .await
            .map_err(|err| SecurityError::Refresh(err.to_string()))?;

        tracing::debug!(
            client_id = %self.profile.client_id,
            rotated = token.refresh_token().is_some(),
            "refreshed oauth access token"
        );

        Ok(OAuthTokenResult {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token.refresh_token().map(|token| token.secret().to_string()),
            expires_in_secs: token.expires_in().map(|duration| duration.as_secs()),
        })
    }

    fn client(&self) -> Result<ConfiguredClient, SecurityError> {
        let mut client = BasicClient::new(ClientId::new(self.profile.client_id.clone()))
            .set_auth_uri(AuthUrl::new(self.profile.auth_url.as_str().to_string())?)
            .set_token_uri(TokenUrl::new(self.profile.token_url.as_str().to_string())?)
            .set_redirect_uri(RedirectUrl::new(
                self.profile.redirect_url.as_str().to_string(),
            )?);

        if let Some(secret) = &self.profile.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }

        Ok(client)
    }
}

fn validate_profile(profile: &OAuthProfile) -> Result<(), SecurityError> {
    for (label, url) in [("authorization", &profile.auth_url), ("token", &profile.token_url)] {
        if url.scheme() != "https" {
            return Err(SecurityError::OAuth(format!("{label} endpoint must use https")));
        }
        if url.host_str().is_none() {
            return Err(SecurityError::OAuth(format!("{label} endpoint has no host")));
        }
    }

    let redirect_host = profile.redirect_url.host_str().unwrap_or_default();
    if !matches!(redirect_host, "127.0.0.1" | "localhost" | "[::1]") {
        return Err(SecurityError::OAuth(format!(
            "redirect url must target the local callback listener, got '{redirect_host}'"
        )));
    }

    let client_id = profile.client_id.trim();
    if client_id.is_empty() {
        return Err(SecurityError::OAuth("client id is not configured".to_string()));
    }
    if client_id.len() > 512 {
        return Err(SecurityError::OAuth("client id is too long".to_string()));
    }

    if let Some(scope) = profile
        .scopes
        .iter()
        .find(|scope| REJECTED_SCOPES.contains(&scope.to_lowercase().as_str()))
    {
        return Err(SecurityError::OAuth(format!("scope '{scope}' is too broad")));
    }

    Ok(())
}
