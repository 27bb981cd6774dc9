use anyhow::{Result, anyhow};
use oauth2::TokenResponse;
use oauth2::basic::BasicClient;
use oauth2::reqwest::http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenUrl,
};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tiny_http::{Response, Server};
use url::Url;

use crate::config::{Config, OAuthAppConfig};
use crate::domain::account::ProviderKind;
use crate::error::SyncError;

/// Tokens returned by a code exchange or refresh (in-memory only)
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// A started authorization: the URL to open plus what the exchange needs later.
pub struct AuthorizationStart {
    pub url: Url,
    pub state: String,
    pub verifier: PkceCodeVerifier,
}

/// Talks to provider authorization and token endpoints.
pub trait TokenExchange: Send + Sync {
    fn authorization_url(&self, provider: ProviderKind) -> Result<AuthorizationStart, SyncError>;

    fn exchange_code(
        &self,
        provider: ProviderKind,
        code: &str,
        verifier: PkceCodeVerifier,
    ) -> Result<TokenSet, SyncError>;

    fn refresh(&self, provider: ProviderKind, refresh_token: &str) -> Result<TokenSet, SyncError>;
}

/// Registered OAuth application for one provider.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub extra_params: Vec<(String, String)>,
}

impl OAuthApp {
    pub fn gmail(cfg: &OAuthAppConfig, client_secret: Option<String>) -> Self {
        Self {
            client_id: cfg.client_id.clone(),
            client_secret,
            redirect_uri: cfg.redirect_uri(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
            // without these Google omits the refresh token on re-consent
            extra_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        }
    }

    pub fn graph(cfg: &OAuthAppConfig, client_secret: Option<String>) -> Self {
        let tenant = cfg.tenant.as_deref().unwrap_or("common");
        Self {
            client_id: cfg.client_id.clone(),
            client_secret,
            redirect_uri: cfg.redirect_uri(),
            auth_url: format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize"),
            token_url: format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"),
            scopes: vec![
                "offline_access".to_string(),
                "https://graph.microsoft.com/Mail.Read".to_string(),
                "https://graph.microsoft.com/User.Read".to_string(),
            ],
            extra_params: Vec::new(),
        }
    }

    fn client(&self) -> Result<BasicClient, SyncError> {
        let bad = |e: oauth2::url::ParseError| SyncError::Provider(format!("oauth url: {e}"));
        let client = BasicClient::new(
            ClientId::new(self.client_id.clone()),
            self.client_secret.clone().map(ClientSecret::new),
            AuthUrl::new(self.auth_url.clone()).map_err(bad)?,
            Some(TokenUrl::new(self.token_url.clone()).map_err(bad)?),
        )
        .set_redirect_uri(RedirectUrl::new(self.redirect_uri.clone()).map_err(bad)?);
        Ok(client)
    }

    pub fn authorization_url(&self) -> Result<AuthorizationStart, SyncError> {
        let (pkce_challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let client = self.client()?;
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        for (k, v) in &self.extra_params {
            request = request.add_extra_param(k.as_str(), v.as_str());
        }
        let (url, csrf) = request.url();
        Ok(AuthorizationStart {
            url,
            state: csrf.secret().clone(),
            verifier,
        })
    }

    pub fn exchange_code(
        &self,
        code: &str,
        verifier: PkceCodeVerifier,
    ) -> Result<TokenSet, SyncError> {
        let token = self
            .client()?
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(verifier)
            .request(http_client)
            .map_err(|e| SyncError::Provider(format!("token exchange failed: {e}")))?;
        Ok(token_set(&token))
    }

    pub fn refresh(&self, refresh_token: &str) -> Result<TokenSet, SyncError> {
        let token = self
            .client()?
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request(http_client)
            .map_err(|e| SyncError::Provider(format!("token refresh failed: {e}")))?;
        Ok(token_set(&token))
    }
}

fn token_set(token: &oauth2::basic::BasicTokenResponse) -> TokenSet {
    TokenSet {
        access_token: token.access_token().secret().to_string(),
        refresh_token: token.refresh_token().map(|r| r.secret().to_string()),
        expires_in: token.expires_in().map(|d| d.as_secs()),
    }
}

/// The OAuth apps configured for this install, one per REST provider.
#[derive(Debug, Default)]
pub struct OAuthApps {
    apps: HashMap<ProviderKind, OAuthApp>,
}

impl OAuthApps {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut apps = HashMap::new();
        if let Some(g) = &cfg.gmail {
            apps.insert(ProviderKind::Gmail, OAuthApp::gmail(g, g.resolve_client_secret()?));
        }
        if let Some(m) = &cfg.graph {
            apps.insert(ProviderKind::Graph, OAuthApp::graph(m, m.resolve_client_secret()?));
        }
        Ok(Self { apps })
    }

    fn app(&self, provider: ProviderKind) -> Result<&OAuthApp, SyncError> {
        self.apps
            .get(&provider)
            .ok_or_else(|| SyncError::Provider(format!("no oauth app configured for {provider}")))
    }
}

impl TokenExchange for OAuthApps {
    fn authorization_url(&self, provider: ProviderKind) -> Result<AuthorizationStart, SyncError> {
        self.app(provider)?.authorization_url()
    }

    fn exchange_code(
        &self,
        provider: ProviderKind,
        code: &str,
        verifier: PkceCodeVerifier,
    ) -> Result<TokenSet, SyncError> {
        self.app(provider)?.exchange_code(code, verifier)
    }

    fn refresh(&self, provider: ProviderKind, refresh_token: &str) -> Result<TokenSet, SyncError> {
        self.app(provider)?.refresh(refresh_token)
    }
}

/// Code and state captured from the provider redirect.
#[derive(Debug)]
pub struct RedirectParams {
    pub code: String,
    pub state: Option<String>,
}

/// Listens on the loopback redirect URI until the provider redirects the
/// browser back with `?code=...`, or the timeout passes.
pub fn wait_for_redirect(redirect_uri: &str, timeout: Duration) -> Result<RedirectParams> {
    // Parse redirect_uri so bind address matches exactly
    let redirect = Url::parse(redirect_uri)
        .map_err(|e| anyhow!("Invalid redirect_uri '{redirect_uri}': {e}"))?;

    let host = redirect
        .host_str()
        .ok_or_else(|| anyhow!("redirect_uri missing host: {redirect_uri}"))?
        .to_string();

    let port = redirect
        .port_or_known_default()
        .ok_or_else(|| anyhow!("redirect_uri missing/unknown port: {redirect_uri}"))?;

    let bind_ip: IpAddr = match host.as_str() {
        "localhost" | "127.0.0.1" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse::<IpAddr>().map_err(|_| {
            anyhow!("redirect_uri host must be localhost/127.0.0.1 or an IP: {other}")
        })?,
    };

    let bind_addr = SocketAddr::new(bind_ip, port);
    let server = Server::http(bind_addr)
        .map_err(|e| anyhow!("Failed to bind OAuth callback server on {bind_addr}: {e:?}"))?;

    let wait_until = Instant::now() + timeout;
    while Instant::now() < wait_until {
        let Ok(maybe_request) = server.recv_timeout(Duration::from_millis(500)) else {
            continue;
        };
        let Some(request) = maybe_request else {
            continue;
        };

        // request.url() is a path+query like "/callback?code=...&state=..."
        let full = format!("http://{}:{}{}", host, port, request.url());
        match parse_redirect(&full) {
            Some(params) => {
                let _ = request.respond(Response::from_string(
                    "Authorization received. You can close this tab.",
                ));
                return Ok(params);
            }
            None => {
                let _ = request.respond(Response::from_string(
                    "No code found in redirect. You can close this tab.",
                ));
            }
        }
    }

    Err(anyhow!("No code received within timeout"))
}

fn parse_redirect(full: &str) -> Option<RedirectParams> {
    let parsed = Url::parse(full).ok()?;
    let mut code = None;
    let mut state = None;
    for (k, v) in parsed.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            _ => {}
        }
    }
    Some(RedirectParams { code: code?, state })
}
