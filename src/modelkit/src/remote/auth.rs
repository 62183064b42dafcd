//! Registry credentials and the `WWW-Authenticate` handshake.
//!
//! A request that comes back `401` is retried once with credentials obtained
//! from the challenge: a `Basic` header built from the provider's username
//! and password, or a `Bearer` token fetched from the challenge realm. The
//! resulting `Authorization` header is cached per `host:port` and sent
//! up front on later requests to the same registry.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use parking_lot::RwLock;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use kitops_core::error::{KitError, Result};

/// Environment variable holding the registry username for [`EnvAuth`].
pub const USERNAME_ENV: &str = "KITOPS_REGISTRY_USERNAME";
/// Environment variable holding the registry password for [`EnvAuth`].
pub const PASSWORD_ENV: &str = "KITOPS_REGISTRY_PASSWORD";

const CLIENT_ID: &str = "kitops";

/// Registry credential.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    /// OAuth2 refresh token exchanged at the token realm.
    IdentityToken(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::IdentityToken(_) => f.write_str("IdentityToken(<redacted>)"),
        }
    }
}

/// Supplies credentials per registry host (`host[:port]`).
pub trait AuthProvider: Send + Sync {
    fn credential(&self, host: &str) -> Option<Credential>;
}

/// Never supplies credentials; bearer realms still hand out anonymous tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousAuth;

impl AuthProvider for AnonymousAuth {
    fn credential(&self, _host: &str) -> Option<Credential> {
        None
    }
}

/// Fixed credentials, either for every host or per host.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    default: Option<Credential>,
    hosts: HashMap<String, Credential>,
}

impl StaticAuth {
    /// Use `credential` for every registry.
    pub fn new(credential: Credential) -> Self {
        Self {
            default: Some(credential),
            hosts: HashMap::new(),
        }
    }

    /// Use `credential` for `host` only.
    pub fn with_host(mut self, host: impl Into<String>, credential: Credential) -> Self {
        self.hosts.insert(host.into(), credential);
        self
    }
}

impl AuthProvider for StaticAuth {
    fn credential(&self, host: &str) -> Option<Credential> {
        self.hosts.get(host).or(self.default.as_ref()).cloned()
    }
}

/// Reads [`USERNAME_ENV`] and [`PASSWORD_ENV`] on every lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvAuth;

impl AuthProvider for EnvAuth {
    fn credential(&self, _host: &str) -> Option<Credential> {
        let username = std::env::var(USERNAME_ENV).ok()?;
        let password = std::env::var(PASSWORD_ENV).ok()?;
        Some(Credential::basic(username, password))
    }
}

/// Parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let params = parse_params(rest);
        Some(Self::Bearer {
            realm: params.get("realm")?.clone(),
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

/// `key="value",key=value` pairs; quoted values may contain commas.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = &rest[eq + 1..];
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key, value.trim().to_string());
        rest = remainder.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }
    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A response together with the `Authorization` header that produced it.
pub struct AuthedResponse {
    pub response: Response,
    pub authorization: Option<String>,
}

/// HTTP client that negotiates registry credentials and caches them.
pub struct AuthClient {
    http: Client,
    provider: Arc<dyn AuthProvider>,
    /// `host:port` -> `Authorization` header value
    cache: RwLock<HashMap<String, String>>,
}

impl AuthClient {
    pub fn new(http: Client, provider: Arc<dyn AuthProvider>) -> Self {
        Self {
            http,
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn cached(&self, host: &str) -> Option<String> {
        self.cache.read().get(host).cloned()
    }

    /// Send the request produced by `build`, answering one `401` challenge.
    /// `build` is called again for the retry, so its body must be replayable.
    pub async fn send<F>(&self, host: &str, build: F) -> Result<AuthedResponse>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let authorization = self.cached(host);
        let mut request = build(&self.http);
        if let Some(value) = &authorization {
            request = request.header(AUTHORIZATION, value);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(AuthedResponse {
                response,
                authorization,
            });
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse);
        let Some(challenge) = challenge else {
            return Ok(AuthedResponse {
                response,
                authorization,
            });
        };
        tracing::debug!(host = %host, challenge = ?challenge, "Registry requested authentication");

        let Some(value) = self.authorize(host, &challenge).await? else {
            return Ok(AuthedResponse {
                response,
                authorization,
            });
        };
        self.cache.write().insert(host.to_string(), value.clone());
        let response = build(&self.http)
            .header(AUTHORIZATION, &value)
            .send()
            .await?;
        Ok(AuthedResponse {
            response,
            authorization: Some(value),
        })
    }

    async fn authorize(&self, host: &str, challenge: &Challenge) -> Result<Option<String>> {
        let credential = self.provider.credential(host);
        match challenge {
            Challenge::Basic => Ok(match credential {
                Some(Credential::Basic { username, password }) => {
                    Some(basic_header(&username, &password))
                }
                _ => None,
            }),
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let token = self
                    .fetch_token(realm, service.as_deref(), scope.as_deref(), credential)
                    .await?;
                Ok(Some(format!("Bearer {}", token)))
            }
        }
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
        credential: Option<Credential>,
    ) -> Result<String> {
        let request = match credential {
            Some(Credential::IdentityToken(refresh_token)) => {
                let mut form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token),
                    ("client_id", CLIENT_ID.to_string()),
                ];
                if let Some(service) = service {
                    form.push(("service", service.to_string()));
                }
                if let Some(scope) = scope {
                    form.push(("scope", scope.to_string()));
                }
                self.http.post(realm).form(&form)
            }
            credential => {
                let mut query = Vec::new();
                if let Some(service) = service {
                    query.push(("service", service));
                }
                if let Some(scope) = scope {
                    query.push(("scope", scope));
                }
                let request = self.http.get(realm).query(&query);
                match credential {
                    Some(Credential::Basic { username, password }) => {
                        request.basic_auth(username, Some(password))
                    }
                    _ => request,
                }
            }
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(KitError::Http(format!(
                "token request to {} failed with status {}",
                realm,
                response.status()
            )));
        }
        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| KitError::Http(format!("no token in response from {}", realm)))
    }
}

fn basic_header(username: &str, password: &str) -> String {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    format!("Basic {}", encoded)
}
