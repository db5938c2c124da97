//! Authentication for registry pulls
//!
//! Probes `/v2/` and follows the `WWW-Authenticate` challenge: registries that answer 200
//! are used anonymously, Basic challenges reuse the caller's credentials directly, and
//! Bearer challenges are exchanged at the token realm for a pull-scoped token.

use crate::config::AuthConfig;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::client::RegistryClient;
use crate::registry::transport::RegistryRequest;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use url::Url;

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);
/// Tokens are treated as expired this long before their deadline
const EXPIRY_LEEWAY: Duration = Duration::from_secs(5);

/// Parsed Bearer challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: Url,
    pub service: String,
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Parse the parameters of a Bearer `WWW-Authenticate` value
    ///
    /// Keys are matched by name; when no `realm=` key is present the first quoted value is
    /// taken as the realm. A missing service becomes the empty string.
    pub fn parse(header: &str) -> Result<Self> {
        let params = match header.trim().split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest,
            _ => header,
        };
        let pairs = parse_params(params);

        let lookup = |key: &str| {
            pairs
                .iter()
                .find(|(name, _, _)| name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(key)))
                .map(|(_, value, _)| value.clone())
        };

        let realm = lookup("realm")
            .or_else(|| {
                pairs
                    .iter()
                    .find(|(_, _, quoted)| *quoted)
                    .map(|(_, value, _)| value.clone())
            })
            .filter(|realm| !realm.is_empty())
            .ok_or_else(|| {
                RegistryError::Auth(format!("Malformed authentication challenge: {}", header))
            })?;

        let realm = Url::parse(&realm).map_err(|e| {
            RegistryError::Auth(format!("Invalid token realm '{}': {}", realm, e))
        })?;

        Ok(Self {
            realm,
            service: lookup("service").unwrap_or_default(),
            scope: lookup("scope"),
        })
    }

    /// Token endpoint URL requesting pull access to `repository`
    pub fn token_url(&self, repository: &str) -> Url {
        let mut url = self.realm.clone();
        {
            let mut query = url.query_pairs_mut();
            if !self.service.is_empty() {
                query.append_pair("service", &self.service);
            }
            query.append_pair("scope", &format!("repository:{}:pull", repository));
        }
        url
    }
}

/// Split `key="value", key=value` parameters, honouring quotes and escapes
///
/// Yields `(key, value, was_quoted)`; entries without `=` have no key.
fn parse_params(input: &str) -> Vec<(Option<String>, String, bool)> {
    let mut result = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        let mut key = None;
        let mut quoted = false;

        while let Some(&c) = chars.peek() {
            match c {
                '=' if key.is_none() && !token.is_empty() => {
                    key = Some(token.trim().to_string());
                    token.clear();
                    chars.next();
                }
                '"' if token.trim().is_empty() => {
                    quoted = true;
                    chars.next();
                    token.clear();
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    token.push(escaped);
                                }
                            }
                            '"' => break,
                            other => token.push(other),
                        }
                    }
                    // skip anything between the closing quote and the separator
                    while chars.peek().is_some_and(|c| *c != ',') {
                        chars.next();
                    }
                    break;
                }
                ',' => break,
                other => {
                    token.push(other);
                    chars.next();
                }
            }
        }

        let value = if quoted {
            token
        } else {
            token.trim().to_string()
        };
        result.push((key, value, quoted));
    }

    result
}

/// Pull token issued by a Bearer realm
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub value: String,
    pub expires_at: Option<Instant>,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, lifetime: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at: lifetime.map(|lifetime| Instant::now() + lifetime),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() + EXPIRY_LEEWAY >= deadline)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What requests to a repository should carry
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Registry answered `/v2/` without a challenge
    Anonymous,
    /// Pre-encoded `user:password` for Basic challenges
    Basic(String),
    Bearer(BearerToken),
}

impl Credential {
    /// Value for the `Authorization` header, if any
    pub fn authorization(&self) -> Option<String> {
        match self {
            Credential::Anonymous => None,
            Credential::Basic(encoded) => Some(format!("Basic {}", encoded)),
            Credential::Bearer(token) => Some(format!("Bearer {}", token.value)),
        }
    }

    /// Attach this credential to `request`
    pub fn apply(&self, request: RegistryRequest) -> RegistryRequest {
        match self.authorization() {
            Some(value) => request.header("Authorization", value),
            None => request,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Credential::Bearer(token) if token.is_expired())
    }

    /// Only bearer tokens can be replaced by asking the realm again
    pub fn is_refreshable(&self) -> bool {
        matches!(self, Credential::Bearer(_))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::Basic(_) => write!(f, "Basic(<redacted>)"),
            Credential::Bearer(token) => f.debug_tuple("Bearer").field(token).finish(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// Negotiates credentials for one registry
#[derive(Clone)]
pub struct AuthNegotiator {
    client: RegistryClient,
    credentials: Option<AuthConfig>,
    output: Logger,
}

impl AuthNegotiator {
    pub fn new(client: RegistryClient, credentials: Option<AuthConfig>, output: Logger) -> Self {
        Self {
            client,
            credentials,
            output,
        }
    }

    /// Obtain the credential for pulling `repository`
    pub async fn negotiate(&self, repository: &str) -> Result<Credential> {
        let ping_url = self.client.endpoint("/v2/")?;
        let response = self.client.send(RegistryRequest::get(ping_url)).await?;
        let status = response.status();

        if response.is_success() {
            self.output.verbose("Registry allows anonymous access, no token required");
            return Ok(Credential::Anonymous);
        }

        if status != 401 {
            let text = response.text().await;
            return Err(RegistryError::Auth(HttpErrorHandler::describe_status(
                status,
                &text,
                "registry version check",
            )));
        }

        let header = response
            .header("www-authenticate")
            .map(str::to_string)
            .ok_or_else(|| {
                RegistryError::Auth(
                    "Registry returned 401 without a WWW-Authenticate challenge".to_string(),
                )
            })?;
        drop(response);

        self.output.detail(&format!("Auth challenge received: {}", header));

        let scheme = header
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match scheme.as_str() {
            "basic" => self.basic_credential(),
            _ => {
                let challenge = AuthChallenge::parse(&header)?;
                self.output.verbose(&format!(
                    "Auth challenge parsed - realm: {}, service: {}",
                    challenge.realm, challenge.service
                ));
                let token = self.request_token(&challenge, repository).await?;
                Ok(Credential::Bearer(token))
            }
        }
    }

    fn basic_credential(&self) -> Result<Credential> {
        let auth = self.credentials.as_ref().ok_or_else(|| {
            RegistryError::Auth("Registry requires basic authentication credentials".to_string())
        })?;
        Ok(Credential::Basic(Self::encode_basic(auth)))
    }

    fn encode_basic(auth: &AuthConfig) -> String {
        STANDARD.encode(format!("{}:{}", auth.username, auth.password))
    }

    /// Exchange the challenge for a token scoped to `repository:<name>:pull`
    pub async fn request_token(
        &self,
        challenge: &AuthChallenge,
        repository: &str,
    ) -> Result<BearerToken> {
        let url = challenge.token_url(repository);
        self.output.detail(&format!("Requesting token from {}", url));

        let mut request = RegistryRequest::get(url);
        if let Some(auth) = &self.credentials {
            self.output.verbose(&format!("Authenticating as {}", auth.username));
            let basic = format!("Basic {}", Self::encode_basic(auth));
            request = request.header("Authorization", basic);
        }

        let response = self.client.send(request).await.map_err(|e| match e {
            RegistryError::Network(message) => {
                RegistryError::Auth(format!("Token endpoint unreachable: {}", message))
            }
            other => other,
        })?;

        if !response.is_success() {
            let status = response.status();
            let text = response.text().await;
            return Err(HttpErrorHandler::handle_auth_error(status, &text));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            RegistryError::Auth(format!("Unreadable token response: {}", e))
        })?;

        let value = body
            .token
            .filter(|token| !token.is_empty())
            .or(body.access_token.filter(|token| !token.is_empty()))
            .ok_or_else(|| {
                RegistryError::Auth(
                    "Token response contained neither token nor access_token".to_string(),
                )
            })?;

        let lifetime = body
            .expires_in
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        self.output.verbose(&format!(
            "Obtained pull token for {} (valid {})",
            repository,
            self.output.format_duration(lifetime)
        ));

        Ok(BearerToken::new(value, Some(lifetime)))
    }
}
