//! OCI distribution API client: tag → manifest digest.
//!
//! Issues `HEAD /v2/<repository>/manifests/<tag>` and reads the
//! `Docker-Content-Digest` header. Registries that answer with a Bearer
//! challenge get one anonymous token round-trip.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, WWW_AUTHENTICATE};
use serde::Deserialize;
use tracing::debug;

use rollwarden_core::{Digest, ImageReference, Registry, RegistryError};

/// Manifest media types we accept, indexes first so multi-arch tags
/// resolve to the index digest.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "docker-content-digest";

/// Registry client over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    http: reqwest::Client,
    /// Registries reached over plain HTTP.
    insecure: Vec<String>,
    /// Send every request here instead (mirrors, tests).
    endpoint: Option<String>,
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl HttpRegistry {
    pub fn new(insecure: Vec<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rollwarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::Protocol(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            insecure,
            endpoint: None,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    /// Base URL for `registry`.
    pub fn base_url(&self, registry: &str) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.clone();
        }
        let host = if registry == "docker.io" {
            "registry-1.docker.io"
        } else {
            registry
        };
        let scheme = if self.insecure.iter().any(|r| r == registry) {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{host}")
    }

    async fn head_manifest(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let mut request = self.http.head(url).header(ACCEPT, MANIFEST_ACCEPT);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        request
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(format!("{url}: {e}")))
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, RegistryError> {
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }
        let response = self
            .http
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(format!("{}: {e}", challenge.realm)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RegistryError::Unreachable(format!("token endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(RegistryError::Unauthorized(format!("token endpoint returned {status}")));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(format!("bad token response: {e}")))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::Protocol("token response carried no token".to_string()))
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn resolve_reference(&self, reference: &ImageReference) -> Result<Digest, RegistryError> {
        let tag = reference.tag().unwrap_or(rollwarden_core::reference::DEFAULT_TAG);
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference.registry()),
            reference.repository(),
            tag
        );

        let mut response = self.head_manifest(&url, None).await?;
        if response.status() == StatusCode::UNAUTHORIZED
            && let Some(challenge) = bearer_challenge(response.headers())
        {
            debug!(realm = %challenge.realm, "registry requested a bearer token");
            let token = self.fetch_token(&challenge).await?;
            response = self.head_manifest(&url, Some(&token)).await?;
        }

        let status = response.status();
        match status {
            s if s.is_success() => digest_from_headers(response.headers()),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(reference.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RegistryError::Unauthorized(format!("{reference}: {status}")))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                Err(RegistryError::Unreachable(format!("{reference}: rate limited")))
            }
            s if s.is_server_error() => Err(RegistryError::Unreachable(format!("{reference}: {status}"))),
            _ => Err(RegistryError::Protocol(format!("{reference}: unexpected {status}"))),
        }
    }
}

fn digest_from_headers(headers: &HeaderMap) -> Result<Digest, RegistryError> {
    let raw = headers
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RegistryError::Protocol(format!("response lacks {DIGEST_HEADER}")))?;
    Digest::parse(raw.trim()).map_err(|e| RegistryError::Protocol(e.to_string()))
}

fn bearer_challenge(headers: &HeaderMap) -> Option<BearerChallenge> {
    headers
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer_challenge)
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let after_key = after_key.trim_start();
        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            match after_key.find(',') {
                Some(end) => (&after_key[..end], &after_key[end..]),
                None => (after_key, ""),
            }
        };
        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}
