//! Registration token exchange against the CI control plane
//!
//! One authenticated `POST` trades the long-lived credential for a one-time
//! runner registration token. The call is never retried: tokens are single
//! use and hammering the API with a bad credential gets it rate limited.

use chrono::{DateTime, Utc};
use lxr_core::{Credential, LxrError, RegistrationTarget, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

use crate::token::RegistrationToken;

const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";

/// Build the scope-specific token endpoint under `api_base`
pub fn token_endpoint(api_base: &str, target: &RegistrationTarget) -> Result<Url> {
    let base = api_base.trim_end_matches('/');
    let url = match target {
        RegistrationTarget::Repository { owner, repository } => format!(
            "{}/repos/{}/{}/actions/runners/registration-token",
            base, owner, repository
        ),
        RegistrationTarget::Organization { owner } => {
            format!("{}/orgs/{}/actions/runners/registration-token", base, owner)
        }
    };
    Url::parse(&url).map_err(|e| LxrError::Config(format!("Invalid API URL '{}': {}", url, e)))
}

/// Client for the registration token endpoint
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    http: reqwest::Client,
    api_base: String,
}

impl RegistrationClient {
    /// Create a client rooted at `api_base`
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LxrError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: api_base.into(),
        })
    }

    /// Exchange `credential` for a registration token scoped to `target`
    ///
    /// - transport failures and unexpected statuses: [`LxrError::Transport`]
    /// - 401/403: [`LxrError::Auth`] with the response body
    /// - 404: [`LxrError::NotFound`] with the response body
    /// - success without a usable `token` field: [`LxrError::Auth`] with the
    ///   raw body, since this almost always means a credential scope mismatch
    pub async fn fetch_registration_token(
        &self,
        target: &RegistrationTarget,
        credential: &Credential,
    ) -> Result<RegistrationToken> {
        let url = token_endpoint(&self.api_base, target)?;
        tracing::info!("Requesting {} registration token for {}", target.scope(), target.owner());

        let response = self
            .http
            .post(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", credential.expose()))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("lxr/", env!("CARGO_PKG_VERSION")))
            .header(API_VERSION_HEADER, API_VERSION)
            .send()
            .await
            .map_err(|e| LxrError::Transport(format!("Failed to send request to {}: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LxrError::Transport(format!("Failed to read response body: {}", e)))?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(LxrError::Auth {
                    message: format!("credential rejected (HTTP {})", status.as_u16()),
                    body,
                });
            }
            StatusCode::NOT_FOUND => {
                return Err(LxrError::NotFound {
                    message: format!(
                        "no {} '{}' visible to this credential",
                        target.scope(),
                        describe(target)
                    ),
                    body,
                });
            }
            s if !s.is_success() => {
                return Err(LxrError::Transport(format!("HTTP {}: {}", status, body)));
            }
            _ => {}
        }

        let token = parse_token_response(&body)?;
        tracing::debug!("Registration token obtained (expires {:?})", token.expires_at());
        Ok(token)
    }
}

fn describe(target: &RegistrationTarget) -> String {
    match target.repository() {
        Some(repo) => format!("{}/{}", target.owner(), repo),
        None => target.owner().to_string(),
    }
}

/// Extract the token from a successful response body
///
/// Anything without a non-empty string `token` (including a body that is not
/// JSON at all) is an [`LxrError::Auth`] carrying the raw body.
pub fn parse_token_response(body: &str) -> Result<RegistrationToken> {
    let missing = || LxrError::Auth {
        message: "response carried no registration token".to_string(),
        body: body.to_string(),
    };

    let value: Value = serde_json::from_str(body).map_err(|_| missing())?;
    let secret = value
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(missing)?;

    let expires_at = value
        .get("expires_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(RegistrationToken::new(secret, expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RegistrationTarget {
        RegistrationTarget::Repository {
            owner: "acme".to_string(),
            repository: "widgets".to_string(),
        }
    }

    #[test]
    fn test_repository_endpoint() {
        let url = token_endpoint("https://api.github.com/", &repo()).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/acme/widgets/actions/runners/registration-token"
        );
    }

    #[test]
    fn test_organization_endpoint() {
        let target = RegistrationTarget::Organization {
            owner: "acme".to_string(),
        };
        let url = token_endpoint("https://ghe.example.com/api/v3", &target).unwrap();
        assert_eq!(
            url.as_str(),
            "https://ghe.example.com/api/v3/orgs/acme/actions/runners/registration-token"
        );
    }

    #[test]
    fn test_invalid_base_is_config_error() {
        assert!(matches!(
            token_endpoint("not a url", &repo()),
            Err(LxrError::Config(_))
        ));
    }

    #[test]
    fn test_parse_token_with_expiry() {
        let token =
            parse_token_response(r#"{"token":"AABB","expires_at":"2030-01-01T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(
            token.expires_at().map(|t| t.to_rfc3339()).as_deref(),
            Some("2030-01-01T00:00:00+00:00")
        );
        assert_eq!(token.into_secret(), "AABB");
    }

    #[test]
    fn test_null_token_is_auth_error_with_body() {
        match parse_token_response(r#"{"token": null}"#) {
            Err(LxrError::Auth { body, .. }) => assert_eq!(body, r#"{"token": null}"#),
            other => panic!("expected auth error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_or_malformed_token_is_auth_error() {
        assert!(matches!(parse_token_response("{}"), Err(LxrError::Auth { .. })));
        assert!(matches!(parse_token_response(r#"{"token": ""}"#), Err(LxrError::Auth { .. })));
        assert!(matches!(parse_token_response(r#"{"token": 42}"#), Err(LxrError::Auth { .. })));
        assert!(matches!(parse_token_response("<html>"), Err(LxrError::Auth { .. })));
    }
}
