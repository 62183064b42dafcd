//! Conversion of non-2xx registry responses into [`RemoteError`].

use reqwest::Response;
use serde::Deserialize;

use kitops_core::error::{KitError, RegistryErrorDetail, RemoteError};

const MAX_EXTRA_MESSAGE: usize = 1024;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<RegistryErrorDetail>,
}

/// Read the body of a failed response and wrap it as [`KitError::RemoteHttp`].
pub(crate) async fn response_error(method: &str, response: Response) -> KitError {
    let url = response.url().to_string();
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    KitError::RemoteHttp(parse_error_body(method, url, status, &body))
}

pub(crate) fn parse_error_body(method: &str, url: String, status: u16, body: &str) -> RemoteError {
    let errors = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.errors)
        .unwrap_or_default();
    let extra_message = if errors.is_empty() {
        let trimmed = body.trim();
        let truncated: String = trimmed.chars().take(MAX_EXTRA_MESSAGE).collect();
        Some(truncated).filter(|s| !s.is_empty())
    } else {
        None
    };
    RemoteError {
        method: method.to_string(),
        url,
        status,
        errors,
        extra_message,
    }
}
