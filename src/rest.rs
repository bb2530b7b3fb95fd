//! REST transport for the K2 array (`/api/v2`).
//!
//! Thin and mechanical on purpose: retries, serialization and typing all
//! live above this layer. Errors are reported as [`TransportError`] with
//! the array's `error_msg` so the client can recognize busy codes.

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde_json::Value;

use crate::client::{ArrayTransport, TransportError};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};

pub struct K2RestTransport {
    http: reqwest::Client,
    base: String,
    username: String,
    password: String,
}

impl K2RestTransport {
    /// Builds a transport for the configured array. `is_ssl` toggles
    /// certificate validation; the connection itself is always HTTPS.
    pub fn connect(config: &DriverConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.is_ssl)
            .build()
            .map_err(|e| DriverError::Connection(format!("K2 API connection failure: {}", e)))?;

        Ok(K2RestTransport {
            http,
            base: format!("https://{}/api/v2", config.storage_host),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/{}", self.base, resource)
    }

    async fn read(response: Response) -> std::result::Result<Value, TransportError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::new(Some(status.as_u16()), e.to_string()))?;
        if status.is_success() {
            if body.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body)
                .map_err(|e| TransportError::new(Some(status.as_u16()), e.to_string()))
        } else {
            Err(TransportError::new(Some(status.as_u16()), error_message(status, &body)))
        }
    }
}

/// Pulls the array's `error_msg` out of an error body, falling back to
/// the raw body or the HTTP status.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(message) = parsed.get("error_msg").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        body.to_string()
    }
}

/// Flattens a filter object into query parameters. Reference values
/// select on the relation's `ref` path, as the array expects
/// (`volume.ref=/volumes/7`).
fn query_params(filters: &Value) -> Vec<(String, String)> {
    let Some(filters) = filters.as_object() else {
        return Vec::new();
    };
    filters
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => (key.clone(), s.clone()),
            Value::Object(fields) => match fields.get("ref").and_then(Value::as_str) {
                Some(path) => (format!("{}.ref", key), path.to_string()),
                None => (key.clone(), value.to_string()),
            },
            other => (key.clone(), other.to_string()),
        })
        .collect()
}

#[async_trait]
impl ArrayTransport for K2RestTransport {
    async fn search(
        &self,
        resource: &str,
        filters: &Value,
    ) -> std::result::Result<Vec<Value>, TransportError> {
        let response = self
            .http
            .get(self.url(resource))
            .basic_auth(&self.username, Some(&self.password))
            .query(&query_params(filters))
            .send()
            .await
            .map_err(|e| TransportError::new(None, e.to_string()))?;
        let body = Self::read(response).await?;
        match body.get("hits").and_then(Value::as_array) {
            Some(hits) => Ok(hits.clone()),
            None => Err(TransportError::new(None, format!("search result for {} has no hits field", resource))),
        }
    }

    async fn create(
        &self,
        resource: &str,
        fields: &Value,
    ) -> std::result::Result<Value, TransportError> {
        let response = self
            .http
            .post(self.url(resource))
            .basic_auth(&self.username, Some(&self.password))
            .json(fields)
            .send()
            .await
            .map_err(|e| TransportError::new(None, e.to_string()))?;
        Self::read(response).await
    }

    async fn update(
        &self,
        resource: &str,
        id: u64,
        fields: &Value,
    ) -> std::result::Result<Value, TransportError> {
        let response = self
            .http
            .patch(format!("{}/{}", self.url(resource), id))
            .basic_auth(&self.username, Some(&self.password))
            .json(fields)
            .send()
            .await
            .map_err(|e| TransportError::new(None, e.to_string()))?;
        Self::read(response).await
    }

    async fn delete(&self, resource: &str, id: u64) -> std::result::Result<(), TransportError> {
        let response = self
            .http
            .delete(format!("{}/{}", self.url(resource), id))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| TransportError::new(None, e.to_string()))?;
        Self::read(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_error_message_prefers_error_msg_field() {
        let message = error_message(
            StatusCode::BAD_REQUEST,
            r#"{"error_msg": "MC_ERR_BUSY", "details": "later"}"#,
        );
        assert_eq!(message, "MC_ERR_BUSY");
    }

    #[test]
    fn test_error_message_falls_back_to_body_then_status() {
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, "upstream gone"), "upstream gone");
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, ""), "HTTP 502 Bad Gateway");
    }

    #[test]
    fn test_query_params_flatten_refs() {
        let params = query_params(&json!({
            "scsi_sn": "2002abc",
            "volume": {"ref": "/volumes/7"},
            "id": 3,
        }));
        assert!(params.contains(&("scsi_sn".to_string(), "2002abc".to_string())));
        assert!(params.contains(&("volume.ref".to_string(), "/volumes/7".to_string())));
        assert!(params.contains(&("id".to_string(), "3".to_string())));
    }
}
