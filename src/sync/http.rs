//! HTTP transport for the backend's GraphQL-style surface.
//!
//! Requests are `POST {endpoint}/graphql` with `{query, variables}` and a
//! bearer token; the token exchange is `POST {endpoint}/auth/device-token`.
//! Every request carries the agent-wide timeout.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::credential::{Credential, CredentialProvider, DeviceSecret};
use crate::DecisionRecord;

use super::backend::{BackendClient, DeltaPage, DeltaQuery, Receipt, TransportError};

const DELTA_QUERY: &str = r#"query CacheDelta($locationId: String!, $updatedSince: Float!, $cursor: String, $limit: Int!) {
  cacheDelta(locationId: $locationId, updatedSince: $updatedSince, cursor: $cursor, limit: $limit) {
    delta { location_id as_of references { identity_id vector model_version quality_score created_at } revoked }
    next_cursor
  }
}"#;

const SUBMIT_MUTATION: &str = r#"mutation SubmitDecision($deviceId: String!, $record: DecisionInput!) {
  submitDecision(deviceId: $deviceId, record: $record) { receipt_id }
}"#;

pub struct HttpBackend {
    agent: ureq::Agent,
    graphql_url: String,
    token_url: String,
}

impl HttpBackend {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let base = endpoint.trim_end_matches('/');
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            graphql_url: format!("{}/graphql", base),
            token_url: format!("{}/auth/device-token", base),
        }
    }

    fn graphql<T: DeserializeOwned>(
        &self,
        bearer: &str,
        query: &str,
        variables: Value,
        field: &str,
    ) -> Result<T, TransportError> {
        let body = json!({ "query": query, "variables": variables }).to_string();
        let text = self.post(&self.graphql_url, Some(bearer), &body)?;
        parse_graphql(&text, field)
    }

    fn post(&self, url: &str, bearer: Option<&str>, body: &str) -> Result<String, TransportError> {
        let mut request = self
            .agent
            .post(url)
            .set("Content-Type", "application/json");
        if let Some(token) = bearer {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        match request.send_string(body) {
            Ok(response) => response
                .into_string()
                .map_err(|e| TransportError::Network(format!("read body: {}", e))),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(map_status(status, &body))
            }
            Err(ureq::Error::Transport(transport)) => Err(map_transport(&transport.to_string())),
        }
    }
}

impl BackendClient for HttpBackend {
    fn fetch_delta(&self, bearer: &str, query: &DeltaQuery) -> Result<DeltaPage, TransportError> {
        let variables = json!({
            "locationId": query.location_id,
            "updatedSince": query.updated_since,
            "cursor": query.cursor,
            "limit": query.limit,
        });
        self.graphql(bearer, DELTA_QUERY, variables, "cacheDelta")
    }

    fn submit_decision(
        &self,
        bearer: &str,
        device_id: &str,
        record: &DecisionRecord,
    ) -> Result<Receipt, TransportError> {
        let variables = json!({ "deviceId": device_id, "record": record });
        self.graphql(bearer, SUBMIT_MUTATION, variables, "submitDecision")
    }
}

impl CredentialProvider for HttpBackend {
    fn exchange(&self, device_id: &str, secret: &DeviceSecret) -> Result<Credential, TransportError> {
        let body = json!({ "device_id": device_id, "secret": secret.expose() }).to_string();
        let text = self.post(&self.token_url, None, &body)?;
        serde_json::from_str(&text).map_err(|e| TransportError::Malformed(format!("token: {}", e)))
    }
}

#[derive(Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(default)]
    extensions: Option<GraphqlExtensions>,
}

#[derive(Deserialize)]
struct GraphqlExtensions {
    #[serde(default)]
    code: Option<String>,
}

/// Extract `data.{field}` or map the first GraphQL error.
fn parse_graphql<T: DeserializeOwned>(text: &str, field: &str) -> Result<T, TransportError> {
    let response: GraphqlResponse = serde_json::from_str(text)
        .map_err(|e| TransportError::Malformed(format!("graphql envelope: {}", e)))?;
    if let Some(err) = response.errors.into_iter().next() {
        let code = err
            .extensions
            .and_then(|x| x.code)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        return Err(map_error_code(code, err.message));
    }
    let value = response
        .data
        .and_then(|mut data| data.get_mut(field).map(Value::take))
        .filter(|v| !v.is_null())
        .ok_or_else(|| TransportError::Malformed(format!("missing data.{}", field)))?;
    serde_json::from_value(value).map_err(|e| TransportError::Malformed(format!("{}: {}", field, e)))
}

fn map_error_code(code: String, message: String) -> TransportError {
    match code.as_str() {
        "UNAUTHENTICATED" | "TOKEN_EXPIRED" => TransportError::Unauthorized,
        "REVOKED" | "FORBIDDEN" => TransportError::Revoked,
        "INTERNAL_SERVER_ERROR" | "SERVICE_UNAVAILABLE" => TransportError::Server { status: 500 },
        _ => TransportError::Rejected { code, message },
    }
}

fn map_status(status: u16, body: &str) -> TransportError {
    match status {
        401 => TransportError::Unauthorized,
        403 => TransportError::Revoked,
        408 | 429 => TransportError::Server { status },
        500..=599 => TransportError::Server { status },
        400..=499 => TransportError::Rejected {
            code: format!("HTTP_{}", status),
            message: body.chars().take(200).collect(),
        },
        _ => TransportError::Malformed(format!("unexpected status {}", status)),
    }
}

fn map_transport(message: &str) -> TransportError {
    if message.contains("timed out") || message.contains("Timeout") {
        TransportError::Timeout
    } else {
        TransportError::Network(message.to_string())
    }
}
