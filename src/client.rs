//! Management-protocol client.
//!
//! The polling engine only depends on the [`MBeanClient`] trait; the
//! production implementation talks to the Jolokia JSON/HTTP bridge that the
//! target processes expose.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::model::{Query, QueryResult, Server};

/// Executes one query against one server, producing numeric samples.
///
/// Implementations must be safe to call concurrently; the engine invokes
/// them from per-server worker pools.
#[async_trait]
pub trait MBeanClient: Send + Sync {
    async fn read_attributes(&self, server: &Server, query: &Query) -> Result<Vec<QueryResult>>;
}

/// Client for the Jolokia HTTP bridge (`POST /jolokia` with a `read`
/// request).
pub struct JolokiaClient {
    http: reqwest::Client,
}

impl JolokiaClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("default reqwest client");
        Self { http }
    }
}

impl Default for JolokiaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MBeanClient for JolokiaClient {
    async fn read_attributes(&self, server: &Server, query: &Query) -> Result<Vec<QueryResult>> {
        let url = format!("http://{}:{}/jolokia", server.host, server.port);
        let body = json!({
            "type": "read",
            "mbean": query.object_name,
            "attribute": query.attributes,
        });

        let mut request = self.http.post(&url).json(&body);
        if let Some(username) = &server.username {
            request = request.basic_auth(username, server.password.as_deref());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("querying {}", server.key()))?
            .error_for_status()
            .with_context(|| format!("querying {}", server.key()))?;
        let payload: Value = response
            .json()
            .await
            .with_context(|| format!("decoding response from {}", server.key()))?;

        let status = payload.get("status").and_then(Value::as_i64).unwrap_or(0);
        if status != 200 {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(anyhow!(
                "{} returned status {} for {}: {}",
                server.key(),
                status,
                query.object_name,
                error
            ));
        }

        let timestamp_ms = payload
            .get("timestamp")
            .and_then(Value::as_i64)
            .map(|secs| secs * 1000)
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let value = payload
            .get("value")
            .ok_or_else(|| anyhow!("response from {} has no value", server.key()))?;
        let results = flatten_values(query, value, timestamp_ms);
        debug!(
            server = %server.key(),
            query = %query.object_name,
            samples = results.len(),
            "query complete"
        );
        Ok(results)
    }
}

/// Turn a Jolokia `read` value payload into flat numeric samples. Composite
/// attribute values are expanded one level; the query's `keys` filter, when
/// non-empty, picks which composite entries survive. Non-numeric leaves are
/// skipped.
fn flatten_values(query: &Query, value: &Value, timestamp_ms: i64) -> Vec<QueryResult> {
    let mut results = Vec::new();
    for attribute in &query.attributes {
        let Some(attr_value) = value.get(attribute) else {
            continue;
        };
        match attr_value {
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    results.push(QueryResult {
                        attribute: attribute.clone(),
                        key: None,
                        value: v,
                        timestamp_ms,
                    });
                }
            }
            Value::Object(map) => {
                for (key, entry) in map {
                    if !query.keys.is_empty() && !query.keys.iter().any(|k| k == key) {
                        continue;
                    }
                    if let Some(v) = entry.as_f64() {
                        results.push(QueryResult {
                            attribute: attribute.clone(),
                            key: Some(key.clone()),
                            value: v,
                            timestamp_ms,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    results
}
