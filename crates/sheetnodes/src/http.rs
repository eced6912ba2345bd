use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use sheetcore::{Config, NodeContext, NodeError, NodeHandler, NodeOutput, NodeType};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Calls an external HTTP endpoint.
///
/// Outputs `status`, `headers` and `body`; a JSON array body is also exposed
/// as `data` so it can feed table nodes.
pub struct HttpIntegrationHandler {
    client: reqwest::Client,
}

impl HttpIntegrationHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpIntegrationHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn method_of(config: &Config) -> Result<reqwest::Method, NodeError> {
    let method = config.get("method").and_then(Value::as_str).unwrap_or("GET");
    match method.to_uppercase().as_str() {
        "GET" => Ok(reqwest::Method::GET),
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "PATCH" => Ok(reqwest::Method::PATCH),
        "DELETE" => Ok(reqwest::Method::DELETE),
        _ => Err(NodeError::config(format!("Unsupported method: {}", method))),
    }
}

fn headers_of(config: &Config) -> Result<HeaderMap, NodeError> {
    let mut map = HeaderMap::new();
    let headers = match config.get("headers") {
        None | Some(Value::Null) => return Ok(map),
        Some(Value::Object(headers)) => headers,
        Some(_) => return Err(NodeError::config("Invalid headers: expected an object")),
    };
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| NodeError::config(format!("Invalid header name: {}", key)))?;
        let value = value
            .as_str()
            .and_then(|v| HeaderValue::from_str(v).ok())
            .ok_or_else(|| NodeError::config(format!("Invalid value for header {}", key)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Per-request timeout, `timeout_secs` in config
fn timeout_of(config: &Config) -> Result<u64, NodeError> {
    match config.get("timeout_secs") {
        None | Some(Value::Null) => Ok(DEFAULT_TIMEOUT_SECS),
        Some(value) => value
            .as_u64()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| NodeError::config("timeout_secs must be a positive integer")),
    }
}

fn parse_url(url: &str) -> Result<reqwest::Url, NodeError> {
    reqwest::Url::parse(url).map_err(|e| NodeError::config(format!("Invalid url {}: {}", url, e)))
}

#[async_trait]
impl NodeHandler for HttpIntegrationHandler {
    fn node_type(&self) -> NodeType {
        NodeType::HttpIntegration
    }

    fn description(&self) -> &str {
        "Make HTTP requests"
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        method_of(config)?;
        headers_of(config)?;
        timeout_of(config)?;
        if let Some(url) = config.get("url").and_then(Value::as_str) {
            parse_url(url)?;
        }
        Ok(())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = match ctx.inputs.get("url").and_then(Value::as_str) {
            Some(url) => url.to_string(),
            None => ctx.require_config_str("url")?.to_string(),
        };
        let method = method_of(&ctx.config)?;
        let headers = headers_of(&ctx.config)?;
        let target = parse_url(&url)?;
        let timeout = timeout_of(&ctx.config)?;
        ctx.events.info(format!("{} {}", method, url));

        let mut request = self
            .client
            .request(method.clone(), target)
            .headers(headers)
            .timeout(Duration::from_secs(timeout));
        if method != reqwest::Method::GET {
            let body = ctx.inputs.get("body").or_else(|| ctx.inputs.get("data"));
            match body {
                Some(Value::String(text)) => request = request.body(text.clone()),
                Some(json) => request = request.json(json),
                None => {}
            }
        }

        let response = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            response = request.send() => response.map_err(|e| {
                if e.is_timeout() {
                    NodeError::Timeout { seconds: timeout }
                } else {
                    NodeError::transient(format!("HTTP request failed: {}", e))
                }
            })?,
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(NodeError::transient(format!("{} returned {}", url, status)));
        }

        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::transient(format!("Failed to read response: {}", e)))?;
        ctx.events.info(format!("Response status: {}", status));

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let mut output = NodeOutput::ports()
            .with_port("status", status.as_u16())
            .with_port("headers", Value::Object(headers));
        if body.is_array() {
            output = output.with_port("data", body.clone());
        }
        Ok(output.with_port("body", body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheetcore::{ErrorKind, NodeEmitter, WorkflowRef};

    fn ctx() -> NodeContext {
        NodeContext::new(WorkflowRef::draft("http"), "call", NodeEmitter::detached("call"))
            .with_config("url", "http://127.0.0.1:9/never")
    }

    #[test]
    fn bad_headers_rejected_by_validation() {
        let mut config = Config::new();
        config.insert("headers".into(), json!({"bad header": "x"}));
        assert!(HttpIntegrationHandler::new().validate_config(&config).is_err());

        config.insert("headers".into(), json!({"x-trace": "line\nbreak"}));
        assert!(HttpIntegrationHandler::new().validate_config(&config).is_err());

        config.insert("headers".into(), json!({"x-trace": "abc"}));
        assert!(HttpIntegrationHandler::new().validate_config(&config).is_ok());

        config.insert("timeout_secs".into(), json!(0));
        assert!(HttpIntegrationHandler::new().validate_config(&config).is_err());
    }

    #[tokio::test]
    async fn bad_header_fails_without_retry() {
        let err = HttpIntegrationHandler::new()
            .execute(ctx().with_config("headers", json!({"bad header": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("bad header"));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_as_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts and never answers
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let err = HttpIntegrationHandler::new()
            .execute(
                ctx()
                    .with_config("url", format!("http://{}/slow", addr))
                    .with_config("timeout_secs", 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Timeout { seconds: 1 }));
        assert_eq!(err.kind(), ErrorKind::Transient);
        server.abort();
    }

    #[tokio::test]
    async fn bad_url_fails_without_retry() {
        let err = HttpIntegrationHandler::new()
            .execute(ctx().with_config("url", "not a url"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
