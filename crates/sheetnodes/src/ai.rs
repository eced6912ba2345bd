use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sheetcore::services::{AiError, AiGateway, CompletionRequest};
use sheetcore::{Config, NodeContext, NodeError, NodeHandler, NodeOutput, NodeType};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_SYSTEM: &str =
    "You are a data analyst. Answer using only the table data provided.";
/// Rows included in the prompt
const SAMPLE_ROWS: usize = 50;

/// Sends a prompt, plus a sample of the input table, to an AI provider
pub struct AiAnalysisHandler {
    gateway: Option<Arc<dyn AiGateway>>,
}

impl AiAnalysisHandler {
    pub fn new(gateway: Option<Arc<dyn AiGateway>>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl NodeHandler for AiAnalysisHandler {
    fn node_type(&self) -> NodeType {
        NodeType::AiAnalysis
    }

    fn description(&self) -> &str {
        "Ask an AI model about the input table"
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        match config.get("prompt").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() => Ok(()),
            _ => Err(NodeError::config("Missing config: prompt")),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| NodeError::config("No AI provider is configured"))?;

        let setting = |key: &str, default: &str| {
            ctx.config
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let mut prompt = ctx.require_config_str("prompt")?.to_string();

        if let Some(Value::Array(rows)) = ctx.inputs.get("data") {
            let sample = &rows[..rows.len().min(SAMPLE_ROWS)];
            let table = serde_json::to_string(sample)
                .map_err(|e| NodeError::fatal(format!("Cannot encode input rows: {}", e)))?;
            prompt.push_str(&format!(
                "\n\nData ({} of {} rows):\n{}",
                sample.len(),
                rows.len(),
                table
            ));
        }

        let request = CompletionRequest {
            provider: setting("provider", DEFAULT_PROVIDER),
            model: setting("model", DEFAULT_MODEL),
            system_message: setting("system_message", DEFAULT_SYSTEM),
            prompt,
        };
        ctx.events
            .info(format!("Calling {} / {}", request.provider, request.model));

        let text = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            result = gateway.complete(request) => result?,
        };
        Ok(NodeOutput::Text { text })
    }
}

/// OpenAI-compatible chat completions endpoint
pub struct HttpAiGateway {
    client: reqwest::Client,
    provider: String,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl HttpAiGateway {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            provider: provider.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Gateway for api.openai.com using `OPENAI_API_KEY`
    pub fn openai_from_env() -> Option<Self> {
        let key = std::env::var("OPENAI_API_KEY").ok()?;
        Some(Self::new("openai", "https://api.openai.com/v1", key))
    }
}

#[async_trait]
impl AiGateway for HttpAiGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<String, AiError> {
        if request.provider != self.provider {
            return Err(AiError::UnsupportedProvider(request.provider));
        }

        let body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system_message},
                {"role": "user", "content": request.prompt},
            ],
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(AiError::Transient(format!("provider returned {}", status)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AiError::Rejected(format!("{}: {}", status, detail)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AiError::Transient(format!("unreadable response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AiError::Rejected("response contained no answer".into()))
    }
}
