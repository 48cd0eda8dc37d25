//! Client for an OpenAI-compatible `chat/completions` endpoint that returns the
//! blog draft as a JSON object.

use std::time::Duration;

use async_trait::async_trait;
use calcblog_core::BlogError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Settings for the generative API. The model comes from the per-run settings row.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// `None` leaves the call without an explicit deadline.
    pub timeout_secs: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 4000,
            timeout_secs: None,
        }
    }
}

impl LlmConfig {
    /// Supported env vars: `LLM_ENDPOINT`, `LLM_API_KEY` (falls back to
    /// `OPENAI_API_KEY`), `LLM_TEMPERATURE`, `LLM_MAX_TOKENS`, `LLM_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: std::env::var("LLM_ENDPOINT").unwrap_or(defaults.endpoint),
            api_key: std::env::var("LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|k| !k.trim().is_empty()),
            temperature: std::env::var("LLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.temperature),
            max_tokens: std::env::var("LLM_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_tokens),
            timeout_secs: std::env::var("LLM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub model: String,
    pub system: String,
    pub user: String,
}

/// Fields the model is asked to return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedDraft {
    pub title: String,
    pub meta_title: String,
    pub meta_desc: String,
    pub content_md: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &PromptRequest) -> Result<GeneratedDraft, BlogError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionsClient {
    config: LlmConfig,
    client: Client,
}

impl ChatCompletionsClient {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder().gzip(true).brotli(true);
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|err| anyhow::anyhow!("building reqwest client: {err}"))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionsClient {
    async fn generate(&self, request: &PromptRequest) -> Result<GeneratedDraft, BlogError> {
        let body = ChatRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        debug!(model = %request.model, endpoint = %self.config.endpoint, "calling generation API");
        let mut call = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            call = call.bearer_auth(key);
        }
        let resp = call
            .send()
            .await
            .map_err(|err| BlogError::Upstream(format!("request failed: {err}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(300).collect();
            warn!(%status, body = %excerpt, "generation API returned an error status");
            return Err(BlogError::Upstream(format!("HTTP {status}: {excerpt}")));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|err| BlogError::MalformedResponse(format!("response body: {err}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BlogError::MalformedResponse("no message content".to_string()))?;
        parse_generated_draft(&content)
    }
}

/// Parse the message content, tolerating a fenced ```json block.
pub fn parse_generated_draft(content: &str) -> Result<GeneratedDraft, BlogError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    let draft: GeneratedDraft = serde_json::from_str(unfenced.trim())
        .map_err(|err| BlogError::MalformedResponse(format!("message content: {err}")))?;
    if draft.title.trim().is_empty() {
        return Err(BlogError::MalformedResponse("empty title".to_string()));
    }
    if draft.content_md.trim().is_empty() {
        return Err(BlogError::MalformedResponse("empty contentMd".to_string()));
    }
    Ok(draft)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Clone)]
    struct FakeApi {
        status: StatusCode,
        reply: serde_json::Value,
        seen: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>,
    }

    async fn completions(
        State(api): State<FakeApi>,
        headers: axum::http::HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        api.seen.lock().await.push((auth, body));
        (api.status, Json(api.reply.clone()))
    }

    async fn spawn_fake(api: FakeApi) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(api);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/v1/chat/completions")
    }

    fn request() -> PromptRequest {
        PromptRequest {
            model: "gpt-test".into(),
            system: "be json".into(),
            user: "write".into(),
        }
    }

    #[tokio::test]
    async fn success_parses_nested_json_content() {
        let content = serde_json::json!({
            "title": "Income Tax Explained",
            "metaTitle": "Income Tax",
            "metaDesc": "All about tax",
            "contentMd": "# Tax\n\nBody",
        })
        .to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let endpoint = spawn_fake(FakeApi {
            status: StatusCode::OK,
            reply: serde_json::json!({"choices": [{"message": {"role": "assistant", "content": content}}]}),
            seen: seen.clone(),
        })
        .await;

        let client = ChatCompletionsClient::new(LlmConfig {
            endpoint,
            api_key: Some("sk-test".into()),
            ..Default::default()
        })
        .expect("client");
        let draft = client.generate(&request()).await.expect("draft");
        assert_eq!(draft.title, "Income Tax Explained");
        assert!(draft.keywords.is_empty());

        let seen = seen.lock().await;
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["max_tokens"], 4000);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "write");
    }

    #[tokio::test]
    async fn non_success_status_is_upstream_error() {
        let endpoint = spawn_fake(FakeApi {
            status: StatusCode::TOO_MANY_REQUESTS,
            reply: serde_json::json!({"error": {"message": "slow down"}}),
            seen: Arc::new(Mutex::new(Vec::new())),
        })
        .await;
        let client = ChatCompletionsClient::new(LlmConfig {
            endpoint,
            ..Default::default()
        })
        .expect("client");
        let err = client.generate(&request()).await.unwrap_err();
        match err {
            BlogError::Upstream(msg) => assert!(msg.contains("429"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_choices_is_malformed() {
        let endpoint = spawn_fake(FakeApi {
            status: StatusCode::OK,
            reply: serde_json::json!({"choices": []}),
            seen: Arc::new(Mutex::new(Vec::new())),
        })
        .await;
        let client = ChatCompletionsClient::new(LlmConfig {
            endpoint,
            ..Default::default()
        })
        .expect("client");
        assert!(matches!(
            client.generate(&request()).await,
            Err(BlogError::MalformedResponse(_))
        ));
    }

    #[test]
    fn fenced_content_and_keywords_parse() {
        let draft = parse_generated_draft(
            "```json\n{\"title\":\"T\",\"metaTitle\":\"M\",\"metaDesc\":\"D\",\"contentMd\":\"C\",\"keywords\":[\"a\",\"b\"]}\n```",
        )
        .expect("draft");
        assert_eq!(draft.keywords, vec!["a", "b"]);
        assert!(matches!(
            parse_generated_draft("{\"title\":\"\",\"metaTitle\":\"\",\"metaDesc\":\"\",\"contentMd\":\"x\"}"),
            Err(BlogError::MalformedResponse(_))
        ));
        assert!(parse_generated_draft("not json").is_err());
    }
}
