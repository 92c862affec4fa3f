use crate::{env, env_or};
use futures_util::StreamExt;
use medpipe_core::{
    Error, GenerationBackend, GenerationRequest, Result, TokenStream,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

/// OpenAI-compatible chat-completions client (OpenRouter by default).
///
/// The model id comes from the per-request `GenerationRequest` so one client
/// serves an entire fallback chain.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let base_url = env_or("MEDPIPE_OPENROUTER_BASE_URL", "OPENROUTER_BASE_URL")
            .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string());
        let api_key = env_or("MEDPIPE_OPENROUTER_API_KEY", "OPENROUTER_API_KEY");
        if api_key.is_none() && env("MEDPIPE_ALLOW_KEYLESS_LLM").is_none() {
            return Err(Error::NotConfigured(
                "missing MEDPIPE_OPENROUTER_API_KEY (or OPENROUTER_API_KEY)".to_string(),
            ));
        }
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn endpoint_chat_completions(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }
        rb
    }
}

/// Some hosted models (Gemma family) reject a system/developer role; for
/// those the instruction is folded into the user turn instead.
pub fn supports_system_role(model: &str) -> bool {
    !model.starts_with("google/gemma")
}

fn build_messages(req: &GenerationRequest) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut user_text = req.user.clone();
    match &req.system {
        Some(system) if supports_system_role(&req.model) => {
            messages.push(Message {
                role: "system".to_string(),
                content: MessageContent::Text(system.clone()),
            });
        }
        Some(system) => {
            user_text = format!("{system}\n\n{user_text}");
        }
        None => {}
    }

    let content = match &req.image {
        Some(img) => MessageContent::Blocks(vec![
            ContentBlock::Text { text: user_text },
            ContentBlock::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", img.mime, img.base64_data),
                },
            },
        ]),
        None => MessageContent::Text(user_text),
    };
    messages.push(Message {
        role: "user".to_string(),
        content,
    });
    messages
}

fn wire_request(req: &GenerationRequest, stream: bool) -> ChatCompletionsRequest {
    ChatCompletionsRequest {
        model: req.model.clone(),
        messages: build_messages(req),
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        stream: Some(stream),
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_data_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|s| !s.is_empty())
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Ignore),
        Err(_) => SseLine::Ignore,
    }
}

#[async_trait::async_trait]
impl GenerationBackend for OpenAiCompatClient {
    async fn generate(&self, req: &GenerationRequest) -> Result<String> {
        let resp = self
            .request_builder()
            .timeout(std::time::Duration::from_millis(req.timeout_ms))
            .json(&wire_request(req, false))
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("chat.completions HTTP {status}")));
        }
        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Llm("chat.completions returned no choices".to_string()))
    }

    async fn generate_stream(&self, req: &GenerationRequest) -> Result<TokenStream> {
        let resp = self
            .request_builder()
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .timeout(std::time::Duration::from_millis(req.timeout_ms))
            .json(&wire_request(req, true))
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!(
                "chat.completions stream HTTP {status}"
            )));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String>>(32);
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut buf = String::new();
            'outer: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Llm(e.to_string()))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].to_string();
                    buf.drain(..=pos);
                    match parse_sse_data_line(&line) {
                        SseLine::Delta(text) => {
                            // A closed receiver means the caller went away;
                            // stop reading so the HTTP call is dropped too.
                            if tx.send(Ok(text)).await.is_err() {
                                break 'outer;
                            }
                        }
                        SseLine::Done => break 'outer,
                        SseLine::Ignore => {}
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
