//! Remote model provider: embeddings and streamed generation over HTTP.
//!
//! The engine consumes two operations from the provider, `embed` and
//! `generate`, behind the [`ModelProvider`] trait so tests can substitute
//! a stub. The HTTP implementation speaks a Gemini-style API: content parts
//! in, `candidates[0].content.parts[0].text` out, with a trailing
//! `usageMetadata` object on generation streams.
//!
//! Streaming bodies arrive in any of three framings: a JSON array of chunk
//! objects, a single object, or newline-delimited objects optionally
//! prefixed with `data: `. [`StreamParser`] normalizes all three by
//! extracting complete top-level JSON objects from a rolling buffer.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_output_tokens: 1024,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub candidate_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub enum GenerationChunk {
    Text(String),
    Usage(TokenUsage),
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Embed a single text into a dense vector of [`Self::dimension`] floats.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate a complete response (used by hypothetical-document retrieval).
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String>;

    /// Generate a streamed response; fragments arrive in order and the
    /// stream may end with a usage chunk. Cancelling stops the stream.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<GenerationChunk>>>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

pub struct HttpProvider {
    embed_client: Client,
    generate_client: Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "provider API key is not set (RAG_PROVIDER_API_KEY)".to_string(),
            ));
        }
        let embed_client = Client::builder().timeout(config.embed_timeout).build()?;
        let generate_client = Client::builder().timeout(config.generate_timeout).build()?;
        Ok(Self {
            embed_client,
            generate_client,
            config,
        })
    }

    fn embed_url(&self) -> String {
        format!(
            "{}/models/{}:embedContent",
            self.config.base_url, self.config.embedding_model
        )
    }

    fn generate_url(&self, streaming: bool) -> String {
        let op = if streaming {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!(
            "{}/models/{}:{}",
            self.config.base_url, self.config.generation_model, op
        )
    }

    fn generation_body(prompt: &str, options: &GenerationOptions) -> Value {
        serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_output_tokens,
            },
        })
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({ "content": { "parts": [{ "text": text }] } });
        let response = self
            .embed_client
            .post(self.embed_url())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let value: Value = response.json().await?;
        parse_embedding(&value)
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let response = self
            .generate_client
            .post(self.generate_url(false))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&Self::generation_body(prompt, options))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let value: Value = response.json().await?;
        extract_text(&value)
            .ok_or_else(|| Error::Parse("generation response carried no text".to_string()))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
        let response = self
            .generate_client
            .post(self.generate_url(true))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&Self::generation_body(prompt, options))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let (tx, rx) = mpsc::channel::<Result<GenerationChunk>>(32);
        tokio::spawn(async move {
            let mut parser = StreamParser::new();
            let mut body = response.bytes_stream();
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = body.next() => item,
                };
                let bytes = match item {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(Error::Network(e.to_string()))).await;
                        break;
                    }
                    None => break,
                };
                for value in parser.feed(&String::from_utf8_lossy(&bytes)) {
                    if let Some(text) = extract_text(&value) {
                        if !text.is_empty()
                            && tx.send(Ok(GenerationChunk::Text(text))).await.is_err()
                        {
                            return;
                        }
                    }
                    if let Some(usage) = extract_usage(&value) {
                        if tx.send(Ok(GenerationChunk::Usage(usage))).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.config.generation_model
    }
}

/// Map an HTTP status to the engine's retryable/terminal split: throttling
/// and server-side failures may be retried, other client errors may not.
fn classify_status(status: u16, body: String) -> Error {
    if status == 429 || status >= 500 {
        Error::ProviderUnavailable(format!("{}: {}", status, truncate(&body, 512)))
    } else {
        Error::Provider {
            status,
            body: truncate(&body, 512),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

fn parse_embedding(value: &Value) -> Result<Vec<f32>> {
    let values = value
        .get("embedding")
        .and_then(|e| e.get("values"))
        .or_else(|| value.get("embedding"))
        .or_else(|| value.get("values"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::Parse("embedding response carried no values".to_string()))?;
    Ok(values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Text of the first candidate's first part, if present.
pub fn extract_text(value: &Value) -> Option<String> {
    value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(|s| s.to_string())
}

/// Usage metadata, tolerating both camelCase and snake_case field names.
pub fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let meta = value
        .get("usageMetadata")
        .or_else(|| value.get("usage_metadata"))?;
    let read = |camel: &str, snake: &str| -> u64 {
        meta.get(camel)
            .or_else(|| meta.get(snake))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    Some(TokenUsage {
        prompt_tokens: read("promptTokenCount", "prompt_tokens"),
        candidate_tokens: read("candidatesTokenCount", "candidate_tokens"),
        total_tokens: read("totalTokenCount", "total_tokens"),
    })
}

/// Incremental extractor of complete top-level JSON objects.
///
/// Tolerates array framing (`[`, `,`, `]` between objects), SSE-style
/// `data: ` prefixes, and objects split across network reads.
pub struct StreamParser {
    buf: String,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Append raw body text, returning every newly completed JSON object.
    pub fn feed(&mut self, data: &str) -> Vec<Value> {
        self.buf.push_str(data);
        let mut out = Vec::new();
        loop {
            let Some(start) = self.buf.find('{') else {
                // Nothing object-like buffered. Keep a short tail in case a
                // "data: " prefix is split across reads.
                if self.buf.len() > 16 {
                    let keep = self.buf.len() - 16;
                    self.buf.drain(..keep);
                }
                break;
            };
            match complete_object_end(&self.buf[start..]) {
                Some(len) => {
                    let object = &self.buf[start..start + len];
                    if let Ok(value) = serde_json::from_str::<Value>(object) {
                        out.push(value);
                    } else {
                        tracing::warn!("discarding malformed stream object ({} bytes)", len);
                    }
                    self.buf.drain(..start + len);
                }
                None => {
                    // Incomplete object; wait for more data.
                    self.buf.drain(..start);
                    break;
                }
            }
        }
        out
    }
}

/// Byte length of the complete JSON object starting at `s[0] == '{'`,
/// or `None` if the object is still incomplete.
fn complete_object_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
