// src/llm/client.rs

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::BackendError;
use crate::llm::prompt::LlmPrompt;

const BODY_EXCERPT: usize = 300;

/// Providers reached over HTTP. `command` backends never get here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProvider {
    OpenAI,
    Anthropic,
    Gemini,
    Ollama,
}

/// HTTP-backed generator for the hosted providers and a local Ollama.
///
/// `base_url`, when set, is the complete endpoint URL and replaces the
/// provider default as is. Nothing is appended to it.
#[derive(Debug, Clone)]
pub struct LlmClient {
    provider: HttpProvider,
    model: String,
    api_key: Option<String>,
    base_url: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl LlmClient {
    pub fn new(
        provider: HttpProvider,
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            provider,
            model,
            api_key,
            base_url,
            max_tokens,
            temperature,
        }
    }

    /// One request, no retries. `timeout` bounds the whole exchange.
    pub fn run(&self, prompt: &LlmPrompt, timeout: Duration) -> Result<String, BackendError> {
        let (url, headers, body) = self.build_request(prompt);

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let mut req = client.post(&url).json(&body);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(status_error(status, &text));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::Malformed(format!("invalid JSON: {e}")))?;

        let out = extract_text(self.provider, &json)?;
        if out.trim().is_empty() {
            return Err(BackendError::Malformed("empty completion".into()));
        }
        Ok(out)
    }

    fn build_request(&self, prompt: &LlmPrompt) -> (String, Vec<(&'static str, String)>, Value) {
        let key = self.api_key.clone().unwrap_or_default();

        match self.provider {
            HttpProvider::OpenAI => {
                let url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".into());

                let body = json!({
                    "model": self.model,
                    "messages": [
                        { "role": "system", "content": prompt.system },
                        { "role": "user", "content": prompt.user }
                    ],
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                });

                (url, vec![("Authorization", format!("Bearer {key}"))], body)
            }

            HttpProvider::Anthropic => {
                let url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".into());

                let body = json!({
                    "model": self.model,
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                    "system": prompt.system,
                    "messages": [
                        { "role": "user", "content": prompt.user }
                    ]
                });

                (
                    url,
                    vec![("x-api-key", key), ("anthropic-version", "2023-06-01".into())],
                    body,
                )
            }

            HttpProvider::Gemini => {
                let url = self.base_url.clone().unwrap_or_else(|| {
                    format!(
                        "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
                        self.model
                    )
                });

                let body = json!({
                    "systemInstruction": { "parts": [{ "text": prompt.system }] },
                    "contents": [
                        { "role": "user", "parts": [{ "text": prompt.user }] }
                    ],
                    "generationConfig": {
                        "maxOutputTokens": self.max_tokens,
                        "temperature": self.temperature,
                    }
                });

                (url, vec![("x-goog-api-key", key)], body)
            }

            HttpProvider::Ollama => {
                let url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434/api/generate".into());

                let body = json!({
                    "model": self.model,
                    "system": prompt.system,
                    "prompt": prompt.user,
                    "stream": false,
                    "options": {
                        "num_predict": self.max_tokens,
                        "temperature": self.temperature,
                    }
                });

                (url, Vec::new(), body)
            }
        }
    }
}

fn status_error(status: u16, body: &str) -> BackendError {
    let excerpt: String = body.chars().take(BODY_EXCERPT).collect();
    match status {
        401 | 403 => BackendError::Auth(format!("HTTP {status}: {excerpt}")),
        _ => BackendError::Rejected(format!("HTTP {status}: {excerpt}")),
    }
}

fn extract_text(provider: HttpProvider, v: &Value) -> Result<String, BackendError> {
    match provider {
        HttpProvider::OpenAI => v
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| BackendError::Malformed("OpenAI response parse failure".into())),

        HttpProvider::Anthropic => v
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| BackendError::Malformed("Anthropic response parse failure".into())),

        HttpProvider::Gemini => {
            if let Some(reason) = v.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
                return Err(BackendError::Rejected(format!("prompt blocked: {reason}")));
            }

            v.pointer("/candidates/0/content/parts")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<String>()
                })
                .filter(|s| !s.is_empty())
                .ok_or_else(|| BackendError::Malformed("Gemini response parse failure".into()))
        }

        HttpProvider::Ollama => v
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| BackendError::Malformed("Ollama response parse failure".into())),
    }
}
