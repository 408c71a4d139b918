//! Backend Client: invokes the Ollama-style generation API on a single
//! worker, with model-candidate rotation, a chat-endpoint fallback, and
//! cooperative abort (§4.11, §6, §7).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::errors::BackendError;
use crate::sentinel::{self, ModelChangeObserver};

const PROBE_NUM_GPU: u32 = 99;
const MIN_MEANINGFUL_RESPONSE_CHARS: usize = 2;

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    num_gpu: u32,
    f16_kv: bool,
    low_vram: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            num_predict: -1,
            stop: None,
            num_gpu: PROBE_NUM_GPU,
            f16_kv: true,
            low_vram: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize, Default)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Outcome of a successful `generate`/`chat` invocation.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub tokens: u32,
    pub duration_ms: u64,
}

/// Signal used by the Cancellation Manager to abort an in-flight HTTP call.
pub type AbortSignal = oneshot::Receiver<()>;

struct ModelState {
    candidates: Vec<String>,
    current_index: usize,
}

/// HTTP client wrapper for talking to backend workers, shared by every
/// worker's dispatcher.
pub struct BackendClient {
    client: reqwest::Client,
    model: Mutex<ModelState>,
    observer: Option<Arc<dyn ModelChangeObserver>>,
}

impl BackendClient {
    pub fn new(client: reqwest::Client, candidates: Vec<String>) -> Self {
        let candidates = if candidates.is_empty() {
            vec!["llama3".to_string()]
        } else {
            candidates
        };
        Self {
            client,
            model: Mutex::new(ModelState {
                candidates,
                current_index: 0,
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ModelChangeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current model name, as used for the next invocation.
    pub async fn current_model(&self) -> String {
        let state = self.model.lock().await;
        state.candidates[state.current_index].clone()
    }

    /// Switches to an explicit model name, resetting the rotation.
    pub async fn set_model(&self, name: &str) {
        let mut state = self.model.lock().await;
        if let Some(idx) = state.candidates.iter().position(|m| m == name) {
            state.current_index = idx;
        } else {
            state.candidates.insert(0, name.to_string());
            state.current_index = 0;
        }
    }

    async fn rotate_model(&self) -> Option<String> {
        let mut state = self.model.lock().await;
        if state.candidates.len() <= 1 {
            return None;
        }
        state.current_index = (state.current_index + 1) % state.candidates.len();
        Some(state.candidates[state.current_index].clone())
    }

    /// Queries `/api/tags` on `worker_id`, returning the advertised model
    /// names. Used by the benchmarker and health monitor.
    pub async fn list_models(&self, worker_id: &str) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", worker_id);
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                worker_id: worker_id.to_string(),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(BackendError::Http {
                worker_id: worker_id.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let body: TagsResponse = resp.json().await.unwrap_or_default();
        Ok(body.models.into_iter().map(|m| m.name).collect())
    }

    /// Issues a fixed probe generation request used by the benchmarker to
    /// derive a worker's TPS. Returns `(tokens, duration_ns)`.
    pub async fn probe(&self, worker_id: &str, prompt: &str) -> Result<(u64, u64), BackendError> {
        let body = GenerateRequest {
            model: &self.current_model().await,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                num_predict: 10,
                stop: None,
                num_gpu: PROBE_NUM_GPU,
                f16_kv: true,
                low_vram: false,
            },
        };

        let url = format!("{}/api/generate", worker_id);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                worker_id: worker_id.to_string(),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(BackendError::Http {
                worker_id: worker_id.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let parsed: GenerateResponse = resp.json().await.unwrap_or_default();
        match (parsed.eval_count, parsed.eval_duration) {
            (Some(tokens), Some(duration_ns)) if duration_ns > 0 => Ok((tokens, duration_ns)),
            _ => Err(BackendError::MalformedResponse {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    /// Issues the actual generation request for a routed prompt, with model
    /// rotation on 404, a chat-endpoint fallback on other non-2xx
    /// responses, and cooperative abort via `abort`.
    pub async fn generate(
        &self,
        worker_id: &str,
        prompt: &str,
        estimated_tokens: u32,
        mut abort: AbortSignal,
    ) -> Result<GenerateOutcome, BackendError> {
        let start = Instant::now();
        let mut retried_rotation = false;

        loop {
            let model = self.current_model().await;

            let options = GenerateOptions {
                num_predict: estimated_tokens.max(1) as i32,
                ..GenerateOptions::default()
            };

            let body = GenerateRequest {
                model: &model,
                prompt,
                stream: false,
                options,
            };
            let url = format!("{}/api/generate", worker_id);

            let send_fut = self.client.post(&url).json(&body).send();
            let resp = tokio::select! {
                result = send_fut => result.map_err(|e| BackendError::Transport {
                    worker_id: worker_id.to_string(),
                    source: e,
                })?,
                _ = &mut abort => {
                    return Err(BackendError::Cancelled { worker_id: worker_id.to_string() });
                }
            };

            if resp.status().as_u16() == 404 && !retried_rotation {
                if let Some(next_model) = self.rotate_model().await {
                    retried_rotation = true;
                    warn!(worker_id, next_model, "model 404, rotating candidate and retrying once");
                    if let Some(observer) = &self.observer {
                        observer.on_model_changed(&next_model, false).await;
                    }
                    continue;
                }
            }

            return if resp.status().is_success() {
                let duration_ms = start.elapsed().as_millis() as u64;
                let parsed: GenerateResponse = resp.json().await.unwrap_or_default();
                Ok(finalize_outcome(parsed.response, parsed.eval_count, duration_ms))
            } else {
                self.chat_fallback(worker_id, prompt, estimated_tokens, start).await
            };
        }
    }

    async fn chat_fallback(
        &self,
        worker_id: &str,
        prompt: &str,
        estimated_tokens: u32,
        start: Instant,
    ) -> Result<GenerateOutcome, BackendError> {
        let model = self.current_model().await;
        let options = GenerateOptions {
            num_predict: estimated_tokens.max(1) as i32,
            ..GenerateOptions::default()
        };
        let body = ChatRequest {
            model: &model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
            options,
        };
        let url = format!("{}/api/chat", worker_id);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                worker_id: worker_id.to_string(),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(BackendError::Http {
                worker_id: worker_id.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let parsed: ChatResponse = resp.json().await.unwrap_or_default();
        let text = parsed.message.and_then(|m| m.content);
        Ok(finalize_outcome(text, parsed.eval_count, duration_ms))
    }
}

fn finalize_outcome(text: Option<String>, tokens: Option<u64>, duration_ms: u64) -> GenerateOutcome {
    let trimmed = text.unwrap_or_default().trim().to_string();
    let text = if trimmed.chars().count() < MIN_MEANINGFUL_RESPONSE_CHARS {
        debug!("response too short or empty, substituting sentinel");
        sentinel::INSUFFICIENT_INFORMATION.to_string()
    } else {
        trimmed
    };
    GenerateOutcome {
        tokens: tokens.unwrap_or(0) as u32,
        text,
        duration_ms,
    }
}
