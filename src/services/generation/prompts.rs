// Prompt expansion through an OpenAI-compatible chat completions API
// Each theme gets its share of the requested count; short replies are
// topped up with follow-up requests for the remainder.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::PromptExpander;
use crate::core::errors::PromptError;
use crate::core::types::GenerationRequest;

/// Retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY_MS: u64 = 1000;
const MAX_RETRY_DELAY_MS: u64 = 10000;

/// Follow-up requests allowed per theme before giving up on a short quota
const MAX_TOP_UP_ROUNDS: usize = 5;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiPromptExpander {
    api_key: String,
    http_client: reqwest::Client,
    model: String,
    endpoint: String,
    initial_retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptList {
    #[serde(rename = "Prompts")]
    prompts: Vec<String>,
}

impl OpenAiPromptExpander {
    pub fn new(api_key: String, model: String) -> Result<Self, PromptError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            api_key,
            http_client,
            model,
            endpoint: OPENAI_API_URL.to_string(),
            initial_retry_delay: Duration::from_millis(INITIAL_RETRY_DELAY_MS),
        })
    }

    /// Point at a different OpenAI-compatible endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// First backoff delay; doubled per retry up to the cap
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    fn messages(theme: &str, count: usize) -> Vec<ChatMessage> {
        let system = format!(
            "You are a prompt engineering assistant with a focus on optimizing prompts for \
             generating high-quality images. You will be given a theme and a number of prompts, \
             and you must return JSON with exactly {count} enhanced prompts. Each prompt should \
             include every word of the original theme and have 15-25 words. Make each prompt \
             more specific, unique, and detailed than the theme so the designs are vivid and \
             visually appealing. Return only valid JSON with this structure: \
             {{\"Prompts\": [\"Prompt1\", \"Prompt2\", ..., \"Prompt{count}\"]}}"
        );

        vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: format!("Theme: ['{}'], NumberOfPrompts: {}", theme, count),
            },
        ]
    }

    /// One chat completion with backoff on transport errors, 429 and 5xx.
    async fn complete(&self, theme: &str, count: usize) -> Result<String, PromptError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: Self::messages(theme, count),
            temperature: 0.7,
        };

        let mut retry_delay_ms = self.initial_retry_delay.as_millis() as u64;
        let mut attempt = 0;

        let response = loop {
            if attempt > 0 {
                warn!("Prompt expansion: retry {} after {}ms", attempt, retry_delay_ms);
                tokio::time::sleep(Duration::from_millis(retry_delay_ms)).await;
                retry_delay_ms = (retry_delay_ms * 2).min(MAX_RETRY_DELAY_MS);
            }

            let send_result = self
                .http_client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await;

            let response = match send_result {
                Ok(resp) => resp,
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < MAX_RETRIES => {
                    error!("Prompt expansion: request failed (attempt {}): {}", attempt + 1, e);
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if (status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS)
                && attempt < MAX_RETRIES
            {
                error!("Prompt expansion: upstream status {} (attempt {})", status, attempt + 1);
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PromptError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            break response.json::<ChatCompletionResponse>().await?;
        };

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PromptError::InvalidResponse("empty completion".to_string()))
    }
}

#[async_trait]
impl PromptExpander for OpenAiPromptExpander {
    #[instrument(skip(self, request), fields(themes = request.themes.len(), total = request.total))]
    async fn expand(&self, request: &GenerationRequest) -> Result<Vec<String>, PromptError> {
        if request.themes.is_empty() {
            return Err(PromptError::NoThemes);
        }

        let mut expanded = Vec::with_capacity(request.total);
        for (theme, quota) in request.per_theme_counts() {
            let mut theme_prompts: Vec<String> = Vec::with_capacity(quota);
            let mut rounds = 0;

            while theme_prompts.len() < quota {
                if rounds == MAX_TOP_UP_ROUNDS {
                    return Err(PromptError::InvalidResponse(format!(
                        "theme '{}': {} of {} prompts after {} requests",
                        theme,
                        theme_prompts.len(),
                        quota,
                        rounds
                    )));
                }
                rounds += 1;

                let remaining = quota - theme_prompts.len();
                debug!("Requesting {} prompts for theme '{}'", remaining, theme);

                let content = self.complete(theme, remaining).await?;
                let mut prompts = parse_prompt_list(&content)?;
                prompts.truncate(remaining);
                theme_prompts.extend(prompts);
            }

            expanded.extend(theme_prompts);
        }

        info!("Expanded {} themes into {} prompts", request.themes.len(), expanded.len());
        Ok(expanded)
    }
}

/// Used when no API key is configured: themes are cycled verbatim.
pub struct PassthroughExpander;

#[async_trait]
impl PromptExpander for PassthroughExpander {
    async fn expand(&self, request: &GenerationRequest) -> Result<Vec<String>, PromptError> {
        if request.themes.is_empty() {
            return Err(PromptError::NoThemes);
        }

        Ok(request
            .per_theme_counts()
            .into_iter()
            .flat_map(|(theme, count)| std::iter::repeat(theme.to_string()).take(count))
            .collect())
    }
}

/// Parse `{"Prompts": [...]}`, repairing a truncated reply once.
pub fn parse_prompt_list(content: &str) -> Result<Vec<String>, PromptError> {
    match serde_json::from_str::<PromptList>(content) {
        Ok(list) => Ok(list.prompts),
        Err(first) => {
            warn!("Prompt reply is not valid JSON ({}), attempting repair", first);
            let repaired = repair_truncated_json(content);
            serde_json::from_str::<PromptList>(&repaired)
                .map(|list| list.prompts)
                .map_err(|e| PromptError::InvalidResponse(format!("{} in {:?}", e, content)))
        }
    }
}

/// Strip trailing commas/whitespace and close whatever brackets a cut-off
/// `{"Prompts": [...` reply left open.
pub fn repair_truncated_json(response: &str) -> String {
    let mut fixed = response
        .trim_end_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string();

    if fixed.ends_with('[') {
        fixed.push(']');
    } else if fixed.ends_with('{') {
        fixed.push('}');
    } else if fixed.contains(']') {
        fixed.push('}');
    } else if fixed.contains('}') {
        fixed.push(']');
    } else {
        fixed.push_str("]}");
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_valid_reply() {
        let prompts = parse_prompt_list(r#"{"Prompts": ["a b c", "d e f"]}"#).unwrap();
        assert_eq!(prompts, vec!["a b c", "d e f"]);
    }

    #[test]
    fn test_repair_truncated_reply() {
        let truncated = "{\"Prompts\": [\"a neon koi fish\", \"a paper crane\",\n";
        assert_eq!(
            repair_truncated_json(truncated),
            "{\"Prompts\": [\"a neon koi fish\", \"a paper crane\"]}"
        );
        assert_eq!(parse_prompt_list(truncated).unwrap().len(), 2);

        assert_eq!(repair_truncated_json("{\"Prompts\": [\"x\"]"), "{\"Prompts\": [\"x\"]}");
    }

    #[test]
    fn test_unrepairable_reply() {
        assert!(matches!(
            parse_prompt_list("I cannot help with that"),
            Err(PromptError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_passthrough_splits_counts() {
        let request = GenerationRequest::new(vec!["cats".to_string(), "dogs".to_string()], 5);
        let prompts = PassthroughExpander.expand(&request).await.unwrap();
        assert_eq!(prompts, vec!["cats", "cats", "cats", "dogs", "dogs"]);
    }

    #[tokio::test]
    async fn test_no_themes_is_rejected() {
        let request = GenerationRequest::new(vec![], 3);
        assert!(matches!(
            PassthroughExpander.expand(&request).await,
            Err(PromptError::NoThemes)
        ));
    }

    mod stub {
        use axum::{extract::State, http::StatusCode, routing::post, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        pub type Reply = fn(usize) -> (StatusCode, String);

        #[derive(Clone)]
        struct Stub {
            calls: Arc<AtomicUsize>,
            reply: Reply,
        }

        async fn chat(State(stub): State<Stub>) -> (StatusCode, String) {
            let call = stub.calls.fetch_add(1, Ordering::SeqCst);
            (stub.reply)(call)
        }

        /// Serve a chat-completions endpoint; returns its URL and a call counter.
        pub async fn serve(reply: Reply) -> (String, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let app = Router::new()
                .route("/v1/chat/completions", post(chat))
                .with_state(Stub {
                    calls: calls.clone(),
                    reply,
                });

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{}/v1/chat/completions", addr), calls)
        }

        pub fn completion(prompts: &[&str]) -> (StatusCode, String) {
            let content = serde_json::json!({ "Prompts": prompts }).to_string();
            let body = serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": content } }]
            });
            (StatusCode::OK, body.to_string())
        }
    }

    async fn stubbed_expander(reply: stub::Reply) -> (OpenAiPromptExpander, Arc<AtomicUsize>) {
        let (endpoint, calls) = stub::serve(reply).await;
        let expander = OpenAiPromptExpander::new("test-key".to_string(), "gpt-test".to_string())
            .unwrap()
            .with_endpoint(endpoint)
            .with_retry_delay(Duration::from_millis(1));
        (expander, calls)
    }

    #[tokio::test]
    async fn test_short_reply_is_topped_up() {
        let (expander, calls) = stubbed_expander(|call| match call {
            0 => stub::completion(&["owl one"]),
            _ => stub::completion(&["owl two", "owl three", "owl four"]),
        })
        .await;

        let request = GenerationRequest::new(vec!["owls".to_string()], 3);
        let prompts = expander.expand(&request).await.unwrap();
        assert_eq!(prompts, vec!["owl one", "owl two", "owl three"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_top_up_rounds() {
        let (expander, calls) = stubbed_expander(|_| stub::completion(&[])).await;

        let request = GenerationRequest::new(vec!["owls".to_string()], 2);
        assert!(matches!(
            expander.expand(&request).await,
            Err(PromptError::InvalidResponse(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_TOP_UP_ROUNDS);
    }

    #[tokio::test]
    async fn test_backs_off_on_overload_and_server_errors() {
        let (expander, calls) = stubbed_expander(|call| match call {
            0 => (StatusCode::SERVICE_UNAVAILABLE, "busy".to_string()),
            1 => (StatusCode::TOO_MANY_REQUESTS, "slow down".to_string()),
            _ => stub::completion(&["owl one"]),
        })
        .await;

        let request = GenerationRequest::new(vec!["owls".to_string()], 1);
        assert_eq!(expander.expand(&request).await.unwrap(), vec!["owl one"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded_and_client_errors_are_not_retried() {
        let (expander, calls) =
            stubbed_expander(|_| (StatusCode::BAD_GATEWAY, "down".to_string())).await;
        let request = GenerationRequest::new(vec!["owls".to_string()], 1);
        assert!(matches!(
            expander.expand(&request).await,
            Err(PromptError::Status { status: 502, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES as usize + 1);

        let (expander, calls) =
            stubbed_expander(|_| (StatusCode::UNAUTHORIZED, "bad key".to_string())).await;
        assert!(matches!(
            expander.expand(&request).await,
            Err(PromptError::Status { status: 401, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
