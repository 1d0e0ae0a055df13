use super::prompt::SYSTEM_PROMPT;
use super::PatchBackend;
use crate::util::truncate;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const ERROR_DETAIL_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelClientError {
    #[error("model request timed out after {after_secs}s")]
    Timeout { after_secs: u64 },
    #[error("model endpoint returned HTTP {status}: {detail}")]
    HttpStatus { status: u16, detail: String },
    #[error("model endpoint rejected credentials (HTTP {status})")]
    AuthFailure { status: u16 },
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model response malformed: {0}")]
    MalformedResponse(String),
    #[error("invalid model endpoint: {0}")]
    InvalidEndpoint(String),
}

impl ModelClientError {
    /// Timeouts, throttling, server errors and connection failures are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelClientError::Timeout { .. } | ModelClientError::Transport(_) => true,
            ModelClientError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ModelClientError::Timeout { .. } => "timeout",
            ModelClientError::HttpStatus { status: 429, .. } => "rate_limited",
            ModelClientError::HttpStatus { status, .. } if *status >= 500 => "server_error",
            ModelClientError::HttpStatus { .. } => "http_status",
            ModelClientError::AuthFailure { .. } => "auth_failure",
            ModelClientError::Transport(_) => "transport",
            ModelClientError::MalformedResponse(_) => "malformed_response",
            ModelClientError::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }
}

/// Append the chat completions path unless `endpoint` already ends in it.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, ModelClientError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ModelClientError::InvalidEndpoint("endpoint is required".to_string()));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|e| ModelClientError::InvalidEndpoint(format!("{}: {}", trimmed, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ModelClientError::InvalidEndpoint(format!(
            "{}: scheme must be http or https",
            trimmed
        )));
    }
    if trimmed.ends_with(CHAT_COMPLETIONS_PATH) {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{}{}", trimmed, CHAT_COMPLETIONS_PATH))
    }
}

#[derive(Debug, Clone)]
pub struct ModelClientOptions {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_base: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<MessageContent>,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

pub struct ModelClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    retries: u32,
    backoff_base: Duration,
}

impl ModelClient {
    pub fn new(options: ModelClientOptions) -> Result<Self, ModelClientError> {
        let endpoint = normalize_endpoint(&options.endpoint)?;
        let http = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| ModelClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            model: options.model,
            api_key: options.api_key,
            timeout: options.timeout,
            retries: options.retries,
            backoff_base: options.backoff_base,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Delay before retry number `retry` (zero-based).
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(MAX_BACKOFF)
    }

    fn send_once(&self, prompt: &str) -> Result<String, (ModelClientError, Option<Duration>)> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
        };
        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().map_err(|e| (self.transport_error(e), None))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().map_err(|e| (self.transport_error(e), None))?;

        if status.is_success() {
            return extract_content(&body).map_err(|e| (e, None));
        }
        let code = status.as_u16();
        let err = if code == 401 || code == 403 {
            ModelClientError::AuthFailure { status: code }
        } else {
            ModelClientError::HttpStatus {
                status: code,
                detail: truncate(body.trim(), ERROR_DETAIL_MAX_CHARS),
            }
        };
        let hint = retry_after.or_else(|| parse_retry_after(&body).map(Duration::from_secs));
        Err((err, hint))
    }

    fn transport_error(&self, err: reqwest::Error) -> ModelClientError {
        if err.is_timeout() {
            ModelClientError::Timeout {
                after_secs: self.timeout.as_secs(),
            }
        } else {
            ModelClientError::Transport(err.to_string())
        }
    }
}

impl PatchBackend for ModelClient {
    fn request_patch(&self, prompt: &str) -> Result<String, ModelClientError> {
        let mut retry = 0;
        loop {
            match self.send_once(prompt) {
                Ok(content) => return Ok(content),
                Err((err, hint)) => {
                    if !err.is_transient() || retry >= self.retries {
                        return Err(err);
                    }
                    let delay = hint.unwrap_or_else(|| self.backoff(retry)).min(MAX_BACKOFF);
                    tracing::warn!(
                        error = %err,
                        retry = retry + 1,
                        of = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        "transient model failure, backing off"
                    );
                    thread::sleep(delay);
                    retry += 1;
                }
            }
        }
    }
}

fn extract_content(body: &str) -> Result<String, ModelClientError> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        ModelClientError::MalformedResponse(format!(
            "{}: {}",
            e,
            truncate(body, ERROR_DETAIL_MAX_CHARS)
        ))
    })?;
    parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelClientError::MalformedResponse("missing 'choices'".to_string()))?
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| ModelClientError::MalformedResponse("missing 'message.content'".to_string()))
}

/// Pull a "retry after N seconds" hint out of an error body.
fn parse_retry_after(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    let pos = lower.find("retry")?;
    lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| word.trim_matches(|c: char| !c.is_ascii_digit()).parse::<u64>().ok())
        .find(|secs| *secs > 0 && *secs < 300)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    /// Serve one canned response per connection and return the request bodies.
    fn serve(responses: Vec<String>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut bodies = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    let lower = line.to_ascii_lowercase();
                    if let Some(value) = lower.strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                let mut body = vec![0u8; content_length];
                reader.read_exact(&mut body).unwrap();
                bodies.push(String::from_utf8(body).unwrap());
                stream.write_all(response.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
            bodies
        });
        (format!("http://{}", addr), handle)
    }

    fn http(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn client(endpoint: &str, retries: u32) -> ModelClient {
        ModelClient::new(ModelClientOptions {
            endpoint: endpoint.to_string(),
            model: "proposer-model".to_string(),
            api_key: Some("test-key".to_string()),
            timeout: Duration::from_secs(5),
            retries,
            backoff_base: Duration::from_millis(1),
        })
        .unwrap()
    }

    const OK_BODY: &str = r#"{"choices":[{"message":{"role":"assistant","content":"[{\"op\":\"remove\",\"path\":\"/spec/hostNetwork\"}]"}}]}"#;

    #[test]
    fn normalizes_endpoints() {
        assert_eq!(
            normalize_endpoint("http://localhost:8000/").unwrap(),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(
            normalize_endpoint("https://api.example.com/v1/chat/completions").unwrap(),
            "https://api.example.com/v1/chat/completions"
        );
        assert!(normalize_endpoint("ftp://example.com").is_err());
        assert!(normalize_endpoint("").is_err());
    }

    #[test]
    fn returns_message_content_and_sends_system_prompt() {
        let (url, server) = serve(vec![http("200 OK", OK_BODY)]);
        let content = client(&url, 0).request_patch("fix it").unwrap();
        assert!(content.contains("/spec/hostNetwork"));
        let bodies = server.join().unwrap();
        let request: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(request["messages"][0]["content"], SYSTEM_PROMPT);
        assert_eq!(request["messages"][1]["content"], "fix it");
        assert_eq!(request["temperature"], 0.0);
    }

    #[test]
    fn retries_server_errors_then_succeeds() {
        let (url, server) = serve(vec![
            http("503 Service Unavailable", "{}"),
            http("429 Too Many Requests", "{}"),
            http("200 OK", OK_BODY),
        ]);
        assert!(client(&url, 2).request_patch("p").is_ok());
        assert_eq!(server.join().unwrap().len(), 3);
    }

    #[test]
    fn auth_failure_is_not_retried() {
        let (url, server) = serve(vec![http("401 Unauthorized", r#"{"error":"bad key"}"#)]);
        let err = client(&url, 3).request_patch("p").unwrap_err();
        assert_eq!(err, ModelClientError::AuthFailure { status: 401 });
        assert!(!err.is_transient());
        assert_eq!(server.join().unwrap().len(), 1);
    }

    #[test]
    fn exhausted_retries_return_last_error() {
        let (url, server) = serve(vec![
            http("500 Internal Server Error", "boom"),
            http("502 Bad Gateway", "down"),
        ]);
        let err = client(&url, 1).request_patch("p").unwrap_err();
        assert_eq!(err.category(), "server_error");
        assert!(matches!(err, ModelClientError::HttpStatus { status: 502, .. }));
        server.join().unwrap();
    }

    #[test]
    fn missing_choices_is_malformed() {
        assert!(matches!(
            extract_content(r#"{"choices":[]}"#),
            Err(ModelClientError::MalformedResponse(_))
        ));
        assert!(matches!(extract_content("not json"), Err(ModelClientError::MalformedResponse(_))));
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let c = ModelClient::new(ModelClientOptions {
            endpoint: "http://localhost:1".to_string(),
            model: "m".to_string(),
            api_key: None,
            timeout: Duration::from_secs(1),
            retries: 0,
            backoff_base: Duration::from_millis(500),
        })
        .unwrap();
        assert_eq!(c.backoff(0), Duration::from_millis(500));
        assert_eq!(c.backoff(2), Duration::from_millis(2000));
        assert_eq!(c.backoff(20), MAX_BACKOFF);
    }

    #[test]
    fn parses_retry_hint_from_body() {
        assert_eq!(parse_retry_after("Rate limited. Retry after 7 seconds"), Some(7));
        assert_eq!(parse_retry_after("no hint"), None);
    }
}
