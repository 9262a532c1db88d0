//! Text-generation service seam.
//!
//! The pipeline only needs "prompt in, text out". `GeminiClient` speaks the
//! Gemini `generateContent` REST API over a blocking HTTP client; tests and
//! offline runs substitute their own `Generator`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("generation service rate limited the request (HTTP 429)")]
    RateLimited,
    #[error("generation service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed generation response: {0}")]
    Malformed(String),
    #[error("generation service returned no text")]
    Empty,
}

impl GenerationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GenerationError::Transport(e) if e.is_timeout())
    }
}

/// A single-prompt text generator. Each call is independent.
pub trait Generator {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

impl<G: Generator + ?Sized> Generator for &G {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        (**self).generate(prompt)
    }
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        (**self).generate(prompt)
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct GeminiClient {
    http: reqwest::blocking::Client,
    url: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig, api_key: String) -> Result<Self, GenerationError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let url = format!(
            "{}/models/{}:generateContent",
            config.endpoint.trim_end_matches('/'),
            config.model
        );
        Ok(Self {
            http,
            url,
            model: config.model.clone(),
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Generator for GeminiClient {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };
        // key goes in a header so transport errors, which echo the URL, never carry it
        let response = self
            .http
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()?;
        let status = response.status();
        let body = response.text()?;
        if status.as_u16() == 429 {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: trim_body(&body),
            });
        }
        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| GenerationError::Malformed(format!("{}: {}", e, trim_body(&body))))?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(GenerationError::Empty);
        }
        tracing::debug!(model = %self.model, chars = text.len(), "generation response received");
        Ok(text)
    }
}

fn trim_body(body: &str) -> String {
    const MAX: usize = 200;
    let flat = body.trim();
    if flat.chars().count() <= MAX {
        flat.to_string()
    } else {
        let mut out: String = flat.chars().take(MAX).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::mpsc;
    use std::thread;

    struct Captured {
        url: String,
        api_key: Option<String>,
        body: String,
    }

    /// Serves exactly one canned response and reports what it received.
    fn serve_once(status: u16, body: &'static str) -> (String, mpsc::Receiver<Captured>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let port = server
            .server_addr()
            .to_ip()
            .expect("ip listener")
            .port();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            if let Ok(mut request) = server.recv() {
                let mut received = String::new();
                let _ = request.as_reader().read_to_string(&mut received);
                let api_key = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("x-goog-api-key"))
                    .map(|h| h.value.as_str().to_string());
                let _ = tx.send(Captured {
                    url: request.url().to_string(),
                    api_key,
                    body: received,
                });
                let response = tiny_http::Response::from_string(body).with_status_code(status);
                let _ = request.respond(response);
            }
        });
        (format!("http://127.0.0.1:{}/v1beta", port), rx)
    }

    fn client(endpoint: String) -> GeminiClient {
        let config = GeminiConfig {
            endpoint,
            model: "gemini-test".to_string(),
            timeout: Duration::from_secs(5),
        };
        GeminiClient::new(&config, "secret-key".to_string()).expect("client")
    }

    #[test]
    fn generate_posts_prompt_and_joins_text_parts() {
        let (endpoint, rx) = serve_once(
            200,
            r#"{"candidates":[{"content":{"parts":[{"text":"4"},{"text":"\n"}]}}]}"#,
        );
        let out = client(endpoint).generate("Rate this speech").expect("generate");
        assert_eq!(out, "4\n");
        let captured = rx.recv().expect("captured request");
        assert_eq!(captured.url, "/v1beta/models/gemini-test:generateContent");
        assert_eq!(captured.api_key.as_deref(), Some("secret-key"));
        let sent: serde_json::Value = serde_json::from_str(&captured.body).expect("json body");
        assert_eq!(sent["contents"][0]["parts"][0]["text"], "Rate this speech");
    }

    #[test]
    fn rate_limit_and_server_errors_are_classified() {
        let (endpoint, _rx) = serve_once(429, "slow down");
        assert!(matches!(
            client(endpoint).generate("p"),
            Err(GenerationError::RateLimited)
        ));

        let (endpoint, _rx) = serve_once(500, "boom");
        match client(endpoint).generate("p") {
            Err(GenerationError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected status error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn malformed_and_empty_bodies_fail() {
        let (endpoint, _rx) = serve_once(200, "<html>not json</html>");
        assert!(matches!(
            client(endpoint).generate("p"),
            Err(GenerationError::Malformed(_))
        ));

        let (endpoint, _rx) = serve_once(200, r#"{"candidates":[]}"#);
        assert!(matches!(client(endpoint).generate("p"), Err(GenerationError::Empty)));

        let (endpoint, _rx) =
            serve_once(200, r#"{"candidates":[{"content":{"parts":[{"text":"  "}]}}]}"#);
        assert!(matches!(client(endpoint).generate("p"), Err(GenerationError::Empty)));
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_error() {
        let err = client("http://127.0.0.1:9".to_string())
            .generate("p")
            .expect_err("nothing listens on the discard port");
        assert!(matches!(err, GenerationError::Transport(_)));
        assert!(!err.to_string().contains("secret-key"));
    }

    #[test]
    fn trim_body_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(trim_body(&long).len(), 203);
        assert_eq!(trim_body("  short \n"), "short");
    }
}
