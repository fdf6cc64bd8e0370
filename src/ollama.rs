use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::env;
use thiserror::Error;

pub const OLLAMA_MODEL: &str = "mistral-openorca";

/// Errors raised while talking to the generation service
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("request to generation service failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generation chunk is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("generation chunk is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("generation service reported an error: {0}")]
    Upstream(String),

    #[error("generation chunk has no response field")]
    MissingResponse,
}

/// Lazy sequence of generated text fragments
pub type FragmentStream = BoxStream<'static, Result<String, GenerateError>>;

/// Configuration for the Ollama generation service
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// host:port of the service
    pub host: String,
    pub model: String,
}

impl OllamaConfig {
    pub fn new(host: impl Into<String>) -> Self {
        OllamaConfig {
            host: host.into(),
            model: OLLAMA_MODEL.to_string(),
        }
    }

    /// Create a new configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("APP_OLLAMA_HOST").unwrap_or_default();
        if host.is_empty() {
            anyhow::bail!("APP_OLLAMA_HOST environment variable not set");
        }
        let model = env::var("APP_OLLAMA_MODEL")
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| OLLAMA_MODEL.to_string());

        Ok(OllamaConfig { host, model })
    }

    pub fn generate_url(&self) -> String {
        format!("http://{}/api/generate", self.host)
    }
}

#[derive(Serialize, Debug)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
}

#[derive(Deserialize, Debug)]
struct GenerateChunk {
    response: Option<String>,
    error: Option<String>,
}

/// Extract the text fragment from one JSON line of the response body
fn parse_fragment(line: &[u8]) -> Result<String, GenerateError> {
    let line = std::str::from_utf8(line)?;
    let chunk: GenerateChunk = serde_json::from_str(line)?;
    match chunk {
        GenerateChunk {
            error: Some(message),
            ..
        } => Err(GenerateError::Upstream(message)),
        GenerateChunk {
            response: Some(text),
            ..
        } => Ok(text),
        _ => Err(GenerateError::MissingResponse),
    }
}

/// Splits a byte stream into newline-delimited records
#[derive(Debug, Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Feed bytes, returning every record completed by them
    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if !is_blank(&line) {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left once the body has ended
    fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        if is_blank(&rest) {
            None
        } else {
            Some(rest)
        }
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii_whitespace())
}

struct FragmentState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: LineDecoder,
    pending: VecDeque<Vec<u8>>,
    ended: bool,
}

/// Decode a raw response body into text fragments, one per JSON record
fn decode_fragments(body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> FragmentStream {
    let state = FragmentState {
        body,
        decoder: LineDecoder::default(),
        pending: VecDeque::new(),
        ended: false,
    };

    stream::try_unfold(state, next_fragment).boxed()
}

async fn next_fragment(
    mut state: FragmentState,
) -> Result<Option<(String, FragmentState)>, GenerateError> {
    loop {
        if let Some(line) = state.pending.pop_front() {
            let fragment = parse_fragment(&line)?;
            return Ok(Some((fragment, state)));
        }
        if state.ended {
            return Ok(None);
        }
        match state.body.next().await {
            Some(bytes) => {
                let bytes = bytes?;
                state.pending.extend(state.decoder.push(&bytes));
            }
            None => {
                state.pending.extend(state.decoder.finish());
                state.ended = true;
            }
        }
    }
}

/// An accepted generation response.
///
/// Owns the HTTP response; dropping it (or the fragment stream made from it)
/// closes the connection to the generation service.
pub struct Generation {
    status: u16,
    response: reqwest::Response,
}

impl Generation {
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Text fragments in the order the service sent them
    pub fn into_fragments(self) -> FragmentStream {
        let body = self
            .response
            .bytes_stream()
            .map_ok(|bytes| bytes.to_vec())
            .boxed();
        decode_fragments(body)
    }
}

/// Client for the Ollama generate endpoint
#[derive(Clone)]
pub struct OllamaClient {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(config: OllamaConfig) -> Self {
        let client = reqwest::Client::new();
        OllamaClient { config, client }
    }

    /// Get the client configuration
    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Send a generate request. Fails on any non-success status.
    pub async fn generate(&self, prompt: &str, stream: bool) -> Result<Generation, GenerateError> {
        let generate_url = self.config.generate_url();
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream,
        };
        info!("generate text url={} prompt={:?}", generate_url, prompt);

        let response = self.client.post(&generate_url).json(&request).send().await?;
        let status = response.status();
        info!("status {} from {}", status, generate_url);

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GenerateError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Generation {
            status: status.as_u16(),
            response,
        })
    }

    /// Generate without streaming and return the whole text
    pub async fn generate_text(&self, prompt: &str) -> Result<String, GenerateError> {
        let generation = self.generate(prompt, false).await?;
        let text: String = generation.into_fragments().try_collect::<Vec<_>>().await?.concat();
        debug!("generated {} bytes", text.len());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(parts: &[&str]) -> BoxStream<'static, Result<Vec<u8>, reqwest::Error>> {
        let parts: Vec<Result<Vec<u8>, reqwest::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(parts).boxed()
    }

    #[test]
    fn test_generate_url() {
        let config = OllamaConfig::new("ollama:11434");
        assert_eq!(config.generate_url(), "http://ollama:11434/api/generate");
        assert_eq!(config.model, OLLAMA_MODEL);
    }

    #[test]
    fn test_request_serialization() {
        let request = GenerateRequest {
            model: OLLAMA_MODEL,
            prompt: "hello",
            stream: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"model": "mistral-openorca", "prompt": "hello", "stream": true})
        );
    }

    #[test]
    fn test_line_decoder_joins_split_records() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"{\"response\":").is_empty());
        let lines = decoder.push(b"\"Hi\"}\n{\"response\":\" there\"}\n\n");
        assert_eq!(
            lines,
            vec![b"{\"response\":\"Hi\"}\n".to_vec(), b"{\"response\":\" there\"}\n".to_vec()]
        );
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_line_decoder_keeps_unterminated_tail() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"{\"response\":\"done\"}").is_empty());
        assert_eq!(decoder.finish(), Some(b"{\"response\":\"done\"}".to_vec()));
    }

    #[test]
    fn test_parse_fragment() {
        assert_eq!(parse_fragment(b"{\"response\":\"Hi\",\"done\":false}").unwrap(), "Hi");
        assert!(matches!(
            parse_fragment(b"{\"error\":\"model not found\"}"),
            Err(GenerateError::Upstream(m)) if m == "model not found"
        ));
        assert!(matches!(
            parse_fragment(b"{\"done\":true}"),
            Err(GenerateError::MissingResponse)
        ));
        assert!(matches!(parse_fragment(b"not json"), Err(GenerateError::Json(_))));
        assert!(matches!(parse_fragment(&[0xff, 0xfe]), Err(GenerateError::Utf8(_))));
    }

    #[tokio::test]
    async fn test_decode_fragments_in_order() {
        let body = body_of(&["{\"response\":\"Hi\"}\n{\"resp", "onse\":\" there\"}\n"]);
        let fragments: Vec<String> = decode_fragments(body).try_collect().await.unwrap();
        assert_eq!(fragments, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn test_decode_fragments_stops_at_bad_record() {
        let body = body_of(&["{\"response\":\"ok\"}\n", "garbage\n", "{\"response\":\"late\"}\n"]);
        let mut fragments = decode_fragments(body);
        assert_eq!(fragments.next().await.unwrap().unwrap(), "ok");
        assert!(fragments.next().await.unwrap().is_err());
        assert!(fragments.next().await.is_none());
    }
}
