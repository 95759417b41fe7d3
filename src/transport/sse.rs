use super::{StreamEvent, StreamHandle, StreamTransport, TransportError, STREAM_ERROR_APOLOGY};
use futures::StreamExt;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SseConfig {
    pub url: String,
}

#[derive(Deserialize)]
struct ToolEvent {
    message: Option<String>,
    tool: Option<String>,
    #[serde(rename = "isFinal")]
    is_final: Option<bool>,
}

pub struct SseClient {
    client: Client,
    config: SseConfig,
}

impl SseClient {
    pub fn new(config: SseConfig) -> Result<Self, TransportError> {
        Url::parse(&config.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            client: Client::new(),
            config,
        })
    }

    fn request_url(&self, prompt: &str) -> Result<Url, TransportError> {
        Url::parse_with_params(&self.config.url, &[("message", prompt)])
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))
    }
}

impl StreamTransport for SseClient {
    fn open(&self, prompt: &str) -> StreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = match self.request_url(prompt) {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot open event stream: {}", e);
                let _ = tx.send(StreamEvent::Error(STREAM_ERROR_APOLOGY.to_string()));
                return StreamHandle::new(rx, None);
            }
        };

        let client = self.client.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = pump(&client, url, &tx).await {
                warn!("Event stream failed: {}", e);
                let _ = tx.send(StreamEvent::Error(STREAM_ERROR_APOLOGY.to_string()));
            }
        });
        StreamHandle::new(rx, Some(task))
    }
}

/// Reads the event stream into `tx` until a terminal event is forwarded.
/// Ending without one is reported as an error.
async fn pump(
    client: &Client,
    url: Url,
    tx: &mpsc::UnboundedSender<StreamEvent>,
) -> Result<(), TransportError> {
    info!("Connecting to event stream at {}", url.host_str().unwrap_or("?"));
    let resp = client
        .get(url)
        .header("Accept", "text/event-stream")
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(TransportError::Api {
            status,
            message: text,
        });
    }
    debug!("Event stream open");

    let mut stream = resp.bytes_stream();
    let mut decoder = SseDecoder::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for payload in decoder.push(&chunk) {
            if forward(&payload, tx) {
                return Ok(());
            }
        }
    }

    if let Some(payload) = decoder.finish() {
        if forward(&payload, tx) {
            return Ok(());
        }
    }

    Err(TransportError::Closed)
}

/// Sends the event for `payload`; true once the stream should stop.
fn forward(payload: &str, tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
    match decode_payload(payload) {
        Some(event) => {
            let terminal = event.is_terminal();
            // A closed receiver means the caller disconnected.
            tx.send(event).is_err() || terminal
        }
        None => tx.is_closed(),
    }
}

/// Maps one `data:` payload to an event. Payloads that are not the expected
/// JSON object are passed through as raw text.
pub fn decode_payload(data: &str) -> Option<StreamEvent> {
    match serde_json::from_str::<ToolEvent>(data) {
        Ok(event) => {
            if let Some(tool) = &event.tool {
                debug!("Stream event from tool {}", tool);
            }
            if event.is_final.unwrap_or(false) {
                return Some(StreamEvent::Done);
            }
            event
                .message
                .filter(|m| !m.is_empty())
                .map(StreamEvent::Fragment)
        }
        Err(_) if data.is_empty() => None,
        Err(_) => Some(StreamEvent::Fragment(data.to_string())),
    }
}

/// Incremental `text/event-stream` parser yielding complete `data` payloads.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if let Some(payload) = self.take_event() {
                    payloads.push(payload);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }

        payloads
    }

    /// Flushes a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            if let Some(payload) = self.push(b"\n").pop() {
                return Some(payload);
            }
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        Some(payload)
    }
}
