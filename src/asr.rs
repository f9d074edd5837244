//! Streaming Transcription Client
//!
//! Maintains one WebSocket stream to the transcription backend, feeds it
//! PCM audio, and assembles the backend's partial results into flushed
//! transcript segments. The stream self-heals: a dropped connection is
//! retried a bounded number of times before the client gives up.

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::{oneshot, Mutex};

use crate::error::{Error, Result};
use crate::ws;

/// Reconnects attempted per outage before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Constant delay between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Buffered partials flush once they reach this many characters
/// (characters, not bytes — transcripts are mostly CJK)
pub const FLUSH_THRESHOLD_CHARS: usize = 50;

fn default_ws_url() -> String {
    "ws://127.0.0.1:10095".to_string()
}

/// Transcription backend endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsrConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
        }
    }
}

/// Lifecycle of the transcription stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
}

/// Accumulates partial recognition text until a flush condition holds:
/// the backend marks a segment final, or the buffer reaches the
/// character threshold.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    pending: String,
}

impl TranscriptBuffer {
    /// Append a partial; returns the flushed segment when one completes
    pub fn push(&mut self, text: &str, is_final: bool) -> Option<String> {
        self.pending.push_str(text);
        if is_final || self.pending.chars().count() >= FLUSH_THRESHOLD_CHARS {
            let flushed = self.pending.trim().to_string();
            self.pending.clear();
            if flushed.is_empty() {
                None
            } else {
                Some(flushed)
            }
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_chars(&self) -> usize {
        self.pending.chars().count()
    }
}

/// Recognition message from the backend. Fields it doesn't send on a
/// given frame default; frames that don't parse at all are dropped.
#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
}

/// Flushed transcript segments land here
type ResultSink = Arc<dyn Fn(String) + Send + Sync>;

struct Shared {
    state: StreamState,
    attempts: u32,
    buffer: TranscriptBuffer,
    writer: Option<TcpStream>,
    /// Bumped by `connect`/`disconnect`; a driver holding a stale value stops
    generation: u64,
}

struct Inner {
    config: AsrConfig,
    shared: Mutex<Shared>,
    sink: ResultSink,
}

/// Client for one live transcription stream
#[derive(Clone)]
pub struct AsrClient {
    inner: Arc<Inner>,
}

impl AsrClient {
    pub fn new(config: AsrConfig, sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                shared: Mutex::new(Shared {
                    state: StreamState::Idle,
                    attempts: 0,
                    buffer: TranscriptBuffer::default(),
                    writer: None,
                    generation: 0,
                }),
                sink: Arc::new(sink),
            }),
        }
    }

    pub async fn state(&self) -> StreamState {
        self.inner.shared.lock().await.state
    }

    /// Whether the stream is open and accepting audio
    pub async fn is_ready(&self) -> bool {
        self.state().await == StreamState::Open
    }

    /// Open the stream. No-op when already open or connecting; failures
    /// feed the same bounded reconnect policy as a mid-stream drop.
    pub async fn connect(&self) {
        let generation = {
            let mut shared = self.inner.shared.lock().await;
            if !matches!(shared.state, StreamState::Idle) {
                return;
            }
            shared.state = StreamState::Connecting;
            shared.attempts = 0;
            shared.generation += 1;
            shared.generation
        };

        let client = self.clone();
        tokio::spawn(async move { client.drive(generation).await });
    }

    /// Tear the stream down: tell the backend speech ended, close the
    /// socket, drop any buffered partials. Cancels in-flight reconnects.
    pub async fn disconnect(&self) {
        let writer = {
            let mut shared = self.inner.shared.lock().await;
            shared.generation += 1;
            shared.state = StreamState::Idle;
            // Counter parked at the cap until the next explicit connect
            shared.attempts = MAX_RECONNECT_ATTEMPTS;
            shared.buffer.clear();
            shared.writer.take()
        };

        if let Some(mut stream) = writer {
            let bye = json!({ "is_speaking": false }).to_string();
            let _ = ws::write_frame(&mut stream, ws::OPCODE_TEXT, bye.as_bytes());
            let _ = ws::write_close(&mut stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }

        tracing::info!("transcription stream closed");
    }

    /// Forward one chunk of PCM audio. Chunks arriving while the stream
    /// is down are dropped with a warning, never queued.
    pub async fn send_audio_chunk(&self, chunk: &[u8]) {
        let mut shared = self.inner.shared.lock().await;
        if shared.state != StreamState::Open {
            tracing::warn!(len = chunk.len(), "audio chunk dropped, stream not open");
            return;
        }
        if let Some(writer) = shared.writer.as_mut() {
            if let Err(e) = ws::write_frame(writer, ws::OPCODE_BINARY, chunk) {
                tracing::warn!(error = %e, "audio chunk write failed");
            }
        }
    }

    /// Connection driver: opens the stream, waits for it to die, applies
    /// the reconnect policy, repeats. Stops when the generation moves on
    /// (disconnect) or the retries are used up.
    async fn drive(self, generation: u64) {
        loop {
            match self.open_stream(generation).await {
                Ok(closed_rx) => {
                    let _ = closed_rx.await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transcription connect failed");
                }
            }

            {
                let mut shared = self.inner.shared.lock().await;
                if shared.generation != generation {
                    return;
                }
                shared.writer = None;
                if shared.attempts >= MAX_RECONNECT_ATTEMPTS {
                    tracing::error!(
                        attempts = MAX_RECONNECT_ATTEMPTS,
                        "transcription backend unreachable, giving up"
                    );
                    shared.state = StreamState::Idle;
                    shared.buffer.clear();
                    return;
                }
                shared.attempts += 1;
                shared.state = StreamState::Reconnecting {
                    attempt: shared.attempts,
                };
                tracing::warn!(attempt = shared.attempts, "reconnecting to transcription backend");
            }

            tokio::time::sleep(RECONNECT_DELAY).await;

            let shared = self.inner.shared.lock().await;
            if shared.generation != generation {
                return;
            }
        }
    }

    /// One connection attempt: socket, WebSocket handshake, recognition
    /// init message, reader thread. The returned channel resolves when
    /// the reader loop ends.
    async fn open_stream(&self, generation: u64) -> Result<oneshot::Receiver<()>> {
        let (host_port, path) = ws::split_url(&self.inner.config.ws_url);
        let mut stream = TcpStream::connect(&host_port)
            .map_err(|e| Error::Asr(format!("connect to {} failed: {}", host_port, e)))?;
        ws::client_handshake(&mut stream, &host_port, &path)
            .map_err(|e| Error::Asr(format!("handshake failed: {}", e)))?;

        ws::write_frame(&mut stream, ws::OPCODE_TEXT, init_message().as_bytes())
            .map_err(|e| Error::Asr(format!("init message failed: {}", e)))?;

        let reader = stream
            .try_clone()
            .map_err(|e| Error::Asr(format!("stream clone failed: {}", e)))?;

        {
            let mut shared = self.inner.shared.lock().await;
            if shared.generation != generation {
                return Err(Error::Asr("stream superseded".into()));
            }
            shared.writer = Some(stream);
            shared.state = StreamState::Open;
            shared.attempts = 0;
        }

        tracing::info!(url = %self.inner.config.ws_url, "transcription stream open");

        let (closed_tx, closed_rx) = oneshot::channel();
        let shared = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            reader_loop(reader, &shared);
            let _ = closed_tx.send(());
        });

        Ok(closed_rx)
    }

    /// One-shot transcription of a recorded file via the backend's HTTP
    /// endpoint (same host as the stream, `ws` scheme swapped for `http`)
    pub async fn transcribe_file(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = file_endpoint(&self.inner.config.ws_url);
        let response = reqwest::Client::new()
            .post(&url)
            .multipart(form)
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;

        body.get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Asr("transcription response missing text".into()))
    }
}

/// Recognition session parameters sent as the first frame
fn init_message() -> String {
    json!({
        "mode": "offline",
        "chunk_size": [5, 10, 5],
        "wav_name": "mic_stream",
        "is_speaking": true,
        "hotwords": "",
        "itn": false
    })
    .to_string()
}

/// Map the stream URL to the backend's file-transcription HTTP endpoint
pub fn file_endpoint(ws_url: &str) -> String {
    let http = if let Some(rest) = ws_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = ws_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        ws_url.to_string()
    };
    format!("{}/transcribe", http.trim_end_matches('/'))
}

fn reader_loop(mut stream: TcpStream, inner: &Inner) {
    loop {
        let (opcode, payload) = match ws::read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "transcription read ended");
                break;
            }
        };

        match opcode {
            ws::OPCODE_TEXT => {
                let msg: ServerMessage = match serde_json::from_slice(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed transcription message dropped");
                        continue;
                    }
                };

                let flushed = {
                    let mut shared = inner.shared.blocking_lock();
                    shared.buffer.push(&msg.text, msg.is_final)
                };
                if let Some(text) = flushed {
                    (inner.sink)(text);
                }
            }
            ws::OPCODE_PING => {
                let _ = ws::write_pong(&mut stream);
            }
            ws::OPCODE_CLOSE => break,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for(client: &AsrClient, pred: impl Fn(StreamState) -> bool) {
        for _ in 0..2000 {
            if pred(client.state().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stream never reached the expected state");
    }

    /// Port that nothing listens on: bound once to pick it, then freed
    fn refused_endpoint() -> AsrConfig {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        AsrConfig {
            ws_url: format!("ws://127.0.0.1:{}", port),
        }
    }

    #[test]
    fn buffer_flushes_on_final() {
        let mut buffer = TranscriptBuffer::default();
        assert_eq!(buffer.push("你好", false), None);
        assert_eq!(buffer.push("，观众们", true), Some("你好，观众们".to_string()));
        assert_eq!(buffer.pending_chars(), 0);
    }

    #[test]
    fn buffer_flushes_at_character_threshold() {
        let mut buffer = TranscriptBuffer::default();
        // 49 CJK characters stay pending, the 50th triggers the flush
        let partial: String = "字".repeat(FLUSH_THRESHOLD_CHARS - 1);
        assert_eq!(buffer.push(&partial, false), None);
        assert_eq!(buffer.pending_chars(), FLUSH_THRESHOLD_CHARS - 1);

        let flushed = buffer.push("字", false).unwrap();
        assert_eq!(flushed.chars().count(), FLUSH_THRESHOLD_CHARS);
    }

    #[test]
    fn threshold_counts_characters_not_bytes() {
        let mut buffer = TranscriptBuffer::default();
        // 20 CJK characters are 60 bytes but well under the threshold
        assert_eq!(buffer.push(&"直".repeat(20), false), None);
    }

    #[test]
    fn flush_trims_and_drops_whitespace_only() {
        let mut buffer = TranscriptBuffer::default();
        assert_eq!(buffer.push("  ", true), None);
        assert_eq!(buffer.push("  hello  ", true), Some("hello".to_string()));
    }

    #[test]
    fn no_text_lost_across_partials() {
        let mut buffer = TranscriptBuffer::default();
        let mut out = String::new();
        for part in ["第一", "第二", "第三"] {
            if let Some(flushed) = buffer.push(part, false) {
                out.push_str(&flushed);
            }
        }
        if let Some(flushed) = buffer.push("", true) {
            out.push_str(&flushed);
        }
        assert_eq!(out, "第一第二第三");
    }

    #[test]
    fn file_endpoint_swaps_scheme() {
        assert_eq!(
            file_endpoint("ws://127.0.0.1:10095"),
            "http://127.0.0.1:10095/transcribe"
        );
        assert_eq!(
            file_endpoint("wss://asr.example.com/stream"),
            "https://asr.example.com/stream/transcribe"
        );
    }

    #[test]
    fn default_config_targets_local_backend() {
        assert_eq!(AsrConfig::default().ws_url, "ws://127.0.0.1:10095");
    }

    #[tokio::test]
    async fn client_starts_idle_and_drops_audio() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushed);
        let client = AsrClient::new(AsrConfig::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(client.state().await, StreamState::Idle);
        assert!(!client.is_ready().await);

        // Not connected: the chunk is dropped, nothing panics, nothing flushes
        client.send_audio_chunk(&[0u8; 320]).await;
        assert_eq!(flushed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_safe() {
        let client = AsrClient::new(AsrConfig::default(), |_| {});
        client.disconnect().await;
        assert_eq!(client.state().await, StreamState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_reconnects_then_give_up() {
        let client = AsrClient::new(refused_endpoint(), |_| {});
        client.connect().await;

        // Failed attempts show up as Reconnecting, then the cap parks
        // the client back at Idle
        wait_for(&client, |s| matches!(s, StreamState::Reconnecting { .. })).await;
        wait_for(&client, |s| s == StreamState::Idle).await;

        // No further attempt fires without an explicit connect
        for _ in 0..10 {
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
        assert_eq!(client.state().await, StreamState::Idle);

        // An explicit connect resets the counter and tries again
        client.connect().await;
        wait_for(&client, |s| matches!(s, StreamState::Reconnecting { .. })).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_reconnect_stops_the_driver() {
        let client = AsrClient::new(refused_endpoint(), |_| {});
        client.connect().await;
        wait_for(&client, |s| matches!(s, StreamState::Reconnecting { .. })).await;

        client.disconnect().await;
        assert_eq!(client.state().await, StreamState::Idle);

        // The sleeping driver wakes into a newer generation and exits;
        // no reconnect ever fires again
        for _ in 0..10 {
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
        assert_eq!(client.state().await, StreamState::Idle);
    }

    #[tokio::test]
    async fn open_stream_then_disconnect_is_final() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n")
                .unwrap();
            // Hold the connection until the client hangs up
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let config = AsrConfig {
            ws_url: format!("ws://{}", addr),
        };
        let client = AsrClient::new(config, |_| {});
        client.connect().await;
        wait_for(&client, |s| s == StreamState::Open).await;
        assert!(client.is_ready().await);

        client.disconnect().await;
        assert_eq!(client.state().await, StreamState::Idle);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.state().await, StreamState::Idle);
        server.join().unwrap();
    }
}
