//! WebSocket backend: terminal-over-HTTP gateway speaking the ttyd framing.
//!
//! Client frames carry a one-byte channel prefix: `'0'` is INPUT. Server
//! frames demultiplex the same way: `'0'` is OUTPUT, `'1'` (window title)
//! and `'2'` (preferences) are discarded. The first client frame is a JSON
//! hello with the terminal geometry and, unless running no-auth, the token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};

use super::buffer::Shared;
use super::{ChatClient, ClientError, Connector, DialOptions, WakeMode};

/// Read limit on a single WebSocket frame.
const MAX_WS_FRAME: usize = 16 * 1024 * 1024;

/// Deadline on the best-effort control PING.
const PING_DEADLINE: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsClient {
    shared: Arc<Shared>,
    writer: Mutex<WsSink>,
}

impl WsClient {
    /// Connect, send the hello frame, inject the wake-up and consume the
    /// banner up to the first prompt.
    pub async fn dial(opts: &DialOptions) -> Result<Self, ClientError> {
        let url = normalize_endpoint(&opts.endpoint)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Connection(format!("ws request: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            "tty".parse().expect("static header value"),
        );
        if !opts.username.is_empty() {
            let basic = BASE64.encode(format!("{}:{}", opts.username, opts.password));
            if let Ok(value) = format!("Basic {basic}").parse() {
                headers.insert("Authorization", value);
            }
        }
        if !opts.auth_header_name.is_empty() && !opts.auth_header_val.is_empty() {
            if let (Ok(name), Ok(value)) = (
                opts.auth_header_name
                    .parse::<tokio_tungstenite::tungstenite::http::HeaderName>(),
                opts.auth_header_val.parse(),
            ) {
                headers.insert(name, value);
            }
        }

        let tls = if opts.insecure_tls {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| ClientError::Connection(format!("tls connector: {e}")))?;
            Some(tokio_tungstenite::Connector::NativeTls(connector))
        } else {
            None
        };

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(MAX_WS_FRAME))
            .max_frame_size(Some(MAX_WS_FRAME));

        debug!("ws: connecting to {url}");
        let (stream, _response) = timeout(
            opts.handshake_timeout,
            connect_async_tls_with_config(request, Some(ws_config), false, tls),
        )
        .await
        .map_err(|_| ClientError::Connection("ws handshake timeout".to_string()))?
        .map_err(|e| ClientError::Connection(format!("ws connect: {e}")))?;

        let (mut write, mut read) = stream.split();

        // The gateway identifies JSON_DATA by a leading '{', so the hello
        // frame carries no channel prefix.
        let mut hello = json!({
            "columns": opts.columns,
            "rows": opts.rows,
        });
        if !opts.no_auth {
            let token = fetch_token(opts).await.unwrap_or_else(|| {
                if !opts.username.is_empty() {
                    BASE64.encode(format!("{}:{}", opts.username, opts.password))
                } else {
                    opts.auth_header_val.clone()
                }
            });
            hello["AuthToken"] = json!(token);
        }
        write
            .send(Message::Binary(hello.to_string().into_bytes().into()))
            .await
            .map_err(|e| ClientError::Connection(format!("ws hello: {e}")))?;

        let shared = Arc::new(Shared::new());
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Binary(data)) => demux(&reader_shared, &data),
                    Ok(Message::Text(text)) => demux(&reader_shared, text.as_bytes()),
                    Ok(Message::Close(frame)) => {
                        reader_shared
                            .mark_closed(format!("closed by peer: {frame:?}"));
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reader_shared.mark_closed(format!("ws read: {e}"));
                        return;
                    }
                }
            }
            reader_shared.mark_closed("ws stream ended");
        });

        let client = Self {
            shared,
            writer: Mutex::new(write),
        };

        match opts.wake {
            WakeMode::Ctrlc => {
                client.send_input(&[0x03]).await?;
                client.send_input(b"\r").await?;
            }
            WakeMode::Newline => client.send_input(b"\r").await?,
            WakeMode::None => {}
        }

        // Consume the banner until the first prompt so a leased session is
        // immediately usable. Not fatal: some gateways stay silent until
        // real input arrives.
        let start = 0;
        if let Err(e) = client.shared.wait_transcript(start, opts.idle_timeout).await {
            if e.is_connection() {
                return Err(e);
            }
            warn!("ws: no initial prompt within idle budget: {e}");
        }
        Ok(client)
    }

    /// Send one INPUT frame ('0' + bytes) under the write lock.
    async fn send_input(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut frame = Vec::with_capacity(bytes.len() + 1);
        frame.push(b'0');
        frame.extend_from_slice(bytes);
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| ClientError::Connection(format!("ws write: {e}")))
    }
}

fn demux(shared: &Shared, data: &[u8]) {
    match data.first() {
        Some(b'0') => shared.push(&data[1..]),
        Some(b'1') | Some(b'2') => {
            debug!("ws: dropping control frame type {}", data[0] as char);
        }
        _ => {}
    }
}

/// `ws://host/ws` form: http(s) schemes rewritten, bare paths get `/ws`.
fn normalize_endpoint(endpoint: &str) -> Result<reqwest::Url, ClientError> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| ClientError::Connection(format!("bad endpoint {endpoint:?}: {e}")))?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        let _ = url.set_scheme(scheme);
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

/// Probe the gateway's token endpoint; `None` when unavailable.
async fn fetch_token(opts: &DialOptions) -> Option<String> {
    #[derive(Deserialize)]
    struct TokenResponse {
        token: String,
    }

    let url = if opts.token_url.is_empty() {
        let mut url = normalize_endpoint(&opts.endpoint).ok()?;
        let scheme = if url.scheme() == "wss" { "https" } else { "http" };
        url.set_scheme(scheme).ok()?;
        url.set_path("/token");
        url
    } else {
        reqwest::Url::parse(&opts.token_url).ok()?
    };

    let client = reqwest::Client::builder()
        .timeout(opts.connect_timeout)
        .danger_accept_invalid_certs(opts.insecure_tls)
        .build()
        .ok()?;
    let mut req = client.get(url);
    if !opts.username.is_empty() {
        req = req.basic_auth(&opts.username, Some(&opts.password));
    }
    if !opts.auth_header_name.is_empty() && !opts.auth_header_val.is_empty() {
        req = req.header(&opts.auth_header_name, &opts.auth_header_val);
    }
    let resp = req.send().await.ok()?;
    let parsed: TokenResponse = resp.json().await.ok()?;
    if parsed.token.is_empty() {
        None
    } else {
        Some(parsed.token)
    }
}

#[async_trait]
impl ChatClient for WsClient {
    async fn ask(&self, prompt: &str, idle: Duration) -> Result<String, ClientError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ClientError::EmptyPrompt);
        }
        let start = self.shared.logical_end();
        let mut line = prompt.as_bytes().to_vec();
        line.push(b'\r');
        self.send_input(&line).await?;
        self.shared.wait_transcript(start, idle).await
    }

    async fn ping(&self) -> Result<(), ClientError> {
        if self.shared.is_closed() {
            return Err(ClientError::Connection("channel closed".to_string()));
        }
        let mut writer = self.writer.lock().await;
        timeout(PING_DEADLINE, writer.send(Message::Ping(Vec::new().into())))
            .await
            .map_err(|_| ClientError::Connection("ping timeout".to_string()))?
            .map_err(|e| ClientError::Connection(format!("ping: {e}")))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = timeout(Duration::from_secs(1), writer.send(Message::Close(None))).await;
        self.shared.mark_closed("closed");
    }
}

/// Connector producing gateway-backed clients.
pub struct WsConnector {
    opts: DialOptions,
}

impl WsConnector {
    pub fn new(opts: DialOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn ChatClient>, ClientError> {
        Ok(Box::new(WsClient::dial(&self.opts).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint_schemes() {
        assert_eq!(
            normalize_endpoint("http://host:7682/ws").unwrap().as_str(),
            "ws://host:7682/ws"
        );
        assert_eq!(
            normalize_endpoint("https://host/ws").unwrap().as_str(),
            "wss://host/ws"
        );
        assert_eq!(
            normalize_endpoint("ws://host:7682").unwrap().as_str(),
            "ws://host:7682/ws"
        );
    }

    #[test]
    fn test_normalize_endpoint_rejects_garbage() {
        assert!(normalize_endpoint("not a url").is_err());
    }

    #[test]
    fn test_demux_routes_output_only() {
        let shared = Shared::new();
        demux(&shared, b"0hello");
        demux(&shared, b"1window-title");
        demux(&shared, b"2{\"prefs\":true}");
        demux(&shared, b"");
        assert_eq!(shared.logical_end(), 5);
    }
}
