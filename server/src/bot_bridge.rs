// Forwarding of opaque trading-bot command frames to the sibling process
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream,
    WebSocketStream};
use tracing::{debug, info, warn};

type BotSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Lazily connected outbound WebSocket to the trading-bot process. Frames
/// are forwarded unchanged; the core never inspects them.
#[derive(Clone)]
pub struct BotBridge {
    tx: Option<mpsc::Sender<String>>,
}

impl BotBridge {
    /// With no configured endpoint the bridge is inert and frames are
    /// dropped with a debug log.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn start(url: String) -> Self {
        let (tx, rx) = mpsc::channel::<String>(64);
        tokio::spawn(run_forwarder(url, rx));
        Self { tx: Some(tx) }
    }

    pub fn forward(&self, frame: &str) {
        match &self.tx {
            Some(tx) => {
                if tx.try_send(frame.to_string()).is_err() {
                    warn!("Bot bridge queue full; dropping command frame");
                }
            }
            None => debug!("No bot endpoint configured; dropping command frame"),
        }
    }
}

async fn run_forwarder(url: String, mut rx: mpsc::Receiver<String>) {
    let mut socket: Option<BotSocket> = None;

    while let Some(frame) = rx.recv().await {
        if socket.is_none() {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Connected to bot service at {}", url);
                    socket = Some(ws);
                }
                Err(e) => {
                    warn!("Bot service unreachable at {}: {}; dropping frame", url, e);
                    continue;
                }
            }
        }
        if let Some(ws) = socket.as_mut() {
            if let Err(e) = ws.send(Message::Text(frame)).await {
                warn!("Bot forward failed: {}; reconnecting on next frame", e);
                socket = None;
            }
        }
    }
    debug!("Bot bridge channel closed");
}
