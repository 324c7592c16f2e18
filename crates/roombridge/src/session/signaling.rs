//! JSON signaling over WebSocket

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::SessionError;
use roombridge_protocol::{ClientMessage, ServerMessage};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Sending half of a joined signaling connection. Cheap to clone.
#[derive(Clone)]
pub struct SignalingClient {
    sender: mpsc::Sender<ClientMessage>,
    participant_sid: String,
}

impl SignalingClient {
    /// Connect, join `room` and return the client plus the stream of server messages
    pub async fn connect(
        url: &str,
        token: &str,
        join: ClientMessage,
    ) -> Result<(Self, mpsc::Receiver<ServerMessage>), SessionError> {
        let (ws_stream, _) = connect_async(rtc_url(url, token)).await?;
        let (mut write, mut read) = ws_stream.split();

        let json = serde_json::to_string(&join)?;
        write.send(Message::Text(json.into())).await?;

        // Wait for the join response
        let participant_sid = tokio::time::timeout(JOIN_TIMEOUT, async {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let response = match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(response) => response,
                            Err(e) => return Err(SessionError::Json(e)),
                        };
                        return match response {
                            ServerMessage::Joined {
                                room,
                                participant_sid,
                            } => {
                                tracing::info!("Joined room {} as {}", room, participant_sid);
                                Ok(participant_sid)
                            }
                            ServerMessage::Error { message } => Err(SessionError::Rejected(message)),
                            other => Err(SessionError::Rejected(format!(
                                "unexpected response during join: {:?}",
                                other
                            ))),
                        };
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(SessionError::Closed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(SessionError::WebSocket(e)),
                }
            }
        })
        .await
        .map_err(|_| SessionError::Timeout("join response"))??;

        // Spawn task to handle outgoing messages
        let (tx, mut rx) = mpsc::channel::<ClientMessage>(100);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send WebSocket message");
                    break;
                }

                if msg == ClientMessage::Leave {
                    let _ = write.close().await;
                    break;
                }
            }
        });

        // Spawn task to handle incoming messages
        let (events_tx, events_rx) = mpsc::channel::<ServerMessage>(100);
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Pong) => {}
                        Ok(msg) => {
                            if events_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring malformed signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Signaling connection closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Start ping task
        let tx_ping = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx_ping.send(ClientMessage::Ping).await.is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                sender: tx,
                participant_sid,
            },
            events_rx,
        ))
    }

    pub fn participant_sid(&self) -> &str {
        &self.participant_sid
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<(), SessionError> {
        self.sender.send(msg).await.map_err(|_| SessionError::Closed)
    }
}

/// WebSocket URL of the signaling endpoint for `base`
pub fn rtc_url(base: &str, token: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };

    format!("{}/rtc?access_token={}", base, token)
}
