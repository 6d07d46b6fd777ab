use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{AppError, Result};

/// Frames exchanged with the relay. SDP and ICE payloads are the JSON
/// encodings of the corresponding `webrtc` types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum SignalingMessage {
    Join {
        app_id: String,
        room: String,
        peer_id: String,
    },
    Welcome {
        peer_id: String,
        peers: Vec<String>,
    },
    PeerJoined {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
    },
    Offer {
        from_peer: String,
        to_peer: String,
        sdp: String,
    },
    Answer {
        from_peer: String,
        to_peer: String,
        sdp: String,
    },
    IceCandidate {
        from_peer: String,
        to_peer: String,
        candidate: String,
    },
    Leave {
        room: String,
        peer_id: String,
    },
    Error {
        message: String,
    },
}

#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<SignalingMessage>,
}

impl SignalingSender {
    pub async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|e| AppError::Signaling(format!("Failed to send message: {}", e)))
    }
}

pub struct SignalingClient {
    tx: SignalingSender,
    rx: mpsc::Receiver<SignalingMessage>,
    reader: Option<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<SignalingMessage>(100);

        // Handle outgoing messages. The writer drains what is queued and closes
        // the socket once every sender is gone.
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("dropping unserializable signaling message: {}", e),
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Handle incoming messages
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!("ignoring unknown signaling frame: {}", e),
                }
            }
        });

        Ok(Self {
            tx: SignalingSender { tx: outgoing_tx },
            rx,
            reader: Some(reader),
        })
    }

    pub fn sender(&self) -> SignalingSender {
        self.tx.clone()
    }

    pub async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.tx.send(msg).await
    }

    /// `None` once the relay connection is gone.
    pub async fn receive(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    /// Stops reading from the relay. Queued outgoing frames are still flushed.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.rx.close();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_tagged() {
        let json = serde_json::to_value(SignalingMessage::Join {
            app_id: "app".into(),
            room: "lobby".into(),
            peer_id: "p1".into(),
        })
        .unwrap();
        assert_eq!(json["message_type"], "Join");
        assert_eq!(json["room"], "lobby");

        let welcome: SignalingMessage =
            serde_json::from_str(r#"{"message_type":"Welcome","peer_id":"p1","peers":["p2"]}"#).unwrap();
        assert_eq!(
            welcome,
            SignalingMessage::Welcome {
                peer_id: "p1".into(),
                peers: vec!["p2".into()],
            }
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(serde_json::from_str::<SignalingMessage>(r#"{"message_type":"Nope"}"#).is_err());
    }
}
