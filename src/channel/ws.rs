//! WebSocket 传输（tokio-tungstenite）

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use super::{ChannelError, FrameTransport};

/// 到远端设备发布端的 WebSocket 连接
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// 连接 `url`，单帧 / 单消息上限为 `max_message_bytes`
    pub async fn connect(url: &str, max_message_bytes: usize) -> Result<Self, ChannelError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(max_message_bytes);
        config.max_frame_size = Some(max_message_bytes);

        let (stream, _) = connect_async_with_config(url, Some(config), false)
            .await
            .map_err(|e| ChannelError::Transport(format!("connect failed: {e}")))?;
        tracing::info!("Action channel connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<String, ChannelError> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(|e| ChannelError::Transport(e.to_string()))? {
                WsMessage::Text(text) => return Ok(text),
                WsMessage::Binary(bytes) => {
                    return String::from_utf8(bytes)
                        .map_err(|e| ChannelError::Transport(format!("non-utf8 frame: {e}")))
                }
                WsMessage::Close(_) => return Err(ChannelError::Closed),
                _ => continue,
            }
        }
        Err(ChannelError::Closed)
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}
