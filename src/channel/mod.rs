//! 远程动作通道
//!
//! 一条持久连接上的两阶段握手：发送动作请求 → 超时内等待 ACK（必须为 `OK`）→ 同一超时内等待 JSON 结果。
//! 每条连接同一时刻只允许一个请求在途，由异步互斥锁保证。
//! 传输层抽象为 [`FrameTransport`]，生产环境用 WebSocket，测试可用内存实现。

mod message;
mod ws;

pub use message::{ActionRequest, ActionResponse, ActionState, ACK_OK};
pub use ws::WsTransport;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::ChannelSection;
use crate::device::RemoteDevice;

/// 默认每阶段超时
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(90);

/// 通道错误：ACK 超时与 ACK 不匹配是两种不同的失败
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("The ack message did not arrive within {0:?}")]
    AckTimeout(Duration),

    #[error("Received ACK != OK: {0}")]
    AckMismatch(String),

    #[error("The result message did not arrive within {0:?}")]
    ResultTimeout(Duration),

    #[error("Channel closed by remote")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Action channel is out of sync: a previous request never received its reply")]
    Desynced,
}

/// 文本帧传输
#[async_trait]
pub trait FrameTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;

    /// 读取下一帧文本；连接关闭时返回 `Closed`
    async fn recv_text(&mut self) -> Result<String, ChannelError>;

    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// 为分配到的设备建立传输连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &RemoteDevice) -> Result<Box<dyn FrameTransport>, ChannelError>;
}

/// WebSocket 连接器：`{uri}/{device}/publisher?token={wss_token}`
#[derive(Debug, Clone)]
pub struct WsConnector {
    uri: String,
    max_message_bytes: usize,
}

impl WsConnector {
    pub fn new(uri: impl Into<String>, max_message_bytes: usize) -> Self {
        Self {
            uri: uri.into().trim_end_matches('/').to_string(),
            max_message_bytes,
        }
    }

    pub fn from_config(section: &ChannelSection) -> Self {
        Self::new(section.uri.clone(), section.max_message_bytes)
    }

    pub fn device_url(&self, device: &RemoteDevice) -> String {
        format!(
            "{}/{}/publisher?token={}",
            self.uri, device.name, device.wss_token
        )
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, device: &RemoteDevice) -> Result<Box<dyn FrameTransport>, ChannelError> {
        let url = self.device_url(device);
        tracing::debug!(device = %device.name, "Connecting action channel");
        let transport = WsTransport::connect(&url, self.max_message_bytes).await?;
        Ok(Box::new(transport))
    }
}

/// 连接与在途状态
struct Link {
    transport: Box<dyn FrameTransport>,
    /// 已发出请求但尚未读到结果
    awaiting_reply: bool,
}

/// 动作通道：对传输层做 ACK / 结果两阶段握手
///
/// 请求超时或被取消后，迟到的 ACK / 结果帧仍会留在连接上，
/// 此后该通道的所有请求都以 [`ChannelError::Desynced`] 失败。
pub struct ActionChannel {
    link: Mutex<Link>,
    ack_timeout: Duration,
}

impl ActionChannel {
    pub fn new(transport: Box<dyn FrameTransport>) -> Self {
        Self {
            link: Mutex::new(Link {
                transport,
                awaiting_reply: false,
            }),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// 发送请求并等待 ACK 与结果；任何一步失败都返回对应的 ChannelError
    pub async fn request(&self, request: &ActionRequest) -> Result<ActionResponse, ChannelError> {
        let payload = serde_json::to_string(request)?;
        let mut link = self.link.lock().await;
        if link.awaiting_reply {
            return Err(ChannelError::Desynced);
        }

        link.transport.send_text(payload).await?;
        link.awaiting_reply = true;

        let ack = timeout(self.ack_timeout, link.transport.recv_text())
            .await
            .map_err(|_| ChannelError::AckTimeout(self.ack_timeout))??;
        if ack.trim() != ACK_OK {
            // 拒绝的请求不会再有结果帧
            link.awaiting_reply = false;
            return Err(ChannelError::AckMismatch(ack));
        }

        let body = timeout(self.ack_timeout, link.transport.recv_text())
            .await
            .map_err(|_| ChannelError::ResultTimeout(self.ack_timeout))??;
        link.awaiting_reply = false;
        Ok(serde_json::from_str(&body)?)
    }

    /// 关闭底层连接（尽力而为）
    pub async fn close(&self) {
        if let Err(e) = self.link.lock().await.transport.close().await {
            tracing::warn!("Failed to close action channel: {}", e);
        }
    }
}
