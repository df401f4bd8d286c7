//! 动作通道线上消息格式
//!
//! 请求：`{proc_inst_id, client_name, headless, action}`；
//! 远端先回一帧 ACK 文本（`OK`），再回一帧 JSON 结果。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// ACK 帧的约定内容
pub const ACK_OK: &str = "OK";

/// 发往远端设备的动作请求
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    /// 运行实例 id（run id）
    pub proc_inst_id: Option<String>,
    /// 目标设备名
    pub client_name: Option<String>,
    pub headless: bool,
    /// 动作载荷，`action_type` 字段决定其余字段含义
    pub action: Value,
}

/// 远端执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionState {
    Completed,
    Failed,
}

/// 远端执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub state: ActionState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub return_value: Option<Value>,
    /// 截图动作返回的 base64 PNG
    #[serde(default)]
    pub screen_b64: Option<String>,
}

impl ActionResponse {
    pub fn completed(return_value: Option<Value>) -> Self {
        Self {
            id: None,
            state: ActionState::Completed,
            message: None,
            return_value,
            screen_b64: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            id: None,
            state: ActionState::Failed,
            message: Some(message.into()),
            return_value: None,
            screen_b64: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == ActionState::Failed
    }
}
