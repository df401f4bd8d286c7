//! AI 纠偏
//!
//! 纠偏 Agent 持有一个自然语言目标，每次向远端请求一个纠偏动作（动作串），
//! 失败时把原因作为反馈追加，下一次请求一并带上。
//! 动作串只会被解析为封闭的 [`UiAction`](crate::actions::UiAction) 集合再执行，不做任何动态求值。

mod corrector;
mod loop_;
mod parse;

pub use corrector::{CourseCorrectorV1, CourseCorrectorV1Factory};
pub use loop_::{course_correct, CorrectionOutcome, ACTION_FAILED_FEEDBACK, TARGET_NOT_FOUND_FEEDBACK};
pub use parse::{parse_action_string, CorrectiveAction, ParseError, RECOVERY_ACTIONS};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::actions::ActionError;
use crate::api::HttpError;

/// 纠偏服务返回的一条动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionString {
    pub action_string: String,
    #[serde(default)]
    pub action_comment: Option<String>,
    /// 对当前屏幕的观察；中断流程时作为原因
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub interrupt_process: bool,
}

impl ActionString {
    pub fn new(action_string: impl Into<String>) -> Self {
        Self {
            action_string: action_string.into(),
            action_comment: None,
            observation: None,
            interrupt_process: false,
        }
    }

    /// 要求中断流程，`observation` 为原因
    pub fn interrupting(mut self, observation: impl Into<String>) -> Self {
        self.interrupt_process = true;
        self.observation = Some(observation.into());
        self
    }
}

/// 接受 bool 或 "true" / "1" / "yes"（不区分大小写）
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::String(s)) => {
            matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes")
        }
        Some(serde_json::Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    })
}

/// 向纠偏服务请求动作时的错误
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Screen capture failed: {0}")]
    Screen(#[from] ActionError),

    #[error("Course corrector request failed: {0}")]
    Request(#[from] HttpError),

    #[error("Course corrector returned no action")]
    Empty,
}

/// 纠偏无法继续（生成不出动作，或 Agent 要求中断）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Course correction impossible: {0}")]
pub struct CourseCorrectionImpossible(pub String);

/// 纠偏 Agent
#[async_trait]
pub trait CourseCorrector: Send + Sync {
    fn name(&self) -> &str;

    fn goal(&self) -> &str;

    /// 请求下一个纠偏动作（携带已累积的反馈）
    async fn corrective_action(&mut self) -> Result<ActionString, RecoveryError>;

    fn add_feedback(&mut self, feedback: String);

    fn latest_feedback(&self) -> Option<&str>;

    fn reset_feedback(&mut self);
}

/// 按目标与自定义指令创建纠偏 Agent
pub trait RecoveryAgentFactory: Send + Sync {
    fn create(&self, goal: &str, custom_instructions: Option<&str>) -> Box<dyn CourseCorrector>;
}
