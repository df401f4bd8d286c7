//! 引擎错误、控制信号与运行结果

use std::fmt;

use thiserror::Error;

use super::graph::GraphError;
use crate::actions::{ActionContext, ActionError};
use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::recovery::CourseCorrectionImpossible;
use crate::vision::ClassifierError;

/// 转移与目标函数向引擎发出的信号
#[derive(Error, Debug)]
pub enum Signal {
    /// 自动化完成（可附带说明）
    #[error("UI automation completed{}", suffix(.0))]
    Complete(Option<String>),

    /// 业务结果（如“单据已存在”），正常结束运行
    #[error("Business exception: {0}")]
    Business(String),

    /// 回滚转移已把界面带回安全状态
    #[error("Rollback completed")]
    RollbackCompleted,

    /// UI 动作失败，触发纠偏与回滚
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl Signal {
    pub fn complete() -> Self {
        Signal::Complete(None)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Signal::Business(message.into())
    }
}

fn suffix(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default()
}

/// 正常结束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(Option<String>),
    Business(String),
}

/// 一次运行的汇总
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: Outcome,
    pub final_state: Option<String>,
    /// 本次运行执行过的转移数（含回滚转移）
    pub transitions: usize,
}

/// 运行期失败的结构化上下文
#[derive(Debug, Clone, PartialEq)]
pub struct FailureContext {
    pub transition: String,
    pub action: Option<ActionContext>,
    pub error: String,
}

impl FailureContext {
    pub fn from_action_error(transition: &str, error: &ActionError) -> Self {
        Self {
            transition: transition.to_string(),
            action: error.context().cloned(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for FailureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Some(action) => write!(f, "{} at action {} ({})", self.transition, action.description, self.error),
            None => write!(f, "{} ({})", self.transition, self.error),
        }
    }
}

/// 引擎运行错误
#[derive(Error, Debug)]
pub enum PilotError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{} unplanned transitions detected: {:?}.", .edges.len(), .edges)]
    UnplannedTransitions { edges: Vec<(String, String)> },

    #[error("{} repeated transitions detected: {:?}.", .names.len(), .names)]
    RepeatedTransitions { names: Vec<String> },

    #[error("{} repeated states detected: {:?}.", .states.len(), .states)]
    RepeatedStates { states: Vec<String> },

    #[error(transparent)]
    CourseCorrectionImpossible(#[from] CourseCorrectionImpossible),

    #[error("Rollback completed{}", rollback_suffix(.0))]
    RollbackCompleted(Option<FailureContext>),

    #[error("State evaluation failed: {0}")]
    StateEvaluation(#[from] ClassifierError),

    #[error("Transition '{name}' failed: {source}")]
    Transition {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Goal function failed: {0}")]
    Goal(#[source] anyhow::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

fn rollback_suffix(failure: &Option<FailureContext>) -> String {
    failure.as_ref().map(|f| format!(" after runtime error in {}", f)).unwrap_or_default()
}

impl PilotError {
    /// 异常模式类错误
    pub fn is_anti_pattern(&self) -> bool {
        matches!(
            self,
            PilotError::UnplannedTransitions { .. }
                | PilotError::RepeatedTransitions { .. }
                | PilotError::RepeatedStates { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Target, UiAction};

    #[test]
    fn test_signal_display() {
        assert_eq!(Signal::complete().to_string(), "UI automation completed");
        assert_eq!(
            Signal::Complete(Some("invoice booked".into())).to_string(),
            "UI automation completed: invoice booked"
        );
        assert_eq!(Signal::business("duplicate").to_string(), "Business exception: duplicate");
    }

    #[test]
    fn test_failure_context_from_action_error() {
        let action = UiAction::left_click(Target::text("Save"));
        let err = ActionError::Failed {
            context: action.context(),
            message: "window not found".into(),
        };
        let failure = FailureContext::from_action_error("save_invoice", &err);
        assert_eq!(failure.transition, "save_invoice");
        assert_eq!(failure.action.as_ref().map(|a| a.target.clone()), Some(Some("Save".to_string())));
        let rendered = PilotError::RollbackCompleted(Some(failure)).to_string();
        assert!(rendered.starts_with("Rollback completed after runtime error in save_invoice at action"));
        assert!(rendered.contains("window not found"));
    }

    #[test]
    fn test_anti_pattern_display() {
        let err = PilotError::RepeatedStates {
            states: vec!["A".into(), "A".into()],
        };
        assert!(err.is_anti_pattern());
        assert_eq!(err.to_string(), r#"2 repeated states detected: ["A", "A"]."#);
    }
}
