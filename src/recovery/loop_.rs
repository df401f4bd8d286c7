//! 纠偏主循环
//!
//! 请求动作 -> 解析 -> 执行 -> 按失败类别写反馈并重试；NoAction 或成功执行即结束。
//! 无论从哪条路径退出，都会清空 Agent 累积的反馈。

use super::{parse_action_string, ActionString, CorrectiveAction, CourseCorrectionImpossible, CourseCorrector};
use crate::actions::{ActionError, ActionExecutor};

/// 目标定位失败时回传的反馈
pub const TARGET_NOT_FOUND_FEEDBACK: &str =
    "The target could not be uniquely identified. Try using different anchors or target.";
/// 远端执行失败时回传的反馈
pub const ACTION_FAILED_FEEDBACK: &str = "The action could not be performed.";

const NO_ACTION_GENERATED: &str = "No course correction action could be generated, see logs for details.";

/// 一次纠偏的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// Agent 认为无需操作
    NoAction,
    /// 成功执行了一个纠偏动作
    Acted,
    /// 遇到无法归类的错误，提前终止
    Aborted,
    /// 用尽尝试次数仍未成功
    Exhausted,
}

/// 单次尝试的结果
enum Attempt {
    NoAction,
    Acted,
    Retry,
    Abort,
}

/// 执行纠偏，最多 `attempts` 次
pub async fn course_correct(
    agent: &mut dyn CourseCorrector,
    executor: &dyn ActionExecutor,
    attempts: usize,
) -> Result<CorrectionOutcome, CourseCorrectionImpossible> {
    let result = correct(agent, executor, attempts).await;
    agent.reset_feedback();
    result
}

async fn correct(
    agent: &mut dyn CourseCorrector,
    executor: &dyn ActionExecutor,
    attempts: usize,
) -> Result<CorrectionOutcome, CourseCorrectionImpossible> {
    for attempt in 1..=attempts {
        tracing::info!("AI recovery attempt {} / {}", attempt, attempts);

        let action = match agent.corrective_action().await {
            Ok(action) => action,
            Err(e) => {
                tracing::error!(agent = agent.name(), "Failed to get a corrective action: {}", e);
                return Err(CourseCorrectionImpossible(NO_ACTION_GENERATED.to_string()));
            }
        };
        tracing::info!(
            action = %action.action_string,
            comment = action.action_comment.as_deref().unwrap_or(""),
            "Corrective action proposed"
        );

        let step = attempt_action(agent, executor, &action).await;

        if action.interrupt_process {
            let reason = action
                .observation
                .clone()
                .unwrap_or_else(|| "recovery agent requested to interrupt the process".to_string());
            tracing::warn!("Recovery agent interrupted the process: {}", reason);
            return Err(CourseCorrectionImpossible(reason));
        }

        match step {
            Attempt::NoAction => {
                tracing::info!("Recovery agent proposed no action");
                return Ok(CorrectionOutcome::NoAction);
            }
            Attempt::Acted => return Ok(CorrectionOutcome::Acted),
            Attempt::Abort => {
                tracing::info!("Interrupting AI recovery.");
                return Ok(CorrectionOutcome::Aborted);
            }
            Attempt::Retry => tracing::info!("Retrying with feedback..."),
        }
    }
    tracing::warn!("AI recovery exhausted {} attempts", attempts);
    Ok(CorrectionOutcome::Exhausted)
}

async fn attempt_action(
    agent: &mut dyn CourseCorrector,
    executor: &dyn ActionExecutor,
    action: &ActionString,
) -> Attempt {
    let ui_action = match parse_action_string(&action.action_string) {
        Ok(CorrectiveAction::NoAction) => return Attempt::NoAction,
        Ok(CorrectiveAction::Perform(ui_action)) => ui_action,
        Err(e) => {
            tracing::error!("{}", e);
            agent.add_feedback(e.to_string());
            return Attempt::Retry;
        }
    };

    match executor.perform(&ui_action).await {
        Ok(_) => {
            tracing::info!(action = %ui_action.describe(), "Corrective action performed");
            Attempt::Acted
        }
        Err(ActionError::Invalid(msg)) => {
            tracing::error!("Invalid corrective action: {}", msg);
            agent.add_feedback(msg);
            Attempt::Retry
        }
        Err(e @ ActionError::TargetNotFound { .. }) => {
            tracing::error!("{}", e);
            agent.add_feedback(TARGET_NOT_FOUND_FEEDBACK.to_string());
            Attempt::Retry
        }
        Err(e @ (ActionError::Failed { .. } | ActionError::Channel { .. })) => {
            tracing::error!("{}", e);
            agent.add_feedback(ACTION_FAILED_FEEDBACK.to_string());
            Attempt::Retry
        }
        Err(e) => {
            tracing::error!("Unexpected error during AI recovery: {}", e);
            Attempt::Abort
        }
    }
}
