//! 纠偏目标（prompt）生成

use std::fmt;

use super::graph::{State, StateGraph};
use super::history::ExecutionHistory;

/// 触发纠偏的场景
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryScenario {
    /// 运行结束但终态不允许退出
    Exit,
    /// 转移执行中 UI 动作失败
    RuntimeError,
    /// 识别到 Error 状态
    UnexpectedState,
}

impl fmt::Display for RecoveryScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecoveryScenario::Exit => "exit",
            RecoveryScenario::RuntimeError => "runtime_error",
            RecoveryScenario::UnexpectedState => "unexpected_state",
        })
    }
}

fn listing<'a>(states: impl Iterator<Item = &'a State>) -> String {
    states
        .map(|s| format!("{} ({})", s.id, s.description))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 为纠偏 Agent 生成自然语言目标
pub fn recovery_prompt(
    scenario: RecoveryScenario,
    graph: &StateGraph,
    history: &ExecutionHistory,
    next_target: Option<&str>,
    details: Option<&str>,
) -> String {
    let last = history.last_transition();
    match (scenario, last) {
        (RecoveryScenario::UnexpectedState, None) => format!(
            "The process just started but the system is in an unexpected state. We need to return to one of the known states: {}.",
            listing(graph.start_states())
        ),
        (RecoveryScenario::Exit, _) => format!(
            "The process has completed and we need to bring the system back to a state where we can exit safely: {}.",
            listing(graph.end_states())
        ),
        (RecoveryScenario::RuntimeError, _) => {
            let (name, description) = last
                .map(|t| (t.name.as_str(), t.description.as_str()))
                .unwrap_or(("unknown transition", ""));
            let previous = history.last_state().unwrap_or("");
            format!(
                "We tried performing '{}' ({}) but ran into an error: {}. Could you try and remove possible causes of the error? It could be e.g. a popup, or window focus. We want to return to the previous state, {} ({}).",
                name,
                description,
                details.unwrap_or("unknown error"),
                previous,
                graph.description(previous)
            )
        }
        (RecoveryScenario::UnexpectedState, Some(t)) => {
            let target = next_target.unwrap_or("");
            format!(
                "We tried performing '{}' ({}) and expected to see state '{}' ({}) but the screen does not match the expected state.",
                t.name,
                t.description,
                target,
                graph.description(target)
            )
        }
    }
}
