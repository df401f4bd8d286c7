//! 状态机执行引擎（Pilot）
//!
//! - `graph`：状态与转移注册、转移选择、实际转移记录
//! - `transition`：转移 / 守卫 / 目标函数与参数过滤
//! - `history` / `antipattern`：有界执行历史与异常模式检测
//! - `prompt`：各纠偏场景的目标描述
//! - `engine`：运行主循环与结束清理

mod antipattern;
mod engine;
mod error;
mod graph;
mod history;
mod prompt;
mod transition;

pub use antipattern::{detect as detect_anti_patterns, repeated_states, repeated_transitions};
pub use engine::{Pilot, PilotBuilder, ERROR_STATE};
pub use error::{FailureContext, Outcome, PilotError, RunReport, Signal};
pub use graph::{ActualEdge, EdgeKey, GraphError, Mode, Selected, State, StateGraph};
pub use history::{ExecutionHistory, TransitionRecord, DEFAULT_HISTORY_CAPACITY};
pub use prompt::{recovery_prompt, RecoveryScenario};
pub use transition::{transition, Arguments, FnTransition, Goal, Guard, Transition, TransitionContext};
