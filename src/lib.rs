//! Screen Pilot - 远程界面自动化状态机执行引擎
//!
//! 模块划分：
//! - **api**: 平台 HTTP 客户端（Bearer 鉴权、指数退避重试）
//! - **channel**: 远程动作通道（WebSocket，ACK + 结果两阶段握手）
//! - **device**: 远端设备分配池（轮询申请、尽力释放）
//! - **actions**: UI 动作模型与执行门面（目标定位、审计日志）
//! - **vision**: 状态识别门面
//! - **recovery**: AI 纠偏（动作串解析、反馈重试）
//! - **artifacts**: 截图等运行产物
//! - **pilot**: 状态图与执行引擎（异常模式检测、回滚、结束清理）
//! - **session**: 自动化会话（申请设备 → 建立通道 → 执行 → 释放）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化与审计
//! - **mock**: 测试替身

pub mod actions;
pub mod api;
pub mod artifacts;
pub mod channel;
pub mod config;
pub mod device;
pub mod mock;
pub mod observability;
pub mod pilot;
pub mod recovery;
pub mod session;
pub mod vision;

pub use pilot::{Arguments, Goal, Outcome, Pilot, PilotError, RunReport, Signal, State, StateGraph};
pub use session::{AutomationSession, SessionHandle};
