//! 状态图：状态、计划/回滚转移、运行中记录的实际转移
//!
//! 每个引擎实例独占一张图。转移按注册顺序保存，选择时取第一条模式匹配且守卫成立的边。
//! 同一 (起点, 模式) 下至多一条无守卫的边；一旦有多条，每条都必须带守卫。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::transition::{Arguments, Guard, Transition};
use crate::vision::StateDescriptor;

/// 注册期 / 选择期的配置错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("State '{0}' is already registered")]
    DuplicateState(String),

    #[error("Error while registering {transition}: transition from {from} to {to} involves undefined state '{state}'")]
    UndefinedState {
        transition: String,
        from: String,
        to: String,
        state: String,
    },

    #[error("Error while registering {transition}: {existing} is already registered as {} from {from} to {to}. To add multiple transitions between the same states, provide a condition function for each of them.", .mode.registration_label())]
    AmbiguousTransition {
        transition: String,
        existing: String,
        mode: Mode,
        from: String,
        to: String,
    },

    #[error("Transition {0} is already registered")]
    DuplicateKey(String),

    #[error("Current state {0} is not recognized.")]
    UnrecognizedState(String),

    #[error("Cannot get a valid transition from {state} in {mode} mode. {available} transitions available, but none of them match the mode and conditions.")]
    NoTransition {
        state: String,
        mode: Mode,
        available: usize,
    },
}

/// 转移模式（同时也是引擎的运行模式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    #[default]
    Planned,
    Rollback,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Planned => "planned",
            Mode::Rollback => "rollback",
        }
    }

    fn registration_label(&self) -> &'static str {
        match self {
            Mode::Planned => "transition",
            Mode::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册后的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub id: String,
    pub description: String,
    /// 可作为运行起点
    pub start_allowed: bool,
    /// 可作为运行终点
    pub end_allowed: bool,
}

impl State {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            start_allowed: true,
            end_allowed: true,
        }
    }

    pub fn start_allowed(mut self, allowed: bool) -> Self {
        self.start_allowed = allowed;
        self
    }

    pub fn end_allowed(mut self, allowed: bool) -> Self {
        self.end_allowed = allowed;
        self
    }
}

/// 边的句柄：`{name}_from_{from}_to_{to}_{mode}`
pub type EdgeKey = String;

struct Edge {
    key: EdgeKey,
    from: String,
    to: String,
    mode: Mode,
    transition: Arc<dyn Transition>,
    guard: Option<Guard>,
}

/// 运行中观察到的实际转移
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualEdge {
    pub key: String,
    pub from: String,
    pub to: String,
    /// 触发它的转移名
    pub via: String,
}

/// 选中的下一条转移
#[derive(Clone)]
pub struct Selected {
    pub key: EdgeKey,
    pub to: String,
    pub transition: Arc<dyn Transition>,
}

impl fmt::Debug for Selected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selected")
            .field("key", &self.key)
            .field("to", &self.to)
            .field("transition", &self.transition.name())
            .finish()
    }
}

/// 状态图
#[derive(Default)]
pub struct StateGraph {
    states: Vec<State>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    actual: Vec<ActualEdge>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册状态，返回状态 id
    pub fn add_state(&mut self, state: State) -> Result<String, GraphError> {
        if self.index.contains_key(&state.id) {
            return Err(GraphError::DuplicateState(state.id));
        }
        let id = state.id.clone();
        self.index.insert(id.clone(), self.states.len());
        self.states.push(state);
        Ok(id)
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.index.get(id).map(|&i| &self.states[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }

    pub fn description(&self, id: &str) -> &str {
        self.state(id).map(|s| s.description.as_str()).unwrap_or("")
    }

    /// 状态目录（注册顺序），供分类器使用
    pub fn catalogue(&self) -> Vec<StateDescriptor> {
        self.states
            .iter()
            .map(|s| StateDescriptor {
                id: s.id.clone(),
                description: s.description.clone(),
            })
            .collect()
    }

    pub fn add_transition(
        &mut self,
        from: &str,
        to: &str,
        transition: impl Transition + 'static,
    ) -> Result<EdgeKey, GraphError> {
        self.register(from, to, Mode::Planned, Arc::new(transition), None)
    }

    pub fn add_transition_when(
        &mut self,
        from: &str,
        to: &str,
        transition: impl Transition + 'static,
        guard: Guard,
    ) -> Result<EdgeKey, GraphError> {
        self.register(from, to, Mode::Planned, Arc::new(transition), Some(guard))
    }

    pub fn add_rollback(
        &mut self,
        from: &str,
        to: &str,
        transition: impl Transition + 'static,
    ) -> Result<EdgeKey, GraphError> {
        self.register(from, to, Mode::Rollback, Arc::new(transition), None)
    }

    pub fn add_rollback_when(
        &mut self,
        from: &str,
        to: &str,
        transition: impl Transition + 'static,
        guard: Guard,
    ) -> Result<EdgeKey, GraphError> {
        self.register(from, to, Mode::Rollback, Arc::new(transition), Some(guard))
    }

    /// 注册一条计划或回滚转移
    pub fn register(
        &mut self,
        from: &str,
        to: &str,
        mode: Mode,
        transition: Arc<dyn Transition>,
        guard: Option<Guard>,
    ) -> Result<EdgeKey, GraphError> {
        let name = transition.name().to_string();

        if let Some(existing) = self
            .edges
            .iter()
            .find(|e| e.from == from && e.mode == mode && (e.guard.is_none() || guard.is_none()))
        {
            return Err(GraphError::AmbiguousTransition {
                transition: name,
                existing: existing.transition.name().to_string(),
                mode,
                from: existing.from.clone(),
                to: existing.to.clone(),
            });
        }

        for state in [from, to] {
            if !self.contains(state) {
                return Err(GraphError::UndefinedState {
                    transition: name,
                    from: from.to_string(),
                    to: to.to_string(),
                    state: state.to_string(),
                });
            }
        }

        let key = format!("{}_from_{}_to_{}_{}", name, from, to, mode);
        if self.edges.iter().any(|e| e.key == key) {
            return Err(GraphError::DuplicateKey(key));
        }

        tracing::debug!(key = %key, "Transition registered");
        self.edges.push(Edge {
            key: key.clone(),
            from: from.to_string(),
            to: to.to_string(),
            mode,
            transition,
            guard,
        });
        Ok(key)
    }

    /// 已注册的边数（计划 + 回滚）
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// 是否存在指定模式的 from -> to 边
    pub fn has_edge(&self, from: &str, to: &str, mode: Mode) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to && e.mode == mode)
    }

    /// 选择下一条转移：按注册顺序取第一条模式匹配且守卫成立的边
    pub fn select_transition(&self, state: &str, mode: Mode, args: &Arguments) -> Result<Selected, GraphError> {
        if !self.contains(state) {
            return Err(GraphError::UnrecognizedState(state.to_string()));
        }
        let outgoing: Vec<&Edge> = self.edges.iter().filter(|e| e.from == state).collect();
        if outgoing.is_empty() {
            tracing::error!("No available {} transitions from {}.", mode, state);
        }
        outgoing
            .iter()
            .filter(|e| e.mode == mode)
            .find(|e| e.guard.as_ref().map_or(true, |g| g.check(args)))
            .map(|e| Selected {
                key: e.key.clone(),
                to: e.to.clone(),
                transition: Arc::clone(&e.transition),
            })
            .ok_or_else(|| GraphError::NoTransition {
                state: state.to_string(),
                mode,
                available: outgoing.len(),
            })
    }

    /// 记录实际转移；同 key 只记一次，返回是否为新边
    pub fn record_actual(&mut self, from: &str, to: &str, via: &str) -> bool {
        let key = format!("{}_from_{}_to_{}_actual", via, from, to);
        if self.actual.iter().any(|e| e.key == key) {
            return false;
        }
        tracing::debug!(key = %key, "Actual transition recorded");
        self.actual.push(ActualEdge {
            key,
            from: from.to_string(),
            to: to.to_string(),
            via: via.to_string(),
        });
        true
    }

    pub fn actual_edges(&self) -> &[ActualEdge] {
        &self.actual
    }

    pub fn clear_actual(&mut self) {
        self.actual.clear();
    }

    /// 没有对应计划边的实际转移
    pub fn unplanned_transitions(&self) -> Vec<(String, String)> {
        let unplanned: Vec<(String, String)> = self
            .actual
            .iter()
            .filter(|a| !self.has_edge(&a.from, &a.to, Mode::Planned))
            .map(|a| (a.from.clone(), a.to.clone()))
            .collect();
        if !unplanned.is_empty() {
            tracing::info!("Found unplanned transitions: {:?}", unplanned);
        }
        unplanned
    }

    pub fn start_states(&self) -> impl Iterator<Item = &State> {
        self.states.iter().filter(|s| s.start_allowed)
    }

    pub fn end_states(&self) -> impl Iterator<Item = &State> {
        self.states.iter().filter(|s| s.end_allowed)
    }
}
