//! 执行历史：最近 N 次转移与最近 N 个状态，仅用于异常模式检测与纠偏提示

use std::collections::VecDeque;

/// 默认保留条数
pub const DEFAULT_HISTORY_CAPACITY: usize = 25;

/// 一次已执行的转移
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    capacity: usize,
    transitions: VecDeque<TransitionRecord>,
    states: VecDeque<String>,
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            transitions: VecDeque::with_capacity(capacity),
            states: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push_transition(&mut self, name: impl Into<String>, description: impl Into<String>) {
        if self.transitions.len() == self.capacity {
            self.transitions.pop_front();
        }
        self.transitions.push_back(TransitionRecord {
            name: name.into(),
            description: description.into(),
        });
    }

    pub fn push_state(&mut self, state: impl Into<String>) {
        if self.states.len() == self.capacity {
            self.states.pop_front();
        }
        self.states.push_back(state.into());
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.transitions.iter()
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(String::as_str)
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.transitions.back()
    }

    pub fn last_state(&self) -> Option<&str> {
        self.states.back().map(String::as_str)
    }

    /// 倒数第二个状态（最近一次识别之前的状态）
    pub fn previous_state(&self) -> Option<&str> {
        self.states.iter().rev().nth(1).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.transitions.clear();
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded() {
        let mut h = ExecutionHistory::new(3);
        for i in 0..5 {
            h.push_state(format!("S{}", i));
            h.push_transition(format!("t{}", i), "");
        }
        assert_eq!(h.states().collect::<Vec<_>>(), vec!["S2", "S3", "S4"]);
        assert_eq!(h.transition_count(), 3);
        assert_eq!(h.last_transition().map(|t| t.name.as_str()), Some("t4"));
        assert_eq!(h.previous_state(), Some("S3"));
    }

    #[test]
    fn test_clear() {
        let mut h = ExecutionHistory::default();
        assert_eq!(h.capacity(), DEFAULT_HISTORY_CAPACITY);
        h.push_state("A");
        assert_eq!(h.previous_state(), None);
        h.clear();
        assert!(h.is_empty());
    }
}
