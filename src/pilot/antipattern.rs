//! 异常模式检测：计划外转移、重复转移、重复状态
//!
//! 重复转移的阈值为 `tolerance + 1`（首次转移不计），其余两类为 `tolerance`。

use std::collections::HashMap;

use super::graph::StateGraph;
use super::history::ExecutionHistory;
use super::PilotError;
use crate::config::PilotConfig;

/// 出现次数大于 1 的条目（逐条保留，含重复）
fn repeated<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let items: Vec<&str> = items.collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in &items {
        *counts.entry(*item).or_insert(0) += 1;
    }
    items
        .into_iter()
        .filter(|item| counts.get(item).copied().unwrap_or(0) > 1)
        .map(str::to_string)
        .collect()
}

pub fn repeated_transitions(history: &ExecutionHistory) -> Vec<String> {
    let found = repeated(history.transitions().map(|t| t.name.as_str()));
    if !found.is_empty() {
        tracing::info!("Found repeated transitions: {:?}", found);
    }
    found
}

pub fn repeated_states(history: &ExecutionHistory) -> Vec<String> {
    let found = repeated(history.states());
    if !found.is_empty() {
        tracing::info!("Found repeated states: {:?}", found);
    }
    found
}

/// 按顺序检查三类异常，返回第一个超出容忍度的
pub fn detect(graph: &StateGraph, history: &ExecutionHistory, config: &PilotConfig) -> Option<PilotError> {
    let edges = graph.unplanned_transitions();
    if edges.len() > config.tolerate_unplanned_transitions {
        return Some(PilotError::UnplannedTransitions { edges });
    }

    let names = repeated_transitions(history);
    if names.len() > config.tolerate_repeat_transitions + 1 {
        return Some(PilotError::RepeatedTransitions { names });
    }

    let states = repeated_states(history);
    if states.len() > config.tolerate_repeat_states {
        return Some(PilotError::RepeatedStates { states });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tolerance: usize) -> PilotConfig {
        PilotConfig::builder()
            .tolerate_unplanned_transitions(tolerance)
            .tolerate_repeat_transitions(tolerance)
            .tolerate_repeat_states(tolerance)
            .build()
            .unwrap()
    }

    #[test]
    fn test_repeated_counts_every_occurrence() {
        let mut h = ExecutionHistory::new(25);
        for name in ["a", "b", "a", "c", "a"] {
            h.push_transition(name, "");
        }
        assert_eq!(repeated_transitions(&h), vec!["a", "a", "a"]);
    }

    #[test]
    fn test_repeat_transition_threshold_is_tolerance_plus_one() {
        let graph = StateGraph::new();
        let mut h = ExecutionHistory::new(25);
        // T = 2：T+1 = 3 次不触发
        for _ in 0..3 {
            h.push_transition("retry", "");
        }
        assert!(detect(&graph, &h, &config(2)).is_none());
        // T+2 = 4 次触发
        h.push_transition("retry", "");
        assert!(matches!(
            detect(&graph, &h, &config(2)),
            Some(PilotError::RepeatedTransitions { ref names }) if names.len() == 4
        ));
    }

    #[test]
    fn test_repeat_state_threshold_is_tolerance() {
        let graph = StateGraph::new();
        let mut h = ExecutionHistory::new(25);
        for _ in 0..2 {
            h.push_state("Popup");
        }
        assert!(detect(&graph, &h, &config(2)).is_none());
        h.push_state("Popup");
        assert!(matches!(
            detect(&graph, &h, &config(2)),
            Some(PilotError::RepeatedStates { ref states }) if states.len() == 3
        ));
    }
}
