//! 转移、守卫与目标函数
//!
//! 三者都声明自己接受的参数名，调用时只拿到 [`Arguments`] 中对应的那部分。

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::Signal;
use crate::actions::{ActionError, ActionExecutor, UiAction};

/// 调用方传入的命名参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(BTreeMap<String, Value>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 只保留 `params` 中声明的参数
    pub fn filtered(&self, params: &[String]) -> Arguments {
        Arguments(
            self.0
                .iter()
                .filter(|(k, _)| params.iter().any(|p| p == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

fn names<I, S>(params: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    params.into_iter().map(Into::into).collect()
}

type Predicate = dyn Fn(&Arguments) -> bool + Send + Sync;

/// 转移守卫：同一 (起点, 模式) 下存在多条转移时，每条都必须带守卫
#[derive(Clone)]
pub struct Guard {
    params: Vec<String>,
    predicate: Arc<Predicate>,
}

impl Guard {
    pub fn new<I, S, F>(params: I, predicate: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Arguments) -> bool + Send + Sync + 'static,
    {
        Self {
            params: names(params),
            predicate: Arc::new(predicate),
        }
    }

    /// 参数 `key` 等于 `expected` 时成立
    pub fn equals(key: impl Into<String>, expected: impl Into<Value>) -> Self {
        let key = key.into();
        let expected = expected.into();
        Self::new([key.clone()], move |args| args.get(&key) == Some(&expected))
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn check(&self, args: &Arguments) -> bool {
        (self.predicate)(&args.filtered(&self.params))
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("params", &self.params).finish()
    }
}

type GoalCheck = dyn Fn(&str, &Arguments) -> Result<(), Signal> + Send + Sync;

/// 目标函数：每次状态识别后调用，返回 `Err(Signal::Complete | Signal::Business)` 结束运行
#[derive(Clone)]
pub struct Goal {
    params: Vec<String>,
    check: Arc<GoalCheck>,
}

impl Goal {
    pub fn new<I, S, F>(params: I, check: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&str, &Arguments) -> Result<(), Signal> + Send + Sync + 'static,
    {
        Self {
            params: names(params),
            check: Arc::new(check),
        }
    }

    /// 从不主动结束；需由某个转移发出完成信号
    pub fn none() -> Self {
        Self::new(Vec::<String>::new(), |_, _| Ok(()))
    }

    /// 识别到 `state` 即完成
    pub fn reach(state: impl Into<String>) -> Self {
        let state = state.into();
        Self::new(Vec::<String>::new(), move |current, _| {
            if current == state {
                Err(Signal::Complete(None))
            } else {
                Ok(())
            }
        })
    }

    pub fn check(&self, current_state: &str, args: &Arguments) -> Result<(), Signal> {
        (self.check)(current_state, &args.filtered(&self.params))
    }
}

impl Default for Goal {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Goal").field("params", &self.params).finish()
    }
}

/// 转移执行时可用的上下文
#[derive(Clone)]
pub struct TransitionContext {
    actions: Arc<dyn ActionExecutor>,
    args: Arguments,
}

impl TransitionContext {
    pub fn new(actions: Arc<dyn ActionExecutor>, args: Arguments) -> Self {
        Self { actions, args }
    }

    /// 已按声明过滤的参数
    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn actions(&self) -> &Arc<dyn ActionExecutor> {
        &self.actions
    }

    pub async fn perform(&self, action: UiAction) -> Result<Value, ActionError> {
        self.actions.perform(&action).await
    }
}

/// 状态间的一次转移
///
/// 执行中返回的 [`Signal::Action`] 视为运行期失败，由引擎转入纠偏与回滚；
/// `Complete` / `Business` 结束运行；`Fatal` 直接中止。
#[async_trait]
pub trait Transition: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// 接受的参数名
    fn params(&self) -> &[String] {
        &[]
    }

    async fn execute(&self, ctx: TransitionContext) -> Result<(), Signal>;
}

/// 由闭包构成的转移
pub struct FnTransition<F> {
    name: String,
    description: String,
    params: Vec<String>,
    func: F,
}

/// 用闭包定义转移：`transition("login", |ctx| async move { ... })`
pub fn transition<F, Fut>(name: impl Into<String>, func: F) -> FnTransition<F>
where
    F: Fn(TransitionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Signal>> + Send,
{
    FnTransition {
        name: name.into(),
        description: String::new(),
        params: Vec::new(),
        func,
    }
}

impl<F> FnTransition<F> {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = names(params);
        self
    }
}

#[async_trait]
impl<F, Fut> Transition for FnTransition<F>
where
    F: Fn(TransitionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Signal>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn params(&self) -> &[String] {
        &self.params
    }

    async fn execute(&self, ctx: TransitionContext) -> Result<(), Signal> {
        (self.func)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingExecutor;
    use serde_json::json;

    #[test]
    fn test_arguments_filtered() {
        let args = Arguments::new().with("user", "alice").with("amount", 12).with("debug", true);
        let filtered = args.filtered(&["user".to_string(), "missing".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get_str("user"), Some("alice"));
        assert!(!filtered.contains("amount"));
    }

    #[test]
    fn test_guard_sees_only_declared_params() {
        let guard = Guard::new(["mode"], |args| args.len() == 1 && args.get_str("mode") == Some("fast"));
        assert!(guard.check(&Arguments::new().with("mode", "fast").with("other", 1)));
        assert!(!guard.check(&Arguments::new().with("mode", "slow")));
        assert!(Guard::equals("retry", true).check(&Arguments::new().with("retry", true)));
    }

    #[test]
    fn test_goal_reach() {
        let goal = Goal::reach("Done");
        assert!(goal.check("Login", &Arguments::new()).is_ok());
        assert!(matches!(goal.check("Done", &Arguments::new()), Err(Signal::Complete(None))));
    }

    #[tokio::test]
    async fn test_fn_transition_executes() {
        let t = transition("submit", |ctx: TransitionContext| async move {
            let user = ctx.args().get_str("user").unwrap_or_default().to_string();
            ctx.perform(UiAction::send_keys(user)).await?;
            Ok::<(), Signal>(())
        })
        .with_description("Submit the form")
        .with_params(["user"]);
        assert_eq!(t.name(), "submit");
        assert_eq!(t.description(), "Submit the form");

        let executor = Arc::new(RecordingExecutor::new());
        let args = Arguments::new().with("user", json!("bob")).filtered(t.params());
        t.execute(TransitionContext::new(executor.clone(), args)).await.unwrap();
        assert_eq!(executor.performed(), vec![UiAction::send_keys("bob")]);
    }
}
