//! 测试替身（无需远端服务）
//!
//! 分类器、执行器、纠偏 Agent、设备分配器均按脚本返回，并记录调用，便于本地跑通引擎全流程。

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::actions::{ActionError, ActionExecutor, UiAction};
use crate::api::HttpError;
use crate::device::{DeviceAllocator, DeviceError, RemoteDevice};
use crate::recovery::{ActionString, CourseCorrector, RecoveryAgentFactory, RecoveryError};
use crate::vision::{ClassifiedState, ClassifierError, StateClassifier, StateDescriptor};

pub use crate::artifacts::MemoryArtifactSink;

/// 8 字节 PNG 文件头
pub const PNG_HEADER_B64: &str = "iVBORw0KGgo=";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 按顺序返回预设状态，脚本用完后重复最后一个
#[derive(Debug, Default)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    calls: Mutex<usize>,
}

impl ScriptedClassifier {
    pub fn new<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(states.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl StateClassifier for ScriptedClassifier {
    async fn classify(&self, catalogue: &[StateDescriptor]) -> Result<ClassifiedState, ClassifierError> {
        *lock(&self.calls) += 1;
        let next = lock(&self.script).pop_front();
        let id = match next {
            Some(id) => {
                *lock(&self.last) = Some(id.clone());
                id
            }
            None => lock(&self.last).clone().ok_or(ClassifierError::Empty)?,
        };
        let description = catalogue
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.description.clone())
            .unwrap_or_default();
        Ok(ClassifiedState { id, description })
    }
}

/// 记录成功执行的动作；可按目标文本模拟“找不到目标”或远端失败
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    performed: Mutex<Vec<UiAction>>,
    missing_targets: HashSet<String>,
    failing_targets: Vec<(String, String)>,
    empty_screen: bool,
    screenshots: Mutex<usize>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 目标文本为 `prompt` 的动作返回 TargetNotFound
    pub fn with_missing_target(mut self, prompt: &str) -> Self {
        self.missing_targets.insert(prompt.to_string());
        self
    }

    /// 目标文本为 `prompt` 的动作返回远端 FAILED
    pub fn failing_on(mut self, prompt: &str, message: &str) -> Self {
        self.failing_targets.push((prompt.to_string(), message.to_string()));
        self
    }

    /// 截图返回空，依赖截图定位的动作一并失败
    pub fn with_empty_screen(mut self) -> Self {
        self.empty_screen = true;
        self
    }

    pub fn performed(&self) -> Vec<UiAction> {
        lock(&self.performed).clone()
    }

    pub fn screenshots(&self) -> usize {
        *lock(&self.screenshots)
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn perform(&self, action: &UiAction) -> Result<Value, ActionError> {
        action.validate()?;
        if let Some(target) = action.target() {
            if self.empty_screen && target.bbox.is_none() {
                return Err(ActionError::EmptyScreen);
            }
            if self.missing_targets.contains(&target.prompt) {
                return Err(ActionError::TargetNotFound {
                    context: action.context(),
                });
            }
            if let Some((_, message)) = self.failing_targets.iter().find(|(p, _)| *p == target.prompt) {
                return Err(ActionError::Failed {
                    context: action.context(),
                    message: message.clone(),
                });
            }
        }
        lock(&self.performed).push(action.clone());
        Ok(Value::Null)
    }

    async fn screenshot(&self) -> Result<String, ActionError> {
        *lock(&self.screenshots) += 1;
        if self.empty_screen {
            return Err(ActionError::EmptyScreen);
        }
        Ok(PNG_HEADER_B64.to_string())
    }
}

type Script = Arc<Mutex<VecDeque<ActionString>>>;

/// 按脚本给出纠偏动作；脚本耗尽后返回 `RecoveryError::Empty`
pub struct ScriptedCorrector {
    goal: String,
    script: Script,
    feedback: Vec<String>,
    feedback_log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedCorrector {
    pub fn new(actions: Vec<ActionString>) -> Self {
        Self::shared(
            String::new(),
            Arc::new(Mutex::new(actions.into())),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    fn shared(goal: String, script: Script, feedback_log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            goal,
            script,
            feedback: Vec::new(),
            feedback_log,
        }
    }

    /// 所有收到过的反馈（不受 reset 影响）
    pub fn feedback_history(&self) -> Vec<String> {
        lock(&self.feedback_log).clone()
    }
}

#[async_trait]
impl CourseCorrector for ScriptedCorrector {
    fn name(&self) -> &str {
        "ScriptedCorrector"
    }

    fn goal(&self) -> &str {
        &self.goal
    }

    async fn corrective_action(&mut self) -> Result<ActionString, RecoveryError> {
        lock(&self.script).pop_front().ok_or(RecoveryError::Empty)
    }

    fn add_feedback(&mut self, feedback: String) {
        lock(&self.feedback_log).push(feedback.clone());
        self.feedback.push(feedback);
    }

    fn latest_feedback(&self) -> Option<&str> {
        self.feedback.last().map(String::as_str)
    }

    fn reset_feedback(&mut self) {
        self.feedback.clear();
    }
}

/// 创建共享同一脚本的 ScriptedCorrector，并记录每次创建时的目标
#[derive(Default)]
pub struct ScriptedCorrectorFactory {
    script: Script,
    feedback_log: Arc<Mutex<Vec<String>>>,
    goals: Mutex<Vec<String>>,
    instructions: Mutex<Vec<Option<String>>>,
}

impl ScriptedCorrectorFactory {
    pub fn new(actions: Vec<ActionString>) -> Self {
        Self {
            script: Arc::new(Mutex::new(actions.into())),
            ..Default::default()
        }
    }

    pub fn goals(&self) -> Vec<String> {
        lock(&self.goals).clone()
    }

    pub fn instructions(&self) -> Vec<Option<String>> {
        lock(&self.instructions).clone()
    }

    pub fn feedback_history(&self) -> Vec<String> {
        lock(&self.feedback_log).clone()
    }

    /// 尚未被取走的脚本动作数
    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

impl RecoveryAgentFactory for ScriptedCorrectorFactory {
    fn create(&self, goal: &str, custom_instructions: Option<&str>) -> Box<dyn CourseCorrector> {
        lock(&self.goals).push(goal.to_string());
        lock(&self.instructions).push(custom_instructions.map(str::to_string));
        Box::new(ScriptedCorrector::shared(
            goal.to_string(),
            Arc::clone(&self.script),
            Arc::clone(&self.feedback_log),
        ))
    }
}

/// 按脚本返回分配结果，脚本耗尽后一直返回“无空闲设备”
#[derive(Debug, Default)]
pub struct ScriptedAllocator {
    script: Mutex<VecDeque<Option<RemoteDevice>>>,
    allocate_calls: Mutex<usize>,
    released: Mutex<Vec<RemoteDevice>>,
    fail_release: bool,
}

impl ScriptedAllocator {
    pub fn new(script: Vec<Option<RemoteDevice>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn allocate_calls(&self) -> usize {
        *lock(&self.allocate_calls)
    }

    /// 成功释放的设备
    pub fn released(&self) -> Vec<RemoteDevice> {
        lock(&self.released).clone()
    }
}

#[async_trait]
impl DeviceAllocator for ScriptedAllocator {
    async fn allocate(&self, _group: &str, _run_id: &str) -> Result<Option<RemoteDevice>, DeviceError> {
        *lock(&self.allocate_calls) += 1;
        Ok(lock(&self.script).pop_front().flatten())
    }

    async fn deallocate(&self, device: &RemoteDevice, _run_id: &str) -> Result<(), DeviceError> {
        if self.fail_release {
            return Err(DeviceError::Service(HttpError::Unsuccessful(
                "deallocation rejected".to_string(),
            )));
        }
        lock(&self.released).push(device.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Target;

    fn catalogue() -> Vec<StateDescriptor> {
        vec![StateDescriptor {
            id: "Login".into(),
            description: "Login form".into(),
        }]
    }

    #[tokio::test]
    async fn test_classifier_repeats_last_state() {
        let classifier = ScriptedClassifier::new(["Login"]);
        let first = classifier.classify(&catalogue()).await.unwrap();
        let second = classifier.classify(&catalogue()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.description, "Login form");
        assert_eq!(classifier.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_classifier_errors() {
        let classifier = ScriptedClassifier::new(Vec::<String>::new());
        assert!(matches!(
            classifier.classify(&catalogue()).await,
            Err(ClassifierError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_executor_failing_target() {
        let executor = RecordingExecutor::new().failing_on("Submit", "window lost focus");
        let err = executor
            .perform(&UiAction::left_click(Target::text("Submit")))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Failed { ref message, .. } if message == "window lost focus"));
        assert!(executor.performed().is_empty());
    }

    #[tokio::test]
    async fn test_factory_shares_script() {
        let factory = ScriptedCorrectorFactory::new(vec![ActionString::new("NoAction"), ActionString::new("NoAction")]);
        let mut a = factory.create("first goal", None);
        let mut b = factory.create("second goal", Some("be careful"));
        a.corrective_action().await.unwrap();
        b.corrective_action().await.unwrap();
        assert_eq!(factory.remaining(), 0);
        assert_eq!(factory.goals(), vec!["first goal".to_string(), "second goal".to_string()]);
        assert_eq!(factory.instructions()[1].as_deref(), Some("be careful"));
    }
}
