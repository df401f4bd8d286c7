//! 执行引擎：识别状态 → 检查目标 → 选择并执行转移，循环直至完成或失败
//!
//! 每轮开始前先做异常模式检测；识别到 `Error` 状态时进入 AI 纠偏，不选择转移。
//! 转移中的 UI 动作失败会被拦截：记录失败上下文、截图、纠偏，然后切换到回滚模式。
//! 无论结果如何，结束时都会检查终态是否允许退出，并清理历史、实际边与运行状态。

use std::sync::Arc;

use super::antipattern;
use super::graph::{Mode, Selected, StateGraph};
use super::history::ExecutionHistory;
use super::prompt::{recovery_prompt, RecoveryScenario};
use super::transition::{Arguments, Goal, TransitionContext};
use super::{FailureContext, Outcome, PilotError, RunReport, Signal};
use crate::actions::{ActionError, ActionExecutor, UiAction};
use crate::api::ApiClient;
use crate::artifacts::{screenshot_and_log, ArtifactSink, NullArtifactSink};
use crate::config::{AppConfig, ConfigError, PilotConfig};
use crate::recovery::{
    course_correct, CorrectionOutcome, CourseCorrector, CourseCorrectorV1Factory, RecoveryAgentFactory,
};
use crate::vision::{StateClassifier, VisionClassifier};

/// 保留状态名：分类器认为界面处于异常状态
pub const ERROR_STATE: &str = "Error";

/// 单次运行的可变状态，每次 run() 开始与结束时重置
#[derive(Default)]
struct RunState {
    current_state: Option<String>,
    mode: Mode,
    acted: bool,
    agent: Option<Box<dyn CourseCorrector>>,
    failure: Option<FailureContext>,
    next_target: Option<String>,
    transitions: usize,
}

/// 状态机执行引擎
pub struct Pilot {
    graph: StateGraph,
    classifier: Arc<dyn StateClassifier>,
    actions: Arc<dyn ActionExecutor>,
    recovery: Option<Arc<dyn RecoveryAgentFactory>>,
    artifacts: Arc<dyn ArtifactSink>,
    config: PilotConfig,
    history: ExecutionHistory,
    run: RunState,
    final_state: Option<String>,
}

impl Pilot {
    pub fn builder(graph: StateGraph) -> PilotBuilder {
        PilotBuilder::new(graph)
    }

    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    pub fn config(&self) -> &PilotConfig {
        &self.config
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn mode(&self) -> Mode {
        self.run.mode
    }

    pub fn current_state(&self) -> Option<&str> {
        self.run.current_state.as_deref()
    }

    /// 上一次运行结束时的状态
    pub fn final_state(&self) -> Option<&str> {
        self.final_state.as_deref()
    }

    /// 运行直至目标达成、业务结束或失败
    pub async fn run(&mut self, goal: &Goal, args: &Arguments) -> Result<RunReport, PilotError> {
        self.act_on_start();
        let result = self.drive(goal, args).await;
        self.act_on_completed(result).await
    }

    fn act_on_start(&mut self) {
        self.run = RunState::default();
        self.history.clear();
        self.graph.clear_actual();
        self.final_state = None;
        tracing::info!("State machine execution started.");
    }

    async fn drive(&mut self, goal: &Goal, args: &Arguments) -> Result<Outcome, PilotError> {
        loop {
            self.find_anti_patterns().await?;

            let state = self.evaluate_state().await?;
            if let Err(signal) = goal.check(&state, args) {
                return self.goal_signal(signal);
            }

            if state == ERROR_STATE && self.config.ai_recovery {
                self.attempt_recovery(RecoveryScenario::UnexpectedState, None).await?;
                continue;
            }
            self.run.agent = None;

            let selected = self
                .graph
                .select_transition(&state, self.run.mode, args)
                .map_err(|e| {
                    tracing::error!("{}", e);
                    e
                })?;
            self.run.next_target = Some(selected.to.clone());

            if let Some(outcome) = self.execute_transition(selected, args).await? {
                return Ok(outcome);
            }
        }
    }

    async fn find_anti_patterns(&self) -> Result<(), PilotError> {
        match antipattern::detect(&self.graph, &self.history, &self.config) {
            None => Ok(()),
            Some(err) => {
                if matches!(err, PilotError::RepeatedStates { .. }) {
                    self.force_close_application().await;
                }
                Err(err)
            }
        }
    }

    async fn force_close_application(&self) {
        if !self.config.force_close_on_repeat_states {
            return;
        }
        match self.config.process_name.as_deref() {
            Some(process) => {
                tracing::info!(
                    "RepeatStatesError detected. Killing application with process name: {}",
                    process
                );
                if let Err(e) = self.actions.perform(&UiAction::force_close(process)).await {
                    tracing::warn!("Killing application failed. Details: {}", e);
                }
            }
            None => tracing::warn!(
                "RepeatStatesError detected. Application cannot be killed as process_name was not provided."
            ),
        }
    }

    /// 识别当前状态，写入历史并记录实际转移
    async fn evaluate_state(&mut self) -> Result<String, PilotError> {
        let catalogue = self.graph.catalogue();
        let classified = self.classifier.classify(&catalogue).await?;
        tracing::debug!(
            state = %classified.id,
            description = %classified.description,
            "Current state evaluated"
        );

        let state = classified.id;
        self.history.push_state(state.clone());
        self.run.current_state = Some(state.clone());
        self.run.acted = false;
        self.screenshot(&format!("State_{}", state)).await;

        let edge = match (self.history.previous_state(), self.history.last_transition()) {
            (Some(prev), Some(via)) => Some((prev.to_string(), via.name.clone())),
            _ => None,
        };
        if let Some((prev, via)) = edge {
            self.graph.record_actual(&prev, &state, &via);
        }
        Ok(state)
    }

    fn goal_signal(&self, signal: Signal) -> Result<Outcome, PilotError> {
        match signal {
            Signal::Complete(message) => {
                tracing::info!("UI automation completed.");
                Ok(Outcome::Completed(message))
            }
            Signal::Business(message) => {
                tracing::info!("Business exception: {}. Exiting.", message);
                Ok(Outcome::Business(message))
            }
            Signal::RollbackCompleted => Err(PilotError::RollbackCompleted(self.run.failure.clone())),
            Signal::Action(e) => Err(PilotError::Goal(e.into())),
            Signal::Fatal(e) => Err(PilotError::Goal(e)),
        }
    }

    /// 执行转移；`Ok(Some(..))` 表示运行结束
    async fn execute_transition(&mut self, selected: Selected, args: &Arguments) -> Result<Option<Outcome>, PilotError> {
        let transition = selected.transition;
        let name = transition.name().to_string();
        self.history.push_transition(name.clone(), transition.description());
        self.run.acted = true;
        self.run.transitions += 1;

        let ctx = TransitionContext::new(Arc::clone(&self.actions), args.filtered(transition.params()));
        tracing::debug!(key = %selected.key, "Starting {}", name);
        match transition.execute(ctx).await {
            Ok(()) => {
                tracing::debug!("Finished {}", name);
                Ok(None)
            }
            Err(Signal::Complete(message)) => {
                tracing::info!("UI automation completed in {}.", name);
                Ok(Some(Outcome::Completed(message)))
            }
            Err(Signal::Business(message)) => {
                tracing::info!("Business exception: {}. Exiting.", message);
                Ok(Some(Outcome::Business(message)))
            }
            Err(Signal::Action(error)) => {
                self.on_runtime_error(&name, error).await?;
                Ok(None)
            }
            Err(Signal::RollbackCompleted) => {
                tracing::info!("Rollback completed.");
                Err(PilotError::RollbackCompleted(self.run.failure.clone()))
            }
            Err(Signal::Fatal(source)) => Err(PilotError::Transition { name, source }),
        }
    }

    /// UI 动作失败：记录上下文、截图、纠偏，然后进入回滚模式
    ///
    /// 纠偏同样受 `ai_recovery` 开关约束，次数取 `ai_recovery_attempts`；关闭时直接进入回滚模式。
    async fn on_runtime_error(&mut self, transition: &str, error: ActionError) -> Result<(), PilotError> {
        let failure = FailureContext::from_action_error(transition, &error);
        let at = failure
            .action
            .as_ref()
            .map(|a| a.description.clone())
            .unwrap_or_else(|| "-".to_string());
        tracing::error!("Runtime error in {} at action {}", transition, at);
        tracing::debug!(error = %failure.error, "Runtime error details");
        self.screenshot("Runtime error").await;
        tracing::info!("Proceeding to course correction, activating rollback mode.");

        let details = failure.error.clone();
        self.run.failure = Some(failure);
        self.attempt_recovery(RecoveryScenario::RuntimeError, Some(&details)).await?;
        self.run.mode = Mode::Rollback;
        Ok(())
    }

    /// AI 纠偏；未启用或未配置 Agent 工厂时直接返回
    async fn attempt_recovery(&mut self, scenario: RecoveryScenario, details: Option<&str>) -> Result<(), PilotError> {
        if !self.config.ai_recovery {
            return Ok(());
        }
        let Some(factory) = self.recovery.clone() else {
            return Ok(());
        };

        if self.run.agent.is_none() {
            let goal = recovery_prompt(
                scenario,
                &self.graph,
                &self.history,
                self.run.next_target.as_deref(),
                details,
            );
            let agent = factory.create(&goal, self.config.ai_recovery_instructions.as_deref());
            tracing::debug!("AI recovery agent {} initialized with prompt: '{}'", agent.name(), goal);
            self.run.agent = Some(agent);
        }

        let outcome = match self.run.agent.as_mut() {
            Some(agent) => {
                tracing::info!(scenario = %scenario, agent = agent.name(), "Starting AI recovery");
                course_correct(agent.as_mut(), self.actions.as_ref(), self.config.ai_recovery_attempts).await?
            }
            None => return Ok(()),
        };

        if outcome == CorrectionOutcome::Acted {
            self.run.acted = true;
        }
        if outcome != CorrectionOutcome::NoAction {
            self.screenshot("Completed AI recovery").await;
        }
        Ok(())
    }

    /// 结束处理：终态检查 + 清理，失败不会掩盖更早的错误
    async fn act_on_completed(&mut self, result: Result<Outcome, PilotError>) -> Result<RunReport, PilotError> {
        let check = self.ensure_allowed_end_state().await;

        self.final_state = self.run.current_state.clone();
        let transitions = self.run.transitions;
        self.history.clear();
        self.graph.clear_actual();
        self.run = RunState::default();
        tracing::info!("State machine execution completed, cleanup performed.");

        if let Err(e) = &check {
            tracing::error!("Error during end state check: {}", e);
        }
        match (result, check) {
            (Ok(outcome), Ok(())) => Ok(RunReport {
                outcome,
                final_state: self.final_state.clone(),
                transitions,
            }),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => {
                tracing::error!("State machine execution failed: {}", e);
                Err(e)
            }
        }
    }

    async fn ensure_allowed_end_state(&mut self) -> Result<(), PilotError> {
        if self.run.acted {
            self.evaluate_state().await?;
        }
        let end_allowed = self
            .run
            .current_state
            .as_deref()
            .and_then(|s| self.graph.state(s))
            .map_or(false, |s| s.end_allowed);
        if !end_allowed && self.config.ai_recovery {
            // 退出纠偏使用自己的目标
            self.run.agent = None;
            self.attempt_recovery(RecoveryScenario::Exit, None).await?;
        }
        Ok(())
    }

    async fn screenshot(&self, message: &str) {
        if !self.config.screenshots {
            return;
        }
        if let Err(e) = screenshot_and_log(self.actions.as_ref(), self.artifacts.as_ref(), message).await {
            tracing::warn!("Error occurred while taking and saving screenshot: {}", e);
        }
    }
}

/// 引擎构建器
pub struct PilotBuilder {
    graph: StateGraph,
    classifier: Option<Arc<dyn StateClassifier>>,
    actions: Option<Arc<dyn ActionExecutor>>,
    recovery: Option<Arc<dyn RecoveryAgentFactory>>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
    config: PilotConfig,
}

impl PilotBuilder {
    pub fn new(graph: StateGraph) -> Self {
        Self {
            graph,
            classifier: None,
            actions: None,
            recovery: None,
            artifacts: None,
            config: PilotConfig::default(),
        }
    }

    pub fn classifier(mut self, classifier: Arc<dyn StateClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn executor(mut self, actions: Arc<dyn ActionExecutor>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn recovery(mut self, factory: Arc<dyn RecoveryAgentFactory>) -> Self {
        self.recovery = Some(factory);
        self
    }

    /// 截图保存位置；未设置时丢弃
    pub fn artifacts(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.artifacts = Some(sink);
        self
    }

    pub fn config(mut self, config: PilotConfig) -> Self {
        self.config = config;
        self
    }

    /// 接入平台服务：视觉分类、CourseCorrectorV1 纠偏与 `[pilot]` 配置均取自 `config`
    pub fn remote(self, api: &ApiClient, actions: Arc<dyn ActionExecutor>, config: &AppConfig) -> Self {
        let classifier = VisionClassifier::from_config(api.clone(), Arc::clone(&actions), &config.vision);
        let recovery = CourseCorrectorV1Factory::from_config(api.clone(), Arc::clone(&actions), &config.recovery);
        self.classifier(Arc::new(classifier))
            .executor(actions)
            .recovery(Arc::new(recovery))
            .config(config.pilot.clone())
    }

    pub fn build(self) -> Result<Pilot, PilotError> {
        self.config.validate()?;
        let classifier = self
            .classifier
            .ok_or_else(|| ConfigError::Invalid("a state classifier is required".to_string()))?;
        let actions = self
            .actions
            .ok_or_else(|| ConfigError::Invalid("an action executor is required".to_string()))?;
        if self.config.ai_recovery && self.recovery.is_none() {
            tracing::warn!("AI recovery is enabled but no recovery agent factory is configured");
        }
        Ok(Pilot {
            graph: self.graph,
            classifier,
            actions,
            recovery: self.recovery,
            artifacts: self.artifacts.unwrap_or_else(|| Arc::new(NullArtifactSink)),
            history: ExecutionHistory::new(self.config.history_capacity),
            config: self.config,
            run: RunState::default(),
            final_state: None,
        })
    }
}
