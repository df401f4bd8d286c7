//! 执行引擎集成测试（脚本化分类器 / 执行器 / 纠偏 Agent）

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use screen_pilot::actions::{ActionKind, Target, UiAction};
    use screen_pilot::channel::WsConnector;
    use screen_pilot::config::PilotConfig;
    use screen_pilot::device::{DeviceError, DevicePool};
    use screen_pilot::mock::{RecordingExecutor, ScriptedAllocator, ScriptedClassifier, ScriptedCorrectorFactory};
    use screen_pilot::pilot::{transition, GraphError, Mode, TransitionContext};
    use screen_pilot::recovery::ActionString;
    use screen_pilot::{Arguments, AutomationSession, Goal, Outcome, Pilot, PilotError, Signal, State, StateGraph};

    fn click(name: &'static str, prompt: &'static str) -> impl screen_pilot::pilot::Transition + 'static {
        transition(name, move |ctx: TransitionContext| async move {
            ctx.perform(UiAction::left_click(Target::text(prompt))).await?;
            Ok::<(), Signal>(())
        })
        .with_description(format!("Click {}", prompt))
    }

    /// Start -> Middle -> End
    fn linear_graph() -> StateGraph {
        let mut g = StateGraph::new();
        g.add_state(State::new("Start", "Start screen")).unwrap();
        g.add_state(State::new("Middle", "Invoice form")).unwrap();
        g.add_state(State::new("End", "Confirmation")).unwrap();
        g.add_transition("Start", "Middle", click("open_form", "Open")).unwrap();
        g.add_transition("Middle", "End", click("submit", "Submit")).unwrap();
        g
    }

    fn strict(ai_recovery: bool) -> PilotConfig {
        PilotConfig::builder()
            .ai_recovery(ai_recovery)
            .tolerate_unplanned_transitions(0)
            .tolerate_repeat_transitions(0)
            .tolerate_repeat_states(0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_unconditioned_duplicate_rejected_at_registration() {
        let mut g = linear_graph();
        let err = g.add_transition("Start", "End", click("shortcut", "Skip")).unwrap_err();
        assert!(matches!(
            err,
            GraphError::AmbiguousTransition { ref transition, ref existing, .. }
                if transition == "shortcut" && existing == "open_form"
        ));
    }

    #[tokio::test]
    async fn test_linear_run_completes_after_two_transitions() {
        let executor = Arc::new(RecordingExecutor::new());
        let mut pilot = Pilot::builder(linear_graph())
            .classifier(Arc::new(ScriptedClassifier::new(["Start", "Middle", "End"])))
            .executor(executor.clone())
            .config(PilotConfig::builder().ai_recovery(false).build().unwrap())
            .build()
            .unwrap();

        let report = pilot.run(&Goal::reach("End"), &Arguments::new()).await.unwrap();
        assert_eq!(report.outcome, Outcome::Completed(None));
        assert_eq!(report.final_state.as_deref(), Some("End"));
        assert_eq!(report.transitions, 2);
        assert_eq!(
            executor.performed(),
            vec![
                UiAction::left_click(Target::text("Open")),
                UiAction::left_click(Target::text("Submit")),
            ]
        );
    }

    #[tokio::test]
    async fn test_planned_run_has_no_unplanned_transitions() {
        // 容忍度为 0：任何计划外转移都会让运行失败
        let mut pilot = Pilot::builder(linear_graph())
            .classifier(Arc::new(ScriptedClassifier::new(["Start", "Middle", "End"])))
            .executor(Arc::new(RecordingExecutor::new()))
            .config(strict(false))
            .build()
            .unwrap();
        assert!(pilot.run(&Goal::reach("End"), &Arguments::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unplanned_transition_detected() {
        let mut g = linear_graph();
        g.add_transition("End", "Start", click("restart", "New")).unwrap();
        let mut pilot = Pilot::builder(g)
            .classifier(Arc::new(ScriptedClassifier::new(["Start", "End"])))
            .executor(Arc::new(RecordingExecutor::new()))
            .config(strict(false))
            .build()
            .unwrap();

        let err = pilot.run(&Goal::none(), &Arguments::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PilotError::UnplannedTransitions { ref edges } if edges == &vec![("Start".to_string(), "End".to_string())]
        ));
        assert!(pilot.graph().actual_edges().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_transition_tolerance_plus_one() {
        let mut g = StateGraph::new();
        g.add_state(State::new("Busy", "Spinner visible")).unwrap();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        g.add_transition(
            "Busy",
            "Busy",
            transition("wait", move |_ctx: TransitionContext| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), Signal>(())
                }
            }),
        )
        .unwrap();

        let config = PilotConfig::builder()
            .ai_recovery(false)
            .tolerate_repeat_transitions(2)
            .tolerate_repeat_states(100)
            .build()
            .unwrap();
        let mut pilot = Pilot::builder(g)
            .classifier(Arc::new(ScriptedClassifier::new(["Busy"])))
            .executor(Arc::new(RecordingExecutor::new()))
            .config(config)
            .build()
            .unwrap();

        let err = pilot.run(&Goal::none(), &Arguments::new()).await.unwrap_err();
        // T+1 = 3 次仍继续，T+2 = 4 次后下一轮检测失败
        assert!(matches!(err, PilotError::RepeatedTransitions { ref names } if names.len() == 4));
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_consecutive_runs_do_not_leak_state() {
        let classifier = Arc::new(ScriptedClassifier::new([
            "Start", "Middle", "End", "Start", "Middle", "End",
        ]));
        let mut pilot = Pilot::builder(linear_graph())
            .classifier(classifier.clone())
            .executor(Arc::new(RecordingExecutor::new()))
            .config(strict(false))
            .build()
            .unwrap();

        let first = pilot.run(&Goal::reach("End"), &Arguments::new()).await.unwrap();
        assert!(pilot.history().is_empty());
        assert!(pilot.graph().actual_edges().is_empty());
        assert_eq!(pilot.mode(), Mode::Planned);

        // 历史泄漏会触发重复转移 / 重复状态检测
        let second = pilot.run(&Goal::reach("End"), &Arguments::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(classifier.calls(), 6);
    }

    #[tokio::test]
    async fn test_error_state_invokes_recovery_without_transition() {
        let executor = Arc::new(RecordingExecutor::new());
        let factory = Arc::new(ScriptedCorrectorFactory::new(vec![ActionString::new(
            "LeftClick(target='Close').do()",
        )]));
        let mut pilot = Pilot::builder(linear_graph())
            .classifier(Arc::new(ScriptedClassifier::new(["Error", "Start", "Middle", "End"])))
            .executor(executor.clone())
            .recovery(factory.clone())
            .config(
                PilotConfig::builder()
                    .ai_recovery_instructions("Never close the main window")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        let report = pilot.run(&Goal::reach("End"), &Arguments::new()).await.unwrap();
        assert_eq!(report.transitions, 2);

        let goals = factory.goals();
        assert_eq!(goals.len(), 1);
        assert!(goals[0].starts_with("The process just started but the system is in an unexpected state."));
        assert_eq!(factory.instructions()[0].as_deref(), Some("Never close the main window"));
        assert_eq!(executor.performed()[0], UiAction::left_click(Target::text("Close")));
        assert_eq!(executor.performed().len(), 3);
    }

    #[tokio::test]
    async fn test_error_state_without_recovery_is_unrecognized() {
        let mut pilot = Pilot::builder(linear_graph())
            .classifier(Arc::new(ScriptedClassifier::new(["Error"])))
            .executor(Arc::new(RecordingExecutor::new()))
            .config(PilotConfig::builder().ai_recovery(false).build().unwrap())
            .build()
            .unwrap();
        let err = pilot.run(&Goal::none(), &Arguments::new()).await.unwrap_err();
        assert!(matches!(err, PilotError::Graph(GraphError::UnrecognizedState(ref s)) if s == "Error"));
    }

    #[tokio::test]
    async fn test_runtime_error_switches_to_rollback() {
        let mut g = linear_graph();
        g.add_rollback(
            "Start",
            "Start",
            transition("reset_form", |_ctx: TransitionContext| async {
                Err::<(), Signal>(Signal::RollbackCompleted)
            }),
        )
        .unwrap();

        let executor = Arc::new(RecordingExecutor::new().failing_on("Open", "window lost focus"));
        let factory = Arc::new(ScriptedCorrectorFactory::new(vec![ActionString::new("NoAction")]));
        let mut pilot = Pilot::builder(g)
            .classifier(Arc::new(ScriptedClassifier::new(["Start"])))
            .executor(executor.clone())
            .recovery(factory.clone())
            .build()
            .unwrap();

        let err = pilot.run(&Goal::reach("End"), &Arguments::new()).await.unwrap_err();
        let failure = match err {
            PilotError::RollbackCompleted(Some(failure)) => failure,
            other => panic!("unexpected error: {}", other),
        };
        assert_eq!(failure.transition, "open_form");
        let action = failure.action.expect("action context");
        assert_eq!(action.kind, ActionKind::LeftClick);
        assert_eq!(action.target.as_deref(), Some("Open"));
        assert!(failure.error.contains("window lost focus"));

        let goals = factory.goals();
        assert_eq!(goals.len(), 1);
        assert!(goals[0].starts_with("We tried performing 'open_form' (Click Open) but ran into an error:"));
        assert!(goals[0].ends_with("previous state, Start (Start screen)."));
        assert_eq!(pilot.mode(), Mode::Planned);
    }

    #[tokio::test]
    async fn test_runtime_error_without_ai_recovery_goes_straight_to_rollback() {
        let mut g = linear_graph();
        g.add_rollback(
            "Start",
            "Start",
            transition("reset_form", |_ctx: TransitionContext| async {
                Err::<(), Signal>(Signal::RollbackCompleted)
            }),
        )
        .unwrap();

        let factory = Arc::new(ScriptedCorrectorFactory::new(vec![ActionString::new("NoAction")]));
        let mut pilot = Pilot::builder(g)
            .classifier(Arc::new(ScriptedClassifier::new(["Start"])))
            .executor(Arc::new(RecordingExecutor::new().failing_on("Open", "window lost focus")))
            .recovery(factory.clone())
            .config(PilotConfig::builder().ai_recovery(false).build().unwrap())
            .build()
            .unwrap();

        let err = pilot.run(&Goal::reach("End"), &Arguments::new()).await.unwrap_err();
        assert!(matches!(err, PilotError::RollbackCompleted(Some(ref f)) if f.transition == "open_form"));
        // 开关关闭时运行时错误也不会创建纠偏 Agent
        assert!(factory.goals().is_empty());
        assert_eq!(factory.remaining(), 1);
    }

    #[tokio::test]
    async fn test_device_exhaustion_runs_nothing() {
        let allocator = Arc::new(ScriptedAllocator::new(vec![]));
        let pool = DevicePool::new(allocator.clone(), Duration::from_millis(1), 2);
        let session = AutomationSession::new(pool, Arc::new(WsConnector::new("ws://127.0.0.1:9", 1 << 20)), "finance");

        let mut pilot = Pilot::builder(linear_graph())
            .classifier(Arc::new(ScriptedClassifier::new(["Start", "Middle", "End"])))
            .executor(Arc::new(RecordingExecutor::new()))
            .build()
            .unwrap();

        let goal = Goal::reach("End");
        let args = Arguments::new();
        let pilot_ref = &mut pilot;
        let err = session
            .run("run-1", |_handle| {
                let pilot = pilot_ref;
                pilot.run(&goal, &args)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::Device(DeviceError::AvailabilityTimeout { .. })));
        assert_eq!(allocator.allocate_calls(), 3);
        assert!(pilot.history().is_empty());
        assert_eq!(pilot.final_state(), None);
    }
}
