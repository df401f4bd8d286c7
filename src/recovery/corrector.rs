//! 平台纠偏服务：`/gui_automation/course_corrector/get_corrective_actions`

use std::sync::Arc;

use async_trait::async_trait;

use super::{ActionString, CourseCorrector, RecoveryAgentFactory, RecoveryError};
use crate::actions::ActionExecutor;
use crate::api::ApiClient;
use crate::config::RecoverySection;

/// 第一代纠偏 Agent：每次请求附带当前截图、目标、自定义指令与累积反馈
pub struct CourseCorrectorV1 {
    api: ApiClient,
    screens: Arc<dyn ActionExecutor>,
    goal: String,
    custom_instructions: Option<String>,
    use_ocr: bool,
    feedback: Vec<String>,
}

impl CourseCorrectorV1 {
    pub fn new(api: ApiClient, screens: Arc<dyn ActionExecutor>, goal: impl Into<String>) -> Self {
        Self {
            api: api.with_root("/gui_automation"),
            screens,
            goal: goal.into(),
            custom_instructions: None,
            use_ocr: true,
            feedback: Vec::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.custom_instructions = instructions;
        self
    }

    pub fn with_ocr(mut self, use_ocr: bool) -> Self {
        self.use_ocr = use_ocr;
        self
    }
}

#[async_trait]
impl CourseCorrector for CourseCorrectorV1 {
    fn name(&self) -> &str {
        "CourseCorrectorV1"
    }

    fn goal(&self) -> &str {
        &self.goal
    }

    async fn corrective_action(&mut self) -> Result<ActionString, RecoveryError> {
        let screen_b64 = self.screens.screenshot().await?;
        let body = serde_json::json!({
            "screen_b64": screen_b64,
            "use_ocr": self.use_ocr,
            "goal": self.goal,
            "custom_instructions": self.custom_instructions,
            "feedback": self.feedback,
        });
        let resp = self
            .api
            .post::<_, ActionString>("/course_corrector/get_corrective_actions", &body)
            .await?;
        resp.into_first()?.ok_or(RecoveryError::Empty)
    }

    fn add_feedback(&mut self, feedback: String) {
        self.feedback.push(feedback);
    }

    fn latest_feedback(&self) -> Option<&str> {
        self.feedback.last().map(String::as_str)
    }

    fn reset_feedback(&mut self) {
        self.feedback.clear();
    }
}

/// CourseCorrectorV1 工厂
pub struct CourseCorrectorV1Factory {
    api: ApiClient,
    screens: Arc<dyn ActionExecutor>,
    use_ocr: bool,
}

impl CourseCorrectorV1Factory {
    pub fn new(api: ApiClient, screens: Arc<dyn ActionExecutor>, use_ocr: bool) -> Self {
        Self { api, screens, use_ocr }
    }

    pub fn from_config(api: ApiClient, screens: Arc<dyn ActionExecutor>, section: &RecoverySection) -> Self {
        Self::new(api, screens, section.use_ocr)
    }
}

impl RecoveryAgentFactory for CourseCorrectorV1Factory {
    fn create(&self, goal: &str, custom_instructions: Option<&str>) -> Box<dyn CourseCorrector> {
        Box::new(
            CourseCorrectorV1::new(self.api.clone(), Arc::clone(&self.screens), goal)
                .with_instructions(custom_instructions.map(str::to_string))
                .with_ocr(self.use_ocr),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingExecutor;
    use std::time::Duration;

    #[test]
    fn test_feedback_accumulates_and_resets() {
        let api = ApiClient::new("http://localhost:1", None, Duration::from_secs(1));
        let factory = CourseCorrectorV1Factory::new(api, Arc::new(RecordingExecutor::new()), true);
        let mut agent = factory.create("Close the popup", Some("Never press Delete"));
        assert_eq!(agent.name(), "CourseCorrectorV1");
        assert_eq!(agent.goal(), "Close the popup");
        assert_eq!(agent.latest_feedback(), None);

        agent.add_feedback("first".into());
        agent.add_feedback("second".into());
        assert_eq!(agent.latest_feedback(), Some("second"));

        agent.reset_feedback();
        assert_eq!(agent.latest_feedback(), None);
    }

    #[test]
    fn test_factory_from_config() {
        let api = ApiClient::new("http://localhost:1", None, Duration::from_secs(1));
        let factory = CourseCorrectorV1Factory::from_config(
            api,
            Arc::new(RecordingExecutor::new()),
            &RecoverySection { use_ocr: false },
        );
        assert!(!factory.use_ocr);
    }
}
