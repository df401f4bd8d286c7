//! 状态识别门面
//!
//! 给定状态目录 `[{id: description}]`，对当前屏幕做分类，返回命中的状态 id 与描述。
//! 图像识别本身在远端服务完成。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::{ActionError, ActionExecutor};
use crate::api::{ApiClient, HttpError};
use crate::config::VisionSection;

/// 状态目录中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDescriptor {
    pub id: String,
    pub description: String,
}

/// 识别结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedState {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Screen capture failed: {0}")]
    Screen(#[from] ActionError),

    #[error("Classification request failed: {0}")]
    Request(#[from] HttpError),

    #[error("Classifier returned no state")]
    Empty,
}

/// 状态分类能力
#[async_trait]
pub trait StateClassifier: Send + Sync {
    async fn classify(&self, catalogue: &[StateDescriptor]) -> Result<ClassifiedState, ClassifierError>;
}

/// 平台视觉服务：`/gui_automation/vision/classify_state`
pub struct VisionClassifier {
    api: ApiClient,
    screens: Arc<dyn ActionExecutor>,
    use_ocr: bool,
}

impl VisionClassifier {
    pub fn new(api: ApiClient, screens: Arc<dyn ActionExecutor>) -> Self {
        Self {
            api: api.with_root("/gui_automation"),
            screens,
            use_ocr: false,
        }
    }

    pub fn with_ocr(mut self, use_ocr: bool) -> Self {
        self.use_ocr = use_ocr;
        self
    }

    pub fn from_config(api: ApiClient, screens: Arc<dyn ActionExecutor>, section: &VisionSection) -> Self {
        Self::new(api, screens).with_ocr(section.use_ocr)
    }
}

/// 目录的线上形式：每个状态一个单键对象 `{id: description}`
fn possible_states(catalogue: &[StateDescriptor]) -> Vec<serde_json::Value> {
    catalogue
        .iter()
        .map(|s| {
            let mut entry = serde_json::Map::new();
            entry.insert(s.id.clone(), serde_json::Value::String(s.description.clone()));
            serde_json::Value::Object(entry)
        })
        .collect()
}

#[async_trait]
impl StateClassifier for VisionClassifier {
    async fn classify(&self, catalogue: &[StateDescriptor]) -> Result<ClassifiedState, ClassifierError> {
        let screen_b64 = self.screens.screenshot().await?;
        let body = serde_json::json!({
            "screen_b64": screen_b64,
            "use_ocr": self.use_ocr,
            "possible_states": possible_states(catalogue),
        });
        let resp = self
            .api
            .post::<_, ClassifiedState>("/vision/classify_state", &body)
            .await?;
        resp.into_first()?.ok_or(ClassifierError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingExecutor;
    use std::time::Duration;

    #[test]
    fn test_from_config_reads_ocr_flag() {
        let api = ApiClient::new("http://localhost:1", None, Duration::from_secs(1));
        let classifier = VisionClassifier::from_config(
            api,
            Arc::new(RecordingExecutor::new()),
            &VisionSection { use_ocr: true },
        );
        assert!(classifier.use_ocr);
        assert_eq!(
            classifier.api.url("/vision/classify_state"),
            "http://localhost:1/gui_automation/vision/classify_state"
        );
    }

    #[test]
    fn test_possible_states_shape() {
        let catalogue = vec![
            StateDescriptor {
                id: "Login".into(),
                description: "Login form visible".into(),
            },
            StateDescriptor {
                id: "Home".into(),
                description: "Main menu".into(),
            },
        ];
        let wire = possible_states(&catalogue);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["Login"], "Login form visible");
        assert_eq!(wire[1]["Home"], "Main menu");
    }
}
