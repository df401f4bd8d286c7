//! 动作执行门面
//!
//! `perform(action)`：校验 → （如有目标）截图并定位 → 经动作通道下发 → 解析结果；
//! 每次执行输出结构化审计日志（JSON）。`screenshot()` 返回 base64 PNG，通道抖动时按退避重试。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ActionContext, ActionError, ActionKind, Target, TargetLocator, UiAction};
use crate::api::RetryPolicy;
use crate::channel::{ActionChannel, ActionRequest, ActionResponse};
use crate::config::ActionsSection;
use crate::observability;

/// 动作执行能力（引擎、转移、纠偏均通过它操作远端界面）
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// 执行一个动作，返回远端 `return_value`（无则 Null）
    async fn perform(&self, action: &UiAction) -> Result<Value, ActionError>;

    /// 当前屏幕截图（base64）
    async fn screenshot(&self) -> Result<String, ActionError>;
}

/// 基于远程动作通道的执行器
pub struct RemoteActionExecutor {
    channel: Arc<ActionChannel>,
    locator: Option<Arc<dyn TargetLocator>>,
    run_id: Option<String>,
    client_name: Option<String>,
    headless: bool,
    screen_retry: RetryPolicy,
    locate_retry: RetryPolicy,
}

impl RemoteActionExecutor {
    pub fn new(channel: Arc<ActionChannel>) -> Self {
        Self {
            channel,
            locator: None,
            run_id: None,
            client_name: None,
            headless: false,
            screen_retry: RetryPolicy::new(5, Duration::from_secs(1)),
            locate_retry: RetryPolicy::new(3, Duration::from_millis(500)),
        }
    }

    pub fn with_locator(mut self, locator: Arc<dyn TargetLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// 请求中携带的运行实例 id 与设备名
    pub fn with_run(mut self, run_id: impl Into<String>, client_name: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self.client_name = Some(client_name.into());
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_retries(mut self, section: &ActionsSection) -> Self {
        self.screen_retry = RetryPolicy::new(section.screen_max_tries, Duration::from_secs(1));
        self.locate_retry = RetryPolicy::new(section.locate_max_tries, Duration::from_millis(500));
        self
    }

    fn request(&self, action: Value, headless: bool) -> ActionRequest {
        ActionRequest {
            proc_inst_id: self.run_id.clone(),
            client_name: self.client_name.clone(),
            headless,
            action,
        }
    }

    async fn send(
        &self,
        context: &ActionContext,
        request: &ActionRequest,
    ) -> Result<ActionResponse, ActionError> {
        let response = self
            .channel
            .request(request)
            .await
            .map_err(|source| ActionError::Channel {
                context: context.clone(),
                source,
            })?;
        if response.is_failed() {
            return Err(ActionError::Failed {
                context: context.clone(),
                message: response
                    .message
                    .unwrap_or_else(|| "no message from remote".to_string()),
            });
        }
        Ok(response)
    }

    /// 目标 → 点击坐标；定位失败按退避重试，仍失败为 TargetNotFound
    async fn resolve(&self, context: &ActionContext, target: &Target) -> Result<Vec<i64>, ActionError> {
        if let Some(bbox) = &target.bbox {
            return Ok(bbox.center(target.offset).to_vec());
        }
        let locator = self.locator.as_ref().ok_or_else(|| {
            ActionError::Invalid(format!(
                "no target locator configured to resolve '{}'",
                target.prompt
            ))
        })?;

        let bbox = self
            .locate_retry
            .run(
                "locate target",
                move || async move {
                    let screen = self.screenshot().await?;
                    locator
                        .locate(&screen, target)
                        .await?
                        .ok_or_else(|| ActionError::TargetNotFound {
                            context: context.clone(),
                        })
                },
                |e| !matches!(e, ActionError::TargetNotFound { .. }),
            )
            .await?;
        tracing::debug!(prompt = %target.prompt, score = bbox.score, "Target located");
        Ok(bbox.center(target.offset).to_vec())
    }
}

#[async_trait]
impl ActionExecutor for RemoteActionExecutor {
    async fn perform(&self, action: &UiAction) -> Result<Value, ActionError> {
        action.validate()?;
        let context = action.context();
        let start = Instant::now();

        let result = async {
            let coordinates = match action.target() {
                Some(target) => self.resolve(&context, target).await?,
                None => Vec::new(),
            };
            let request = self.request(action.to_payload(&coordinates), self.headless);
            self.send(&context, &request).await
        }
        .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ActionError::TargetNotFound { .. }) => "target_not_found",
            Err(ActionError::Failed { .. }) => "failed",
            Err(_) => "error",
        };
        observability::audit(
            "action_audit",
            json!({
                "action": context.kind.as_str(),
                "target": context.target,
                "ok": result.is_ok(),
                "outcome": outcome,
                "duration_ms": start.elapsed().as_millis() as u64,
            }),
        );

        Ok(result?.return_value.unwrap_or(Value::Null))
    }

    async fn screenshot(&self) -> Result<String, ActionError> {
        let context = ActionContext {
            kind: ActionKind::Screenshot,
            target: None,
            description: "Screenshot().do()".to_string(),
        };
        let context = &context;
        self.screen_retry
            .run(
                "screenshot",
                move || async move {
                    let request = self.request(json!({ "action_type": ActionKind::Screenshot.as_str() }), true);
                    let response = self.send(context, &request).await?;
                    response
                        .screen_b64
                        .filter(|s| !s.is_empty())
                        .ok_or(ActionError::EmptyScreen)
                },
                |e| matches!(e, ActionError::Failed { .. }),
            )
            .await
    }
}
