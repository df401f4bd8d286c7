//! 自动化会话：申请设备 → 建立动作通道 → 执行 → 关闭通道 → 释放设备
//!
//! 设备申请失败时回调不会执行。回调成功且设置了保留设备时不释放，
//! 其余情况（包括回调失败）一律释放。回调 panic 或外层 future 被取消时，
//! 由 [`ScopeGuard`] 在后台任务里关闭通道并释放设备。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{ActionExecutor, RemoteActionExecutor, TargetLocator};
use crate::channel::{ActionChannel, Connector, DEFAULT_ACK_TIMEOUT};
use crate::config::{ActionsSection, AppConfig};
use crate::device::{DevicePool, RemoteDevice};
use crate::pilot::PilotError;

/// 回调拿到的会话资源
#[derive(Clone)]
pub struct SessionHandle {
    device: RemoteDevice,
    run_id: String,
    executor: Arc<RemoteActionExecutor>,
}

impl SessionHandle {
    pub fn device(&self) -> &RemoteDevice {
        &self.device
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 绑定到本设备的动作执行器
    pub fn actions(&self) -> Arc<dyn ActionExecutor> {
        self.executor.clone()
    }
}

pub struct AutomationSession {
    pool: DevicePool,
    connector: Arc<dyn Connector>,
    group: String,
    reserve_device: bool,
    ack_timeout: Duration,
    headless: bool,
    locator: Option<Arc<dyn TargetLocator>>,
    retries: ActionsSection,
}

impl AutomationSession {
    pub fn new(pool: DevicePool, connector: Arc<dyn Connector>, group: impl Into<String>) -> Self {
        Self {
            pool,
            connector,
            group: group.into(),
            reserve_device: false,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            headless: false,
            locator: None,
            retries: ActionsSection::default(),
        }
    }

    pub fn from_config(config: &AppConfig, pool: DevicePool, connector: Arc<dyn Connector>) -> Self {
        Self::new(pool, connector, config.device.group_name.clone())
            .with_reserve(config.device.reserve)
            .with_ack_timeout(config.channel.ack_timeout())
            .with_headless(config.channel.headless)
            .with_action_retries(config.actions.clone())
    }

    pub fn with_locator(mut self, locator: Arc<dyn TargetLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// 成功后保留设备，供同一 run id 的后续步骤使用
    pub fn with_reserve(mut self, reserve: bool) -> Self {
        self.reserve_device = reserve;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_action_retries(mut self, retries: ActionsSection) -> Self {
        self.retries = retries;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub async fn run<F, Fut, T>(&self, run_id: &str, f: F) -> Result<T, PilotError>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = Result<T, PilotError>>,
    {
        let device = self.pool.acquire(&self.group, run_id).await?;
        let mut guard = ScopeGuard::new(self.pool.clone(), device.clone(), run_id);
        let result = self.run_on(&device, run_id, &mut guard, f).await;
        guard.disarm();

        if self.reserve_device && result.is_ok() {
            tracing::warn!("The client stayed reserved for this run id: {}", run_id);
        } else {
            self.pool.release(&device, run_id).await;
        }
        result
    }

    async fn run_on<F, Fut, T>(
        &self,
        device: &RemoteDevice,
        run_id: &str,
        guard: &mut ScopeGuard,
        f: F,
    ) -> Result<T, PilotError>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = Result<T, PilotError>>,
    {
        let transport = self.connector.connect(device).await?;
        tracing::debug!(device = %device.name, "Action channel established");
        let channel = Arc::new(ActionChannel::new(transport).with_ack_timeout(self.ack_timeout));
        guard.channel = Some(Arc::clone(&channel));

        let mut executor = RemoteActionExecutor::new(Arc::clone(&channel))
            .with_run(run_id, device.name.clone())
            .with_headless(self.headless)
            .with_retries(&self.retries);
        if let Some(locator) = &self.locator {
            executor = executor.with_locator(Arc::clone(locator));
        }

        let handle = SessionHandle {
            device: device.clone(),
            run_id: run_id.to_string(),
            executor: Arc::new(executor),
        };
        let result = f(handle).await;

        guard.channel = None;
        channel.close().await;
        tracing::debug!(device = %device.name, "Action channel closed");
        result
    }
}

/// 作用域未正常结束（panic / 取消）时的兜底清理
struct ScopeGuard {
    pool: DevicePool,
    device: RemoteDevice,
    run_id: String,
    channel: Option<Arc<ActionChannel>>,
    armed: bool,
}

impl ScopeGuard {
    fn new(pool: DevicePool, device: RemoteDevice, run_id: &str) -> Self {
        Self {
            pool,
            device,
            run_id: run_id.to_string(),
            channel: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            device = %self.device.name,
            run_id = %self.run_id,
            "Automation scope aborted, releasing the device in the background"
        );
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(device = %self.device.name, "No runtime available, the device was not released");
            return;
        };
        let pool = self.pool.clone();
        let device = self.device.clone();
        let run_id = std::mem::take(&mut self.run_id);
        let channel = self.channel.take();
        runtime.spawn(async move {
            if let Some(channel) = channel {
                channel.close().await;
            }
            pool.release(&device, &run_id).await;
        });
    }
}
