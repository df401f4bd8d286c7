//! 远端设备分配池
//!
//! 按分组名向平台申请一台独占设备；无空闲设备时按固定间隔轮询，
//! 超过最大重试次数返回 `AvailabilityTimeout`。释放为尽力而为，失败只记日志。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{ApiClient, HttpError};
use crate::config::DeviceSection;

/// 分配到的远端设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub id: String,
    pub name: String,
    pub wss_token: String,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No clients available for {group} group after {waited_secs} seconds")]
    AvailabilityTimeout { group: String, waited_secs: u64 },

    #[error("Device service error: {0}")]
    Service(#[from] HttpError),
}

/// 设备分配后端
#[async_trait]
pub trait DeviceAllocator: Send + Sync {
    /// 申请一台设备；`Ok(None)` 表示当前没有空闲设备
    async fn allocate(&self, group: &str, run_id: &str) -> Result<Option<RemoteDevice>, DeviceError>;

    async fn deallocate(&self, device: &RemoteDevice, run_id: &str) -> Result<(), DeviceError>;
}

/// 平台设备服务：`/gui_automation/remote_device/{allocate,deallocate}`
#[derive(Debug, Clone)]
pub struct RemoteDeviceService {
    api: ApiClient,
}

impl RemoteDeviceService {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api: api.with_root("/gui_automation"),
        }
    }
}

#[async_trait]
impl DeviceAllocator for RemoteDeviceService {
    async fn allocate(&self, group: &str, run_id: &str) -> Result<Option<RemoteDevice>, DeviceError> {
        let body = serde_json::json!({ "group_name": group, "run_id": run_id });
        let resp = self
            .api
            .post::<_, Option<RemoteDevice>>("/remote_device/allocate", &body)
            .await?;
        Ok(resp.into_first()?.flatten())
    }

    async fn deallocate(&self, device: &RemoteDevice, run_id: &str) -> Result<(), DeviceError> {
        let body = serde_json::json!({
            "id": device.id,
            "name": device.name,
            "run_id": run_id,
        });
        self.api
            .post::<_, serde_json::Value>("/remote_device/deallocate", &body)
            .await?
            .into_first()?;
        Ok(())
    }
}

/// 设备分配池：轮询直至拿到设备或超时
#[derive(Clone)]
pub struct DevicePool {
    allocator: Arc<dyn DeviceAllocator>,
    poll_interval: Duration,
    max_retries: usize,
}

impl DevicePool {
    pub fn new(allocator: Arc<dyn DeviceAllocator>, poll_interval: Duration, max_retries: usize) -> Self {
        Self {
            allocator,
            poll_interval,
            max_retries,
        }
    }

    pub fn from_config(allocator: Arc<dyn DeviceAllocator>, section: &DeviceSection) -> Self {
        Self::new(allocator, section.poll_interval(), section.max_retries)
    }

    /// 申请设备：首次尝试 + 最多 max_retries 次重试
    pub async fn acquire(&self, group: &str, run_id: &str) -> Result<RemoteDevice, DeviceError> {
        let mut retries = 0;
        loop {
            if let Some(device) = self.allocator.allocate(group, run_id).await? {
                tracing::info!(device = %device.name, group, run_id, "Remote device allocated");
                return Ok(device);
            }
            if retries >= self.max_retries {
                return Err(DeviceError::AvailabilityTimeout {
                    group: group.to_string(),
                    waited_secs: self.poll_interval.as_secs() * self.max_retries as u64,
                });
            }
            tracing::warn!(
                "No clients are available for {} group. Initiating a {} seconds wait. Retry count: {}",
                group,
                self.poll_interval.as_secs(),
                retries
            );
            tokio::time::sleep(self.poll_interval).await;
            retries += 1;
        }
    }

    /// 释放设备（尽力而为）
    pub async fn release(&self, device: &RemoteDevice, run_id: &str) {
        match self.allocator.deallocate(device, run_id).await {
            Ok(()) => tracing::info!(device = %device.name, run_id, "Remote device released"),
            Err(e) => tracing::warn!(device = %device.name, run_id, "Failed to release remote device: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedAllocator;

    fn device() -> RemoteDevice {
        RemoteDevice {
            id: "42".into(),
            name: "vm-42".into(),
            wss_token: "t".into(),
        }
    }

    #[tokio::test]
    async fn test_acquire_after_polling() {
        let allocator = Arc::new(ScriptedAllocator::new(vec![None, None, Some(device())]));
        let pool = DevicePool::new(allocator.clone(), Duration::from_millis(1), 5);
        let got = pool.acquire("finance", "run-1").await.unwrap();
        assert_eq!(got, device());
        assert_eq!(allocator.allocate_calls(), 3);
    }

    #[tokio::test]
    async fn test_acquire_times_out_after_max_retries() {
        let allocator = Arc::new(ScriptedAllocator::new(vec![]));
        let pool = DevicePool::new(allocator.clone(), Duration::from_millis(1), 2);
        let err = pool.acquire("finance", "run-1").await.unwrap_err();
        assert!(matches!(err, DeviceError::AvailabilityTimeout { ref group, .. } if group == "finance"));
        // 首次 + 2 次重试
        assert_eq!(allocator.allocate_calls(), 3);
    }

    #[tokio::test]
    async fn test_release_is_best_effort() {
        let allocator = Arc::new(ScriptedAllocator::new(vec![]).failing_release());
        let pool = DevicePool::new(allocator.clone(), Duration::from_millis(1), 0);
        pool.release(&device(), "run-1").await;
        assert_eq!(allocator.released().len(), 0);
    }
}
