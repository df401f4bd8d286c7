//! 目标定位：截图 + 目标提示 → 控件包围盒

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Target;
use crate::api::{ApiClient, HttpError};

/// 控件包围盒 `[x1, y1, x2, y2]` 与置信度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub value: [f64; 4],
    #[serde(default)]
    pub score: f64,
}

impl Coords {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            value: [x1, y1, x2, y2],
            score: 0.0,
        }
    }

    /// 包围盒中心（半宽 / 半高向下取整）加偏移
    pub fn center(&self, offset: (i64, i64)) -> [i64; 2] {
        let [x1, y1, x2, y2] = self.value;
        let half_w = ((x2 - x1) / 2.0).floor();
        let half_h = ((y2 - y1) / 2.0).floor();
        [
            (x1 + half_w) as i64 + offset.0,
            (y1 + half_h) as i64 + offset.1,
        ]
    }
}

/// 定位服务
#[async_trait]
pub trait TargetLocator: Send + Sync {
    /// 在截图中定位目标；`Ok(None)` 表示未找到唯一匹配
    async fn locate(&self, screen_b64: &str, target: &Target) -> Result<Option<Coords>, HttpError>;
}

/// 平台动作模型：`/gui_automation/action_model/get_coordinates`
#[derive(Debug, Clone)]
pub struct ActionModelLocator {
    api: ApiClient,
}

impl ActionModelLocator {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api: api.with_root("/gui_automation"),
        }
    }
}

#[async_trait]
impl TargetLocator for ActionModelLocator {
    async fn locate(&self, screen_b64: &str, target: &Target) -> Result<Option<Coords>, HttpError> {
        let body = serde_json::json!({
            "screen_b64": { "value": screen_b64 },
            "target": target.prompt,
            "anchors": target.anchors,
            "is_awaited": false,
            "target_name": target.prompt,
        });
        let resp = self
            .api
            .post::<_, Option<Coords>>("/action_model/get_coordinates", &body)
            .await?;
        Ok(resp.into_first()?.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_with_offset() {
        let bbox = Coords::new(10.0, 20.0, 31.0, 41.0);
        assert_eq!(bbox.center((0, 0)), [20, 30]);
        assert_eq!(bbox.center((5, -5)), [25, 25]);
    }
}
