//! 平台 HTTP 客户端
//!
//! 所有远端服务（设备分配、目标定位、状态识别、纠偏）共用同一 [`ApiClient`]：
//! Bearer 鉴权、统一的 `StandardResponse` 信封、5xx / 网络错误指数退避，4xx 立即放弃。

mod retry;

pub use retry::RetryPolicy;

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ApiSection;

/// HTTP 调用错误
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Service reported failure: {0}")]
    Unsuccessful(String),
}

impl HttpError {
    /// 4xx 为调用方错误，重试无意义
    pub fn is_client_error(&self) -> bool {
        matches!(self, HttpError::Status { status, .. } if status.is_client_error())
    }
}

/// 平台统一响应信封
#[derive(Debug, Clone, Deserialize)]
pub struct StandardResponse<T> {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

fn default_success() -> bool {
    true
}

impl<T> StandardResponse<T> {
    /// 取第一条数据；success=false 时转为 Unsuccessful
    pub fn into_first(self) -> Result<Option<T>, HttpError> {
        if !self.success {
            return Err(HttpError::Unsuccessful(
                self.message.unwrap_or_else(|| "no message".to_string()),
            ));
        }
        Ok(self.data.into_iter().next())
    }
}

/// 平台 API 客户端
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    root_endpoint: Option<String>,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            root_endpoint: None,
            api_key,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(section: &ApiSection) -> Self {
        Self::new(
            section.resolved_base_url(),
            section.resolved_api_key(),
            Duration::from_secs(section.request_timeout_secs),
        )
        .with_retry(RetryPolicy::new(section.max_tries, Duration::from_secs(1)))
    }

    /// 为所有请求加统一前缀（如 `/gui_automation`）
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root_endpoint = Some(root.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn url(&self, endpoint: &str) -> String {
        match &self.root_endpoint {
            Some(root) => format!("{}{}{}", self.base_url, root, endpoint),
            None => format!("{}{}", self.base_url, endpoint),
        }
    }

    /// POST JSON 并解析为 StandardResponse
    pub async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<StandardResponse<T>, HttpError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned + Send,
    {
        let url = self.url(endpoint);
        let url = url.as_str();
        self.retry
            .run(
                endpoint,
                move || async move {
                    let mut req = self.client.post(url).json(body);
                    if let Some(key) = &self.api_key {
                        req = req.bearer_auth(key);
                    }
                    let resp = req.send().await?;
                    Self::decode(resp).await
                },
                HttpError::is_client_error,
            )
            .await
    }

    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<StandardResponse<T>, HttpError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpError::Status { status, body });
        }
        Ok(resp.json::<StandardResponse<T>>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_with_root() {
        let api = ApiClient::new("https://api.example.com/", None, Duration::from_secs(5))
            .with_root("/gui_automation");
        assert_eq!(
            api.url("/remote_device/allocate"),
            "https://api.example.com/gui_automation/remote_device/allocate"
        );
    }

    #[test]
    fn test_standard_response_first() {
        let resp: StandardResponse<Option<String>> =
            serde_json::from_str(r#"{"success": true, "data": [null]}"#).unwrap();
        assert_eq!(resp.into_first().unwrap(), Some(None));

        let resp: StandardResponse<String> =
            serde_json::from_str(r#"{"success": false, "message": "denied", "data": []}"#).unwrap();
        assert!(matches!(resp.into_first(), Err(HttpError::Unsuccessful(m)) if m == "denied"));
    }

    #[test]
    fn test_client_error_gives_up() {
        let err = HttpError::Status {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(err.is_client_error());
        let err = HttpError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(!err.is_client_error());
    }
}
