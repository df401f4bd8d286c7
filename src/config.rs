//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PILOT__*` 覆盖（双下划线表示嵌套，如 `PILOT__DEVICE__GROUP_NAME=finance`）。
//! `[pilot]` 段反序列化为 [`PilotConfig`]，加载时即校验，运行期只读。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 配置加载 / 校验错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiSection,
    pub device: DeviceSection,
    pub channel: ChannelSection,
    pub actions: ActionsSection,
    pub vision: VisionSection,
    pub recovery: RecoverySection,
    pub pilot: PilotConfig,
    pub artifacts: ArtifactsSection,
}

/// [api] 段：平台 HTTP 接口地址、鉴权与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    /// 未设置时读取 CLERK_BASE_URL，再退回默认地址
    pub base_url: Option<String>,
    /// 未设置时读取 CLERK_API_KEY
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// 单次请求最多尝试次数（含首次）
    pub max_tries: usize,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
            max_tries: 3,
        }
    }
}

const DEFAULT_BASE_URL: &str = "https://api.clerk-app.com";

impl ApiSection {
    pub fn resolved_base_url(&self) -> String {
        self.base_url
            .clone()
            .or_else(|| std::env::var("CLERK_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("CLERK_API_KEY").ok())
    }
}

/// [device] 段：设备分组、轮询间隔与次数、是否保留设备
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub group_name: String,
    pub poll_interval_secs: u64,
    /// 无空闲设备时最多重试次数（总尝试次数 = max_retries + 1）
    pub max_retries: usize,
    /// 运行成功后保留设备（不释放）
    pub reserve: bool,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            group_name: "default".to_string(),
            poll_interval_secs: 60,
            max_retries: 60,
            reserve: false,
        }
    }
}

impl DeviceSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// [channel] 段：WebSocket 地址、ACK / 结果超时、最大消息大小
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub uri: String,
    pub ack_timeout_secs: u64,
    pub max_message_bytes: usize,
    pub headless: bool,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            uri: "wss://agent-manager.f-one.group/action".to_string(),
            ack_timeout_secs: 90,
            max_message_bytes: 1 << 23,
            headless: false,
        }
    }
}

impl ChannelSection {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// [actions] 段：目标定位与截图的重试次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActionsSection {
    pub locate_max_tries: usize,
    pub screen_max_tries: usize,
}

impl Default for ActionsSection {
    fn default() -> Self {
        Self {
            locate_max_tries: 3,
            screen_max_tries: 5,
        }
    }
}

/// [vision] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VisionSection {
    pub use_ocr: bool,
}

/// [recovery] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub use_ocr: bool,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self { use_ocr: true }
    }
}

/// [artifacts] 段：截图等产物的根目录与运行目录名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub root: PathBuf,
    pub folder: String,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/artifacts"),
            folder: "unknown".to_string(),
        }
    }
}

/// [pilot] 段：状态机执行引擎的容忍度与恢复参数
///
/// 通过 [`PilotConfig::builder`] 或配置文件构造，`validate()` 通过后交给 Pilot，运行期间不再修改。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    /// 失败 / 异常状态时是否启用 AI 纠偏
    pub ai_recovery: bool,
    /// 单次纠偏最多尝试的动作数
    pub ai_recovery_attempts: usize,
    /// 透传给纠偏 Agent 的自定义指令
    pub ai_recovery_instructions: Option<String>,
    pub tolerate_unplanned_transitions: usize,
    pub tolerate_repeat_transitions: usize,
    pub tolerate_repeat_states: usize,
    /// 状态重复超限时强制关闭远端进程
    pub force_close_on_repeat_states: bool,
    pub process_name: Option<String>,
    /// 执行历史保留条数
    pub history_capacity: usize,
    /// 每次状态识别后截图
    pub screenshots: bool,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            ai_recovery: true,
            ai_recovery_attempts: 5,
            ai_recovery_instructions: None,
            tolerate_unplanned_transitions: 5,
            tolerate_repeat_transitions: 5,
            tolerate_repeat_states: 5,
            force_close_on_repeat_states: false,
            process_name: None,
            history_capacity: 25,
            screenshots: true,
        }
    }
}

impl PilotConfig {
    pub fn builder() -> PilotConfigBuilder {
        PilotConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ai_recovery && self.ai_recovery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ai_recovery_attempts must be at least 1 when ai_recovery is enabled".into(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "history_capacity must be at least 1".into(),
            ));
        }
        if self.force_close_on_repeat_states
            && self.process_name.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Invalid(
                "process_name is required when force_close_on_repeat_states is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// PilotConfig 构建器，`build()` 时校验
#[derive(Debug, Default)]
pub struct PilotConfigBuilder {
    config: PilotConfig,
}

impl PilotConfigBuilder {
    pub fn ai_recovery(mut self, enabled: bool) -> Self {
        self.config.ai_recovery = enabled;
        self
    }

    pub fn ai_recovery_attempts(mut self, attempts: usize) -> Self {
        self.config.ai_recovery_attempts = attempts;
        self
    }

    pub fn ai_recovery_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.ai_recovery_instructions = Some(instructions.into());
        self
    }

    pub fn tolerate_unplanned_transitions(mut self, n: usize) -> Self {
        self.config.tolerate_unplanned_transitions = n;
        self
    }

    pub fn tolerate_repeat_transitions(mut self, n: usize) -> Self {
        self.config.tolerate_repeat_transitions = n;
        self
    }

    pub fn tolerate_repeat_states(mut self, n: usize) -> Self {
        self.config.tolerate_repeat_states = n;
        self
    }

    /// 状态重复超限时强制关闭指定进程
    pub fn force_close_process(mut self, process_name: impl Into<String>) -> Self {
        self.config.force_close_on_repeat_states = true;
        self.config.process_name = Some(process_name.into());
        self
    }

    pub fn history_capacity(mut self, n: usize) -> Self {
        self.config.history_capacity = n;
        self
    }

    pub fn screenshots(mut self, enabled: bool) -> Self {
        self.config.screenshots = enabled;
        self
    }

    pub fn build(self) -> Result<PilotConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// 从 config 目录加载配置，环境变量 PILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PILOT__*（双下划线表示嵌套键）
/// 4. 校验 [pilot] 段
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PILOT")
            .separator("__")
            .try_parsing(true),
    );

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.pilot.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pilot_defaults() {
        let config = PilotConfig::default();
        assert!(config.ai_recovery);
        assert_eq!(config.ai_recovery_attempts, 5);
        assert_eq!(config.tolerate_repeat_transitions, 5);
        assert_eq!(config.history_capacity, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_attempts() {
        let err = PilotConfig::builder().ai_recovery_attempts(0).build();
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
        // 关闭纠偏时次数无意义
        assert!(PilotConfig::builder()
            .ai_recovery(false)
            .ai_recovery_attempts(0)
            .build()
            .is_ok());
    }

    #[test]
    fn test_force_close_requires_process_name() {
        let mut config = PilotConfig::default();
        config.force_close_on_repeat_states = true;
        assert!(config.validate().is_err());

        let config = PilotConfig::builder()
            .force_close_process("excel.exe")
            .build()
            .unwrap();
        assert_eq!(config.process_name.as_deref(), Some("excel.exe"));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.toml");
        std::fs::write(
            &path,
            "[device]\ngroup_name = \"finance\"\nmax_retries = 2\n\n[pilot]\ntolerate_repeat_states = 9\n",
        )
        .unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.device.group_name, "finance");
        assert_eq!(config.device.max_retries, 2);
        assert_eq!(config.pilot.tolerate_repeat_states, 9);
        assert_eq!(config.channel.ack_timeout(), Duration::from_secs(90));
    }
}
