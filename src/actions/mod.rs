//! 远程 UI 动作
//!
//! [`UiAction`] 是所有可在远端设备上执行的动作的封闭集合：点击、键盘输入、窗口 / 应用操作、文件操作。
//! 需要定位控件的动作携带 [`Target`]（文本提示 + 锚点 + 像素偏移），执行前由 [`TargetLocator`] 解析为坐标。
//! 执行失败时返回带结构化上下文（动作类型、目标）的 [`ActionError`]，供引擎记录与纠偏。

mod executor;
mod locator;

pub use executor::{ActionExecutor, RemoteActionExecutor};
pub use locator::{ActionModelLocator, Coords, TargetLocator};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::api::HttpError;
use crate::channel::ChannelError;

/// 锚点相对目标的方位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Above,
    Below,
    Left,
    Right,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Above => "above",
            Relation::Below => "below",
            Relation::Left => "left",
            Relation::Right => "right",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub value: String,
    pub relation: Relation,
}

/// 控件目标：文本提示、锚点、点击偏移；`bbox` 已知时跳过定位服务
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Target {
    pub prompt: String,
    pub anchors: Vec<Anchor>,
    pub offset: (i64, i64),
    pub bbox: Option<Coords>,
}

impl Target {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn anchored(mut self, value: impl Into<String>, relation: Relation) -> Self {
        self.anchors.push(Anchor {
            value: value.into(),
            relation,
        });
        self
    }

    pub fn above(self, anchor: impl Into<String>) -> Self {
        self.anchored(anchor, Relation::Above)
    }

    pub fn below(self, anchor: impl Into<String>) -> Self {
        self.anchored(anchor, Relation::Below)
    }

    pub fn left(self, anchor: impl Into<String>) -> Self {
        self.anchored(anchor, Relation::Left)
    }

    pub fn right(self, anchor: impl Into<String>) -> Self {
        self.anchored(anchor, Relation::Right)
    }

    /// 相对目标中心的像素偏移（x 向右，y 向下）
    pub fn offset(mut self, x: i64, y: i64) -> Self {
        self.offset = (x, y);
        self
    }

    pub fn with_bbox(mut self, bbox: Coords) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

/// 键盘输入内容：单串或多段（多段必须指定分隔键）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Keys {
    Text(String),
    Sequence(Vec<String>),
}

impl fmt::Display for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Keys::Text(s) => write!(f, "{s}"),
            Keys::Sequence(parts) => write!(f, "{}", parts.join(", ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOp {
    Maximize,
    Minimize,
    Close,
    Activate,
}

/// 待上传到远端的文件（内容为 base64）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDetails {
    pub filename: String,
    pub value: String,
}

/// 动作类型，即线上 `action_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    LeftClick,
    RightClick,
    MiddleClick,
    DoubleClick,
    SendKeys,
    PressKeys,
    Scroll,
    GetText,
    PasteText,
    OpenApp,
    ForceCloseApp,
    MaximizeWindow,
    MinimizeWindow,
    CloseWindow,
    ActivateWindow,
    SaveFiles,
    DeleteFiles,
    GetFile,
    Screenshot,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::LeftClick => "left_click",
            ActionKind::RightClick => "right_click",
            ActionKind::MiddleClick => "middle_click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::SendKeys => "send_keys",
            // 远端以 hot_keys 处理组合键
            ActionKind::PressKeys => "hot_keys",
            ActionKind::Scroll => "scroll",
            ActionKind::GetText => "get_text",
            ActionKind::PasteText => "paste_text",
            ActionKind::OpenApp => "open_app",
            ActionKind::ForceCloseApp => "force_close_app",
            ActionKind::MaximizeWindow => "maximize_window",
            ActionKind::MinimizeWindow => "minimize_window",
            ActionKind::CloseWindow => "close_window",
            ActionKind::ActivateWindow => "activate_window",
            ActionKind::SaveFiles => "save_files",
            ActionKind::DeleteFiles => "delete_files",
            ActionKind::GetFile => "get_file",
            ActionKind::Screenshot => "screenshot",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_KEY_INTERVAL: f64 = 0.05;
const DEFAULT_WINDOW_TIMEOUT_SECS: u64 = 10;
const DEFAULT_APP_TIMEOUT_SECS: u64 = 60;

/// 远端 UI 动作
#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    LeftClick(Target),
    RightClick(Target),
    MiddleClick(Target),
    DoubleClick(Target),
    SendKeys {
        keys: Keys,
        target: Option<Target>,
        key_separator: Option<String>,
        followed_by: Option<String>,
        interval: f64,
    },
    PressKeys(String),
    Scroll {
        clicks: i64,
        click_coords: Vec<i64>,
    },
    GetText(Target),
    PasteText {
        keys: String,
        target: Option<Target>,
        followed_by: Option<String>,
    },
    OpenApplication {
        app_path: String,
        app_window_name: String,
        timeout_secs: u64,
    },
    ForceCloseApplication(String),
    Window {
        op: WindowOp,
        window_name: String,
        timeout_secs: u64,
    },
    SaveFiles {
        save_location: String,
        files: Vec<FileDetails>,
    },
    DeleteFiles(Vec<String>),
    GetFile(String),
}

impl UiAction {
    pub fn left_click(target: Target) -> Self {
        UiAction::LeftClick(target)
    }

    pub fn double_click(target: Target) -> Self {
        UiAction::DoubleClick(target)
    }

    pub fn send_keys(keys: impl Into<String>) -> Self {
        UiAction::SendKeys {
            keys: Keys::Text(keys.into()),
            target: None,
            key_separator: None,
            followed_by: None,
            interval: DEFAULT_KEY_INTERVAL,
        }
    }

    pub fn press_keys(keys: impl Into<String>) -> Self {
        UiAction::PressKeys(keys.into())
    }

    pub fn window(op: WindowOp, window_name: impl Into<String>) -> Self {
        UiAction::Window {
            op,
            window_name: window_name.into(),
            timeout_secs: DEFAULT_WINDOW_TIMEOUT_SECS,
        }
    }

    pub fn open_application(app_path: impl Into<String>, app_window_name: impl Into<String>) -> Self {
        UiAction::OpenApplication {
            app_path: app_path.into(),
            app_window_name: app_window_name.into(),
            timeout_secs: DEFAULT_APP_TIMEOUT_SECS,
        }
    }

    pub fn force_close(process_name: impl Into<String>) -> Self {
        UiAction::ForceCloseApplication(process_name.into())
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            UiAction::LeftClick(_) => ActionKind::LeftClick,
            UiAction::RightClick(_) => ActionKind::RightClick,
            UiAction::MiddleClick(_) => ActionKind::MiddleClick,
            UiAction::DoubleClick(_) => ActionKind::DoubleClick,
            UiAction::SendKeys { .. } => ActionKind::SendKeys,
            UiAction::PressKeys(_) => ActionKind::PressKeys,
            UiAction::Scroll { .. } => ActionKind::Scroll,
            UiAction::GetText(_) => ActionKind::GetText,
            UiAction::PasteText { .. } => ActionKind::PasteText,
            UiAction::OpenApplication { .. } => ActionKind::OpenApp,
            UiAction::ForceCloseApplication(_) => ActionKind::ForceCloseApp,
            UiAction::Window { op, .. } => match op {
                WindowOp::Maximize => ActionKind::MaximizeWindow,
                WindowOp::Minimize => ActionKind::MinimizeWindow,
                WindowOp::Close => ActionKind::CloseWindow,
                WindowOp::Activate => ActionKind::ActivateWindow,
            },
            UiAction::SaveFiles { .. } => ActionKind::SaveFiles,
            UiAction::DeleteFiles(_) => ActionKind::DeleteFiles,
            UiAction::GetFile(_) => ActionKind::GetFile,
        }
    }

    /// 需要先解析坐标的目标
    pub fn target(&self) -> Option<&Target> {
        match self {
            UiAction::LeftClick(t)
            | UiAction::RightClick(t)
            | UiAction::MiddleClick(t)
            | UiAction::DoubleClick(t)
            | UiAction::GetText(t) => Some(t),
            UiAction::SendKeys { target, .. } | UiAction::PasteText { target, .. } => target.as_ref(),
            _ => None,
        }
    }

    /// 执行前的结构校验
    pub fn validate(&self) -> Result<(), ActionError> {
        match self {
            UiAction::SendKeys {
                keys: Keys::Sequence(_),
                key_separator: None,
                ..
            } => Err(ActionError::Invalid(
                "The attribute 'key_separator' must be provided if 'keys' is a list.".into(),
            )),
            UiAction::Window { window_name, .. } if window_name.is_empty() => {
                Err(ActionError::Invalid("window_name must not be empty".into()))
            }
            UiAction::ForceCloseApplication(name) if name.is_empty() => {
                Err(ActionError::Invalid("process_name must not be empty".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn context(&self) -> ActionContext {
        ActionContext {
            kind: self.kind(),
            target: self.target().map(|t| t.prompt.clone()),
            description: self.describe(),
        }
    }

    /// 线上载荷；`coordinates` 为已解析的点击坐标（无目标时为空）
    pub fn to_payload(&self, coordinates: &[i64]) -> Value {
        let action_type = self.kind().as_str();
        match self {
            UiAction::LeftClick(_)
            | UiAction::RightClick(_)
            | UiAction::MiddleClick(_)
            | UiAction::DoubleClick(_)
            | UiAction::GetText(_) => json!({
                "action_type": action_type,
                "coordinates": coordinates,
            }),
            UiAction::SendKeys {
                keys,
                key_separator,
                followed_by,
                interval,
                ..
            } => json!({
                "action_type": action_type,
                "coordinates": coordinates,
                "keys": keys,
                "key_separator": key_separator,
                "followed_by": followed_by,
                "interval": interval,
            }),
            UiAction::PressKeys(keys) => json!({
                "action_type": action_type,
                "keys": keys,
                "coordinates": coordinates,
            }),
            UiAction::Scroll {
                clicks,
                click_coords,
            } => json!({
                "action_type": action_type,
                "coordinates": click_coords,
                "clicks": clicks,
            }),
            UiAction::PasteText {
                keys, followed_by, ..
            } => json!({
                "action_type": action_type,
                "coordinates": coordinates,
                "keys": keys,
                "followed_by": followed_by,
            }),
            UiAction::OpenApplication {
                app_path,
                app_window_name,
                timeout_secs,
            } => json!({
                "action_type": action_type,
                "app_path": app_path,
                "app_window_name": app_window_name,
                "timeout": timeout_secs,
            }),
            UiAction::ForceCloseApplication(process_name) => json!({
                "action_type": action_type,
                "process_name": process_name,
            }),
            UiAction::Window {
                window_name,
                timeout_secs,
                ..
            } => json!({
                "action_type": action_type,
                "window_name": window_name,
                "timeout": timeout_secs,
            }),
            UiAction::SaveFiles {
                save_location,
                files,
            } => json!({
                "action_type": action_type,
                "save_location": save_location,
                "files": files,
            }),
            UiAction::DeleteFiles(files_location) => json!({
                "action_type": action_type,
                "files_location": files_location,
            }),
            UiAction::GetFile(file_location) => json!({
                "action_type": action_type,
                "file_location": file_location,
            }),
        }
    }

    /// 可读形式，与纠偏 Agent 产出的动作串同构，如 `LeftClick(target='OK').above('Cancel').do()`
    pub fn describe(&self) -> String {
        let head = match self {
            UiAction::LeftClick(t) => format!("LeftClick(target={})", quote(&t.prompt)),
            UiAction::RightClick(t) => format!("RightClick(target={})", quote(&t.prompt)),
            UiAction::MiddleClick(t) => format!("MiddleClick(target={})", quote(&t.prompt)),
            UiAction::DoubleClick(t) => format!("DoubleClick(target={})", quote(&t.prompt)),
            UiAction::SendKeys { keys, target, .. } => match target {
                Some(t) => format!("SendKeys(target={}, keys={})", quote(&t.prompt), quote(&keys.to_string())),
                None => format!("SendKeys(keys={})", quote(&keys.to_string())),
            },
            UiAction::PressKeys(keys) => format!("PressKeys(keys={})", quote(keys)),
            UiAction::Scroll { clicks, .. } => format!("Scroll(clicks={clicks})"),
            UiAction::GetText(t) => format!("GetText(target={})", quote(&t.prompt)),
            UiAction::PasteText { keys, .. } => format!("PasteText(keys={})", quote(keys)),
            UiAction::OpenApplication { app_path, .. } => {
                format!("OpenApplication(app_path={})", quote(app_path))
            }
            UiAction::ForceCloseApplication(p) => format!("ForceCloseApplication(process_name={})", quote(p)),
            UiAction::Window { op, window_name, .. } => {
                let name = match op {
                    WindowOp::Maximize => "MaximizeWindow",
                    WindowOp::Minimize => "MinimizeWindow",
                    WindowOp::Close => "CloseWindow",
                    WindowOp::Activate => "ActivateWindow",
                };
                format!("{name}(window_name={})", quote(window_name))
            }
            UiAction::SaveFiles { save_location, .. } => {
                format!("SaveFiles(save_location={})", quote(save_location))
            }
            UiAction::DeleteFiles(files) => format!("DeleteFiles(files_location={files:?})"),
            UiAction::GetFile(file) => format!("GetFile(file_location={})", quote(file)),
        };

        let mut out = head;
        if let Some(target) = self.target() {
            for anchor in &target.anchors {
                out.push_str(&format!(".{}({})", anchor.relation.as_str(), quote(&anchor.value)));
            }
            if target.offset != (0, 0) {
                out.push_str(&format!(".offset(x={}, y={})", target.offset.0, target.offset.1));
            }
        }
        out.push_str(".do()");
        out
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// 失败动作的结构化上下文
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    pub kind: ActionKind,
    pub target: Option<String>,
    pub description: String,
}

impl fmt::Display for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// 动作执行错误
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Invalid action: {0}")]
    Invalid(String),

    #[error("{context}: the target could not be uniquely identified")]
    TargetNotFound { context: ActionContext },

    #[error("{context}: remote execution failed: {message}")]
    Failed { context: ActionContext, message: String },

    #[error("{context}: {source}")]
    Channel {
        context: ActionContext,
        #[source]
        source: ChannelError,
    },

    #[error("Target locator request failed: {0}")]
    Locator(#[from] HttpError),

    #[error("Screen capture returned no image")]
    EmptyScreen,
}

impl ActionError {
    pub fn context(&self) -> Option<&ActionContext> {
        match self {
            ActionError::TargetNotFound { context }
            | ActionError::Failed { context, .. }
            | ActionError::Channel { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_press_keys_maps_to_hot_keys() {
        let payload = UiAction::press_keys("ctrl+s").to_payload(&[]);
        assert_eq!(payload["action_type"], "hot_keys");
        assert_eq!(payload["keys"], "ctrl+s");
    }

    #[test]
    fn test_describe_includes_anchors_and_offset() {
        let action = UiAction::left_click(Target::text("OK").above("Cancel").offset(10, -20));
        assert_eq!(
            action.describe(),
            "LeftClick(target='OK').above('Cancel').offset(x=10, y=-20).do()"
        );
        let ctx = action.context();
        assert_eq!(ctx.kind, ActionKind::LeftClick);
        assert_eq!(ctx.target.as_deref(), Some("OK"));
    }

    #[test]
    fn test_key_sequence_requires_separator() {
        let action = UiAction::SendKeys {
            keys: Keys::Sequence(vec!["a".into(), "b".into()]),
            target: None,
            key_separator: None,
            followed_by: None,
            interval: 0.05,
        };
        assert!(matches!(action.validate(), Err(ActionError::Invalid(_))));
        assert!(UiAction::send_keys("hello").validate().is_ok());
    }

    #[test]
    fn test_window_payload_has_timeout() {
        let payload = UiAction::window(WindowOp::Activate, "Excel").to_payload(&[]);
        assert_eq!(payload["action_type"], "activate_window");
        assert_eq!(payload["window_name"], "Excel");
        assert_eq!(payload["timeout"], 10);
    }
}
