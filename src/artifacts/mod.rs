//! 运行产物（截图等）
//!
//! 落盘路径：`{root}/{folder}/{run_id}/{subfolder}/{filename}`；截图文件名为 `{YYYYmmddHHMMSS}_{message}.png`（空格替换为下划线）。
//! 产物保存失败不影响自动化流程，由调用方记日志。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

use crate::actions::{ActionError, ActionExecutor};
use crate::config::ArtifactsSection;

pub const SCREENSHOT_FOLDER: &str = "screenshots";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Screen capture failed: {0}")]
    Capture(#[from] ActionError),

    #[error("Invalid base64 image: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// 产物存储
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn save(&self, filename: &str, bytes: &[u8], subfolder: Option<&str>) -> Result<PathBuf, ArtifactError>;
}

/// 本地目录存储
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    dir: PathBuf,
}

impl LocalArtifactStore {
    /// `root/folder`
    pub fn new(root: impl AsRef<Path>, folder: &str) -> Self {
        Self {
            dir: root.as_ref().join(folder),
        }
    }

    /// 某次运行的产物目录：`{root}/{folder}/{run_id}`
    pub fn for_run(section: &ArtifactsSection, run_id: &str) -> Self {
        Self {
            dir: section.root.join(&section.folder).join(run_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ArtifactSink for LocalArtifactStore {
    async fn save(&self, filename: &str, bytes: &[u8], subfolder: Option<&str>) -> Result<PathBuf, ArtifactError> {
        let dir = match subfolder {
            Some(sub) => self.dir.join(sub),
            None => self.dir.clone(),
        };
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// 丢弃所有产物
#[derive(Debug, Default)]
pub struct NullArtifactSink;

#[async_trait]
impl ArtifactSink for NullArtifactSink {
    async fn save(&self, filename: &str, _bytes: &[u8], subfolder: Option<&str>) -> Result<PathBuf, ArtifactError> {
        Ok(subfolder.map(PathBuf::from).unwrap_or_default().join(filename))
    }
}

/// 内存存储（测试与调试用）
#[derive(Debug, Default)]
pub struct MemoryArtifactSink {
    saved: Mutex<Vec<(PathBuf, Vec<u8>)>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifactSink {
    async fn save(&self, filename: &str, bytes: &[u8], subfolder: Option<&str>) -> Result<PathBuf, ArtifactError> {
        let path = subfolder.map(PathBuf::from).unwrap_or_default().join(filename);
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((path.clone(), bytes.to_vec()));
        Ok(path)
    }
}

/// 截图文件名：时间戳 + 消息（空格转下划线）
pub fn screenshot_filename(message: &str) -> String {
    format!(
        "{}_{}.png",
        chrono::Local::now().format("%Y%m%d%H%M%S"),
        message.trim().replace(' ', "_")
    )
}

/// 截图并保存，返回文件路径
pub async fn screenshot_and_log(
    executor: &dyn ActionExecutor,
    sink: &dyn ArtifactSink,
    message: &str,
) -> Result<PathBuf, ArtifactError> {
    let screen_b64 = executor.screenshot().await?;
    let bytes = STANDARD.decode(screen_b64.trim())?;
    let path = sink
        .save(&screenshot_filename(message), &bytes, Some(SCREENSHOT_FOLDER))
        .await?;
    tracing::info!(path = %path.display(), "{}", message);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingExecutor;

    #[test]
    fn test_screenshot_filename() {
        let name = screenshot_filename("State Login");
        assert!(name.ends_with("_State_Login.png"));
        assert_eq!(name.len(), "20260101120000_State_Login.png".len());
    }

    #[tokio::test]
    async fn test_local_store_writes_into_subfolder() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "run-1");
        let path = store.save("a.txt", b"hello", Some("logs")).await.unwrap();
        assert_eq!(path, dir.path().join("run-1").join("logs").join("a.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_run_directory_from_config() {
        let section = ArtifactsSection {
            root: PathBuf::from("data/artifacts"),
            folder: "invoices".to_string(),
        };
        let store = LocalArtifactStore::for_run(&section, "run-7");
        assert_eq!(store.dir(), Path::new("data/artifacts/invoices/run-7"));
    }

    #[tokio::test]
    async fn test_screenshot_and_log_decodes_png() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "run-2");
        let executor = RecordingExecutor::new();
        let path = screenshot_and_log(&executor, &store, "Runtime error").await.unwrap();
        assert!(path.starts_with(dir.path().join("run-2").join(SCREENSHOT_FOLDER)));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
    }

    #[tokio::test]
    async fn test_capture_failure_is_reported() {
        let sink = MemoryArtifactSink::new();
        let executor = RecordingExecutor::new().with_empty_screen();
        let err = screenshot_and_log(&executor, &sink, "x").await.unwrap_err();
        assert!(matches!(err, ArtifactError::Capture(ActionError::EmptyScreen)));
        assert!(sink.paths().is_empty());
    }
}
