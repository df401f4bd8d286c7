//! 可观测性：tracing 订阅器初始化与动作审计日志

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// 输出一条结构化审计日志（JSON），字段由调用方给出
pub fn audit(event: &str, fields: serde_json::Value) {
    let mut record = serde_json::json!({ "event": event });
    if let (Some(record), serde_json::Value::Object(fields)) = (record.as_object_mut(), fields) {
        record.extend(fields);
    }
    tracing::info!(audit = %record, "{}", event);
}
