//! 指数退避重试
//!
//! 第 n 次重试前等待 base * 2^(n-1)（上限 2^4 倍），`give_up` 判定为不可重试的错误立即返回。

use std::future::Future;
use std::time::Duration;

/// 重试策略：最多尝试次数（含首次）与基础等待时长
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_tries: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_tries: usize, base_delay: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            base_delay,
        }
    }

    /// 第 attempt 次失败后的等待时长（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(4) as u32;
        self.base_delay * (1u32 << shift)
    }

    /// 按策略执行 op，直到成功、耗尽次数或 give_up 返回 true
    pub async fn run<T, E, F, Fut, G>(&self, what: &str, mut op: F, give_up: G) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_tries || give_up(&e) => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        what,
                        attempt,
                        max_tries = self.max_tries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
