//! リトライ付きレジストリ操作
//!
//! pull / push はすべてこの有界リトライでラップする。方向による
//! 特別扱いはなく、ログに使う操作名だけが呼び出し側ごとに異なる。

use crate::error::BuildResult;
use std::time::Duration;

/// 名前付きの失敗しうる操作に対する有界リトライポリシー
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大試行回数（リトライではなく総数）
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    /// バックオフの上限
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// リトライなし（最初の失敗で確定）
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// n 回目の失敗後に待つ時間（capped exponential）
    pub fn backoff_duration(&self, failed_attempts: usize) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let base_millis = self.initial_backoff.as_millis() as f64;
        let multiplier = self.backoff_multiplier.powi((failed_attempts - 1) as i32);
        let backoff = Duration::from_millis((base_millis * multiplier) as u64);
        backoff.min(self.max_backoff)
    }

    /// 操作を成功するか試行回数を使い切るまで実行する。
    /// 成功で即座に返り、使い切った場合は最後のエラーを返す。
    pub async fn run<T, F, Fut>(&self, operation: &str, mut action: F) -> BuildResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BuildResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= attempts {
                        tracing::warn!(
                            "{} failed after {} attempt(s): {}",
                            operation,
                            attempt,
                            err
                        );
                        return Err(err);
                    }
                    let backoff = self.backoff_duration(attempt);
                    tracing::debug!(
                        "{} attempt {}/{} failed: {} (retrying in {:?})",
                        operation,
                        attempt,
                        attempts,
                        err,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flaky(
        counter: &AtomicUsize,
        succeed_on: usize,
    ) -> impl Future<Output = BuildResult<usize>> + '_ {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n >= succeed_on {
                Ok(n)
            } else {
                Err(BuildError::PullFailed {
                    image: "example".to_string(),
                    message: format!("attempt {}", n),
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures_with_exact_attempt_count() {
        let counter = AtomicUsize::new(0);
        let policy = RetryPolicy::default();

        let result = policy.run("Pull", || flaky(&counter, 3)).await.unwrap();
        assert_eq!(result, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_short_circuits() {
        let counter = AtomicUsize::new(0);
        let policy = RetryPolicy::default();

        policy.run("Pull", || flaky(&counter, 1)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let counter = AtomicUsize::new(0);
        let policy = RetryPolicy::default();

        let err = policy.run("Push", || flaky(&counter, 99)).await.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        match err {
            BuildError::PullFailed { message, .. } => assert_eq!(message, "attempt 3"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_duration(0), Duration::ZERO);
        assert_eq!(policy.backoff_duration(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_duration(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_duration(10), Duration::from_secs(10));
    }
}
