//! 失敗種別ごとの再試行ポリシー
//!
//! ブロック (403) は 60s → 120s → 240s の指数バックオフ、タイムアウトは即時に1回だけ、
//! 一時エラーは 2s から2回まで再試行する。それ以外の失敗は即座に返す。

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{FailureKind, ScraperError};

/// 1種類の失敗に対するバックオフ設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Backoff {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            multiplier: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// `attempt` 回目（0始まり）の再試行前に待つ時間
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    backoffs: HashMap<FailureKind, Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
            .with(
                FailureKind::Blocked,
                Backoff {
                    max_retries: 3,
                    base_delay: Duration::from_secs(60),
                    multiplier: 2,
                    max_delay: Duration::from_secs(240),
                },
            )
            .with(
                FailureKind::Timeout,
                Backoff {
                    max_retries: 1,
                    base_delay: Duration::ZERO,
                    multiplier: 1,
                    max_delay: Duration::ZERO,
                },
            )
            .with(
                FailureKind::Transient,
                Backoff {
                    max_retries: 2,
                    base_delay: Duration::from_secs(2),
                    multiplier: 2,
                    max_delay: Duration::from_secs(30),
                },
            )
    }
}

impl RetryPolicy {
    /// 何も再試行しないポリシー
    pub fn new() -> Self {
        Self {
            backoffs: HashMap::new(),
        }
    }

    pub fn with(mut self, kind: FailureKind, backoff: Backoff) -> Self {
        self.backoffs.insert(kind, backoff);
        self
    }

    pub fn backoff(&self, kind: FailureKind) -> Backoff {
        self.backoffs.get(&kind).copied().unwrap_or(Backoff::none())
    }

    /// 回数はそのままで待ち時間だけ0にする
    pub fn without_delays(mut self) -> Self {
        for backoff in self.backoffs.values_mut() {
            backoff.base_delay = Duration::ZERO;
            backoff.max_delay = Duration::ZERO;
        }
        self
    }

    pub fn tracker(&self) -> RetryTracker<'_> {
        RetryTracker {
            policy: self,
            attempts: HashMap::new(),
        }
    }

    /// `operation` を実行し、再試行対象の失敗なら種別ごとの回数・待ち時間で繰り返す
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, ScraperError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScraperError>>,
    {
        let mut tracker = self.tracker();
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => tracker.wait_or_fail(err).await?,
            }
        }
    }
}

/// 1回の操作に対する再試行回数の記録
pub struct RetryTracker<'p> {
    policy: &'p RetryPolicy,
    attempts: HashMap<FailureKind, u32>,
}

impl RetryTracker<'_> {
    /// 再試行するなら待ち時間、諦めるなら None
    pub fn next_delay(&mut self, err: &ScraperError) -> Option<Duration> {
        if !err.is_retryable() {
            return None;
        }
        let kind = err.kind();
        let backoff = self.policy.backoff(kind);
        let attempt = self.attempts.entry(kind).or_insert(0);
        if *attempt >= backoff.max_retries {
            tracing::error!(
                kind = ?kind,
                retries = *attempt,
                error = %err,
                "再試行回数の上限に達しました"
            );
            return None;
        }

        let delay = backoff.delay_for(*attempt);
        *attempt += 1;
        tracing::warn!(
            kind = ?kind,
            attempt = *attempt,
            max_retries = backoff.max_retries,
            delay_secs = delay.as_secs(),
            error = %err,
            "再試行します"
        );
        Some(delay)
    }

    /// 待ってから Ok、諦める場合は元のエラーを返す
    pub async fn wait_or_fail(&mut self, err: ScraperError) -> Result<(), ScraperError> {
        match self.next_delay(&err) {
            Some(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(())
            }
            None => Err(err),
        }
    }

    /// `wait_or_fail` と同じだが、待機中に `cancel` が true になったら
    /// `ScraperError::Cancelled` で抜ける
    pub async fn wait_or_cancel(
        &mut self,
        err: ScraperError,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ScraperError> {
        let Some(delay) = self.next_delay(&err) else {
            return Err(err);
        };
        if *cancel.borrow() {
            return Err(ScraperError::Cancelled);
        }
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            // 送信側が閉じた場合はこの分岐が無効になり、待機を続ける
            Ok(_) = cancel.wait_for(|cancelled| *cancelled) => {
                tracing::warn!(error = %err, "再試行待機中に中断されました");
                Err(ScraperError::Cancelled)
            }
        }
    }

    pub fn total_retries(&self) -> u32 {
        self.attempts.values().sum()
    }
}
