//! アクセス間隔の制御と 403 統計

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ScraperConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub successful: u64,
    pub blocked: u64,
    pub session_breaks: u64,
}

impl RateLimitStats {
    /// 成功率 (%)。リクエストなしなら 0
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful as f64 / self.total_requests as f64 * 100.0
        }
    }

    pub fn merge(&mut self, other: &RateLimitStats) {
        self.total_requests += other.total_requests;
        self.successful += other.successful;
        self.blocked += other.blocked;
        self.session_breaks += other.session_breaks;
    }
}

/// ワーカー1つ分のレートリミッタ
#[derive(Debug)]
pub struct RateLimiter {
    request_delay: Duration,
    page_delay: Duration,
    category_delay: Duration,
    session_max_requests: u32,
    session_break: Duration,
    /// 待ち時間に掛ける揺らぎ幅（0.25 なら ±25%）
    jitter: f64,
    last_request: Option<Instant>,
    session_requests: u32,
    consecutive_blocks: u32,
    stats: RateLimitStats,
}

impl RateLimiter {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            request_delay: config.request_delay,
            page_delay: config.page_delay,
            category_delay: config.category_delay,
            session_max_requests: config.session_max_requests,
            session_break: config.session_break,
            jitter: 0.25,
            last_request: None,
            session_requests: 0,
            consecutive_blocks: 0,
            stats: RateLimitStats::default(),
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// 通常のリクエスト前。前回から `request_delay` 経っていなければ待つ。
    pub async fn before_request(&mut self) {
        self.session_gate().await;
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.request_delay {
                let wait = self.jittered(self.request_delay - elapsed);
                tracing::debug!(wait_ms = wait.as_millis() as u64, "リクエスト間隔調整");
                tokio::time::sleep(wait).await;
            }
        }
        self.mark_request();
    }

    /// 次ページへ移る前
    pub async fn before_page(&mut self) {
        self.session_gate().await;
        let wait = self.jittered(self.page_delay);
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "ページ切り替え待機");
            tokio::time::sleep(wait).await;
        }
        self.mark_request();
    }

    /// カテゴリを切り替える前
    pub async fn before_category(&mut self) {
        let wait = self.jittered(self.category_delay);
        if !wait.is_zero() {
            tracing::info!(wait_secs = wait.as_secs(), "カテゴリ切り替え待機");
            tokio::time::sleep(wait).await;
        }
    }

    pub fn on_success(&mut self) {
        self.stats.successful += 1;
        self.consecutive_blocks = 0;
    }

    pub fn on_blocked(&mut self, url: &str) {
        self.stats.blocked += 1;
        self.consecutive_blocks += 1;
        tracing::warn!(
            url,
            consecutive = self.consecutive_blocks,
            total_blocked = self.stats.blocked,
            "403 を検出しました"
        );
    }

    pub fn consecutive_blocks(&self) -> u32 {
        self.consecutive_blocks
    }

    pub fn stats(&self) -> RateLimitStats {
        self.stats
    }

    async fn session_gate(&mut self) {
        if self.session_max_requests == 0 || self.session_requests < self.session_max_requests {
            return;
        }
        tracing::info!(
            requests = self.session_requests,
            break_secs = self.session_break.as_secs(),
            "セッション上限に達したため休憩します"
        );
        if !self.session_break.is_zero() {
            tokio::time::sleep(self.session_break).await;
        }
        self.session_requests = 0;
        self.stats.session_breaks += 1;
    }

    fn mark_request(&mut self) {
        self.last_request = Some(Instant::now());
        self.session_requests += 1;
        self.stats.total_requests += 1;
    }

    fn jittered(&self, base: Duration) -> Duration {
        if base.is_zero() || self.jitter == 0.0 {
            return base;
        }
        let factor = 1.0 - self.jitter + rand::random::<f64>() * self.jitter * 2.0;
        base.mul_f64(factor)
    }
}
