use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Device;
use crate::retry::RetryPolicy;

/// UA・ビューポートなどのアクセス環境
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device: Device,
    pub user_agent: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub mobile: bool,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    /// (name, value, domain, path)
    #[serde(default)]
    pub cookies: Vec<(String, String, String, String)>,
}

impl DeviceProfile {
    pub fn pc() -> Self {
        Self {
            device: Device::Pc,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            width: 1920,
            height: 1080,
            mobile: false,
            extra_headers: no_cache_headers(),
            cookies: Vec::new(),
        }
    }

    pub fn ios() -> Self {
        Self {
            device: Device::Ios,
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Mobile/15E148 Safari/604.1".to_string(),
            width: 375,
            height: 812,
            mobile: true,
            extra_headers: no_cache_headers(),
            cookies: Vec::new(),
        }
    }

    pub fn android() -> Self {
        Self {
            device: Device::Android,
            user_agent: "Mozilla/5.0 (Linux; Android 12; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36".to_string(),
            width: 360,
            height: 640,
            mobile: true,
            extra_headers: no_cache_headers(),
            cookies: Vec::new(),
        }
    }

    /// `pc` / `ios` / `android`（大文字小文字は区別しない）
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pc" => Some(Self::pc()),
            "ios" => Some(Self::ios()),
            "android" => Some(Self::android()),
            _ => None,
        }
    }

    pub fn for_device(device: Device) -> Self {
        match device {
            Device::Ios => Self::ios(),
            Device::Android => Self::android(),
            _ => Self::pc(),
        }
    }

    pub fn with_cookie(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        self.cookies
            .push((name.into(), value.into(), domain.into(), "/".to_string()));
        self
    }
}

fn no_cache_headers() -> HashMap<String, String> {
    HashMap::from([
        (
            "Cache-Control".to_string(),
            "no-cache, no-store, must-revalidate".to_string(),
        ),
        ("Pragma".to_string(), "no-cache".to_string()),
        ("Accept-Language".to_string(), "ja-JP,ja;q=0.9".to_string()),
    ])
}

/// 実行設定
///
/// 既定値:
/// - ページ上限 50、連続空ページ 2 で打ち切り
/// - チェックポイントは 20 URL ごと、DB 投入は 100 件ずつ
/// - リクエスト間隔 3 秒、ページ間 2 秒、カテゴリ間 5 秒（いずれも ±25% のゆらぎ）
/// - 描画待ち 3 秒、ナビゲーションのタイムアウト 45 秒
/// - 200 リクエストごとに 60 秒休憩、5 カテゴリごとにブラウザ再起動
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// 巡回に使うアクセス環境。複数あればカテゴリごとにそれぞれで1周する。
    pub profiles: Vec<DeviceProfile>,
    pub headless: bool,
    /// 1カテゴリあたりのページ上限
    pub max_pages: u32,
    /// 連続空ページでの打ち切り閾値
    pub empty_page_threshold: u32,
    /// N件処理ごとにチェックポイントを書き出す
    pub checkpoint_every: usize,
    /// DB 投入のバッチサイズ
    pub batch_size: usize,
    pub request_delay: Duration,
    pub page_delay: Duration,
    pub category_delay: Duration,
    /// ナビゲーション後の描画待ち
    pub content_wait: Duration,
    pub nav_timeout: Duration,
    /// 0 のとき連続リクエスト休憩なし
    pub session_max_requests: u32,
    pub session_break: Duration,
    /// Nカテゴリごとにブラウザを再起動
    pub browser_restart_every: u32,
    pub workers: usize,
    /// 詳細ページを取得して案件名・還元額を補完する
    pub enrich_details: bool,
    pub output_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            profiles: vec![DeviceProfile::pc()],
            headless: true,
            max_pages: 50,
            empty_page_threshold: 2,
            checkpoint_every: 20,
            batch_size: 100,
            request_delay: Duration::from_secs(3),
            page_delay: Duration::from_secs(2),
            category_delay: Duration::from_secs(5),
            content_wait: Duration::from_secs(3),
            nav_timeout: Duration::from_secs(45),
            session_max_requests: 200,
            session_break: Duration::from_secs(60),
            browser_restart_every: 5,
            workers: 1,
            enrich_details: false,
            output_dir: PathBuf::from("./data"),
            retry: RetryPolicy::default(),
        }
    }
}

impl ScraperConfig {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profiles: vec![profile],
            ..Default::default()
        }
    }

    /// `POINTSITE_*` 環境変数で上書き
    pub fn from_env() -> Self {
        let mut config = Self::default();
        // 例: POINTSITE_DEVICES=ios,android
        if let Some(devices) = read_env::<String>("POINTSITE_DEVICES")
            .or_else(|| read_env::<String>("POINTSITE_DEVICE"))
        {
            config = config.with_profiles(
                devices
                    .split(',')
                    .filter_map(DeviceProfile::parse_name)
                    .collect(),
            );
        }
        if let Some(v) = read_env("POINTSITE_HEADLESS") {
            config.headless = v;
        }
        if let Some(v) = read_env("POINTSITE_MAX_PAGES") {
            config.max_pages = v;
        }
        if let Some(v) = read_env("POINTSITE_EMPTY_PAGE_THRESHOLD") {
            config.empty_page_threshold = v;
        }
        if let Some(v) = read_env("POINTSITE_CHECKPOINT_EVERY") {
            config.checkpoint_every = v;
        }
        if let Some(v) = read_env("POINTSITE_BATCH_SIZE") {
            config.batch_size = v;
        }
        if let Some(v) = read_env("POINTSITE_REQUEST_DELAY_MS") {
            config.request_delay = Duration::from_millis(v);
        }
        if let Some(v) = read_env("POINTSITE_PAGE_DELAY_MS") {
            config.page_delay = Duration::from_millis(v);
        }
        if let Some(v) = read_env("POINTSITE_CATEGORY_DELAY_MS") {
            config.category_delay = Duration::from_millis(v);
        }
        if let Some(v) = read_env("POINTSITE_WORKERS") {
            config.workers = v;
        }
        if let Some(v) = read_env::<String>("POINTSITE_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(v);
        }
        config
    }

    /// 空なら変更しない。同じデバイスの重複は先のものを残す。
    pub fn with_profiles(mut self, profiles: Vec<DeviceProfile>) -> Self {
        let mut unique: Vec<DeviceProfile> = Vec::new();
        for profile in profiles {
            if !unique.iter().any(|p| p.device == profile.device) {
                unique.push(profile);
            }
        }
        if !unique.is_empty() {
            self.profiles = unique;
        }
        self
    }

    /// 先頭のアクセス環境
    pub fn primary_profile(&self) -> DeviceProfile {
        self.profiles.first().cloned().unwrap_or_else(DeviceProfile::pc)
    }

    /// 巡回するデバイス（プロファイル順）
    pub fn devices(&self) -> Vec<Device> {
        self.profiles.iter().map(|p| p.device).collect()
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_empty_page_threshold(mut self, threshold: u32) -> Self {
        self.empty_page_threshold = threshold;
        self
    }

    pub fn with_checkpoint_every(mut self, every: usize) -> Self {
        self.checkpoint_every = every;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_enrich_details(mut self, enrich: bool) -> Self {
        self.enrich_details = enrich;
        self
    }

    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// 待機時間をすべて0にする（テスト・ローカル検証用）
    pub fn without_delays(mut self) -> Self {
        self.request_delay = Duration::ZERO;
        self.page_delay = Duration::ZERO;
        self.category_delay = Duration::ZERO;
        self.content_wait = Duration::ZERO;
        self.session_break = Duration::ZERO;
        self.retry = self.retry.without_delays();
        self
    }
}

fn read_env<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
