//! Chrome セッションとページドライバ
//!
//! ブラウザはワーカー単位で所有し、`close()` で確実に終了する。
//! 一定カテゴリ数ごとの再起動はワーカー側でドライバを作り直して行う。

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{DeviceProfile, ScraperConfig};
use crate::error::ScraperError;
use crate::traits::{DriverFactory, PageDriver};

/// ページ安定待機のタイムアウト
const PAGE_STABLE_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_STABLE_INTERVAL: Duration = Duration::from_millis(300);
const REQUIRED_STABLE_CHECKS: u32 = 3;

const BLOCKED_PHRASES: &[&str] = &["403 Forbidden", "Access Denied", "アクセスが制限されています"];
const NOT_FOUND_PHRASES: &[&str] = &["ページが見つかりません", "404 Not Found"];

const STATUS_SCRIPT: &str = r#"
(() => {
    const e = performance.getEntriesByType('navigation')[0];
    return e && e.responseStatus ? e.responseStatus : 0;
})()
"#;
const BODY_TEXT_SCRIPT: &str = "document.body ? document.body.innerText.slice(0, 3000) : ''";

/// ナビゲーション結果の分類（status=0 はステータス不明）
pub fn classify_response(url: &str, status: u16, body_text: &str) -> Result<(), ScraperError> {
    if status == 403 || BLOCKED_PHRASES.iter().any(|p| body_text.contains(p)) {
        return Err(ScraperError::Blocked {
            url: url.to_string(),
            status: if status == 0 { 403 } else { status },
        });
    }
    if status == 404 || NOT_FOUND_PHRASES.iter().any(|p| body_text.contains(p)) {
        return Err(ScraperError::NotFound(url.to_string()));
    }
    if status == 429 || status >= 500 {
        return Err(ScraperError::Transient(format!("{} (status={})", url, status)));
    }
    Ok(())
}

/// 起動済みブラウザとイベントハンドラタスク
pub struct BrowserSession {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    headless: bool,
    profile: DeviceProfile,
    nav_timeout: Duration,
    content_wait: Duration,
}

impl BrowserSession {
    pub async fn launch(
        config: &ScraperConfig,
        profile: &DeviceProfile,
    ) -> Result<Self, ScraperError> {
        let mut session = Self {
            browser: None,
            handler: None,
            headless: config.headless,
            profile: profile.clone(),
            nav_timeout: config.nav_timeout,
            content_wait: config.content_wait,
        };
        session.start().await?;
        Ok(session)
    }

    async fn start(&mut self) -> Result<(), ScraperError> {
        info!(device = %self.profile.device, headless = self.headless, "ブラウザを起動中...");

        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let user_data_dir = std::env::temp_dir().join(format!("pointsite-scraper-{}", unique_id));

        let chrome_path = std::env::var("CHROME_PATH")
            .or_else(|_| std::env::var("CHROMIUM_PATH"))
            .unwrap_or_else(|_| "chromium".to_string());

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&user_data_dir)
            .window_size(self.profile.width, self.profile.height);

        if !self.headless {
            builder = builder.with_head();
        }

        let browser_config = builder
            .no_sandbox()
            .request_timeout(Duration::from_secs(60))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--lang=ja-JP")
            .build()
            .map_err(ScraperError::BrowserInit)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScraperError::BrowserInit(e.to_string()))?;

        let task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {:?}", e);
                }
            }
        });

        self.browser = Some(browser);
        self.handler = Some(task);
        info!("ブラウザ起動完了");
        Ok(())
    }

    /// プロファイル（UA・ビューポート・ヘッダ・クッキー）を適用した新しいページ
    pub async fn new_page(&self) -> Result<ChromePage, ScraperError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| ScraperError::BrowserInit("ブラウザが初期化されていません".into()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScraperError::BrowserInit(e.to_string()))?;

        apply_profile(&page, &self.profile).await?;

        Ok(ChromePage {
            page,
            nav_timeout: self.nav_timeout,
            content_wait: self.content_wait,
        })
    }

    pub async fn close(mut self) -> Result<(), ScraperError> {
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("ブラウザ終了エラー: {}", e);
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler.take() {
            task.abort();
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(task) = self.handler.take() {
            task.abort();
        }
    }
}

async fn apply_profile(page: &Page, profile: &DeviceProfile) -> Result<(), ScraperError> {
    let cdp_err = |e: chromiumoxide::error::CdpError| ScraperError::BrowserInit(e.to_string());

    page.execute(SetUserAgentOverrideParams::new(profile.user_agent.clone()))
        .await
        .map_err(cdp_err)?;

    page.execute(SetDeviceMetricsOverrideParams::new(
        i64::from(profile.width),
        i64::from(profile.height),
        if profile.mobile { 2.0 } else { 1.0 },
        profile.mobile,
    ))
    .await
    .map_err(cdp_err)?;

    if !profile.extra_headers.is_empty() {
        let headers = serde_json::to_value(&profile.extra_headers)?;
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await
            .map_err(cdp_err)?;
    }

    for (name, value, domain, path) in &profile.cookies {
        match CookieParam::builder()
            .name(name)
            .value(value)
            .domain(domain)
            .path(path)
            .build()
        {
            Ok(param) => {
                if let Err(e) = page.set_cookie(param).await {
                    debug!("Failed to set cookie {}: {}", name, e);
                }
            }
            Err(e) => debug!("Invalid cookie {}: {}", name, e),
        }
    }
    Ok(())
}

/// Chrome の1タブ
pub struct ChromePage {
    page: Page,
    nav_timeout: Duration,
    content_wait: Duration,
}

impl ChromePage {
    async fn eval<T: serde::de::DeserializeOwned + Default>(&self, script: &str) -> T {
        match self.page.evaluate(script).await {
            Ok(v) => v.into_value::<T>().unwrap_or_default(),
            Err(e) => {
                debug!("evaluate error: {}", e);
                T::default()
            }
        }
    }

    /// HTML の長さが連続して変わらなくなるまで待機
    async fn wait_stable(&self) {
        let start = std::time::Instant::now();
        let mut last_len: Option<usize> = None;
        let mut stable_count = 0;

        while start.elapsed() < PAGE_STABLE_TIMEOUT {
            let current: usize = self.eval("document.documentElement.outerHTML.length").await;
            match last_len {
                Some(last) if last == current => {
                    stable_count += 1;
                    if stable_count >= REQUIRED_STABLE_CHECKS {
                        debug!("Page stable after {:?}", start.elapsed());
                        return;
                    }
                }
                _ => stable_count = 0,
            }
            last_len = Some(current);
            sleep(PAGE_STABLE_INTERVAL).await;
        }
        debug!("Page stable timeout after {:?}, proceeding anyway", start.elapsed());
    }

    async fn debug_screenshot(&self, label: &str) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        if let Ok(png) = self
            .page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
        {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
            debug!("{} screenshot: data:image/png;base64,{}", label, encoded);
        }
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn open(&mut self, url: &str) -> Result<String, ScraperError> {
        debug!(url, "ページを開きます");
        match tokio::time::timeout(self.nav_timeout, self.page.goto(url)).await {
            Err(_) => {
                return Err(ScraperError::Timeout(format!(
                    "{} ({}秒)",
                    url,
                    self.nav_timeout.as_secs()
                )))
            }
            Ok(Err(e)) => return Err(ScraperError::Navigation(format!("{}: {}", url, e))),
            Ok(Ok(_)) => {}
        }

        if !self.content_wait.is_zero() {
            sleep(self.content_wait).await;
        }
        self.wait_stable().await;

        let status: u16 = self.eval(STATUS_SCRIPT).await;
        let body_text: String = self.eval(BODY_TEXT_SCRIPT).await;
        if let Err(e) = classify_response(url, status, &body_text) {
            if matches!(e, ScraperError::Blocked { .. }) {
                self.debug_screenshot("blocked").await;
            }
            return Err(e);
        }

        self.html().await
    }

    async fn click(&mut self, selector: &str, text: Option<&str>) -> Result<bool, ScraperError> {
        let script = format!(
            r#"
            (() => {{
                const wanted = {text};
                const els = Array.from(document.querySelectorAll({selector}));
                const target = els.find(el => {{
                    if (el.disabled || el.classList.contains('disabled')) return false;
                    return wanted === null || el.textContent.trim() === wanted;
                }});
                if (!target) return false;
                target.scrollIntoView({{ block: 'center' }});
                target.click();
                return true;
            }})()
            "#,
            selector = serde_json::to_string(selector)?,
            text = serde_json::to_string(&text)?,
        );

        let clicked: bool = self.eval(&script).await;
        if clicked {
            if !self.content_wait.is_zero() {
                sleep(self.content_wait).await;
            }
            self.wait_stable().await;
        }
        Ok(clicked)
    }

    async fn scroll_to_bottom(&mut self, wait: Duration) -> Result<(), ScraperError> {
        self.page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await
            .map_err(|e| ScraperError::Transient(format!("スクロール失敗: {}", e)))?;
        sleep(wait).await;
        self.wait_stable().await;
        Ok(())
    }

    async fn html(&mut self) -> Result<String, ScraperError> {
        self.page
            .content()
            .await
            .map_err(|e| ScraperError::Transient(format!("HTML取得失敗: {}", e)))
    }

    async fn close(&mut self) -> Result<(), ScraperError> {
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| ScraperError::Transient(format!("ページ終了失敗: {}", e)))
    }
}

/// ワーカー1つが所有するブラウザとタブ
pub struct ChromeDriver {
    session: Option<BrowserSession>,
    page: ChromePage,
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn open(&mut self, url: &str) -> Result<String, ScraperError> {
        self.page.open(url).await
    }

    async fn click(&mut self, selector: &str, text: Option<&str>) -> Result<bool, ScraperError> {
        self.page.click(selector, text).await
    }

    async fn scroll_to_bottom(&mut self, wait: Duration) -> Result<(), ScraperError> {
        self.page.scroll_to_bottom(wait).await
    }

    async fn html(&mut self) -> Result<String, ScraperError> {
        self.page.html().await
    }

    async fn close(&mut self) -> Result<(), ScraperError> {
        if let Err(e) = self.page.close().await {
            debug!("ページ終了エラー: {}", e);
        }
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

/// 設定からワーカー用の Chrome を起動する
pub struct ChromeLauncher {
    config: ScraperConfig,
}

impl ChromeLauncher {
    pub fn new(config: ScraperConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DriverFactory for ChromeLauncher {
    type Driver = ChromeDriver;

    async fn create(&self, profile: &DeviceProfile) -> Result<ChromeDriver, ScraperError> {
        let session = BrowserSession::launch(&self.config, profile).await?;
        let page = session.new_page().await?;
        Ok(ChromeDriver {
            session: Some(session),
            page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_response() {
        let url = "https://pc.moppy.jp/category/list.php?parent_category=4";
        assert!(classify_response(url, 200, "楽天市場 1%").is_ok());
        assert!(classify_response(url, 0, "").is_ok());
        assert!(matches!(
            classify_response(url, 403, ""),
            Err(ScraperError::Blocked { status: 403, .. })
        ));
        assert!(matches!(
            classify_response(url, 200, "Access Denied"),
            Err(ScraperError::Blocked { .. })
        ));
        assert!(matches!(
            classify_response(url, 200, "お探しのページが見つかりません"),
            Err(ScraperError::NotFound(_))
        ));
        assert!(matches!(
            classify_response(url, 503, ""),
            Err(ScraperError::Transient(_))
        ));
    }

    #[tokio::test]
    #[ignore] // 実環境テスト用: cargo test test_chrome_driver_open -- --ignored --nocapture
    async fn test_chrome_driver_open() {
        let launcher = ChromeLauncher::new(ScraperConfig::default());
        let mut driver = launcher
            .create(&DeviceProfile::pc())
            .await
            .expect("Failed to launch browser");

        let html = driver
            .open("https://www.chobirich.com/shopping/shop/101")
            .await
            .expect("Failed to open listing");
        assert!(html.contains("ad_details"));

        driver.close().await.expect("Failed to close browser");
    }
}
