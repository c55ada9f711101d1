use std::time::Duration;

use async_trait::async_trait;

use crate::config::DeviceProfile;
use crate::error::ScraperError;
use crate::persist::{FlushReport, Snapshot};

/// 描画済みページを扱うドライバ（本番は Chrome、テストは固定HTML）
#[async_trait]
pub trait PageDriver: Send {
    /// URLを開いて描画済みHTMLを返す
    async fn open(&mut self, url: &str) -> Result<String, ScraperError>;

    /// `selector` に一致する要素（`text` 指定時はテキスト一致のもの）をクリック。
    /// 見つからなければ false。
    async fn click(&mut self, selector: &str, text: Option<&str>) -> Result<bool, ScraperError>;

    /// 最下部までスクロールして `wait` だけ待つ
    async fn scroll_to_bottom(&mut self, wait: Duration) -> Result<(), ScraperError>;

    /// 現在のHTML
    async fn html(&mut self) -> Result<String, ScraperError>;

    /// リソース解放
    async fn close(&mut self) -> Result<(), ScraperError> {
        Ok(())
    }

    /// クリックして描画後のHTMLを返す（一括実行）
    async fn click_and_read(
        &mut self,
        selector: &str,
        text: Option<&str>,
    ) -> Result<Option<String>, ScraperError> {
        if !self.click(selector, text).await? {
            return Ok(None);
        }
        Ok(Some(self.html().await?))
    }
}

/// 収集結果の書き出し先
#[async_trait]
pub trait CampaignSink: Send + Sync {
    fn name(&self) -> &str;

    /// サイト1つ分のスナップショットを書き出す（既存分は置き換え）
    async fn flush(&self, snapshot: &Snapshot<'_>) -> Result<FlushReport, ScraperError>;
}

/// ワーカーごとに専用のドライバを作る
#[async_trait]
pub trait DriverFactory: Send + Sync + 'static {
    type Driver: PageDriver + 'static;

    /// `profile` の UA・ビューポートで開いたドライバ
    async fn create(&self, profile: &DeviceProfile) -> Result<Self::Driver, ScraperError>;
}
