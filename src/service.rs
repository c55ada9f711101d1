use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tower::Service;
use tracing::{error, info, warn};

use crate::browser::ChromeLauncher;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ScraperConfig;
use crate::diff::{detect_changes, ChangeSummary};
use crate::error::ScraperError;
use crate::model::CampaignRecord;
use crate::persist::{FlushReport, JsonArtifact, JsonArtifactSink, PostgresSink, Snapshot};
use crate::pool::WorkerPool;
use crate::rate_limit::RateLimitStats;
use crate::rule::{CategoryDef, SiteRule};
use crate::runner::{CategoryOutcome, RunContext};
use crate::traits::{CampaignSink, DriverFactory};

/// スクレイピングリクエスト
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub site: SiteRule,
    /// 対象カテゴリのキー（空なら全カテゴリ）
    pub categories: Vec<String>,
    /// JSON の出力先（未指定なら `output_dir` にタイムスタンプ付きで保存）
    pub output: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub database_url: Option<String>,
    /// 差分比較に使う前回の JSON
    pub previous: Option<PathBuf>,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl ScrapeRequest {
    pub fn new(site: SiteRule) -> Self {
        Self {
            site,
            categories: Vec::new(),
            output: None,
            checkpoint: None,
            database_url: None,
            previous: None,
            cancel: None,
        }
    }

    pub fn with_categories<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_previous(mut self, path: impl Into<PathBuf>) -> Self {
        self.previous = Some(path.into());
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// サイトの全カテゴリを対象にしているか
    fn selects_all_categories(&self) -> bool {
        self.categories.is_empty()
            || self
                .site
                .categories
                .iter()
                .all(|c| self.categories.contains(&c.key))
    }

    /// 指定キーのカテゴリ。未定義のキーがあればエラー。
    fn selected_categories(&self) -> Result<Vec<CategoryDef>, ScraperError> {
        if self.categories.is_empty() {
            return Ok(self.site.categories.clone());
        }
        self.categories
            .iter()
            .map(|key| {
                self.site.category(key).cloned().ok_or_else(|| {
                    ScraperError::InvalidRule(format!(
                        "{} に未定義のカテゴリです: {}",
                        self.site.site_id, key
                    ))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeSummary {
    pub raw: usize,
    pub unique: usize,
    pub duplicates: usize,
    pub processed: usize,
    pub errors: usize,
    /// リクエスト成功率 (%)
    pub success_rate: f64,
}

/// スクレイピング結果
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeReport {
    pub site_id: String,
    pub records: Vec<CampaignRecord>,
    pub summary: ScrapeSummary,
    pub outcomes: Vec<CategoryOutcome>,
    pub errors: Vec<String>,
    pub flushes: Vec<FlushReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<ChangeSummary>,
    pub stats: RateLimitStats,
    pub cancelled: bool,
}

/// tower::Serviceを実装したスクレイパーサービス
pub struct ScraperService<F: DriverFactory> {
    factory: Arc<F>,
    config: Arc<ScraperConfig>,
}

impl<F: DriverFactory> Clone for ScraperService<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            config: Arc::clone(&self.config),
        }
    }
}

impl ScraperService<ChromeLauncher> {
    /// Chrome で巡回するサービス
    pub fn chrome(config: ScraperConfig) -> Self {
        Self::new(ChromeLauncher::new(config.clone()), config)
    }
}

impl<F: DriverFactory> ScraperService<F> {
    pub fn new(factory: F, config: ScraperConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }
}

impl<F: DriverFactory> Service<ScrapeRequest> for ScraperService<F> {
    type Response = ScrapeReport;
    type Error = ScraperError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ScrapeRequest) -> Self::Future {
        info!("スクレイピングリクエスト受信: site={}", req.site.site_id);
        let factory = Arc::clone(&self.factory);
        let config = Arc::clone(&self.config);

        Box::pin(async move { execute(factory, config, req).await })
    }
}

async fn execute<F: DriverFactory>(
    factory: Arc<F>,
    config: Arc<ScraperConfig>,
    req: ScrapeRequest,
) -> Result<ScrapeReport, ScraperError> {
    let categories = req.selected_categories()?;
    let site = req.site.clone();
    let full_selection = req.selects_all_categories();
    let rule = Arc::new(req.site.compile()?);
    let site_id = rule.site_id().to_string();

    let store = match &req.checkpoint {
        Some(path) => Some(CheckpointStore::open(path, &site_id, config.checkpoint_every).await?),
        None => None,
    };
    let resume = match &store {
        Some(store) => {
            let snapshot = store.snapshot().await;
            if !snapshot.site_id.is_empty() && snapshot.site_id != site_id {
                return Err(ScraperError::InvalidRule(format!(
                    "チェックポイントのサイト ({}) が {} と一致しません",
                    snapshot.site_id, site_id
                )));
            }
            snapshot
        }
        None => Checkpoint::new(&site_id),
    };

    let cancel = req.cancel.unwrap_or_else(|| watch::channel(false).1);
    let ctx = RunContext::new(
        Arc::clone(&rule),
        Arc::clone(&config),
        Arc::new(resume),
        cancel,
    );

    let pool = WorkerPool::new(factory, config.workers);
    let output = pool.run(ctx, categories, store.as_ref()).await;

    let summary = ScrapeSummary {
        raw: output.accumulator.raw_count(),
        unique: output.accumulator.unique_count(),
        duplicates: output.accumulator.duplicate_count(),
        processed: output.processed,
        errors: output.errors.len(),
        success_rate: output.stats.success_rate(),
    };
    let cancelled = output.cancelled;
    let complete = output.is_complete();
    let outcomes = output.outcomes;
    let mut errors = output.errors;
    let records = output.accumulator.into_records();

    // 今回巡回したデバイスと、判定で別デバイスになったレコードのデバイス
    let mut devices = config.devices();
    for record in &records {
        if !devices.contains(&record.device) {
            devices.push(record.device);
        }
    }

    let mut flushes = Vec::new();
    let snapshot = Snapshot {
        site: &site,
        records: &records,
        devices: &devices,
        processed: summary.processed,
        errors: &errors,
        scraped_at: Utc::now(),
    };

    let json_sink = match &req.output {
        Some(path) => JsonArtifactSink::new(path),
        None => JsonArtifactSink::timestamped(&config.output_dir, &site_id),
    };
    let mut flush_errors = Vec::new();
    match json_sink.flush(&snapshot).await {
        Ok(report) => flushes.push(report),
        Err(e) => {
            error!(path = %json_sink.path().display(), error = %e, "JSON の保存に失敗しました");
            flush_errors.push(format!("JSON 保存失敗: {}", e));
        }
    }

    if let Some(url) = &req.database_url {
        match db_skip_reason(cancelled, complete, full_selection) {
            Some(reason) => warn!(reason, "DB への反映は行いません（前回分を残します）"),
            None => match flush_database(url, config.batch_size, &snapshot).await {
                Ok(report) => {
                    flush_errors.extend(
                        report
                            .failures
                            .iter()
                            .map(|f| format!("DB バッチ {} 失敗: {}", f.index, f.error)),
                    );
                    flushes.push(report);
                }
                Err(e) => {
                    error!(error = %e, "DB への保存に失敗しました");
                    flush_errors.push(format!("DB 保存失敗: {}", e));
                }
            },
        }
    }
    errors.extend(flush_errors);

    let changes = match &req.previous {
        Some(path) => match JsonArtifact::load(path).await {
            Ok(previous) => {
                let changes = detect_changes(&previous.campaigns, &records).summary();
                info!(
                    new = changes.new,
                    changed = changes.changed,
                    unchanged = changes.unchanged,
                    removed = changes.removed,
                    "前回との差分"
                );
                Some(changes)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "前回の JSON を読めないため差分は省略します");
                errors.push(format!("前回データ読み込み失敗: {}", e));
                None
            }
        },
        None => None,
    };

    if let Some(store) = &store {
        let result = if complete {
            store.clear().await
        } else {
            info!(path = %store.path().display(), "未完了のカテゴリがあるためチェックポイントを残します");
            store.save(&records).await
        };
        if let Err(e) = result {
            warn!(error = %e, "チェックポイントの更新に失敗しました");
            errors.push(format!("チェックポイント更新失敗: {}", e));
        }
    }

    info!(
        site = %site_id,
        unique = summary.unique,
        duplicates = summary.duplicates,
        errors = errors.len(),
        success_rate = %format!("{:.1}", summary.success_rate),
        "スクレイピング完了"
    );

    Ok(ScrapeReport {
        site_id,
        records,
        summary: ScrapeSummary {
            errors: errors.len(),
            ..summary
        },
        outcomes,
        errors,
        flushes,
        changes,
        stats: output.stats,
        cancelled,
    })
}

/// DB はサイト（デバイス）単位で置き換えるため、一部しか取れていない実行では反映しない
fn db_skip_reason(cancelled: bool, complete: bool, full_selection: bool) -> Option<&'static str> {
    if cancelled {
        Some("中断されました")
    } else if !complete {
        Some("未完了のカテゴリがあります")
    } else if !full_selection {
        Some("一部のカテゴリのみ指定されています")
    } else {
        None
    }
}

async fn flush_database(
    url: &str,
    batch_size: usize,
    snapshot: &Snapshot<'_>,
) -> Result<FlushReport, ScraperError> {
    let sink = PostgresSink::connect(url, batch_size).await?;
    sink.migrate().await?;
    sink.flush(snapshot).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagination::StopReason;
    use crate::pool::tests::FakeFactory;
    use crate::runner::tests::{listing_html, page_url, FakeDriver, MOPPY_JSON};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn site() -> SiteRule {
        SiteRule::from_json_str(MOPPY_JSON).unwrap()
    }

    #[test]
    fn test_scrape_request_builder() {
        let req = ScrapeRequest::new(site())
            .with_categories(["shopping"])
            .with_output("/tmp/moppy.json")
            .with_checkpoint("/tmp/moppy_checkpoint.json");

        assert_eq!(req.categories, vec!["shopping".to_string()]);
        assert_eq!(req.output, Some(PathBuf::from("/tmp/moppy.json")));
        assert_eq!(req.selected_categories().unwrap().len(), 1);
        assert!(req.database_url.is_none());
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        let req = ScrapeRequest::new(site()).with_categories(["travel"]);
        assert!(matches!(
            req.selected_categories(),
            Err(ScraperError::InvalidRule(_))
        ));
    }

    #[tokio::test]
    async fn test_three_page_category_end_to_end() {
        let dir = TempDir::new().unwrap();
        let mut pages = HashMap::new();
        pages.insert(page_url(1), listing_html(1..31));
        pages.insert(page_url(2), listing_html(31..61));
        pages.insert(page_url(3), listing_html(31..61));
        let mut service = ScraperService::new(
            FakeFactory::new(FakeDriver::new(pages)),
            ScraperConfig::default().without_delays(),
        );

        let output = dir.path().join("moppy.json");
        let checkpoint = dir.path().join("checkpoint.json");
        let report = service
            .call(
                ScrapeRequest::new(site())
                    .with_output(&output)
                    .with_checkpoint(&checkpoint),
            )
            .await
            .unwrap();

        assert_eq!(report.summary.unique, 60);
        assert!(report.summary.duplicates >= 30);
        assert_eq!(report.outcomes[0].stop_reason, Some(StopReason::DuplicateContent));
        assert!(!report.cancelled);
        assert_eq!(report.flushes.len(), 1);

        let artifact = JsonArtifact::load(&output).await.unwrap();
        assert_eq!(artifact.total_campaigns, 60);
        assert_eq!(artifact.summary.processed, 3);
        assert!(!checkpoint.exists());
    }

    #[test]
    fn test_db_flush_requires_complete_full_run() {
        assert_eq!(db_skip_reason(false, true, true), None);
        assert!(db_skip_reason(true, true, true).is_some());
        assert!(db_skip_reason(false, false, true).is_some());
        assert!(db_skip_reason(false, true, false).is_some());
    }

    #[test]
    fn test_category_selection_coverage() {
        let mut site = site();
        site.categories.push(CategoryDef {
            key: "travel".into(),
            name: "旅行".into(),
            url: "/category/list.php?parent_category=5".into(),
            max_pages: None,
        });
        assert!(ScrapeRequest::new(site.clone()).selects_all_categories());
        assert!(!ScrapeRequest::new(site.clone())
            .with_categories(["shopping"])
            .selects_all_categories());
        assert!(ScrapeRequest::new(site)
            .with_categories(["travel", "shopping"])
            .selects_all_categories());
    }

    #[tokio::test]
    async fn test_incomplete_run_leaves_database_untouched() {
        let dir = TempDir::new().unwrap();
        let mut pages = HashMap::new();
        pages.insert(
            page_url(1),
            "<html><body><div class='renewal'></div></body></html>".to_string(),
        );
        let mut service = ScraperService::new(
            FakeFactory::new(FakeDriver::new(pages)),
            ScraperConfig::default().without_delays(),
        );

        // 接続できない URL: 反映を試みれば DB 保存失敗が記録される
        let report = service
            .call(
                ScrapeRequest::new(site())
                    .with_output(dir.path().join("moppy.json"))
                    .with_database_url("postgres://127.0.0.1:1/none"),
            )
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].stop_reason, Some(StopReason::Error));
        assert_eq!(report.flushes.len(), 1);
        assert_eq!(report.flushes[0].sink, "json");
        assert!(report.errors.iter().all(|e| !e.contains("DB")));
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut service = ScraperService::new(
            FakeFactory::new(FakeDriver::default()),
            ScraperConfig::default().without_delays(),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let checkpoint = dir.path().join("checkpoint.json");
        let report = service
            .call(
                ScrapeRequest::new(site())
                    .with_output(dir.path().join("moppy.json"))
                    .with_checkpoint(&checkpoint)
                    .with_cancel(cancel_rx),
            )
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(checkpoint.exists());
    }
}
