//! カテゴリ1つ分の巡回
//!
//! レート制限 → 取得（再試行つき）→ 抽出 → ページング判定 を1ページずつ回し、
//! 見つかったレコードは `RunEvent` として集約側へ送る。レコードの重複排除と
//! チェックポイントの保存は集約側が行う。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::ScraperConfig;
use crate::error::ScraperError;
use crate::extract::{extract_detail, extract_listing};
use crate::model::{CampaignRecord, Device, RawRecord, RecordKey};
use crate::normalize::{clean_title, detect_device, parse_cashback};
use crate::pagination::{Paginator, PaginatorLimits, StopReason};
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::rule::{CategoryDef, CompiledRule, PaginationMode};
use crate::traits::PageDriver;

/// ワーカーから集約側への通知
#[derive(Debug)]
pub enum RunEvent {
    /// 一覧ページ1枚分（`url` は処理済みURLとして記録される）
    Page {
        url: String,
        records: Vec<CampaignRecord>,
    },
    /// 詳細ページで補完したレコード
    Detail { url: String, record: CampaignRecord },
    CategoryDone(CategoryOutcome),
    WorkerDone { stats: RateLimitStats },
}

/// カテゴリ1つ（1デバイス分）の結果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryOutcome {
    pub category_key: String,
    pub category_name: String,
    pub device: Device,
    pub pages_fetched: u32,
    pub records_found: usize,
    pub details_fetched: usize,
    pub stop_reason: Option<StopReason>,
    /// 前回の実行で完了済みのため読み飛ばした
    pub resumed: bool,
    pub errors: Vec<String>,
}

impl CategoryOutcome {
    pub(crate) fn new(category: &CategoryDef, device: Device) -> Self {
        Self {
            category_key: category.key.clone(),
            category_name: category.name.clone(),
            device,
            pages_fetched: 0,
            records_found: 0,
            details_fetched: 0,
            stop_reason: None,
            resumed: false,
            errors: Vec::new(),
        }
    }

    pub(crate) fn skipped(category: &CategoryDef, device: Device) -> Self {
        Self {
            resumed: true,
            ..Self::new(category, device)
        }
    }

    pub(crate) fn failed(category: &CategoryDef, device: Device, error: String) -> Self {
        Self {
            stop_reason: Some(StopReason::Error),
            errors: vec![error],
            ..Self::new(category, device)
        }
    }

    /// 最後まで巡回できた（エラー・中断以外で止まった）
    pub fn is_complete(&self) -> bool {
        self.resumed
            || !matches!(
                self.stop_reason,
                None | Some(StopReason::Error) | Some(StopReason::Cancelled)
            )
    }
}

/// 完了済みカテゴリをチェックポイントに記録するためのキー
pub fn category_done_key(site_id: &str, category_key: &str) -> String {
    format!("category:{}:{}", site_id, category_key)
}

/// ワーカー間で共有する実行情報
#[derive(Clone)]
pub struct RunContext {
    pub rule: Arc<CompiledRule>,
    pub config: Arc<ScraperConfig>,
    /// 実行開始時点のチェックポイント
    pub resume: Arc<Checkpoint>,
    pub cancel: watch::Receiver<bool>,
    /// 複数デバイスで巡回する場合、処理済みキーにデバイスを付ける
    multi_device: bool,
    /// 今回の実行で詳細ページの取得を引き受けたレコード
    detail_claims: Arc<Mutex<HashSet<RecordKey>>>,
}

impl RunContext {
    pub fn new(
        rule: Arc<CompiledRule>,
        config: Arc<ScraperConfig>,
        resume: Arc<Checkpoint>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let multi_device = config.profiles.len() > 1;
        Self {
            rule,
            config,
            resume,
            cancel,
            multi_device,
            detail_claims: Arc::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// チェックポイントに記録するキー（単一デバイスなら URL そのもの）
    pub fn progress_key(&self, url: &str, device: Device) -> String {
        if self.multi_device {
            format!("{}#device={}", url, device)
        } else {
            url.to_string()
        }
    }

    /// 前回までに完了したカテゴリか
    pub fn is_category_done(&self, category_key: &str, device: Device) -> bool {
        self.is_processed(&self.done_key(category_key, device))
    }

    pub(crate) fn done_key(&self, category_key: &str, device: Device) -> String {
        self.progress_key(&category_done_key(self.rule.site_id(), category_key), device)
    }

    fn is_processed(&self, key: &str) -> bool {
        self.resume.processed_urls.contains(key)
    }

    /// 詳細ページを取りに行く権利を得る。他のカテゴリ・ワーカーが取得済みなら false。
    fn claim_detail(&self, key: RecordKey) -> bool {
        match self.detail_claims.lock() {
            Ok(mut claims) => claims.insert(key),
            Err(poisoned) => poisoned.into_inner().insert(key),
        }
    }
}

enum PageAction<'s> {
    Open(&'s str),
    Click {
        selector: &'s str,
        text: Option<&'s str>,
    },
    Scroll(Duration),
}

pub struct CategoryRunner<'a, D: PageDriver> {
    ctx: &'a RunContext,
    /// このパスのアクセス環境のデバイス（判定できないときの既定値）
    device: Device,
    driver: &'a mut D,
    limiter: &'a mut RateLimiter,
    events: &'a mpsc::Sender<RunEvent>,
}

impl<'a, D: PageDriver> CategoryRunner<'a, D> {
    pub fn new(
        ctx: &'a RunContext,
        device: Device,
        driver: &'a mut D,
        limiter: &'a mut RateLimiter,
        events: &'a mpsc::Sender<RunEvent>,
    ) -> Self {
        Self {
            ctx,
            device,
            driver,
            limiter,
            events,
        }
    }

    pub async fn run(&mut self, category: &CategoryDef) -> CategoryOutcome {
        let site_id = self.ctx.rule.site_id().to_string();
        if self.ctx.is_category_done(&category.key, self.device) {
            info!(site = %site_id, category = %category.key, device = %self.device, "完了済みのカテゴリをスキップ");
            return CategoryOutcome::skipped(category, self.device);
        }

        let mut outcome = CategoryOutcome::new(category, self.device);
        info!(
            site = %site_id,
            category = %category.key,
            name = %category.name,
            device = %self.device,
            "カテゴリ巡回開始"
        );
        let found = self.crawl_listing(category, &mut outcome).await;

        let detail_stage = self.ctx.config.enrich_details
            && self.ctx.rule.has_detail_rule()
            && !matches!(outcome.stop_reason, Some(StopReason::Cancelled));
        if detail_stage {
            self.enrich_details(category, found, &mut outcome).await;
        }

        info!(
            site = %site_id,
            category = %category.key,
            pages = outcome.pages_fetched,
            records = outcome.records_found,
            details = outcome.details_fetched,
            reason = ?outcome.stop_reason,
            errors = outcome.errors.len(),
            "カテゴリ巡回終了"
        );
        outcome
    }

    /// 一覧ページを辿り、このカテゴリで見つけたレコードを返す
    async fn crawl_listing(
        &mut self,
        category: &CategoryDef,
        outcome: &mut CategoryOutcome,
    ) -> Vec<CampaignRecord> {
        let rule = Arc::clone(&self.ctx.rule);
        let mode = rule.rule.pagination.clone();
        let max_pages = category
            .max_pages
            .map_or(self.ctx.config.max_pages, |m| m.min(self.ctx.config.max_pages));
        let mut paginator = Paginator::new(
            mode.clone(),
            PaginatorLimits {
                max_pages,
                empty_page_threshold: self.ctx.config.empty_page_threshold,
            },
        );

        let category_url = rule.category_url(category);
        let mut found = Vec::new();
        let mut emitted_ids: HashSet<String> = HashSet::new();

        while let Some(page) = paginator.next_fetch() {
            if self.ctx.is_cancelled() {
                warn!(category = %category.key, page, "中断要求を受けました");
                paginator.stop(StopReason::Cancelled);
                break;
            }

            let page_key = match mode {
                PaginationMode::QueryParam { .. } => rule.page_url(&category_url, page),
                _ => format!("{}#page={}", category_url, page),
            };
            let progress = self.ctx.progress_key(&page_key, self.device);
            if matches!(mode, PaginationMode::QueryParam { .. }) && self.ctx.is_processed(&progress)
            {
                debug!(url = %progress, "処理済みページをスキップ");
                paginator.skip_current();
                continue;
            }

            let html = match self.fetch_page(&rule, &mode, &category_url, page).await {
                Ok(Some(html)) => html,
                Ok(None) => {
                    debug!(category = %category.key, page, "次ページの操作要素がありません");
                    paginator.stop(StopReason::NoNextPage);
                    break;
                }
                Err(err) => {
                    error!(category = %category.key, page, error = %err, "ページ取得に失敗しました");
                    outcome.errors.push(format!("{}: {}", page_key, err));
                    paginator.stop(StopReason::Error);
                    break;
                }
            };

            paginator.start_extract();
            let mut extracted = extract_listing(&html, &page_key, &rule);

            if page == 1 && extracted.item_count == 0 && !extracted.empty_page_detected {
                let err = ScraperError::StructuralChange {
                    url: page_key.clone(),
                    detail: "案件要素が1件も見つかりません".to_string(),
                };
                error!(category = %category.key, error = %err, "ページ構造が変わった可能性があります");
                outcome.errors.push(err.to_string());
                paginator.stop(StopReason::Error);
                break;
            }

            if matches!(mode, PaginationMode::InfiniteScroll { .. }) {
                extracted
                    .records
                    .retain(|r| !emitted_ids.contains(&r.external_id));
            }
            emitted_ids.extend(extracted.records.iter().map(|r| r.external_id.clone()));

            let records: Vec<CampaignRecord> = extracted
                .records
                .iter()
                .cloned()
                .map(|raw| self.to_campaign(raw, category))
                .collect();
            debug!(category = %category.key, page, records = records.len(), "ページ抽出完了");
            outcome.records_found += records.len();
            found.extend(records.iter().cloned());

            if !self
                .emit(RunEvent::Page {
                    url: progress,
                    records,
                })
                .await
            {
                paginator.stop(StopReason::Cancelled);
                break;
            }

            paginator.observe(&extracted);
        }

        outcome.pages_fetched = paginator.fetch_state().pages_fetched;
        outcome.stop_reason = paginator.stop_reason();
        found
    }

    /// 1ページ目は開く、2ページ目以降はモードに応じて URL・クリック・スクロール
    async fn fetch_page(
        &mut self,
        rule: &CompiledRule,
        mode: &PaginationMode,
        category_url: &str,
        page: u32,
    ) -> Result<Option<String>, ScraperError> {
        if page <= 1 {
            self.limiter.before_request().await;
            return self.perform(category_url, PageAction::Open(category_url)).await;
        }

        self.limiter.before_page().await;
        match mode {
            PaginationMode::QueryParam { .. } => {
                let url = rule.page_url(category_url, page);
                self.perform(&url, PageAction::Open(&url)).await
            }
            PaginationMode::ClickNext => {
                let listing = &rule.rule.listing;
                let number = page.to_string();
                if let Some(selector) = listing.page_link_selector.as_deref() {
                    let action = PageAction::Click {
                        selector,
                        text: Some(number.as_str()),
                    };
                    if let Some(html) = self.perform(category_url, action).await? {
                        return Ok(Some(html));
                    }
                }
                match listing.next_selector.as_deref() {
                    Some(selector) => {
                        let action = PageAction::Click {
                            selector,
                            text: None,
                        };
                        self.perform(category_url, action).await
                    }
                    None => Ok(None),
                }
            }
            PaginationMode::InfiniteScroll { scroll_wait_ms } => {
                let wait = Duration::from_millis(*scroll_wait_ms);
                self.perform(category_url, PageAction::Scroll(wait)).await
            }
        }
    }

    /// 失敗種別ごとの再試行ポリシーで1操作を実行する
    async fn perform(
        &mut self,
        url: &str,
        action: PageAction<'_>,
    ) -> Result<Option<String>, ScraperError> {
        let config = Arc::clone(&self.ctx.config);
        let mut tracker = config.retry.tracker();
        let mut cancel = self.ctx.cancel.clone();
        loop {
            let result = match &action {
                PageAction::Open(target) => self.driver.open(target).await.map(Some),
                PageAction::Click { selector, text } => {
                    self.driver.click_and_read(selector, *text).await
                }
                PageAction::Scroll(wait) => match self.driver.scroll_to_bottom(*wait).await {
                    Ok(()) => self.driver.html().await.map(Some),
                    Err(e) => Err(e),
                },
            };
            match result {
                Ok(html) => {
                    self.limiter.on_success();
                    return Ok(html);
                }
                Err(err) => {
                    if matches!(err, ScraperError::Blocked { .. }) {
                        self.limiter.on_blocked(url);
                    }
                    tracker.wait_or_cancel(err, &mut cancel).await?;
                }
            }
        }
    }

    /// 詳細ページを開いて名前と還元額を補完する
    async fn enrich_details(
        &mut self,
        category: &CategoryDef,
        found: Vec<CampaignRecord>,
        outcome: &mut CategoryOutcome,
    ) {
        let site_id = self.ctx.rule.site_id().to_string();
        let resumed = self
            .ctx
            .resume
            .results
            .iter()
            .filter(|r| r.site_id == site_id && r.category == category.name)
            .cloned();

        let mut seen_urls = HashSet::new();
        let candidates: Vec<CampaignRecord> = found
            .into_iter()
            .chain(resumed)
            .filter(|r| seen_urls.insert(r.url.clone()))
            .filter(|r| !self.ctx.is_processed(&self.ctx.progress_key(&r.url, self.device)))
            .collect();
        if candidates.is_empty() {
            return;
        }
        info!(category = %category.key, count = candidates.len(), "詳細ページの取得を開始");

        for record in candidates {
            if self.ctx.is_cancelled() {
                warn!(category = %category.key, "詳細取得を中断します");
                outcome.stop_reason = Some(StopReason::Cancelled);
                return;
            }
            // 別カテゴリで先に見つかった案件は、そちらで取得する
            if !self.ctx.claim_detail(record.key()) {
                debug!(url = %record.url, "詳細ページは取得済みまたは取得中");
                continue;
            }

            self.limiter.before_request().await;
            let html = match self.perform(&record.url, PageAction::Open(&record.url)).await {
                Ok(Some(html)) => html,
                Ok(None) => continue,
                Err(ScraperError::Cancelled) => {
                    outcome.stop_reason = Some(StopReason::Cancelled);
                    return;
                }
                Err(err) => {
                    warn!(url = %record.url, error = %err, "詳細ページを取得できませんでした");
                    outcome.errors.push(format!("{}: {}", record.url, err));
                    continue;
                }
            };

            let info = extract_detail(&html, &self.ctx.rule);
            let mut enriched = record;
            if let Some(title) = info.title.map(|t| clean_title(&t)).filter(|t| !t.is_empty()) {
                enriched.title = title;
            }
            if let Some(text) = info.cashback_text {
                enriched.cashback = parse_cashback(&text, self.ctx.rule.rule.points_per_yen);
                enriched.raw_cashback_text = text;
            }
            enriched.scraped_at = Utc::now();
            outcome.details_fetched += 1;

            let url = self.ctx.progress_key(&enriched.url, self.device);
            if !self
                .emit(RunEvent::Detail {
                    url,
                    record: enriched,
                })
                .await
            {
                outcome.stop_reason = Some(StopReason::Cancelled);
                return;
            }
        }
    }

    fn to_campaign(&self, raw: RawRecord, category: &CategoryDef) -> CampaignRecord {
        let device = detect_device(
            &format!("{} {}", raw.title, raw.context_text),
            self.device,
        );
        CampaignRecord {
            site_id: self.ctx.rule.site_id().to_string(),
            external_id: raw.external_id,
            title: clean_title(&raw.title),
            cashback: parse_cashback(&raw.raw_cashback_text, self.ctx.rule.rule.points_per_yen),
            raw_cashback_text: raw.raw_cashback_text,
            device,
            category: category.name.clone(),
            url: raw.url,
            scraped_at: Utc::now(),
        }
    }

    /// 集約側が終了していたら false
    async fn emit(&mut self, event: RunEvent) -> bool {
        if self.events.send(event).await.is_err() {
            warn!("集約タスクが終了しているため送信できません");
            return false;
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rule::SiteRule;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};

    type FailureFn = fn(&str) -> ScraperError;

    /// URL ごとに固定HTMLを返すドライバ。
    /// クリック・スクロール後のHTMLは `links`（ページ番号のテキスト）と `script`（順番に消費）で与える。
    #[derive(Clone, Default)]
    pub(crate) struct FakeDriver {
        pub pages: Arc<HashMap<String, String>>,
        pub links: Arc<HashMap<String, String>>,
        pub script: Arc<Mutex<VecDeque<String>>>,
        pub opened: Arc<Mutex<Vec<String>>>,
        pub clicks: Arc<Mutex<Vec<String>>>,
        /// 指定URLを開いたときに返すエラー（回数つき）
        pub failures: Arc<Mutex<HashMap<String, (u32, FailureFn)>>>,
        current: String,
    }

    impl FakeDriver {
        pub(crate) fn new(pages: HashMap<String, String>) -> Self {
            Self {
                pages: Arc::new(pages),
                ..Default::default()
            }
        }

        pub(crate) fn with_links(mut self, links: HashMap<String, String>) -> Self {
            self.links = Arc::new(links);
            self
        }

        pub(crate) fn with_script(self, script: Vec<String>) -> Self {
            self.script.lock().unwrap().extend(script);
            self
        }

        pub(crate) fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }

        pub(crate) fn clicks(&self) -> Vec<String> {
            self.clicks.lock().unwrap().clone()
        }

        fn next_scripted(&self) -> Option<String> {
            self.script.lock().unwrap().pop_front()
        }
    }

    #[async_trait]
    impl PageDriver for FakeDriver {
        async fn open(&mut self, url: &str) -> Result<String, ScraperError> {
            self.opened.lock().unwrap().push(url.to_string());
            if let Some((remaining, make)) = self.failures.lock().unwrap().get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err((*make)(url));
                }
            }
            self.current = self
                .pages
                .get(url)
                .cloned()
                .unwrap_or_else(|| "<html><body>該当する商品がありません</body></html>".into());
            Ok(self.current.clone())
        }

        async fn click(&mut self, selector: &str, text: Option<&str>) -> Result<bool, ScraperError> {
            self.clicks
                .lock()
                .unwrap()
                .push(text.unwrap_or(selector).to_string());
            let next = match text {
                Some(text) => self.links.get(text).cloned(),
                None => self.next_scripted(),
            };
            match next {
                Some(html) => {
                    self.current = html;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn scroll_to_bottom(&mut self, _wait: Duration) -> Result<(), ScraperError> {
            if let Some(html) = self.next_scripted() {
                self.current = html;
            }
            Ok(())
        }

        async fn html(&mut self) -> Result<String, ScraperError> {
            Ok(self.current.clone())
        }
    }

    pub(crate) const MOPPY_JSON: &str = r#"{
        "site_id": "moppy",
        "name": "モッピー",
        "base_url": "https://pc.moppy.jp/",
        "points_per_yen": 1,
        "categories": [
            { "key": "shopping", "name": "ショッピング", "url": "/category/list.php?parent_category=4" }
        ],
        "pagination": { "mode": "query_param" },
        "listing": {
            "item_selectors": ["div.m-list__item"],
            "link_selectors": ["a[href*='/ad/detail.php']"],
            "title_selectors": [".m-list__title"],
            "cashback_selectors": [".m-list__point"],
            "id_patterns": ["site_id=(\\d+)"]
        },
        "detail": { "title_selectors": ["h1"], "cashback_selectors": [".a-point__point"] }
    }"#;

    const POINTINCOME_CLICK_JSON: &str = r#"{
        "site_id": "pointincome",
        "name": "ポイントインカム",
        "base_url": "https://pointi.jp/",
        "categories": [
            { "key": "shopping_66", "name": "総合通販", "url": "/list.php?category=66" }
        ],
        "pagination": { "mode": "click_next" },
        "listing": {
            "item_selectors": [".box_ad"],
            "link_selectors": ["a[href*='/ad/']"],
            "title_selectors": [".title_list"],
            "id_patterns": ["/ad/(\\d+)/"],
            "page_link_selector": ".pager a",
            "next_selector": ".page_next a"
        }
    }"#;

    const POINTINCOME_SCROLL_JSON: &str = r#"{
        "site_id": "pointincome",
        "name": "ポイントインカム",
        "base_url": "https://sp.pointi.jp/",
        "categories": [
            { "key": "app_ios", "name": "アプリ", "url": "/pts_app.php?cat_no=285&sort=&sub=4" }
        ],
        "pagination": { "mode": "infinite_scroll", "scroll_wait_ms": 0 },
        "listing": {
            "item_selectors": [".box_ad"],
            "link_selectors": ["a[href*='/ad/']"],
            "title_selectors": [".title_list"],
            "id_patterns": ["/ad/(\\d+)/"]
        }
    }"#;

    pub(crate) const CATEGORY_URL: &str =
        "https://pc.moppy.jp/category/list.php?parent_category=4";

    pub(crate) fn listing_html(ids: std::ops::Range<u32>) -> String {
        listing_with(ids, "")
    }

    fn listing_with(ids: std::ops::Range<u32>, extra: &str) -> String {
        let items: String = ids
            .map(|id| {
                format!(
                    r#"<div class="m-list__item">
                         <a href="/ad/detail.php?site_id={id}"><span class="m-list__title">案件{id}</span></a>
                         <span class="m-list__point">{id}P</span>
                       </div>"#
                )
            })
            .collect();
        format!("<html><body>{}{}</body></html>", extra, items)
    }

    /// ポイントインカム形式の一覧（ページ番号リンクと「次へ」の有無を指定）
    fn box_listing(ids: std::ops::Range<u32>, pager: &[u32], next: bool) -> String {
        let items: String = ids
            .map(|id| {
                format!(
                    r#"<div class="box_ad"><a href="/ad/{id}/"><span class="title_list">ショップ{id}</span></a></div>"#
                )
            })
            .collect();
        let links: String = pager
            .iter()
            .map(|n| format!(r#"<a href="javascript:void(0)">{}</a>"#, n))
            .collect();
        let next = if next {
            r#"<span class="page_next"><a href="javascript:void(0)">次へ</a></span>"#
        } else {
            ""
        };
        format!(
            r#"<html><body>{}<div class="pager">{}</div>{}</body></html>"#,
            items, links, next
        )
    }

    pub(crate) fn page_url(page: u32) -> String {
        if page == 1 {
            CATEGORY_URL.to_string()
        } else {
            format!("{}&page={}", CATEGORY_URL, page)
        }
    }

    fn context_for(
        site: SiteRule,
        checkpoint: Checkpoint,
        enrich: bool,
    ) -> (RunContext, watch::Sender<bool>) {
        let config = ScraperConfig::default()
            .without_delays()
            .with_enrich_details(enrich);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = RunContext::new(
            Arc::new(site.compile().unwrap()),
            Arc::new(config),
            Arc::new(checkpoint),
            cancel_rx,
        );
        (ctx, cancel_tx)
    }

    fn context(checkpoint: Checkpoint, enrich: bool) -> (RunContext, watch::Sender<bool>) {
        context_for(SiteRule::from_json_str(MOPPY_JSON).unwrap(), checkpoint, enrich)
    }

    async fn run_category(
        ctx: &RunContext,
        driver: &mut FakeDriver,
    ) -> (CategoryOutcome, Vec<RunEvent>) {
        let mut limiter = RateLimiter::new(&ctx.config);
        let (tx, mut rx) = mpsc::channel(64);
        let category = ctx.rule.rule.categories[0].clone();
        let outcome = CategoryRunner::new(ctx, Device::Pc, driver, &mut limiter, &tx)
            .run(&category)
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn test_query_param_pages_until_duplicate() {
        let mut pages = HashMap::new();
        pages.insert(page_url(1), listing_html(1..31));
        pages.insert(page_url(2), listing_html(31..61));
        pages.insert(page_url(3), listing_html(31..61));
        let mut driver = FakeDriver::new(pages);
        let (ctx, _cancel) = context(Checkpoint::new("moppy"), false);

        let (outcome, events) = run_category(&ctx, &mut driver).await;

        assert_eq!(outcome.stop_reason, Some(StopReason::DuplicateContent));
        assert_eq!(outcome.pages_fetched, 3);
        assert_eq!(outcome.records_found, 90);
        assert_eq!(driver.opened(), vec![page_url(1), page_url(2), page_url(3)]);
        assert_eq!(events.len(), 3);
        match &events[0] {
            RunEvent::Page { url, records } => {
                assert_eq!(url, CATEGORY_URL);
                assert_eq!(records[0].external_id, "1");
                assert_eq!(records[0].title, "案件1");
                assert_eq!(records[0].category, "ショッピング");
                assert_eq!(records[0].device, Device::Pc);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_total_count_label_does_not_stop_early() {
        let mut site = SiteRule::from_json_str(MOPPY_JSON).unwrap();
        site.listing.total_count_selector = Some(".count".to_string());
        let count = "<p class='count'>1〜30件 / 全60件</p>";
        let mut pages = HashMap::new();
        pages.insert(page_url(1), listing_with(1..31, count));
        pages.insert(page_url(2), listing_with(31..61, count));
        let mut driver = FakeDriver::new(pages);
        let (ctx, _cancel) = context_for(site, Checkpoint::new("moppy"), false);

        let (outcome, _) = run_category(&ctx, &mut driver).await;

        assert_eq!(outcome.records_found, 60);
        assert_eq!(outcome.pages_fetched, 2);
        // 60件そろった時点で終了し、3ページ目は開かない
        assert_eq!(outcome.stop_reason, Some(StopReason::NoNextPage));
        assert_eq!(driver.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_click_pagination_falls_back_to_next_control() {
        let category_url = "https://pointi.jp/list.php?category=66";
        let mut pages = HashMap::new();
        pages.insert(category_url.to_string(), box_listing(1..11, &[2], true));
        let links = HashMap::from([("2".to_string(), box_listing(11..21, &[], true))]);
        let mut driver = FakeDriver::new(pages)
            .with_links(links)
            .with_script(vec![box_listing(21..26, &[], false)]);
        let (ctx, _cancel) = context_for(
            SiteRule::from_json_str(POINTINCOME_CLICK_JSON).unwrap(),
            Checkpoint::new("pointincome"),
            false,
        );

        let (outcome, events) = run_category(&ctx, &mut driver).await;

        assert_eq!(outcome.pages_fetched, 3);
        assert_eq!(outcome.records_found, 25);
        assert_eq!(outcome.stop_reason, Some(StopReason::NoNextPage));
        // 3ページ目はページ番号リンクがないので「次へ」をクリック
        assert_eq!(driver.clicks(), vec!["2", "3", ".page_next a"]);
        assert_eq!(driver.opened(), vec![category_url.to_string()]);
        match &events[1] {
            RunEvent::Page { url, .. } => assert_eq!(url, &format!("{}#page=2", category_url)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_click_pagination_stops_when_nothing_to_click() {
        let category_url = "https://pointi.jp/list.php?category=66";
        let mut pages = HashMap::new();
        pages.insert(category_url.to_string(), box_listing(1..6, &[], true));
        let mut driver = FakeDriver::new(pages);
        let (ctx, _cancel) = context_for(
            SiteRule::from_json_str(POINTINCOME_CLICK_JSON).unwrap(),
            Checkpoint::new("pointincome"),
            false,
        );

        let (outcome, _) = run_category(&ctx, &mut driver).await;

        assert_eq!(outcome.pages_fetched, 1);
        assert_eq!(outcome.records_found, 5);
        assert_eq!(outcome.stop_reason, Some(StopReason::NoNextPage));
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_infinite_scroll_stops_without_growth() {
        let category_url = "https://sp.pointi.jp/pts_app.php?cat_no=285&sort=&sub=4";
        let mut pages = HashMap::new();
        pages.insert(category_url.to_string(), box_listing(1..11, &[], false));
        let mut driver = FakeDriver::new(pages).with_script(vec![
            box_listing(1..21, &[], false),
            box_listing(1..26, &[], false),
        ]);
        let (ctx, _cancel) = context_for(
            SiteRule::from_json_str(POINTINCOME_SCROLL_JSON).unwrap(),
            Checkpoint::new("pointincome"),
            false,
        );

        let (outcome, events) = run_category(&ctx, &mut driver).await;

        // 10件 → +10件 → +5件 → 増加なし ×2 で打ち切り
        assert_eq!(outcome.stop_reason, Some(StopReason::ConsecutiveEmpty));
        assert_eq!(outcome.pages_fetched, 5);
        assert_eq!(outcome.records_found, 25);
        let per_page: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Page { records, .. } => Some(records.len()),
                _ => None,
            })
            .collect();
        assert_eq!(per_page, vec![10, 10, 5, 0, 0]);
        assert_eq!(driver.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_items_on_first_page_is_structural_change() {
        let mut pages = HashMap::new();
        pages.insert(page_url(1), "<html><body><div class='renewal'></div></body></html>".into());
        let mut driver = FakeDriver::new(pages);
        let (ctx, _cancel) = context(Checkpoint::new("moppy"), false);

        let (outcome, events) = run_category(&ctx, &mut driver).await;

        assert_eq!(outcome.stop_reason, Some(StopReason::Error));
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("構造"));
        assert!(events.is_empty());
        assert_eq!(driver.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_once() {
        let mut pages = HashMap::new();
        pages.insert(page_url(1), listing_html(1..3));
        let mut driver = FakeDriver::new(pages);
        driver.failures.lock().unwrap().insert(
            page_url(1),
            (1, |url: &str| ScraperError::Timeout(url.to_string())),
        );
        let (ctx, _cancel) = context(Checkpoint::new("moppy"), false);

        let (outcome, _) = run_category(&ctx, &mut driver).await;

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.records_found, 2);
        assert_eq!(driver.opened()[..2], [page_url(1), page_url(1)]);
    }

    #[tokio::test]
    async fn test_not_found_stops_category_with_error() {
        let mut driver = FakeDriver::default();
        driver.failures.lock().unwrap().insert(
            page_url(1),
            (1, |url: &str| ScraperError::NotFound(url.to_string())),
        );
        let (ctx, _cancel) = context(Checkpoint::new("moppy"), false);

        let (outcome, _) = run_category(&ctx, &mut driver).await;

        assert_eq!(outcome.stop_reason, Some(StopReason::Error));
        assert!(!outcome.is_complete());
        assert_eq!(driver.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_category_is_skipped() {
        let mut checkpoint = Checkpoint::new("moppy");
        checkpoint
            .processed_urls
            .insert(category_done_key("moppy", "shopping"));
        let mut driver = FakeDriver::default();
        let (ctx, _cancel) = context(checkpoint, false);

        let (outcome, events) = run_category(&ctx, &mut driver).await;

        assert!(outcome.resumed);
        assert!(outcome.is_complete());
        assert!(events.is_empty());
        assert!(driver.opened().is_empty());
    }

    #[test]
    fn test_progress_keys_carry_device_for_multi_device_runs() {
        let (single, _cancel) = context(Checkpoint::new("moppy"), false);
        assert_eq!(single.progress_key(CATEGORY_URL, Device::Ios), CATEGORY_URL);

        let config = ScraperConfig::default().with_profiles(vec![
            crate::config::DeviceProfile::ios(),
            crate::config::DeviceProfile::android(),
        ]);
        let (_tx, cancel) = watch::channel(false);
        let multi = RunContext::new(
            Arc::clone(&single.rule),
            Arc::new(config),
            Arc::new(Checkpoint::new("moppy")),
            cancel,
        );
        assert_eq!(
            multi.progress_key(CATEGORY_URL, Device::Ios),
            format!("{}#device=iOS", CATEGORY_URL)
        );
        assert_eq!(
            multi.done_key("shopping", Device::Android),
            "category:moppy:shopping#device=Android"
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let mut driver = FakeDriver::default();
        let (ctx, cancel) = context(Checkpoint::new("moppy"), false);
        cancel.send(true).unwrap();

        let (outcome, _) = run_category(&ctx, &mut driver).await;

        assert_eq!(outcome.stop_reason, Some(StopReason::Cancelled));
        assert!(driver.opened().is_empty());
    }

    #[test]
    fn test_category_run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (ctx, _cancel) = context(Checkpoint::new("moppy"), true);
        let mut driver = FakeDriver::default();
        let mut limiter = RateLimiter::new(&ctx.config);
        let (tx, _rx) = mpsc::channel(1);
        let category = ctx.rule.rule.categories[0].clone();
        let mut runner = CategoryRunner::new(&ctx, Device::Pc, &mut driver, &mut limiter, &tx);
        // ワーカーは tokio::spawn で動かすため Send が必要
        let run = runner.run(&category);
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_detail_pages_enrich_records() {
        let mut pages = HashMap::new();
        pages.insert(page_url(1), listing_html(1..3));
        pages.insert(
            "https://pc.moppy.jp/ad/detail.php?site_id=1".to_string(),
            "<html><body><h1>Yahoo!ショッピング（最大5%）</h1><p class='a-point__point'>5%</p></body></html>"
                .to_string(),
        );
        let mut driver = FakeDriver::new(pages);
        let (ctx, _cancel) = context(Checkpoint::new("moppy"), true);

        let (outcome, events) = run_category(&ctx, &mut driver).await;

        assert_eq!(outcome.details_fetched, 2);
        let detail = events
            .iter()
            .find_map(|e| match e {
                RunEvent::Detail { record, .. } if record.external_id == "1" => Some(record),
                _ => None,
            })
            .unwrap();
        assert_eq!(detail.title, "Yahoo!ショッピング");
        assert_eq!(detail.raw_cashback_text, "5%");
        assert_eq!(detail.cashback.as_ref().unwrap().value, 5.0);
    }
}
