//! 固定数ワーカーによるカテゴリ並列巡回
//!
//! (カテゴリ, デバイス) の組をジョブキュー（mpsc）で配り、各ワーカーは自分専用の
//! ブラウザで巡回する。結果は `RunEvent` として1つの集約タスクに送られ、
//! `Accumulator` と `CheckpointStore` は集約タスクだけが触る。

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accumulator::Accumulator;
use crate::checkpoint::CheckpointStore;
use crate::config::DeviceProfile;
use crate::model::Device;
use crate::pagination::StopReason;
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::rule::CategoryDef;
use crate::runner::{CategoryOutcome, CategoryRunner, RunContext, RunEvent};
use crate::traits::{DriverFactory, PageDriver};

const EVENT_BUFFER: usize = 64;

type Job = (CategoryDef, DeviceProfile);

/// 巡回全体の結果
#[derive(Debug, Default)]
pub struct PoolOutput {
    pub accumulator: Accumulator,
    pub outcomes: Vec<CategoryOutcome>,
    pub stats: RateLimitStats,
    pub errors: Vec<String>,
    /// 今回処理したURL数（一覧ページ + 詳細ページ）
    pub processed: usize,
    pub cancelled: bool,
    /// 予定していた (カテゴリ × デバイス) の数
    pub expected: usize,
}

impl PoolOutput {
    /// 予定したすべてのカテゴリ・デバイスを最後まで巡回できた
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self.outcomes.len() == self.expected
            && self.outcomes.iter().all(CategoryOutcome::is_complete)
    }
}

pub struct WorkerPool<F: DriverFactory> {
    factory: Arc<F>,
    workers: usize,
}

impl<F: DriverFactory> WorkerPool<F> {
    pub fn new(factory: Arc<F>, workers: usize) -> Self {
        Self {
            factory,
            workers: workers.max(1),
        }
    }

    /// 全カテゴリを設定中の全デバイスで巡回し、集約結果を返す
    pub async fn run(
        &self,
        ctx: RunContext,
        categories: Vec<CategoryDef>,
        checkpoint: Option<&CheckpointStore>,
    ) -> PoolOutput {
        let mut output = PoolOutput::default();
        output.accumulator.seed(
            ctx.resume
                .results
                .iter()
                .filter(|r| r.site_id == ctx.rule.site_id())
                .cloned(),
        );

        // デバイスごとにカテゴリを一巡する（同じワーカーでブラウザを使い回しやすい）
        let jobs: Vec<Job> = ctx
            .config
            .profiles
            .iter()
            .flat_map(|profile| {
                categories
                    .iter()
                    .map(move |category| (category.clone(), profile.clone()))
            })
            .collect();
        output.expected = jobs.len();
        if jobs.is_empty() {
            return output;
        }

        let workers = self.workers.min(jobs.len());
        info!(
            site = %ctx.rule.site_id(),
            categories = categories.len(),
            devices = ?ctx.config.devices(),
            workers,
            "巡回を開始します"
        );

        let (job_tx, job_rx) = mpsc::channel(jobs.len());
        for job in jobs {
            // 受信側はまだ生きているので失敗しない
            let _ = job_tx.send(job).await;
        }
        drop(job_tx);
        let jobs = Arc::new(Mutex::new(job_rx));

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&self.factory),
                    ctx.clone(),
                    Arc::clone(&jobs),
                    event_tx.clone(),
                ))
            })
            .collect();
        drop(event_tx);

        while let Some(event) = event_rx.recv().await {
            match event {
                RunEvent::Page { url, records } => {
                    for record in records {
                        output.accumulator.upsert(record);
                    }
                    output.processed += 1;
                    mark_processed(checkpoint, &url, &mut output).await;
                }
                RunEvent::Detail { url, record } => {
                    output.accumulator.replace(record);
                    output.processed += 1;
                    mark_processed(checkpoint, &url, &mut output).await;
                }
                RunEvent::CategoryDone(outcome) => {
                    if outcome.is_complete() && !outcome.resumed {
                        let key = ctx.done_key(&outcome.category_key, outcome.device);
                        mark_processed(checkpoint, &key, &mut output).await;
                    }
                    output.errors.extend(outcome.errors.iter().cloned());
                    output.outcomes.push(outcome);
                }
                RunEvent::WorkerDone { stats } => output.stats.merge(&stats),
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("ワーカーが異常終了しました: {}", e);
                output.errors.push(format!("ワーカー異常終了: {}", e));
            }
        }

        output.cancelled = ctx.is_cancelled()
            || output
                .outcomes
                .iter()
                .any(|o| o.stop_reason == Some(StopReason::Cancelled));
        info!(
            unique = output.accumulator.unique_count(),
            duplicates = output.accumulator.duplicate_count(),
            processed = output.processed,
            outcomes = output.outcomes.len(),
            expected = output.expected,
            errors = output.errors.len(),
            cancelled = output.cancelled,
            "巡回終了"
        );
        output
    }
}

/// チェックポイントへの書き込み失敗は記録だけして続行する
async fn mark_processed(checkpoint: Option<&CheckpointStore>, url: &str, output: &mut PoolOutput) {
    let Some(store) = checkpoint else {
        return;
    };
    if let Err(e) = store.record(url, output.accumulator.records()).await {
        warn!(path = %store.path().display(), error = %e, "チェックポイント保存に失敗しました");
        output.errors.push(format!("チェックポイント保存失敗: {}", e));
    }
}

async fn worker_loop<F: DriverFactory>(
    id: usize,
    factory: Arc<F>,
    ctx: RunContext,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    events: mpsc::Sender<RunEvent>,
) {
    let mut limiter = RateLimiter::new(&ctx.config);
    let restart_every = ctx.config.browser_restart_every;
    // ブラウザは最初のジョブで起動し、デバイスが変わるか一定数巡回したら作り直す
    let mut session: Option<(Device, F::Driver)> = None;
    let mut since_launch = 0u32;
    let mut crawled = 0u32;

    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some((category, profile)) = job else {
            break;
        };
        if ctx.is_cancelled() {
            break;
        }
        let device = profile.device;

        if ctx.is_category_done(&category.key, device) {
            info!(worker = id, category = %category.key, device = %device, "完了済みのカテゴリをスキップ");
            let outcome = CategoryOutcome::skipped(&category, device);
            if events.send(RunEvent::CategoryDone(outcome)).await.is_err() {
                break;
            }
            continue;
        }

        if crawled > 0 {
            limiter.before_category().await;
        }

        let relaunch = match &session {
            Some((current, _)) => {
                *current != device || (restart_every > 0 && since_launch >= restart_every)
            }
            None => true,
        };
        if relaunch {
            if let Some((_, mut old)) = session.take() {
                info!(worker = id, crawled, device = %device, "ブラウザを再起動します");
                if let Err(e) = old.close().await {
                    warn!(worker = id, error = %e, "ブラウザ終了エラー");
                }
            }
            match factory.create(&profile).await {
                Ok(driver) => {
                    session = Some((device, driver));
                    since_launch = 0;
                }
                Err(e) => {
                    error!(worker = id, device = %device, error = %e, "ブラウザを起動できませんでした");
                    let outcome = CategoryOutcome::failed(
                        &category,
                        device,
                        format!("{} ({}): {}", category.key, device, e),
                    );
                    if events.send(RunEvent::CategoryDone(outcome)).await.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }
        let Some((_, driver)) = session.as_mut() else {
            continue;
        };

        let outcome = CategoryRunner::new(&ctx, device, driver, &mut limiter, &events)
            .run(&category)
            .await;
        crawled += 1;
        since_launch += 1;
        if events.send(RunEvent::CategoryDone(outcome)).await.is_err() {
            break;
        }
    }

    if let Some((_, mut driver)) = session.take() {
        if let Err(e) = driver.close().await {
            warn!(worker = id, error = %e, "ブラウザ終了エラー");
        }
    }
    let _ = events
        .send(RunEvent::WorkerDone {
            stats: limiter.stats(),
        })
        .await;
}
