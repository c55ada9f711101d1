use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

use super::{BatchFailure, FlushReport, Snapshot};
use crate::error::ScraperError;
use crate::model::{CampaignRecord, Device};
use crate::rule::SiteRule;
use crate::traits::CampaignSink;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn connect_pool(database_url: &str) -> Result<PgPool, ScraperError> {
    Ok(PgPoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?)
}

/// UNNEST に渡す列ごとの配列
#[derive(Debug, Default, PartialEq)]
struct CampaignColumns {
    names: Vec<String>,
    rates: Vec<String>,
    devices: Vec<String>,
    urls: Vec<Option<String>>,
    descriptions: Vec<Option<String>>,
}

impl CampaignColumns {
    fn from_records(records: &[CampaignRecord]) -> Self {
        let mut cols = Self {
            names: Vec::with_capacity(records.len()),
            rates: Vec::with_capacity(records.len()),
            devices: Vec::with_capacity(records.len()),
            urls: Vec::with_capacity(records.len()),
            descriptions: Vec::with_capacity(records.len()),
        };
        for r in records {
            cols.names.push(r.title.clone());
            cols.rates.push(cashback_rate(r));
            cols.devices.push(r.device.as_str().to_string());
            cols.urls.push((!r.url.is_empty()).then(|| r.url.clone()));
            cols.descriptions
                .push((!r.category.is_empty()).then(|| r.category.clone()));
        }
        cols
    }
}

/// cashback_rate 列の値（解析できなければ生テキスト、それも空なら「なし」）
fn cashback_rate(record: &CampaignRecord) -> String {
    match &record.cashback {
        Some(cb) => cb.display_rate(),
        None if !record.raw_cashback_text.trim().is_empty() => {
            record.raw_cashback_text.trim().to_string()
        }
        None => "なし".to_string(),
    }
}

/// `campaigns` テーブルへの置き換え投入
pub struct PostgresSink {
    pool: PgPool,
    batch_size: usize,
}

impl PostgresSink {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn connect(database_url: &str, batch_size: usize) -> Result<Self, ScraperError> {
        let pool = connect_pool(database_url).await?;
        Ok(Self::new(pool, batch_size))
    }

    pub async fn migrate(&self) -> Result<(), ScraperError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| ScraperError::Persistence(format!("マイグレーション失敗: {}", e)))
    }

    /// point_sites の行を取得（なければ作成）
    async fn ensure_point_site(&self, site: &SiteRule) -> Result<i64, ScraperError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO point_sites (name, url) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET updated_at = NOW() \
             RETURNING id",
        )
        .bind(&site.name)
        .bind(&site.base_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// 今回巡回したデバイスの行だけ削除する（デバイス指定なしならサイト全体）
    async fn delete_site_rows(
        &self,
        point_site_id: i64,
        devices: &[Device],
    ) -> Result<u64, ScraperError> {
        let query = if devices.is_empty() {
            sqlx::query("DELETE FROM campaigns WHERE point_site_id = $1").bind(point_site_id)
        } else {
            let names: Vec<String> = devices.iter().map(|d| d.as_str().to_string()).collect();
            sqlx::query("DELETE FROM campaigns WHERE point_site_id = $1 AND device = ANY($2::text[])")
                .bind(point_site_id)
                .bind(names)
        };
        let deleted = query.execute(&self.pool).await?.rows_affected();
        Ok(deleted)
    }

    async fn insert_batch(
        &self,
        point_site_id: i64,
        records: &[CampaignRecord],
    ) -> Result<u64, sqlx::Error> {
        let cols = CampaignColumns::from_records(records);
        let inserted = sqlx::query(
            "INSERT INTO campaigns \
                 (point_site_id, name, cashback_rate, device, campaign_url, description, is_active) \
             SELECT $1, t.name, t.rate, t.device, t.url, t.description, TRUE \
             FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::text[]) \
                  AS t(name, rate, device, url, description) \
             ON CONFLICT (name, point_site_id, device) DO NOTHING",
        )
        .bind(point_site_id)
        .bind(&cols.names)
        .bind(&cols.rates)
        .bind(&cols.devices)
        .bind(&cols.urls)
        .bind(&cols.descriptions)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted)
    }
}

/// `batch_size` 件ずつ投入する。失敗したバッチは記録して残りを続ける。
async fn insert_chunks<'r, F, Fut, E>(
    records: &'r [CampaignRecord],
    batch_size: usize,
    mut insert: F,
) -> (usize, Vec<BatchFailure>)
where
    F: FnMut(&'r [CampaignRecord]) -> Fut,
    Fut: Future<Output = Result<u64, E>>,
    E: fmt::Display,
{
    let total_batches = records.len().div_ceil(batch_size.max(1));
    let mut written = 0usize;
    let mut failures = Vec::new();

    for (index, batch) in records.chunks(batch_size.max(1)).enumerate() {
        match insert(batch).await {
            Ok(inserted) => {
                written += inserted as usize;
                info!(
                    batch = index + 1,
                    total_batches,
                    inserted,
                    skipped = (batch.len() as u64).saturating_sub(inserted),
                    "バッチ投入完了"
                );
            }
            Err(e) => {
                error!(batch = index + 1, total_batches, error = %e, "バッチ投入に失敗しました");
                failures.push(BatchFailure {
                    index,
                    error: e.to_string(),
                });
            }
        }
    }
    (written, failures)
}

#[async_trait]
impl CampaignSink for PostgresSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn flush(&self, snapshot: &Snapshot<'_>) -> Result<FlushReport, ScraperError> {
        let point_site_id = self.ensure_point_site(snapshot.site).await?;
        let replaced = self
            .delete_site_rows(point_site_id, snapshot.devices)
            .await?;
        info!(
            site = %snapshot.site.site_id,
            point_site_id,
            devices = ?snapshot.devices,
            replaced,
            "前回分の案件を削除しました"
        );

        let (written, failures) =
            insert_chunks(snapshot.records, self.batch_size, |batch| {
                self.insert_batch(point_site_id, batch)
            })
            .await;

        Ok(FlushReport {
            sink: self.name().to_string(),
            written,
            replaced,
            failures,
            location: Some(format!("campaigns (point_site_id={})", point_site_id)),
        })
    }
}
