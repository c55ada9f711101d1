//! 収集結果の書き出し
//!
//! JSON アーティファクトと PostgreSQL の `campaigns` テーブルの2種類。
//! どちらもサイト単位で前回分を置き換える。

mod json;
mod postgres;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CampaignRecord, Device};
use crate::rule::SiteRule;

pub use json::{ArtifactSummary, JsonArtifact, JsonArtifactSink};
pub use postgres::{connect_pool, PostgresSink};

/// 書き出すサイト1つ分の内容
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub site: &'a SiteRule,
    pub records: &'a [CampaignRecord],
    /// 今回巡回したデバイス。DB ではこのデバイスの行だけを置き換える（空ならサイト全体）。
    pub devices: &'a [Device],
    /// 処理したページ・URLの数
    pub processed: usize,
    pub errors: &'a [String],
    pub scraped_at: DateTime<Utc>,
}

/// 失敗したバッチ（0始まりの番号）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub sink: String,
    pub written: usize,
    /// 置き換えで削除した前回分の件数
    pub replaced: u64,
    pub failures: Vec<BatchFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 書き込み途中のファイル（`moppy.json` → `moppy.json.tmp`）
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
