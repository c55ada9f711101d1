//! 中断再開用のチェックポイント
//!
//! `{processedUrls, results, updatedAt}` を N件ごとに書き出す。書き込みは一時ファイル経由の
//! rename で行い、途中で落ちても前回の内容が残るようにする。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ScraperError;
use crate::model::CampaignRecord;
use crate::persist::temp_path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub processed_urls: BTreeSet<String>,
    #[serde(default)]
    pub results: Vec<CampaignRecord>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            ..Default::default()
        }
    }

    /// ファイルがなければ None。壊れている場合は警告して None。
    pub async fn load(path: &Path) -> Result<Option<Self>, ScraperError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(cp) => Ok(Some(cp)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "チェックポイントを読めないため最初から実行します");
                Ok(None)
            }
        }
    }
}

struct StoreState {
    checkpoint: Checkpoint,
    since_save: usize,
}

/// チェックポイントファイルの排他的な読み書き
pub struct CheckpointStore {
    path: PathBuf,
    every: usize,
    resumed: bool,
    state: Mutex<StoreState>,
}

impl CheckpointStore {
    /// 既存ファイルがあれば読み込んで再開する
    pub async fn open(
        path: impl Into<PathBuf>,
        site_id: &str,
        every: usize,
    ) -> Result<Self, ScraperError> {
        let path = path.into();
        let existing = Checkpoint::load(&path).await?;
        let resumed = existing.is_some();
        let checkpoint = match existing {
            Some(cp) => {
                info!(
                    path = %path.display(),
                    processed = cp.processed_urls.len(),
                    results = cp.results.len(),
                    "チェックポイントから再開します"
                );
                cp
            }
            None => Checkpoint::new(site_id),
        };
        Ok(Self {
            path,
            every: every.max(1),
            resumed,
            state: Mutex::new(StoreState {
                checkpoint,
                since_save: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub async fn is_processed(&self, url: &str) -> bool {
        self.state.lock().await.checkpoint.processed_urls.contains(url)
    }

    pub async fn snapshot(&self) -> Checkpoint {
        self.state.lock().await.checkpoint.clone()
    }

    /// 処理済みURLを記録し、N件ごとにその時点の結果と一緒に保存する。保存したら true。
    pub async fn record(&self, url: &str, results: &[CampaignRecord]) -> Result<bool, ScraperError> {
        let mut state = self.state.lock().await;
        if !state.checkpoint.processed_urls.insert(url.to_string()) {
            return Ok(false);
        }
        state.since_save += 1;
        if state.since_save < self.every {
            return Ok(false);
        }
        state.checkpoint.results = results.to_vec();
        self.write_locked(&mut state).await?;
        Ok(true)
    }

    /// 件数に関係なく保存（中断時）
    pub async fn save(&self, results: &[CampaignRecord]) -> Result<(), ScraperError> {
        let mut state = self.state.lock().await;
        state.checkpoint.results = results.to_vec();
        self.write_locked(&mut state).await
    }

    /// 完走後に削除
    pub async fn clear(&self) -> Result<(), ScraperError> {
        let _state = self.state.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "チェックポイントを削除しました");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_locked(&self, state: &mut StoreState) -> Result<(), ScraperError> {
        state.checkpoint.updated_at = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&state.checkpoint)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        state.since_save = 0;
        debug!(
            path = %self.path.display(),
            processed = state.checkpoint.processed_urls.len(),
            results = state.checkpoint.results.len(),
            "チェックポイント保存"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Device;
    use tempfile::TempDir;

    fn record(id: u32) -> CampaignRecord {
        CampaignRecord {
            site_id: "pointincome".into(),
            external_id: id.to_string(),
            title: format!("案件{}", id),
            raw_cashback_text: "1,000pt".into(),
            cashback: None,
            device: Device::Pc,
            category: "shopping".into(),
            url: format!("https://pointi.jp/ad/{}/", id),
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_saves_every_n_and_resumes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");

        let store = CheckpointStore::open(&path, "pointincome", 2).await.unwrap();
        assert!(!store.resumed());
        assert!(!store.record("https://pointi.jp/ad/1/", &[record(1)]).await.unwrap());
        assert!(!path.exists());
        assert!(store
            .record("https://pointi.jp/ad/2/", &[record(1), record(2)])
            .await
            .unwrap());
        assert!(path.exists());
        assert!(!dir.path().join("checkpoint.json.tmp").exists());

        let resumed = CheckpointStore::open(&path, "pointincome", 2).await.unwrap();
        assert!(resumed.resumed());
        assert!(resumed.is_processed("https://pointi.jp/ad/1/").await);
        assert!(!resumed.is_processed("https://pointi.jp/ad/3/").await);
        let snapshot = resumed.snapshot().await;
        assert_eq!(snapshot.results.len(), 2);
        assert!(snapshot.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_url_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("cp.json"), "pointincome", 1)
            .await
            .unwrap();
        assert!(store.record("https://pointi.jp/ad/1/", &[record(1)]).await.unwrap());
        assert!(!store.record("https://pointi.jp/ad/1/", &[record(1)]).await.unwrap());
        assert_eq!(store.snapshot().await.results.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cp.json");
        let store = CheckpointStore::open(&path, "pointincome", 10).await.unwrap();
        store.record("https://pointi.jp/ad/1/", &[]).await.unwrap();
        store.save(&[record(1)]).await.unwrap();
        assert!(path.exists());

        store.clear().await.unwrap();
        assert!(!path.exists());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_temp_file_does_not_collide_with_same_stem() {
        let dir = TempDir::new().unwrap();
        // 同じ stem の別ファイル（moppy.json）の一時ファイル名と衝突しないこと
        std::fs::create_dir(dir.path().join("moppy.tmp")).unwrap();
        let path = dir.path().join("moppy.checkpoint");
        let store = CheckpointStore::open(&path, "moppy", 1).await.unwrap();

        assert!(store.record("https://pc.moppy.jp/ad/1/", &[record(1)]).await.unwrap());
        assert!(path.exists());
        assert!(!dir.path().join("moppy.checkpoint.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = CheckpointStore::open(&path, "pointincome", 10).await.unwrap();
        assert!(!store.resumed());
        assert!(store.snapshot().await.processed_urls.is_empty());
    }
}
