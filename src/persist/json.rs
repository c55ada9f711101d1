use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{temp_path, FlushReport, Snapshot};
use crate::error::ScraperError;
use crate::model::CampaignRecord;
use crate::traits::CampaignSink;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
}

/// JSON 出力ファイルの中身
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonArtifact {
    pub scraped_at: DateTime<Utc>,
    #[serde(default)]
    pub site_id: String,
    pub total_campaigns: usize,
    pub summary: ArtifactSummary,
    pub campaigns: Vec<CampaignRecord>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl JsonArtifact {
    pub fn from_snapshot(snapshot: &Snapshot<'_>) -> Self {
        Self {
            scraped_at: snapshot.scraped_at,
            site_id: snapshot.site.site_id.clone(),
            total_campaigns: snapshot.records.len(),
            summary: ArtifactSummary {
                total: snapshot.records.len(),
                processed: snapshot.processed,
                errors: snapshot.errors.len(),
            },
            campaigns: snapshot.records.to_vec(),
            errors: snapshot.errors.to_vec(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, ScraperError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// JSON ファイルへの書き出し（同じパスなら上書き）
pub struct JsonArtifactSink {
    path: PathBuf,
}

impl JsonArtifactSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `{dir}/{site_id}_{YYYYmmdd_HHMMSS}.json`（JST）
    pub fn timestamped(dir: impl AsRef<Path>, site_id: &str) -> Self {
        let now = Utc::now();
        let timestamp = match FixedOffset::east_opt(9 * 3600) {
            Some(jst) => now.with_timezone(&jst).format("%Y%m%d_%H%M%S").to_string(),
            None => now.format("%Y%m%d_%H%M%S").to_string(),
        };
        Self::new(dir.as_ref().join(format!("{}_{}.json", site_id, timestamp)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CampaignSink for JsonArtifactSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn flush(&self, snapshot: &Snapshot<'_>) -> Result<FlushReport, ScraperError> {
        let artifact = JsonArtifact::from_snapshot(snapshot);
        let json = serde_json::to_vec_pretty(&artifact)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(
            path = %self.path.display(),
            campaigns = artifact.total_campaigns,
            "JSON を保存しました"
        );
        Ok(FlushReport {
            sink: self.name().to_string(),
            written: artifact.total_campaigns,
            replaced: 0,
            failures: Vec::new(),
            location: Some(self.path.display().to_string()),
        })
    }
}
