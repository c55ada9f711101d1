//! 前回の出力との差分（新規・変更・変化なし・削除）

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{CampaignRecord, RecordKey};

/// 案件内容のハッシュ（案件名・還元額テキスト・URL）
pub fn record_hash(record: &CampaignRecord) -> String {
    let mut hasher = Sha256::new();
    for part in [&record.title, &record.raw_cashback_text, &record.url] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Default, Serialize)]
pub struct ChangeSet {
    pub new: Vec<CampaignRecord>,
    pub changed: Vec<CampaignRecord>,
    pub unchanged: Vec<CampaignRecord>,
    pub removed: Vec<CampaignRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl ChangeSet {
    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            new: self.new.len(),
            changed: self.changed.len(),
            unchanged: self.unchanged.len(),
            removed: self.removed.len(),
        }
    }

    pub fn has_changes(&self) -> bool {
        !(self.new.is_empty() && self.changed.is_empty() && self.removed.is_empty())
    }
}

/// `previous` を基準に `current` を分類する
pub fn detect_changes(previous: &[CampaignRecord], current: &[CampaignRecord]) -> ChangeSet {
    let mut previous_by_key: HashMap<RecordKey, &CampaignRecord> =
        previous.iter().map(|r| (r.key(), r)).collect();

    let mut changes = ChangeSet::default();
    for record in current {
        match previous_by_key.remove(&record.key()) {
            None => changes.new.push(record.clone()),
            Some(prev) if record_hash(prev) != record_hash(record) => {
                changes.changed.push(record.clone())
            }
            Some(_) => changes.unchanged.push(record.clone()),
        }
    }

    changes.removed = previous
        .iter()
        .filter(|r| previous_by_key.contains_key(&r.key()))
        .cloned()
        .collect();
    changes
}
