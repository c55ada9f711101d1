//! 実行中のユニーク案件セット

use std::collections::HashMap;

use crate::model::{CampaignRecord, RecordKey};

/// (siteId, externalId, device) で重複排除する。先に見つかった方を残す。
#[derive(Debug, Default)]
pub struct Accumulator {
    /// キー → records 内の位置
    keys: HashMap<RecordKey, usize>,
    records: Vec<CampaignRecord>,
    duplicates: usize,
    raw: usize,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未登録なら追加して true、既出なら破棄して false
    pub fn upsert(&mut self, record: CampaignRecord) -> bool {
        self.raw += 1;
        if self.insert_new(record) {
            true
        } else {
            self.duplicates += 1;
            false
        }
    }

    /// 詳細ページで補完した名前・還元額を取り込む（未登録なら追加）。
    /// カテゴリ・URL などは先に登録された方のまま。
    pub fn replace(&mut self, record: CampaignRecord) {
        match self.keys.get(&record.key()) {
            Some(&index) => {
                let stored = &mut self.records[index];
                stored.title = record.title;
                stored.raw_cashback_text = record.raw_cashback_text;
                stored.cashback = record.cashback;
                stored.scraped_at = record.scraped_at;
            }
            None => {
                self.insert_new(record);
            }
        }
    }

    fn insert_new(&mut self, record: CampaignRecord) -> bool {
        let key = record.key();
        if self.keys.contains_key(&key) {
            return false;
        }
        self.keys.insert(key, self.records.len());
        self.records.push(record);
        true
    }

    /// チェックポイントの結果で初期化（件数カウンタには含めない）
    pub fn seed(&mut self, records: impl IntoIterator<Item = CampaignRecord>) {
        for record in records {
            self.insert_new(record);
        }
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn unique_count(&self) -> usize {
        self.records.len()
    }

    pub fn duplicate_count(&self) -> usize {
        self.duplicates
    }

    pub fn raw_count(&self) -> usize {
        self.raw
    }

    pub fn records(&self) -> &[CampaignRecord] {
        &self.records
    }

    /// 初出順のレコード
    pub fn into_records(self) -> Vec<CampaignRecord> {
        self.records
    }
}
