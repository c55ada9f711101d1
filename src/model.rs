//! 案件データの型定義

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 対象デバイス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    #[serde(rename = "PC")]
    Pc,
    #[serde(rename = "iOS")]
    Ios,
    #[serde(rename = "Android")]
    Android,
    #[serde(rename = "iOS/Android")]
    IosAndroid,
    #[serde(rename = "All")]
    All,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Pc => "PC",
            Device::Ios => "iOS",
            Device::Android => "Android",
            Device::IosAndroid => "iOS/Android",
            Device::All => "All",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 還元額の単位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CashbackUnit {
    #[serde(rename = "pt")]
    Point,
    Percent,
    Yen,
}

/// 解析済みの還元額
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cashback {
    pub value: f64,
    pub unit: CashbackUnit,
    /// 円換算（ポイント・円のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yen_equivalent: Option<u64>,
}

impl Cashback {
    /// DB の cashback_rate 列に入れる表示用文字列
    pub fn display_rate(&self) -> String {
        let value = if self.value.fract() == 0.0 {
            format!("{}", self.value as u64)
        } else {
            format!("{}", self.value)
        };
        match self.unit {
            CashbackUnit::Point => format!("{}pt", value),
            CashbackUnit::Percent => format!("{}%", value),
            CashbackUnit::Yen => format!("{}円", value),
        }
    }
}

/// サイト識別子（`moppy` など、ルールの `site_id`）
pub type SiteId = String;

/// 一覧ページから抽出した未加工の候補
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub raw_cashback_text: String,
    /// 案件要素全体のテキスト（デバイス判定用）
    #[serde(default)]
    pub context_text: String,
}

/// 1件の案件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRecord {
    pub site_id: SiteId,
    pub external_id: String,
    pub title: String,
    pub raw_cashback_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashback: Option<Cashback>,
    pub device: Device,
    pub category: String,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

impl CampaignRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            site_id: self.site_id.clone(),
            external_id: self.external_id.clone(),
            device: self.device,
        }
    }
}

/// 重複排除キー (siteId, externalId, device)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub site_id: SiteId,
    pub external_id: String,
    pub device: Device,
}
