//! サイトごとの抽出ルール（コードではなくデータとして持つ）

use std::path::Path;

use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ScraperError;
use crate::normalize::resolve_url;

fn default_points_per_yen() -> u32 {
    10
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_scroll_wait_ms() -> u64 {
    2500
}

fn default_empty_phrases() -> Vec<String> {
    vec![
        "現在、掲載している商品が存在しません。".to_string(),
        "商品が存在しません".to_string(),
        "該当する商品がありません".to_string(),
    ]
}

fn default_detail_title_selectors() -> Vec<String> {
    vec![
        "h1".to_string(),
        "[class*='title']".to_string(),
        "meta[property='og:title']".to_string(),
        "title".to_string(),
    ]
}

/// サイト定義
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRule {
    pub site_id: String,
    pub name: String,
    pub base_url: String,
    /// 何ポイントで1円か
    #[serde(default = "default_points_per_yen")]
    pub points_per_yen: u32,
    pub categories: Vec<CategoryDef>,
    pub pagination: PaginationMode,
    pub listing: ListingRule,
    #[serde(default)]
    pub detail: Option<DetailRule>,
    #[serde(default)]
    pub redirects: Vec<RedirectRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryDef {
    pub key: String,
    pub name: String,
    pub url: String,
    /// カテゴリ固有のページ上限（全体設定より小さい場合のみ有効）
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// 次ページの辿り方
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PaginationMode {
    /// `?page=N` を増やしていく
    QueryParam {
        #[serde(default = "default_page_param")]
        param: String,
    },
    /// ページ番号リンク・「次へ」ボタンをクリック
    ClickNext,
    /// 最下部までスクロールして要素数の増加を見る
    InfiniteScroll {
        #[serde(default = "default_scroll_wait_ms")]
        scroll_wait_ms: u64,
    },
}

/// 一覧ページの抽出ルール（各チェーンは先頭から試して最初に取れたものを採用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRule {
    #[serde(default)]
    pub item_selectors: Vec<String>,
    pub link_selectors: Vec<String>,
    #[serde(default)]
    pub title_selectors: Vec<String>,
    #[serde(default)]
    pub cashback_selectors: Vec<String>,
    pub id_patterns: Vec<String>,
    #[serde(default = "default_empty_phrases")]
    pub empty_page_phrases: Vec<String>,
    #[serde(default)]
    pub total_count_selector: Option<String>,
    /// 総件数テキストから件数を取り出す正規表現（1番目のキャプチャを使う）。
    /// 未指定ならテキスト中の最大の数値。
    #[serde(default)]
    pub total_count_pattern: Option<String>,
    #[serde(default)]
    pub page_link_selector: Option<String>,
    #[serde(default)]
    pub next_selector: Option<String>,
}

/// 詳細ページの抽出ルール
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailRule {
    #[serde(default = "default_detail_title_selectors")]
    pub title_selectors: Vec<String>,
    #[serde(default)]
    pub cashback_selectors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectRule {
    pub pattern: String,
    /// `$1` などキャプチャ参照を含む置換先
    pub template: String,
}

impl SiteRule {
    pub fn from_json_str(json: &str) -> Result<Self, ScraperError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScraperError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn category(&self, key: &str) -> Option<&CategoryDef> {
        self.categories.iter().find(|c| c.key == key)
    }

    /// すべてのセレクタ・正規表現を検証してコンパイル
    pub fn compile(self) -> Result<CompiledRule, ScraperError> {
        if self.listing.link_selectors.is_empty() {
            return Err(ScraperError::InvalidRule(format!(
                "{}: link_selectors が空です",
                self.site_id
            )));
        }
        if self.listing.id_patterns.is_empty() {
            return Err(ScraperError::InvalidRule(format!(
                "{}: id_patterns が空です",
                self.site_id
            )));
        }
        if Url::parse(&self.base_url).is_err() {
            return Err(ScraperError::InvalidRule(format!(
                "{}: base_url が不正です: {}",
                self.site_id, self.base_url
            )));
        }
        if self.pagination == PaginationMode::ClickNext
            && self.listing.next_selector.is_none()
            && self.listing.page_link_selector.is_none()
        {
            return Err(ScraperError::InvalidRule(format!(
                "{}: click_next には next_selector か page_link_selector が必要です",
                self.site_id
            )));
        }

        let listing = &self.listing;
        let detail_title = match &self.detail {
            Some(d) => parse_selectors(&d.title_selectors)?,
            None => Vec::new(),
        };
        let detail_cashback = match &self.detail {
            Some(d) => parse_selectors(&d.cashback_selectors)?,
            None => Vec::new(),
        };

        Ok(CompiledRule {
            item_selectors: parse_selectors(&listing.item_selectors)?,
            link_selectors: parse_selectors(&listing.link_selectors)?,
            title_selectors: parse_selectors(&listing.title_selectors)?,
            cashback_selectors: parse_selectors(&listing.cashback_selectors)?,
            id_patterns: parse_regexes(&listing.id_patterns)?,
            total_count: parse_optional(listing.total_count_selector.as_deref())?,
            total_count_pattern: listing
                .total_count_pattern
                .as_deref()
                .map(compile_regex)
                .transpose()?,
            page_links: parse_optional(listing.page_link_selector.as_deref())?,
            next_control: parse_optional(listing.next_selector.as_deref())?,
            detail_title,
            detail_cashback,
            redirects: self
                .redirects
                .iter()
                .map(|r| Ok((compile_regex(&r.pattern)?, r.template.clone())))
                .collect::<Result<Vec<_>, ScraperError>>()?,
            rule: self,
        })
    }
}

/// コンパイル済みルール
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: SiteRule,
    pub(crate) item_selectors: Vec<Selector>,
    pub(crate) link_selectors: Vec<Selector>,
    pub(crate) title_selectors: Vec<Selector>,
    pub(crate) cashback_selectors: Vec<Selector>,
    pub(crate) id_patterns: Vec<Regex>,
    pub(crate) total_count: Option<Selector>,
    pub(crate) total_count_pattern: Option<Regex>,
    pub(crate) page_links: Option<Selector>,
    pub(crate) next_control: Option<Selector>,
    pub(crate) detail_title: Vec<Selector>,
    pub(crate) detail_cashback: Vec<Selector>,
    pub(crate) redirects: Vec<(Regex, String)>,
}

impl CompiledRule {
    pub fn site_id(&self) -> &str {
        &self.rule.site_id
    }

    pub fn has_detail_rule(&self) -> bool {
        self.rule.detail.is_some()
    }

    /// カテゴリURL（相対可）を絶対URLにする
    pub fn category_url(&self, category: &CategoryDef) -> String {
        resolve_url(&self.rule.base_url, &category.url)
    }

    /// ページ番号付きURL（1ページ目はそのまま）
    pub fn page_url(&self, category_url: &str, page: u32) -> String {
        let param = match &self.rule.pagination {
            PaginationMode::QueryParam { param } => param.as_str(),
            _ => return category_url.to_string(),
        };
        if page <= 1 {
            return category_url.to_string();
        }
        match Url::parse(category_url) {
            Ok(mut url) => {
                let pairs: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != param)
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                url.query_pairs_mut()
                    .clear()
                    .extend_pairs(pairs)
                    .append_pair(param, &page.to_string());
                url.to_string()
            }
            Err(_) => format!("{}?{}={}", category_url, param, page),
        }
    }
}

fn parse_selectors(raw: &[String]) -> Result<Vec<Selector>, ScraperError> {
    raw.iter().map(|s| parse_selector(s)).collect()
}

fn parse_optional(raw: Option<&str>) -> Result<Option<Selector>, ScraperError> {
    raw.map(parse_selector).transpose()
}

fn parse_selector(raw: &str) -> Result<Selector, ScraperError> {
    Selector::parse(raw)
        .map_err(|e| ScraperError::InvalidRule(format!("セレクタ '{}': {:?}", raw, e)))
}

fn parse_regexes(raw: &[String]) -> Result<Vec<Regex>, ScraperError> {
    raw.iter().map(|p| compile_regex(p)).collect()
}

fn compile_regex(raw: &str) -> Result<Regex, ScraperError> {
    Regex::new(raw).map_err(|e| ScraperError::InvalidRule(format!("正規表現 '{}': {}", raw, e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CHOBIRICH_JSON: &str = r#"{
        "site_id": "chobirich",
        "name": "ちょびリッチ",
        "base_url": "https://www.chobirich.com/",
        "categories": [
            { "key": "shopping_101", "name": "総合通販", "url": "/shopping/shop/101", "max_pages": 20 }
        ],
        "pagination": { "mode": "query_param" },
        "listing": {
            "item_selectors": ["li.ad-category__ad", "div.campaign-item"],
            "link_selectors": ["a[href*='/ad_details/']"],
            "cashback_selectors": [".ad-category__ad__pt", ".item-point"],
            "id_patterns": ["/ad_details/(?:redirect/)?(\\d+)"],
            "total_count_selector": ".result-count"
        },
        "detail": { "cashback_selectors": [".AdDetails__pt"] },
        "redirects": [
            { "pattern": "^https://www\\.chobirich\\.com/ad_details/redirect/(\\d+).*$",
              "template": "https://www.chobirich.com/ad_details/$1/" }
        ]
    }"#;

    #[test]
    fn test_parse_and_compile_rule() {
        let rule = SiteRule::from_json_str(CHOBIRICH_JSON).unwrap();
        assert_eq!(rule.points_per_yen, 10);
        assert_eq!(rule.listing.empty_page_phrases.len(), 3);
        assert_eq!(
            rule.pagination,
            PaginationMode::QueryParam {
                param: "page".to_string()
            }
        );
        let detail = rule.detail.clone().unwrap();
        assert_eq!(detail.title_selectors[0], "h1");

        let compiled = rule.compile().unwrap();
        assert_eq!(compiled.site_id(), "chobirich");
        assert!(compiled.has_detail_rule());
        assert_eq!(compiled.redirects.len(), 1);
    }

    #[test]
    fn test_page_url() {
        let compiled = SiteRule::from_json_str(CHOBIRICH_JSON)
            .unwrap()
            .compile()
            .unwrap();
        let category = compiled.rule.categories[0].clone();
        let base = compiled.category_url(&category);
        assert_eq!(base, "https://www.chobirich.com/shopping/shop/101");
        assert_eq!(compiled.page_url(&base, 1), base);
        assert_eq!(
            compiled.page_url(&base, 3),
            "https://www.chobirich.com/shopping/shop/101?page=3"
        );
        assert_eq!(
            compiled.page_url("https://pointi.jp/list.php?category=1&page=2", 4),
            "https://pointi.jp/list.php?category=1&page=4"
        );
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let mut rule = SiteRule::from_json_str(CHOBIRICH_JSON).unwrap();
        rule.listing.link_selectors = vec!["a[href*=".to_string()];
        assert!(matches!(rule.compile(), Err(ScraperError::InvalidRule(_))));
    }

    #[test]
    fn test_invalid_total_count_pattern_is_rejected() {
        let mut rule = SiteRule::from_json_str(CHOBIRICH_JSON).unwrap();
        rule.listing.total_count_pattern = Some("全(\\d+".to_string());
        assert!(matches!(rule.compile(), Err(ScraperError::InvalidRule(_))));
    }

    #[test]
    fn test_click_next_requires_control() {
        let mut rule = SiteRule::from_json_str(CHOBIRICH_JSON).unwrap();
        rule.pagination = PaginationMode::ClickNext;
        assert!(matches!(rule.compile(), Err(ScraperError::InvalidRule(_))));
    }

    #[test]
    fn test_bundled_site_rules_compile() {
        for json in [
            include_str!("../sites/chobirich.json"),
            include_str!("../sites/moppy.json"),
            include_str!("../sites/pointincome.json"),
            include_str!("../sites/pointincome_app.json"),
        ] {
            let rule = SiteRule::from_json_str(json).unwrap();
            let site_id = rule.site_id.clone();
            let compiled = rule.compile().unwrap();
            assert_eq!(compiled.site_id(), site_id);
            assert!(!compiled.rule.categories.is_empty());
        }
    }

    #[test]
    fn test_app_rule_scrolls_mobile_listing() {
        let rule = SiteRule::from_json_str(include_str!("../sites/pointincome_app.json")).unwrap();
        assert_eq!(
            rule.pagination,
            PaginationMode::InfiniteScroll {
                scroll_wait_ms: 2500
            }
        );
        let compiled = rule.compile().unwrap();
        let first = &compiled.rule.categories[0];
        assert_eq!(
            compiled.category_url(first),
            "https://sp.pointi.jp/pts_app.php?cat_no=285&sort=&sub=4"
        );
    }
}
