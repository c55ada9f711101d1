//! 抽出エンジン
//!
//! 描画済みHTMLにサイトルールを適用して候補レコードとページング用の手がかりを取り出す。
//! `scraper::Html` は `Send` ではないため、ここでは同期的に処理して結果だけ返す。

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::model::RawRecord;
use crate::normalize::{canonical_url, collapse_whitespace, extract_external_id, resolve_url};
use crate::rule::CompiledRule;

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s*(?:pt|P|ポイント|%|％|円)")
        .expect("valid amount regex")
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:,\d{3})+|\d+").expect("valid number regex"));
static PAGE_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]page=(\d+)").expect("valid page param regex"));

/// 一覧ページ1枚分の抽出結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedPage {
    pub records: Vec<RawRecord>,
    pub empty_page_detected: bool,
    pub total_count_hint: Option<u32>,
    /// ページ番号リンクが指すページ番号（昇順・重複なし）
    pub pagination_targets: Vec<u32>,
    pub has_next_control: bool,
    /// 案件要素の数（無限スクロールの増加判定用）
    pub item_count: usize,
}

/// 詳細ページから取れた補完情報
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailInfo {
    pub title: Option<String>,
    pub cashback_text: Option<String>,
}

pub fn extract_listing(html: &str, page_url: &str, rule: &CompiledRule) -> ExtractedPage {
    let doc = Html::parse_document(html);
    let root = doc.root_element();

    let body_text = visible_text(&doc);
    let empty_page_detected = rule
        .rule
        .listing
        .empty_page_phrases
        .iter()
        .any(|phrase| body_text.contains(phrase.as_str()));

    let items = find_items(root, rule);
    let mut seen_ids = HashSet::new();
    let records: Vec<RawRecord> = items
        .iter()
        .filter_map(|item| extract_item(*item, page_url, rule))
        .filter(|r| seen_ids.insert(r.external_id.clone()))
        .collect();

    let total_count_hint = rule
        .total_count
        .as_ref()
        .and_then(|sel| root.select(sel).next())
        .and_then(|el| total_count(&el.text().collect::<String>(), rule));

    let pagination_targets = rule
        .page_links
        .as_ref()
        .map(|sel| page_targets(root, sel))
        .unwrap_or_default();

    let has_next_control = rule
        .next_control
        .as_ref()
        .map(|sel| root.select(sel).any(|el| !is_disabled(el)))
        .unwrap_or(false);

    ExtractedPage {
        records,
        empty_page_detected,
        total_count_hint,
        pagination_targets,
        has_next_control,
        item_count: items.len(),
    }
}

pub fn extract_detail(html: &str, rule: &CompiledRule) -> DetailInfo {
    let doc = Html::parse_document(html);
    let root = doc.root_element();
    DetailInfo {
        title: first_text(root, &rule.detail_title),
        cashback_text: first_text(root, &rule.detail_cashback),
    }
}

static BODY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid body selector"));

/// body 内の表示テキスト（script / style / noscript / template の中身は除く）
fn visible_text(doc: &Html) -> String {
    let scope = doc
        .select(&BODY_SELECTOR)
        .next()
        .unwrap_or_else(|| doc.root_element());
    let mut text = String::new();
    for node in scope.descendants() {
        let Some(fragment) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|parent| {
            parent.value().as_element().is_some_and(|el| {
                matches!(el.name(), "script" | "style" | "noscript" | "template")
            })
        });
        if !hidden {
            text.push_str(fragment);
        }
    }
    text
}

/// 総件数。パターン指定があればそのキャプチャ、なければ最大の数値
/// （「1〜30件 / 全60件」のような表記で先頭の数値を拾わないため）。
fn total_count(text: &str, rule: &CompiledRule) -> Option<u32> {
    let parse = |raw: &str| raw.replace(',', "").parse::<u32>().ok();
    match &rule.total_count_pattern {
        Some(pattern) => {
            let caps = pattern.captures(text)?;
            let matched = caps.get(1).or_else(|| caps.get(0))?;
            parse(matched.as_str())
        }
        None => NUMBER_RE.find_iter(text).filter_map(|m| parse(m.as_str())).max(),
    }
}

/// 案件コンテナを探す。どのセレクタにも当たらなければリンクの親要素で代用する。
fn find_items<'a>(root: ElementRef<'a>, rule: &CompiledRule) -> Vec<ElementRef<'a>> {
    for sel in &rule.item_selectors {
        let items: Vec<ElementRef> = root.select(sel).collect();
        if !items.is_empty() {
            return items;
        }
    }

    let mut seen = HashSet::new();
    for sel in &rule.link_selectors {
        let parents: Vec<ElementRef> = root
            .select(sel)
            .filter_map(|link| link.parent().and_then(ElementRef::wrap))
            .filter(|parent| seen.insert(parent.id()))
            .collect();
        if !parents.is_empty() {
            return parents;
        }
    }
    Vec::new()
}

fn extract_item(item: ElementRef, page_url: &str, rule: &CompiledRule) -> Option<RawRecord> {
    let link = first_match(item, &rule.link_selectors)?;
    let href = link.value().attr("href")?;
    let absolute = resolve_url(page_url, href);
    let url = canonical_url(&absolute, &rule.redirects);

    let external_id = extract_external_id(&url, &rule.id_patterns)
        .or_else(|| extract_external_id(href, &rule.id_patterns))?;

    let title = first_text(item, &rule.title_selectors)
        .or_else(|| non_empty(element_text(link)))
        .or_else(|| link.value().attr("title").and_then(|t| non_empty(t.to_string())))
        .or_else(|| {
            link.select(&IMG_SELECTOR)
                .next()
                .and_then(|img| img.value().attr("alt"))
                .and_then(|alt| non_empty(alt.to_string()))
        })?;

    let context_text = collapse_whitespace(&item.text().collect::<String>());
    let raw_cashback_text = first_text(item, &rule.cashback_selectors)
        .or_else(|| AMOUNT_RE.find(&context_text).map(|m| m.as_str().to_string()))
        .unwrap_or_default();

    Some(RawRecord {
        external_id,
        title,
        url,
        raw_cashback_text,
        context_text,
    })
}

static IMG_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img").expect("valid img selector"));

fn first_match<'a>(scope: ElementRef<'a>, selectors: &[Selector]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|sel| scope.select(sel).next())
}

/// セレクタチェーンを順に試し、最初に空でないテキストが取れたものを返す
fn first_text(scope: ElementRef, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|sel| {
        scope
            .select(sel)
            .map(element_text)
            .find(|text| !text.is_empty())
    })
}

/// meta 要素は content 属性、それ以外はテキスト
fn element_text(el: ElementRef) -> String {
    if el.value().name() == "meta" {
        return el
            .value()
            .attr("content")
            .map(collapse_whitespace)
            .unwrap_or_default();
    }
    collapse_whitespace(&el.text().collect::<String>())
}

fn non_empty(text: String) -> Option<String> {
    let text = collapse_whitespace(&text);
    (!text.is_empty()).then_some(text)
}

fn page_targets(root: ElementRef, sel: &Selector) -> Vec<u32> {
    let mut targets = BTreeSet::new();
    for el in root.select(sel) {
        if is_disabled(el) {
            continue;
        }
        let text = element_text(el);
        if let Ok(n) = text.parse::<u32>() {
            targets.insert(n);
            continue;
        }
        if let Some(n) = el
            .value()
            .attr("href")
            .and_then(|href| PAGE_PARAM_RE.captures(href))
            .and_then(|c| c[1].parse::<u32>().ok())
        {
            targets.insert(n);
        }
    }
    targets.into_iter().collect()
}

fn is_disabled(el: ElementRef) -> bool {
    el.value().attr("disabled").is_some()
        || el.value().classes().any(|c| c == "disabled" || c == "is-disabled")
        || el.value().attr("aria-disabled") == Some("true")
}
