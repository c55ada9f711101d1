//! 案件名・還元額・デバイスなどテキストの正規化

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::model::{Cashback, CashbackUnit, Device};

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static BRACKETS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"【[^】]*】|\([^)]*\)|（[^）]*）|\[[^\]]*\]").expect("valid bracket regex")
});
static RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:最大|[Uu][Pp]\s*[Tt][Oo]|[-:：～〜])?\s*[\d,，]+(?:\.\d+)?\s*(?:pt|PT|Pt|ポイント|P|円|%|％)(?:還元|獲得|UP|up)?",
    )
    .expect("valid rate regex")
});
static MULTIPLIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?\s*倍").expect("valid multiplier regex"));
static TRAILING_SEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-:：|｜/]+$").expect("valid separator regex"));

static POINT_AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s*(?:pt|PT|Pt|ポイント|P)")
        .expect("valid point regex")
});
static PERCENT_AMOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("valid percent regex"));
static YEN_AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s*円").expect("valid yen regex")
});

/// 全角英数字・記号を半角に寄せる（全角スペースは残す）
pub fn to_halfwidth(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            _ => c,
        })
        .collect()
}

/// 空白の連続を1つにまとめる
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text, " ").trim().to_string()
}

/// 案件名のクリーニング
///
/// 空白の正規化、【】・()・（）・[] の除去、還元率表記（最大10%還元、500pt など）と
/// 倍率表記の除去を行う。結果が空になる場合は空白正規化のみの値を返す。
pub fn clean_title(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw);

    let without_brackets = BRACKETS_RE.replace_all(&collapsed, " ");
    let without_rates = RATE_RE.replace_all(&without_brackets, " ");
    let without_multipliers = MULTIPLIER_RE.replace_all(&without_rates, " ");

    let cleaned = collapse_whitespace(&without_multipliers);
    let cleaned = TRAILING_SEP_RE.replace(&cleaned, "").trim().to_string();

    if cleaned.is_empty() {
        collapsed
    } else {
        cleaned
    }
}

/// 還元額テキストを解析
///
/// 矢印表記（100pt→500pt）は右端の値を採用する。ポイント表記を優先し、
/// 次に％、最後に円を探す。ポイントは `points_per_yen` で円換算する。
pub fn parse_cashback(raw: &str, points_per_yen: u32) -> Option<Cashback> {
    let text = to_halfwidth(raw);
    let target = text.rsplit('→').next().unwrap_or(&text).trim();
    if target.is_empty() {
        return None;
    }

    if let Some(value) = first_amount(&POINT_AMOUNT_RE, target) {
        let yen_equivalent = if points_per_yen > 0 {
            Some((value / f64::from(points_per_yen)).floor() as u64)
        } else {
            None
        };
        return Some(Cashback {
            value,
            unit: CashbackUnit::Point,
            yen_equivalent,
        });
    }

    if let Some(value) = first_amount(&PERCENT_AMOUNT_RE, target) {
        return Some(Cashback {
            value,
            unit: CashbackUnit::Percent,
            yen_equivalent: None,
        });
    }

    first_amount(&YEN_AMOUNT_RE, target).map(|value| Cashback {
        value,
        unit: CashbackUnit::Yen,
        yen_equivalent: Some(value.floor() as u64),
    })
}

fn first_amount(re: &Regex, text: &str) -> Option<f64> {
    let caps = re.captures(text)?;
    caps.get(1)?.as_str().replace(',', "").parse::<f64>().ok()
}

/// タイトル・本文のキーワードからデバイスを推定
pub fn detect_device(text: &str, fallback: Device) -> Device {
    let lower = to_halfwidth(text).to_lowercase();

    let ios = contains_ascii_word(&lower, "ios")
        || ["iphone", "ipad", "app store", "appstore"]
            .iter()
            .any(|k| lower.contains(k));
    let android = ["android", "google play", "googleplay", "プレイストア"]
        .iter()
        .any(|k| lower.contains(k));

    if lower.contains("両対応") || (ios && android) {
        Device::IosAndroid
    } else if ios {
        Device::Ios
    } else if android {
        Device::Android
    } else if lower.contains("pc限定") || lower.contains("パソコン限定") {
        Device::Pc
    } else {
        fallback
    }
}

/// 前後が英字でない位置に `word` が現れるか（"studios" を iOS と誤判定しない）
fn contains_ascii_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_alphabetic())
            && !after.is_some_and(|c| c.is_ascii_alphabetic())
    })
}

/// 詳細URLからサイト固有IDを取り出す（最初にマッチしたキャプチャ）
pub fn extract_external_id(url: &str, patterns: &[Regex]) -> Option<String> {
    patterns.iter().find_map(|re| {
        let caps = re.captures(url)?;
        caps.iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str().to_string())
            .find(|s| !s.is_empty())
    })
}

/// 既知のリダイレクトURLを直接の詳細URLに書き換える
pub fn canonical_url(url: &str, redirects: &[(Regex, String)]) -> String {
    for (pattern, template) in redirects {
        if pattern.is_match(url) {
            return pattern.replace(url, template.as_str()).into_owned();
        }
    }
    url.to_string()
}

/// 相対URLをベースURLで解決する
pub fn resolve_url(base: &str, href: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(u) => u.to_string(),
        Err(_) => href.to_string(),
    }
}
