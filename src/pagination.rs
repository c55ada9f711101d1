//! ページング状態機械
//!
//! 1ページごとに「空ページ文言」「内容ハッシュの重複」「連続空ページ」「ページ上限」の
//! 4条件をすべて評価し、続行できる場合のみ次ページへ進む。
//!
//! ```text
//! Fetching -> Extracting -> HasMore -> Fetching ...
//!                        \-> Exhausted(reason)
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::extract::ExtractedPage;
use crate::model::RawRecord;
use crate::rule::PaginationMode;

/// 打ち切り理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EmptyPageMessage,
    DuplicateContent,
    ConsecutiveEmpty,
    MaxPageCap,
    NoNextPage,
    Error,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EmptyPageMessage => "empty_page_message",
            StopReason::DuplicateContent => "duplicate_content",
            StopReason::ConsecutiveEmpty => "consecutive_empty",
            StopReason::MaxPageCap => "max_page_cap",
            StopReason::NoNextPage => "no_next_page",
            StopReason::Error => "error",
            StopReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginatorState {
    Fetching { page: u32 },
    Extracting { page: u32 },
    HasMore { next_page: u32 },
    Exhausted { reason: StopReason },
}

/// ページングループ1本分の状態
#[derive(Debug, Clone, Default)]
pub struct PageFetchState {
    pub page: u32,
    pub consecutive_empty_pages: u32,
    pub seen_hashes: HashSet<String>,
    pub pages_fetched: u32,
    pub records_seen: usize,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy)]
pub struct PaginatorLimits {
    pub max_pages: u32,
    pub empty_page_threshold: u32,
}

pub struct Paginator {
    mode: PaginationMode,
    limits: PaginatorLimits,
    state: PaginatorState,
    fetch: PageFetchState,
}

impl Paginator {
    pub fn new(mode: PaginationMode, limits: PaginatorLimits) -> Self {
        Self {
            mode,
            limits: PaginatorLimits {
                max_pages: limits.max_pages.max(1),
                empty_page_threshold: limits.empty_page_threshold.max(1),
            },
            state: PaginatorState::Fetching { page: 1 },
            fetch: PageFetchState {
                page: 1,
                ..Default::default()
            },
        }
    }

    pub fn state(&self) -> PaginatorState {
        self.state
    }

    pub fn fetch_state(&self) -> &PageFetchState {
        &self.fetch
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.fetch.stop_reason
    }

    /// 次に取得するページ番号。終了済みなら None。
    pub fn next_fetch(&mut self) -> Option<u32> {
        match self.state {
            PaginatorState::Fetching { page } => Some(page),
            PaginatorState::HasMore { next_page } => {
                self.state = PaginatorState::Fetching { page: next_page };
                self.fetch.page = next_page;
                Some(next_page)
            }
            PaginatorState::Extracting { .. } | PaginatorState::Exhausted { .. } => None,
        }
    }

    pub fn start_extract(&mut self) {
        if let PaginatorState::Fetching { page } = self.state {
            self.state = PaginatorState::Extracting { page };
        }
    }

    /// 取得済み（チェックポイント済み）のページを観測せずに読み飛ばす
    pub fn skip_current(&mut self) {
        if let PaginatorState::Fetching { page } = self.state {
            self.state = if page >= self.limits.max_pages {
                self.exhaust(StopReason::MaxPageCap)
            } else {
                PaginatorState::HasMore {
                    next_page: page + 1,
                }
            };
        }
    }

    pub fn stop(&mut self, reason: StopReason) {
        if !matches!(self.state, PaginatorState::Exhausted { .. }) {
            self.state = self.exhaust(reason);
        }
    }

    /// 抽出結果を評価して次の状態へ遷移する
    pub fn observe(&mut self, page: &ExtractedPage) -> PaginatorState {
        let current = match self.state {
            PaginatorState::Extracting { page } | PaginatorState::Fetching { page } => page,
            other => return other,
        };
        self.fetch.pages_fetched += 1;
        self.state = self.transition(current, page);
        self.state
    }

    fn transition(&mut self, current: u32, page: &ExtractedPage) -> PaginatorState {
        if page.empty_page_detected {
            return self.exhaust(StopReason::EmptyPageMessage);
        }

        if page.records.is_empty() {
            self.fetch.consecutive_empty_pages += 1;
            if self.fetch.consecutive_empty_pages >= self.limits.empty_page_threshold {
                return self.exhaust(StopReason::ConsecutiveEmpty);
            }
        } else {
            self.fetch.consecutive_empty_pages = 0;
            if !self.fetch.seen_hashes.insert(content_hash(&page.records)) {
                return self.exhaust(StopReason::DuplicateContent);
            }
            self.fetch.records_seen += page.records.len();
        }

        if current >= self.limits.max_pages {
            return self.exhaust(StopReason::MaxPageCap);
        }

        if let Some(total) = page.total_count_hint {
            if total > 0 && self.fetch.records_seen >= total as usize {
                return self.exhaust(StopReason::NoNextPage);
            }
        }

        let next = match &self.mode {
            PaginationMode::QueryParam { .. } | PaginationMode::InfiniteScroll { .. } => {
                Some(current + 1)
            }
            PaginationMode::ClickNext => page
                .pagination_targets
                .iter()
                .copied()
                .find(|&target| target > current)
                .or_else(|| page.has_next_control.then_some(current + 1)),
        };

        match next {
            Some(next_page) => PaginatorState::HasMore { next_page },
            None => self.exhaust(StopReason::NoNextPage),
        }
    }

    fn exhaust(&mut self, reason: StopReason) -> PaginatorState {
        self.fetch.stop_reason = Some(reason);
        PaginatorState::Exhausted { reason }
    }
}

/// ページ内容のハッシュ（順序付きの id・名前・還元額テキスト）
pub fn content_hash(records: &[RawRecord]) -> String {
    let mut hasher = Sha256::new();
    for r in records {
        hasher.update(r.external_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(r.title.as_bytes());
        hasher.update([0x1f]);
        hasher.update(r.raw_cashback_text.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}
