use thiserror::Error;

/// リトライ判定に使う失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Blocked,
    Timeout,
    NotFound,
    Transient,
    StructuralChange,
    Persistence,
    Fatal,
}

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("アクセスがブロックされました (status={status}): {url}")]
    Blocked { url: String, status: u16 },

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("ページが見つかりません: {0}")]
    NotFound(String),

    #[error("一時的なエラー: {0}")]
    Transient(String),

    #[error("ページ構造が変わった可能性があります ({url}): {detail}")]
    StructuralChange { url: String, detail: String },

    #[error("サイトルールが不正です: {0}")]
    InvalidRule(String),

    #[error("保存エラー: {0}")]
    Persistence(String),

    #[error("キャンセルされました")]
    Cancelled,

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("DBエラー: {0}")]
    Database(#[from] sqlx::Error),
}

impl ScraperError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ScraperError::Blocked { .. } => FailureKind::Blocked,
            ScraperError::Timeout(_) => FailureKind::Timeout,
            ScraperError::NotFound(_) => FailureKind::NotFound,
            ScraperError::Transient(_) | ScraperError::Navigation(_) => FailureKind::Transient,
            ScraperError::StructuralChange { .. } => FailureKind::StructuralChange,
            ScraperError::Persistence(_)
            | ScraperError::FileIO(_)
            | ScraperError::Json(_)
            | ScraperError::Database(_) => FailureKind::Persistence,
            ScraperError::BrowserInit(_)
            | ScraperError::InvalidRule(_)
            | ScraperError::Cancelled => FailureKind::Fatal,
        }
    }

    /// ブロック・タイムアウト・一時エラーのみ再試行対象
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Blocked | FailureKind::Timeout | FailureKind::Transient
        )
    }
}
