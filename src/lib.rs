//! ポイントサイト案件スクレイパー
//!
//! - サイトごとのセレクタ・ページング方式は JSON のルールで定義
//! - 一覧ページを巡回し、(サイト, 案件ID, デバイス) で重複排除
//! - チェックポイントで中断再開、結果は JSON と PostgreSQL に保存
//!
//! # 使用例
//!
//! ```rust,ignore
//! use pointsite_scraper::{ScrapeRequest, ScraperConfig, ScraperService, SiteRule};
//! use tower::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let site = SiteRule::from_file("sites/moppy.json").unwrap();
//!     let mut service = ScraperService::chrome(ScraperConfig::from_env());
//!
//!     let request = ScrapeRequest::new(site)
//!         .with_categories(["shopping"])
//!         .with_output("./data/moppy.json")
//!         .with_checkpoint("./data/moppy_checkpoint.json");
//!
//!     let report = service.call(request).await.unwrap();
//!     println!("unique: {}", report.summary.unique);
//! }
//! ```

pub mod accumulator;
pub mod browser;
pub mod checkpoint;
pub mod config;
pub mod diff;
pub mod error;
pub mod extract;
pub mod model;
pub mod normalize;
pub mod pagination;
pub mod persist;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod rule;
pub mod runner;
pub mod service;
pub mod traits;

// 主要な型をリエクスポート
pub use accumulator::Accumulator;
pub use browser::{BrowserSession, ChromeDriver, ChromeLauncher, ChromePage};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{DeviceProfile, ScraperConfig};
pub use error::{FailureKind, ScraperError};
pub use model::{CampaignRecord, Cashback, CashbackUnit, Device, RawRecord, RecordKey, SiteId};
pub use pagination::{Paginator, StopReason};
pub use rule::{CompiledRule, SiteRule};
pub use service::{ScrapeReport, ScrapeRequest, ScraperService};
pub use traits::{CampaignSink, DriverFactory, PageDriver};
