use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tower::Service;
use tracing_subscriber::EnvFilter;

use pointsite_scraper::{
    Device, DeviceProfile, ScrapeRequest, ScraperConfig, ScraperService, SiteRule,
};

#[derive(Debug, Parser)]
#[command(name = "pointsite-scraper")]
#[command(about = "ポイントサイトの案件一覧を巡回して JSON / DB に保存する")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// サイトルールに従って巡回する
    Scrape(ScrapeArgs),
    /// サイトルールを読み込んでセレクタ・正規表現を検証する
    Validate {
        #[arg(long)]
        site: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
struct ScrapeArgs {
    /// サイトルール (JSON)
    #[arg(long)]
    site: PathBuf,
    /// 対象カテゴリのキー（複数指定可、省略時は全カテゴリ）
    #[arg(long = "category")]
    categories: Vec<String>,
    /// JSON の出力先
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    max_pages: Option<u32>,
    /// アクセス環境（複数指定可: --device pc --device ios）
    #[arg(long = "device", value_enum)]
    devices: Vec<DeviceArg>,
    /// ブラウザを表示する
    #[arg(long)]
    headed: bool,
    /// 詳細ページも開いて名前・還元額を補完する
    #[arg(long)]
    enrich_details: bool,
    /// 差分比較に使う前回の JSON
    #[arg(long)]
    previous: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceArg {
    Pc,
    Ios,
    Android,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Pc => Device::Pc,
            DeviceArg::Ios => Device::Ios,
            DeviceArg::Android => Device::Android,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,pointsite_scraper=debug"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Scrape(args) => scrape(args).await,
        Commands::Validate { site } => validate(site),
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let rule = SiteRule::from_file(&path)
        .with_context(|| format!("サイトルールを読み込めません: {}", path.display()))?;
    let compiled = rule.compile()?;
    println!(
        "OK: {} ({}) カテゴリ {} 件",
        compiled.rule.name,
        compiled.site_id(),
        compiled.rule.categories.len()
    );
    for category in &compiled.rule.categories {
        println!("  - {} {}: {}", category.key, category.name, compiled.category_url(category));
    }
    Ok(())
}

async fn scrape(args: ScrapeArgs) -> anyhow::Result<()> {
    let site = SiteRule::from_file(&args.site)
        .with_context(|| format!("サイトルールを読み込めません: {}", args.site.display()))?;

    let mut config = ScraperConfig::from_env();
    if !args.devices.is_empty() {
        config = config.with_profiles(
            args.devices
                .iter()
                .map(|&d| DeviceProfile::for_device(d.into()))
                .collect(),
        );
    }
    if args.headed {
        config = config.with_headless(false);
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(max_pages) = args.max_pages {
        config = config.with_max_pages(max_pages);
    }
    if args.enrich_details {
        config = config.with_enrich_details(true);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("中断シグナルを受信しました。現在のページ処理後に停止します");
            let _ = cancel_tx.send(true);
        }
    });

    let mut request = ScrapeRequest::new(site)
        .with_categories(args.categories)
        .with_cancel(cancel_rx);
    if let Some(out) = args.out {
        request = request.with_output(out);
    }
    if let Some(checkpoint) = args.checkpoint {
        request = request.with_checkpoint(checkpoint);
    }
    if let Some(url) = args.database_url {
        request = request.with_database_url(url);
    }
    if let Some(previous) = args.previous {
        request = request.with_previous(previous);
    }

    let mut service = ScraperService::chrome(config);
    let report = service.call(request).await?;

    println!("=== {} 巡回結果 ===", report.site_id);
    println!(
        "取得: {} 件 / ユニーク: {} 件 / 重複除外: {} 件",
        report.summary.raw, report.summary.unique, report.summary.duplicates
    );
    println!(
        "処理URL: {} / エラー: {} / 成功率: {:.1}%",
        report.summary.processed, report.summary.errors, report.summary.success_rate
    );
    for outcome in &report.outcomes {
        let reason = outcome
            .stop_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| if outcome.resumed { "resumed".into() } else { "-".into() });
        println!(
            "  {} ({}) [{}]: {} ページ, {} 件, 終了理由 {}",
            outcome.category_name,
            outcome.category_key,
            outcome.device,
            outcome.pages_fetched,
            outcome.records_found,
            reason
        );
    }
    for flush in &report.flushes {
        println!(
            "保存 [{}]: {} 件{}",
            flush.sink,
            flush.written,
            flush
                .location
                .as_deref()
                .map(|l| format!(" → {}", l))
                .unwrap_or_default()
        );
    }
    if let Some(changes) = report.changes {
        println!(
            "差分: 新規 {} / 変更 {} / 変化なし {} / 削除 {}",
            changes.new, changes.changed, changes.unchanged, changes.removed
        );
    }
    if report.cancelled {
        println!("中断されました。同じ --checkpoint で再実行すると続きから再開します");
    }
    Ok(())
}
