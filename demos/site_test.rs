use pointsite_scraper::{ScrapeRequest, ScraperConfig, ScraperService, SiteRule};
use tower::Service;

#[tokio::main]
async fn main() {
    // ログ設定
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // 例: SITE_RULE=sites/moppy.json SITE_CATEGORY=shopping
    let rule_path = std::env::var("SITE_RULE").unwrap_or_else(|_| "sites/moppy.json".to_string());
    let category = std::env::var("SITE_CATEGORY").ok();

    let site = SiteRule::from_file(&rule_path).expect("Failed to load site rule");

    let config = ScraperConfig::from_env()
        .with_headless(false) // デバッグ用に表示モード
        .with_max_pages(3);

    println!("=== {} Site Test ===", site.name);

    let mut request = ScrapeRequest::new(site).with_output("./data/site_test.json");
    if let Some(key) = category {
        request = request.with_categories([key]);
    }

    let mut service = ScraperService::chrome(config);
    match service.call(request).await {
        Ok(report) => {
            println!(
                "成功! ユニーク {} 件 (重複 {} 件)",
                report.summary.unique, report.summary.duplicates
            );
            for record in report.records.iter().take(10) {
                println!(
                    "  [{}] {} / {} / {}",
                    record.external_id,
                    record.title,
                    record.raw_cashback_text,
                    record.device
                );
            }
        }
        Err(e) => {
            eprintln!("エラー: {}", e);
        }
    }
}
