use anyhow::Result;
use pagehand::{BrowserConfig, ChromiumBackend, ModelConfig, Pilot, PilotConfig, ResponsesClient};
use tracing_subscriber::EnvFilter;

const START_URL: &str = "https://www.bing.com";
const DEFAULT_TASK: &str =
    "Go to the httpbin.org forms page, fill in a small pizza order with sample details, and submit it.";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let backend = if let Ok(ws) = std::env::var("CHROME_WS_URL") {
        if !ws.trim().is_empty() {
            ChromiumBackend::connect(ws.trim()).await?
        } else {
            ChromiumBackend::launch(BrowserConfig { headless: false, ..Default::default() }).await?
        }
    } else {
        ChromiumBackend::launch(BrowserConfig { headless: false, ..Default::default() }).await?
    };
    let model = ResponsesClient::new(ModelConfig::default())?;

    let task = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_TASK.to_string());
    let pilot = Pilot::new(backend, model, PilotConfig::default());
    let report = pilot.run(&task, Some(START_URL)).await?;

    tracing::info!(
        run = %report.run_id,
        turns = report.turns,
        actions = report.actions,
        auto_confirms = report.auto_confirms,
        "finished"
    );
    println!("{}", report.final_text);
    Ok(())
}
