use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the API gateway admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway version and liveness
    Status,
    /// Health report (uptime, error rate, tracer and limiter state)
    Health,
    /// Request statistics over a window
    Stats {
        #[arg(short, long)]
        window_secs: Option<u64>,
    },
    /// Business metrics over a window
    Business {
        #[arg(short, long)]
        window_secs: Option<u64>,
    },
    /// Prometheus metrics text
    Metrics,
    /// Busiest rate limit keys
    RateLimits {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Live route table
    Routes,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let client = reqwest::Client::builder()
        .default_headers(headers)
        .build()?;
    let base = cli.url.trim_end_matches('/');

    let (path, query): (&str, Vec<(&str, String)>) = match &cli.command {
        Commands::Status => ("status", Vec::new()),
        Commands::Health => ("health", Vec::new()),
        Commands::Stats { window_secs } => ("stats", window_param(*window_secs)),
        Commands::Business { window_secs } => ("business", window_param(*window_secs)),
        Commands::Metrics => ("metrics", Vec::new()),
        Commands::RateLimits { limit } => ("rate-limits", vec![("limit", limit.to_string())]),
        Commands::Routes => ("routes", Vec::new()),
    };

    let res = client
        .get(format!("{base}/admin/{path}"))
        .query(&query)
        .send()
        .await?;

    if matches!(cli.command, Commands::Metrics) {
        print_text(res).await
    } else {
        print_response(res).await
    }
}

fn window_param(window_secs: Option<u64>) -> Vec<(&'static str, String)> {
    window_secs
        .map(|w| vec![("window_secs", w.to_string())])
        .unwrap_or_default()
}

async fn print_text(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        eprintln!("Response: {}", text);
        return Ok(());
    }
    print!("{text}");
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
