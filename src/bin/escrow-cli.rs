use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "escrow-cli")]
#[command(about = "Operator CLI for the escrow custody admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081", env = "ESCROW_ADMIN_URL")]
    url: String,

    #[arg(short, long, env = "ESCROW_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Service health and payout queue summary
    Status,
    /// Audit statistics, optionally for one escrow
    Stats {
        #[arg(long)]
        escrow: Option<String>,
    },
    /// Export audit entries as CSV
    Export {
        #[arg(long)]
        escrow: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Human-readable audit report
    Report {
        #[arg(long)]
        escrow: Option<String>,
    },
    /// List payout rows, optionally by status (pending, processing, completed, failed)
    Payouts {
        #[arg(long)]
        status: Option<String>,
    },
    /// Run one payout recovery sweep now
    Recover,
    /// Stop a pending payout
    Fail {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Status => {
            let res = client.get(format!("{}/admin/status", base)).send().await?;
            print_json(res).await?;
        }
        Commands::Stats { escrow } => {
            let res = client
                .get(format!("{}/admin/audit/stats", base))
                .query(&escrow_query(escrow, None))
                .send()
                .await?;
            print_json(res).await?;
        }
        Commands::Export { escrow, limit } => {
            let res = client
                .get(format!("{}/admin/audit/export.csv", base))
                .query(&escrow_query(escrow, limit))
                .send()
                .await?;
            print_text(res).await?;
        }
        Commands::Report { escrow } => {
            let res = client
                .get(format!("{}/admin/audit/report", base))
                .query(&escrow_query(escrow, None))
                .send()
                .await?;
            print_text(res).await?;
        }
        Commands::Payouts { status } => {
            let mut query = Vec::new();
            if let Some(status) = status {
                query.push(("status", status));
            }
            let res = client
                .get(format!("{}/admin/payouts", base))
                .query(&query)
                .send()
                .await?;
            print_json(res).await?;
        }
        Commands::Recover => {
            let res = client.post(format!("{}/admin/payouts/recover", base)).send().await?;
            print_json(res).await?;
        }
        Commands::Fail { id, reason } => {
            let res = client
                .post(format!("{}/admin/payouts/{}/fail", base, id))
                .json(&serde_json::json!({ "reason": reason }))
                .send()
                .await?;
            print_json(res).await?;
        }
    }

    Ok(())
}

fn escrow_query(escrow: Option<String>, limit: Option<usize>) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(id) = escrow {
        query.push(("escrow_id", id));
    }
    if let Some(limit) = limit {
        query.push(("limit", limit.to_string()));
    }
    query
}

async fn check_status(res: reqwest::Response) -> Result<Option<reqwest::Response>, Box<dyn std::error::Error>> {
    let status = res.status();
    if status.is_success() {
        return Ok(Some(res));
    }
    eprintln!("Error: admin API returned status {}", status);
    if let Ok(text) = res.text().await {
        eprintln!("Response: {}", text);
    }
    Ok(None)
}

async fn print_json(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(res) = check_status(res).await? {
        let json: Value = res.json().await?;
        println!("{}", serde_json::to_string_pretty(&json)?);
    }
    Ok(())
}

async fn print_text(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(res) = check_status(res).await? {
        print!("{}", res.text().await?);
    }
    Ok(())
}
