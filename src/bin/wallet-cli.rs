use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "wallet-cli")]
#[command(about = "Command-line client for the agent wallet API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080", env = "AGENT_WALLET_URL")]
    url: String,

    #[arg(short, long, env = "AGENT_WALLET_API_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service health
    Health,
    /// List wallets and their spending limits
    Wallets,
    /// Submit a transfer
    Transfer {
        /// Wallet to send from
        #[arg(long)]
        wallet: String,
        /// Recipient address
        #[arg(long)]
        to: String,
        /// Amount in human units, e.g. 12.5
        #[arg(long)]
        amount: String,
        /// `native` or an ERC20 contract address
        #[arg(long, default_value = "native")]
        token: String,
        /// Idempotency id (UUID); generated by the service if omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Show a transaction record
    Status { id: String },
    /// Resubmit a dropped or failed transaction as a new one
    Resubmit { id: String },
    /// Stop watching a transaction for confirmation
    CancelWatch { id: String },
    /// Create or replace a spending limit
    SetLimit {
        #[arg(long)]
        wallet: String,
        #[arg(long, default_value = "native")]
        token: String,
        /// Cap in human units
        #[arg(long)]
        cap: String,
        /// Window length in seconds
        #[arg(long, default_value_t = 86_400)]
        period_secs: u64,
        /// Token decimals; looked up on chain if omitted
        #[arg(long)]
        decimals: Option<u8>,
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

    let res = match cli.command {
        Commands::Health => client.get(format!("{}/health", base)).send().await?,
        Commands::Wallets => client.get(format!("{}/v1/wallets", base)).send().await?,
        Commands::Transfer {
            wallet,
            to,
            amount,
            token,
            id,
        } => {
            let mut body = json!({
                "wallet_id": wallet,
                "to": to,
                "token": token,
                "amount": amount,
            });
            if let Some(id) = id {
                body["transaction_id"] = Value::String(id);
            }
            client
                .post(format!("{}/v1/transfers", base))
                .json(&body)
                .send()
                .await?
        }
        Commands::Status { id } => {
            client
                .get(format!("{}/v1/transactions/{}", base, id))
                .send()
                .await?
        }
        Commands::Resubmit { id } => {
            client
                .post(format!("{}/v1/transactions/{}/resubmit", base, id))
                .send()
                .await?
        }
        Commands::CancelWatch { id } => {
            client
                .delete(format!("{}/v1/transactions/{}/watch", base, id))
                .send()
                .await?
        }
        Commands::SetLimit {
            wallet,
            token,
            cap,
            period_secs,
            decimals,
        } => {
            client
                .put(format!("{}/v1/wallets/{}/limits/{}", base, wallet, token))
                .json(&json!({
                    "cap": cap,
                    "period_secs": period_secs,
                    "decimals": decimals,
                }))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: wallet API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
