use anyhow::Result;
use clap::{Parser, Subcommand};
use matsearch::envelope::ErrorBody;
use matsearch_core::ConversationRequest;
use matsearch_local::Config;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "matsearch")]
#[command(about = "Search-augmented material lookup (HTTP server + CLI)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server (`POST /api/chat`, `POST /api/log`, `GET /healthz`).
    Serve(ServeCmd),
    /// Answer one message and print the response envelope (json).
    Ask(AskCmd),
    /// Diagnose configuration (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct ServeCmd {
    #[arg(long, env = "MATSEARCH_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "MATSEARCH_PORT", default_value_t = 3000)]
    port: u16,
}

#[derive(clap::Args, Debug)]
struct AskCmd {
    /// The material requirement, in natural language.
    message: String,
    /// Completion API key for this call (falls back to OPENAI_API_KEY).
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Parses dotenv-style text: `#` comments, optional `export `, values optionally quoted.
/// Lines without `=` or with an empty key are skipped.
fn parse_env_file(txt: &str) -> Vec<(String, String)> {
    txt.lines()
        .filter_map(|raw| {
            let line = raw.trim();
            if line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (k, v) = line.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            let v = v.trim();
            let v = ['"', '\'']
                .iter()
                .find_map(|q| v.strip_prefix(*q).and_then(|s| s.strip_suffix(*q)))
                .unwrap_or(v);
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

/// Applies `MATSEARCH_ENV_FILE` before clap reads the environment. Variables already set
/// in the process win. Values are never logged.
fn load_env_file() {
    let Some(path) = std::env::var("MATSEARCH_ENV_FILE")
        .ok()
        .filter(|p| !p.trim().is_empty())
    else {
        return;
    };
    let Ok(txt) = std::fs::read_to_string(path.trim()) else {
        return;
    };
    for (k, v) in parse_env_file(&txt) {
        if std::env::var_os(&k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn doctor_payload(cfg: &Config, elapsed_ms: u128) -> serde_json::Value {
    let checks = vec![
        serde_json::json!({
            "name": "completion_default_key",
            "ok": cfg.openai_api_key.is_some(),
            "message": if cfg.openai_api_key.is_some() {
                "fallback completion key is configured"
            } else {
                "no fallback completion key; every request must carry apiKey"
            },
            "hint": if cfg.openai_api_key.is_some() { "" } else { "Set OPENAI_API_KEY (or MATSEARCH_OPENAI_API_KEY)." },
        }),
        serde_json::json!({
            "name": "search_credential",
            "ok": true,
            "message": if cfg.search_enabled() {
                "search enabled; answers are grounded when results are found"
            } else {
                "search disabled; answers are ungrounded"
            },
            "hint": if cfg.search_enabled() { "" } else { "Set SERPER_API_KEY (or MATSEARCH_SERPER_API_KEY) to enable web search." },
        }),
        serde_json::json!({
            "name": "telemetry_sink",
            "ok": true,
            "message": if cfg.telemetry_url.is_some() {
                "experiment records are relayed"
            } else {
                "experiment records are dropped"
            },
            "hint": if cfg.telemetry_url.is_some() { "" } else { "Set GAS_LOG_URL (or MATSEARCH_TELEMETRY_URL) to relay experiment records." },
        }),
    ];
    serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": true,
        "name": "matsearch",
        "version": env!("CARGO_PKG_VERSION"),
        "elapsed_ms": elapsed_ms,
        "configured": cfg.summary(),
        "checks": checks,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();
    init_tracing()?;

    match cli.command {
        Commands::Serve(args) => {
            let cfg = Config::from_env();
            let client = matsearch_local::http_client()?;
            let addr: SocketAddr = format!("{}:{}", args.host, args.port)
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid bind address {}:{}: {e}", args.host, args.port))?;
            matsearch::server::run_server(cfg.build_orchestrator(client), addr).await?;
        }
        Commands::Ask(args) => {
            let cfg = Config::from_env();
            let orchestrator = cfg.build_orchestrator(matsearch_local::http_client()?);
            let out = match ConversationRequest::new(args.message) {
                Ok(mut req) => {
                    req.api_key = args
                        .api_key
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty());
                    orchestrator.handle(req).await
                }
                Err(e) => Err(e),
            };
            match out {
                Ok(r) => println!("{}", serde_json::to_string(&r)?),
                Err(e) => {
                    println!("{}", serde_json::to_string(&ErrorBody::from_error(&e))?);
                    std::process::exit(1);
                }
            }
        }
        Commands::Doctor(args) => {
            let t0 = std::time::Instant::now();
            let cfg = Config::from_env();
            let payload = doctor_payload(&cfg, t0.elapsed().as_millis());
            match args.output.to_ascii_lowercase().as_str() {
                "text" => {
                    println!("matsearch {}", env!("CARGO_PKG_VERSION"));
                    if let Some(checks) = payload["checks"].as_array() {
                        for c in checks {
                            println!(
                                "- {}: {}",
                                c["name"].as_str().unwrap_or(""),
                                c["message"].as_str().unwrap_or("")
                            );
                        }
                    }
                }
                _ => println!("{payload}"),
            }
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "matsearch",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("matsearch {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }

    Ok(())
}
