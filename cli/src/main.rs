//! ChainStream CLI — stream ERC-20 token events from an EVM node.
//!
//! # Commands
//! ```
//! chainstream run    --type Transfer|Approval|All [--sse]
//! chainstream serve  [--port 3000]      GET /consume?type=...
//! chainstream status
//! chainstream reset
//! chainstream info
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use chainstream_storage::StoreOptions;

mod cmd_checkpoint;
mod cmd_run;
mod cmd_serve;
mod logging;

use logging::LogConfig;

/// Checkpoint backend used when neither `--checkpoint-url`, `CHECKPOINT_URL`
/// nor `REDIS_URL` is set.
pub const DEFAULT_CHECKPOINT_URL: &str = "sqlite:chainstream.db";

#[derive(Parser)]
#[command(
    name = "chainstream",
    about = "ERC-20 Transfer / Approval event streaming — ChainStream CLI",
    long_about = "
ChainStream CLI: back-fill and follow a token contract's Transfer and Approval
events over a WebSocket JSON-RPC endpoint, with a durable checkpoint so a
restart resumes where it left off.

ENVIRONMENT VARIABLES:
  RPC_WSS_URL      WebSocket JSON-RPC endpoint (run)
  TOKEN_ADDRESS    ERC-20 contract address (run)
  CHECKPOINT_URL   memory://, sqlite:<path> or redis://host:port
  REDIS_URL        fallback for CHECKPOINT_URL
  REDIS_KEY_PREFIX Redis key namespace; empty stores the bare stream id
  STREAM_ID        checkpoint key (default: lastProcessedBlock)
  BATCH_SIZE       blocks per historical query (default: 100)
  LOG_LEVEL        trace | debug | info | warn | error
  LOG_COMPONENTS   per-crate levels, e.g. chainstream-evm=debug,chainstream-core=trace
  LOG_JSON         emit JSON logs on stderr
  LISTEN_HOST      bind address (serve, default: 0.0.0.0)
  PORT             listen port (serve, default: 3000)
",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    /// Checkpoint store URL
    #[arg(long, env = "CHECKPOINT_URL", global = true)]
    checkpoint_url: Option<String>,

    /// Redis key prefix (default: chainstream:checkpoint; empty for the bare stream id)
    #[arg(long, env = "REDIS_KEY_PREFIX", global = true)]
    redis_key_prefix: Option<String>,

    /// Checkpoint key of this stream
    #[arg(long, env = "STREAM_ID", default_value = "lastProcessedBlock", global = true)]
    stream_id: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Level for one crate, e.g. chainstream-evm=debug (repeatable)
    #[arg(
        long = "log-component",
        value_name = "CRATE=LEVEL",
        env = "LOG_COMPONENTS",
        value_delimiter = ',',
        value_parser = logging::parse_component,
        global = true
    )]
    log_components: Vec<(String, String)>,

    /// Emit JSON logs
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

impl GlobalArgs {
    fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            components: self.log_components.iter().cloned().collect(),
            json: self.log_json,
        }
    }

    fn store_options(&self) -> StoreOptions {
        match &self.redis_key_prefix {
            Some(prefix) => StoreOptions {
                redis_key_prefix: prefix.clone(),
            },
            None => StoreOptions::default(),
        }
    }

    fn checkpoint_url(&self) -> String {
        resolve_checkpoint_url(self.checkpoint_url.clone(), std::env::var("REDIS_URL").ok())
    }
}

/// `--checkpoint-url` / `CHECKPOINT_URL`, then `REDIS_URL`, then the default.
fn resolve_checkpoint_url(explicit: Option<String>, redis_url: Option<String>) -> String {
    explicit
        .or(redis_url)
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CHECKPOINT_URL.to_string())
}

#[derive(Subcommand)]
enum Commands {
    /// Back-fill from the checkpoint, then follow live events until Ctrl-C
    Run(cmd_run::RunArgs),

    /// Back-fill, follow live events and serve them over HTTP until Ctrl-C
    Serve(cmd_serve::ServeArgs),

    /// Show the stored checkpoint of the stream
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete the stored checkpoint; the next run starts at the chain head
    Reset,

    /// Show version, event topics and engine defaults
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(&cli.global.log_config());

    let checkpoint_url = cli.global.checkpoint_url();
    let store_options = cli.global.store_options();
    let stream_id = cli.global.stream_id.as_str();

    match cli.command {
        Commands::Run(args) => cmd_run::run(args, &checkpoint_url, &store_options, stream_id).await,

        Commands::Serve(args) => {
            cmd_serve::serve(args, &checkpoint_url, &store_options, stream_id).await
        }

        Commands::Status { json } => {
            cmd_checkpoint::status(&checkpoint_url, &store_options, stream_id, json).await
        }

        Commands::Reset => cmd_checkpoint::reset(&checkpoint_url, &store_options, stream_id).await,

        Commands::Info => cmd_info(),
    }
}

fn cmd_info() -> Result<()> {
    println!("ChainStream v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Events:");
    println!("  Transfer  {}  topic event.transfer", chainstream_evm::TRANSFER_TOPIC);
    println!("  Approval  {}  topic event.approval", chainstream_evm::APPROVAL_TOPIC);
    println!();
    println!("Engine defaults:");
    let defaults = chainstream_core::EngineConfig::default();
    println!("{}", serde_json::to_string_pretty(&defaults)?);
    println!();
    println!("Checkpoint backends: memory://, sqlite:<path>, redis://host:port");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_parses_type_and_transport() {
        let cli = Cli::try_parse_from([
            "chainstream",
            "run",
            "--type",
            "Approval",
            "--rpc-url",
            "wss://node.example/ws",
            "--token",
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
            "--sse",
            "--stream-id",
            "usdc",
        ])
        .unwrap();

        assert_eq!(cli.global.stream_id, "usdc");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.event_type, "Approval");
                assert!(args.sse);
                assert_eq!(args.engine.rpc_url, "wss://node.example/ws");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_type() {
        let err = Cli::try_parse_from([
            "chainstream",
            "run",
            "--rpc-url",
            "wss://node.example/ws",
            "--token",
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
        ])
        .err()
        .unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert!(err.to_string().contains("--type"));
    }

    #[test]
    fn serve_parses_port_and_engine_flags() {
        let cli = Cli::try_parse_from([
            "chainstream",
            "serve",
            "--port",
            "8080",
            "--rpc-url",
            "wss://node.example/ws",
            "--token",
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
            "--capacity",
            "32",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.port, 8080);
                assert_eq!(args.engine.capacity, Some(32));
                assert_eq!(args.engine.engine_config("s").subscriber_capacity, 32);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn redis_key_prefix_reaches_store_options() {
        let cli = Cli::try_parse_from(["chainstream", "status", "--redis-key-prefix", ""]).unwrap();
        assert_eq!(cli.global.store_options().redis_key_prefix, "");

        let cli = Cli::try_parse_from(["chainstream", "status", "--redis-key-prefix", "prod:cp"])
            .unwrap();
        assert_eq!(cli.global.store_options().redis_key_prefix, "prod:cp");
    }

    #[test]
    fn log_components_fill_the_log_config() {
        let cli = Cli::try_parse_from([
            "chainstream",
            "info",
            "--log-level",
            "warn",
            "--log-component",
            "chainstream-evm=debug",
            "--log-component",
            "chainstream-core=trace",
        ])
        .unwrap();
        let config = cli.global.log_config();
        assert_eq!(config.components.len(), 2);
        assert_eq!(
            config.directives(),
            "warn,chainstream_core=trace,chainstream_evm=debug"
        );

        assert!(Cli::try_parse_from(["chainstream", "info", "--log-component", "debug"]).is_err());
    }

    #[test]
    fn status_accepts_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "chainstream",
            "status",
            "--checkpoint-url",
            "memory://",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.global.checkpoint_url.as_deref(), Some("memory://"));
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }

    #[test]
    fn checkpoint_url_fallbacks() {
        assert_eq!(
            resolve_checkpoint_url(Some("memory://".into()), Some("redis://r:6379".into())),
            "memory://"
        );
        assert_eq!(
            resolve_checkpoint_url(None, Some("redis://r:6379".into())),
            "redis://r:6379"
        );
        assert_eq!(resolve_checkpoint_url(None, None), DEFAULT_CHECKPOINT_URL);
    }
}
