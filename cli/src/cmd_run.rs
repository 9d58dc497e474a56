//! `chainstream run` — ingest and stream one filtered session to stdout.
//!
//! Events are written as JSON lines, or as server-sent-event `data:` frames
//! with `--sse`. Logs go to stderr.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use chainstream_core::{
    EngineBuilder, EngineConfig, EngineState, IngestionEngine, KindFilter, NormalizedEvent,
    SessionEnd, SubscriptionDispatcher,
};
use chainstream_evm::WsConnector;
use chainstream_storage::{open_store_with, StoreOptions};

/// Node, contract and engine tuning shared by `run` and `serve`.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// WebSocket JSON-RPC endpoint
    #[arg(long, env = "RPC_WSS_URL")]
    pub rpc_url: String,

    /// ERC-20 contract address
    #[arg(long, env = "TOKEN_ADDRESS")]
    pub token: String,

    /// Blocks per historical range query
    #[arg(long, env = "BATCH_SIZE")]
    pub batch_size: Option<u64>,

    /// Liveness probe interval in live mode (ms)
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,

    /// Delay between reconnect attempts (ms)
    #[arg(long)]
    pub reconnect_delay_ms: Option<u64>,

    /// Deadline for every node request (ms)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Skip the gap back-fill after a reconnect
    #[arg(long)]
    pub no_gap_backfill: bool,

    /// Events buffered per consumer before it is dropped as too slow
    #[arg(long)]
    pub capacity: Option<usize>,
}

impl EngineArgs {
    /// Engine configuration: flags over defaults.
    pub fn engine_config(&self, stream_id: &str) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            stream_id: stream_id.to_string(),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            heartbeat_interval_ms: self.heartbeat_ms.unwrap_or(defaults.heartbeat_interval_ms),
            reconnect_delay_ms: self.reconnect_delay_ms.unwrap_or(defaults.reconnect_delay_ms),
            request_timeout_ms: self.timeout_ms.unwrap_or(defaults.request_timeout_ms),
            backfill_on_reconnect: !self.no_gap_backfill,
            subscriber_capacity: self.capacity.unwrap_or(defaults.subscriber_capacity),
        }
    }

    /// Open the checkpoint store, connect the node and build the engine.
    pub async fn build_engine(
        &self,
        checkpoint_url: &str,
        store_options: &StoreOptions,
        stream_id: &str,
    ) -> Result<IngestionEngine> {
        let store = open_store_with(checkpoint_url, store_options)
            .await
            .with_context(|| format!("opening checkpoint store '{checkpoint_url}'"))?;
        let connector = WsConnector::new(self.rpc_url.clone(), &self.token)
            .with_context(|| format!("invalid token address '{}'", self.token))?;

        tracing::info!(
            stream_id,
            rpc = %connector.url(),
            token = %connector.contract(),
            "starting chainstream"
        );

        EngineBuilder::with_config(self.engine_config(stream_id))
            .connector(Arc::new(connector))
            .checkpoint_store(store)
            .build()
            .context("building ingestion engine")
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Events to stream: Transfer, Approval or All
    #[arg(long = "type")]
    pub event_type: String,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Write server-sent-event frames instead of JSON lines
    #[arg(long)]
    pub sse: bool,
}

impl RunArgs {
    fn output(&self) -> Output {
        if self.sse {
            Output::Sse
        } else {
            Output::JsonLines
        }
    }
}

/// Framing of events on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    JsonLines,
    Sse,
}

/// Write one event and flush.
pub fn write_frame<W: Write>(out: &mut W, event: &NormalizedEvent, output: Output) -> Result<()> {
    let json = serde_json::to_string(event)?;
    match output {
        Output::JsonLines => writeln!(out, "{json}")?,
        Output::Sse => write!(out, "data: {json}\n\n")?,
    }
    out.flush()?;
    Ok(())
}

pub async fn run(
    args: RunArgs,
    checkpoint_url: &str,
    store_options: &StoreOptions,
    stream_id: &str,
) -> Result<()> {
    let filter = KindFilter::from_param(Some(&args.event_type))?;
    let output = args.output();

    let engine = args
        .engine
        .build_engine(checkpoint_url, store_options, stream_id)
        .await?;

    // subscribe before the engine starts so the first back-filled block is seen
    let dispatcher = SubscriptionDispatcher::new(engine.router().clone());
    let session = dispatcher.open(filter)?;
    let handle = engine.spawn();
    tracing::info!(filter = %filter, "streaming to stdout");

    let mut state = handle.state_watch();
    let finished = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received, shutting down"),
            _ = state.wait_for(|s| *s == EngineState::Stopped) => {}
        }
    };

    let stdout = std::io::stdout();
    let end = session
        .pump(finished, |event| write_frame(&mut stdout.lock(), event, output))
        .await;

    let metrics = handle.metrics();
    let result = handle.stop().await;
    tracing::info!(
        end = ?end,
        events = metrics.events_emitted,
        skipped = metrics.malformed_skipped,
        reconnections = metrics.reconnections,
        "chainstream stopped"
    );
    result.context("ingestion engine failed")?;

    if end == SessionEnd::Overflowed {
        anyhow::bail!("output could not keep up; increase --capacity");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstream_core::{EventFields, EventKind};

    fn approval() -> NormalizedEvent {
        NormalizedEvent {
            kind: EventKind::Approval,
            position: 42,
            sequence_hint: "0xabc:0000000007".into(),
            fields: EventFields::Approval {
                owner: "0x1111111111111111111111111111111111111111".into(),
                spender: "0x2222222222222222222222222222222222222222".into(),
                amount: "1000".into(),
            },
        }
    }

    fn args() -> RunArgs {
        RunArgs {
            event_type: "All".into(),
            engine: EngineArgs {
                rpc_url: "ws://localhost:8546".into(),
                token: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".into(),
                batch_size: None,
                heartbeat_ms: None,
                reconnect_delay_ms: Some(1_000),
                timeout_ms: None,
                no_gap_backfill: true,
                capacity: None,
            },
            sse: false,
        }
    }

    #[test]
    fn json_lines_frame() {
        let mut out = Vec::new();
        write_frame(&mut out, &approval(), Output::JsonLines).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["kind"], "Approval");
        assert_eq!(value["position"], 42);
        assert_eq!(value["sequenceHint"], "0xabc:0000000007");
        assert_eq!(value["fields"]["spender"], "0x2222222222222222222222222222222222222222");
    }

    #[test]
    fn sse_frame() {
        let mut out = Vec::new();
        write_frame(&mut out, &approval(), Output::Sse).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("}\n\n"));
    }

    #[test]
    fn flags_override_engine_defaults() {
        let config = args().engine.engine_config("usdc");
        let defaults = EngineConfig::default();
        assert_eq!(config.stream_id, "usdc");
        assert_eq!(config.reconnect_delay_ms, 1_000);
        assert_eq!(config.batch_size, defaults.batch_size);
        assert_eq!(config.heartbeat_interval_ms, defaults.heartbeat_interval_ms);
        assert!(!config.backfill_on_reconnect);
    }

    #[test]
    fn output_follows_sse_flag() {
        let mut a = args();
        assert_eq!(a.output(), Output::JsonLines);
        a.sse = true;
        assert_eq!(a.output(), Output::Sse);
    }

    #[tokio::test]
    async fn unknown_type_fails_before_connecting() {
        let mut a = args();
        a.event_type = "transfer".into();
        let err = run(a, "memory://", &StoreOptions::default(), "usdc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid event type 'transfer'"));
    }
}
