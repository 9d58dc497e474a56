//! `chainstream serve`: ingest once, fan events out to HTTP clients.
//!
//! `GET /consume?type=Transfer|Approval|All` answers with a server-sent-event
//! stream of that client's events. A missing or unknown type is a 400.

use std::convert::Infallible;
use std::future::IntoFuture;
use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Router,
};
use clap::Args;
use futures::stream;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};

use chainstream_core::{EngineState, Session, SessionEnd, StreamError, SubscriptionDispatcher};
use chainstream_storage::StoreOptions;

use crate::cmd_run::EngineArgs;

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Clone)]
struct AppState {
    dispatcher: SubscriptionDispatcher,
    buffer: usize,
}

#[derive(Debug, Deserialize)]
struct ConsumeQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// HTTP routes over `dispatcher`. `buffer` bounds the frames queued per
/// connection before the client is dropped as too slow.
pub fn app(dispatcher: SubscriptionDispatcher, buffer: usize) -> Router {
    Router::new()
        .route("/consume", get(consume))
        .with_state(AppState {
            dispatcher,
            buffer: buffer.max(1),
        })
}

async fn consume(State(state): State<AppState>, Query(query): Query<ConsumeQuery>) -> Response {
    let session = match state.dispatcher.open_param(query.kind.as_deref()) {
        Ok(session) => session,
        Err(e @ StreamError::InvalidFilter(_)) => {
            tracing::warn!(error = %e, "consume request rejected");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "could not open session");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let (tx, rx) = mpsc::channel(state.buffer);
    tokio::spawn(forward(session, tx));

    let frames = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });
    Sse::new(frames)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Drive `session` into the connection's frame queue. The connection closing
/// drops the receiver, which ends the session.
async fn forward(session: Session, tx: mpsc::Sender<Event>) -> SessionEnd {
    session
        .pump(tx.closed(), |event| -> Result<()> {
            let frame = Event::default().json_data(event)?;
            tx.try_send(frame).map_err(|e| match e {
                TrySendError::Full(_) => anyhow!("client is not keeping up"),
                TrySendError::Closed(_) => anyhow!("client disconnected"),
            })
        })
        .await
}

pub async fn serve(
    args: ServeArgs,
    checkpoint_url: &str,
    store_options: &StoreOptions,
    stream_id: &str,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;

    let engine = args
        .engine
        .build_engine(checkpoint_url, store_options, stream_id)
        .await?;
    let dispatcher = SubscriptionDispatcher::new(engine.router().clone());
    let buffer = engine.config().subscriber_capacity;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "serving /consume");

    let handle = engine.spawn();
    let mut state = handle.state_watch();

    // open streams never finish on their own, so the server is dropped rather
    // than drained
    let served = tokio::select! {
        result = axum::serve(listener, app(dispatcher, buffer)).into_future() => {
            result.context("http server failed")
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            Ok(())
        }
        _ = state.wait_for(|s| *s == EngineState::Stopped) => Ok(()),
    };

    let metrics = handle.metrics();
    let result = handle.stop().await;
    tracing::info!(
        events = metrics.events_emitted,
        skipped = metrics.malformed_skipped,
        reconnections = metrics.reconnections,
        "chainstream stopped"
    );
    result.context("ingestion engine failed")?;
    served
}
