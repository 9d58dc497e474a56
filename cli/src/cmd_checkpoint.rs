//! `chainstream status` and `chainstream reset`: inspect and clear checkpoints.

use anyhow::{Context, Result};
use serde::Serialize;

use chainstream_core::CheckpointStore;
use chainstream_storage::{open_store_with, StoreOptions};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport<'a> {
    stream_id: &'a str,
    last_processed_position: Option<u64>,
    next_block: Option<u64>,
}

async fn report<'a>(store: &dyn CheckpointStore, stream_id: &'a str) -> Result<StatusReport<'a>> {
    let position = store
        .get(stream_id)
        .await
        .with_context(|| format!("reading checkpoint '{stream_id}'"))?;
    Ok(StatusReport {
        stream_id,
        last_processed_position: position,
        next_block: position.map(|p| p.saturating_add(1)),
    })
}

pub async fn status(
    checkpoint_url: &str,
    store_options: &StoreOptions,
    stream_id: &str,
    json: bool,
) -> Result<()> {
    let store = open_store_with(checkpoint_url, store_options)
        .await
        .with_context(|| format!("opening checkpoint store '{checkpoint_url}'"))?;
    let report = report(store.as_ref(), stream_id).await;
    let _ = store.close().await;
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    match report.last_processed_position {
        Some(position) => {
            println!("stream:    {stream_id}");
            println!("position:  {position}");
            println!("resumes:   block {}", position.saturating_add(1));
        }
        None => {
            println!("stream:    {stream_id}");
            println!("position:  (none, the next run starts at the chain head)");
        }
    }
    Ok(())
}

pub async fn reset(
    checkpoint_url: &str,
    store_options: &StoreOptions,
    stream_id: &str,
) -> Result<()> {
    let store = open_store_with(checkpoint_url, store_options)
        .await
        .with_context(|| format!("opening checkpoint store '{checkpoint_url}'"))?;
    let previous = store.get(stream_id).await.ok().flatten();
    let deleted = store
        .delete(stream_id)
        .await
        .with_context(|| format!("deleting checkpoint '{stream_id}'"));
    let _ = store.close().await;
    deleted?;

    tracing::info!(stream_id, previous, "checkpoint reset");
    match previous {
        Some(position) => println!("checkpoint '{stream_id}' cleared (was {position})"),
        None => println!("checkpoint '{stream_id}' was not set"),
    }
    Ok(())
}
