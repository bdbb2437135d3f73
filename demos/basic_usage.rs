// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cdn-engine usage example.
//!
//! Demonstrates:
//! 1. Starting an engine on SQLite with the in-process KV service
//! 2. Streaming a signed step log over TCP, null-byte framed
//! 3. Waiting for the drainer to complete the item
//! 4. Promoting it to a storage unit and reclaiming the buffer
//! 5. Reading lines back, newest first
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use cdn_engine::config::MemoryConfig;
use cdn_engine::ingest::auth::{StaticAuthority, WorkerIdentity};
use cdn_engine::ingest::jws;
use cdn_engine::ingest::message::WorkerClaim;
use cdn_engine::ingest::{LogMessage, Signature};
use cdn_engine::{
    ApiRef, CdnConfig, CdnEngine, DriverConfig, EngineState, ItemStatus, ItemType, ReadOrder, StorageConfig,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const PORT: u16 = 18090;
const WORKER_KEY: &[u8] = b"demo-session-key";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cdn_engine=info".into()),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let mut config = CdnConfig::default();
    config.catalog_url = format!("sqlite:{}?mode=rwc", dir.path().join("cdn.db").display());
    config.tcp.addr = "127.0.0.1".into();
    config.tcp.port = PORT;
    config.gc.buffer_min_age_secs = 0;
    config.units.storages = vec![StorageConfig::new("archive", DriverConfig::Memory(MemoryConfig::default()))];

    let authority = StaticAuthority::new();
    authority.add_worker(WorkerIdentity {
        id: "w-1".into(),
        name: "demo-worker".into(),
        job_run_id: Some(1),
        hatchery_id: None,
        key: WORKER_KEY.to_vec(),
    });

    let mut engine = CdnEngine::new(config).with_authority(Arc::new(authority));
    engine.start().await?;
    let engine = Arc::new(engine);

    let runner = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });
    let mut state = engine.state_receiver();
    state.wait_for(|s| *s == EngineState::Running).await?;
    println!("engine running on port {}", PORT);

    // ── Stream a step log ────────────────────────────────────────────────
    let signature = Signature {
        project_key: "DEMO".into(),
        workflow_name: "build".into(),
        run_id: 1,
        node_run_id: 1,
        job_id: 1,
        worker: Some(WorkerClaim {
            worker_id: "w-1".into(),
            worker_name: "demo-worker".into(),
            step_name: "compile".into(),
            step_order: 0,
        }),
        ..Default::default()
    };
    let token = jws::sign_hs512(&signature, WORKER_KEY)?;

    let mut stream = TcpStream::connect(("127.0.0.1", PORT)).await?;
    let lines = ["checking out", "compiling 42 crates", "tests passed"];
    for (n, text) in lines.iter().enumerate() {
        let last = n == lines.len() - 1;
        let msg = LogMessage::new(text, 6, &token, n as u64, last);
        let mut frame = serde_json::to_vec(&msg)?;
        frame.push(0);
        stream.write_all(&frame).await?;
    }
    stream.flush().await?;
    drop(stream);

    // ── Wait for completion ──────────────────────────────────────────────
    let hash = ApiRef::Log(signature.log_api_ref()).hash()?;
    let item = loop {
        match engine.get_item(&hash, ItemType::StepLog).await {
            Ok(item) if item.status == ItemStatus::Completed => break item,
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    };
    println!("item {} completed, {} bytes, sha512 {}", item.id, item.size(), item.hash().unwrap_or("-"));

    // ── Promote and reclaim ──────────────────────────────────────────────
    let report = engine.sync_engine()?.sync_unit("archive").await?;
    println!("sync: {:?}", report);
    let reclaimed = engine.garbage_collector()?.reclaim_buffer().await?;
    println!("buffer entries reclaimed: {}", reclaimed);

    // ── Read back ────────────────────────────────────────────────────────
    for line in engine.get_log_lines(&item.id, 0, 10, ReadOrder::Descending).await? {
        print!("  {}", line);
    }
    println!("cache: {:?}", engine.cache_status().await?);

    for unit in engine.list_units().await? {
        println!("unit {} configured={} buffer={}", unit.name, unit.configured, unit.is_buffer);
    }

    engine.shutdown().await;
    runner.await??;
    Ok(())
}
