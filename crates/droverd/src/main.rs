//! droverd — the Drover manager daemon.
//!
//! Wires the core subsystems together and runs the two transports: the
//! WebSocket p2p transport on `network.port` and the HTTP transport
//! (plus admin surface) on `network.http_port`. All long-running work
//! lives in spawned tasks; main waits on them and on the shutdown
//! signal.

use std::sync::Arc;

use anyhow::{Context, Result};

use drover_core::config::DroverConfig;
use drover_core::crypto::{ManagerIdentity, StructuralVerifier};
use drover_services::{
    ControlLoop, EventBus, FsStore, MessageRouter, PaymentLedger, TaskEngine, WorkerRegistry,
};

mod ws;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = DroverConfig::write_default_if_missing().context("config bootstrap")?;
    let config = DroverConfig::load().context("config load")?;
    tracing::info!(path = %config_path.display(), "configuration loaded");

    let identity = Arc::new(
        ManagerIdentity::load_or_generate(&config.identity.private_key_path)
            .context("identity load")?,
    );
    let peer_id = hex::encode(identity.public);
    tracing::info!(peer_id = %peer_id, "manager identity ready");

    let store: Arc<dyn drover_services::KvStore> =
        Arc::new(FsStore::new(&config.store.root).context("store open")?);
    let events = EventBus::new();

    let registry = Arc::new(
        WorkerRegistry::open(
            store.clone(),
            config.manager.require_access_codes,
            events.clone(),
        )
        .context("registry open")?,
    );
    for code in &config.manager.access_codes {
        registry
            .seed_access_code(code)
            .context("access code seed")?;
    }

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let (accrual_tx, mut accrual_rx) = tokio::sync::mpsc::unbounded_channel();

    let engine = Arc::new(
        TaskEngine::open(
            store.clone(),
            registry.clone(),
            events.clone(),
            outbound_tx,
            accrual_tx,
            config.manager.task_acceptance_secs * 1000,
            config.manager.auto_manage,
        )
        .context("engine open")?,
    );

    let payment_account = config.payment_account_bytes().context("payment account")?;
    let ledger = Arc::new(
        PaymentLedger::open(
            store,
            events.clone(),
            identity.clone(),
            Arc::new(StructuralVerifier),
            config.payments.payment_batch_size,
            payment_account,
        )
        .context("ledger open")?,
    );

    let control = ControlLoop::new(
        engine.clone(),
        events.clone(),
        config.manager.tick_interval_ms,
        config.manager.drain_deadline_secs,
        config.manager.auto_manage,
    );

    let router = Arc::new(MessageRouter::new(
        registry.clone(),
        engine.clone(),
        ledger.clone(),
        drover_services::router::ManagerInfo {
            peer_id: peer_id.clone(),
            require_access_codes: config.manager.require_access_codes,
            announced_addresses: config.network.announce.clone(),
            public_key: identity.public,
        },
    ));

    let sessions = ws::new_session_table();

    // Accrual drain — the one-way path from task completions into the
    // ledger. Confirms back to the engine so the outbox marker clears.
    let accrual_drain = {
        let ledger = ledger.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(accrual) = accrual_rx.recv().await {
                let task_id = accrual.task_id.clone();
                match ledger.accrue(accrual.recipient, accrual.amount, Some(&task_id)) {
                    Ok(_) => engine.mark_accrued(&task_id),
                    Err(e) => {
                        // Marker stays set; the outbox replays on restart.
                        tracing::warn!(task = %task_id, error = %e, "accrual failed");
                    }
                }
            }
        })
    };

    // Outbound writer — delivers engine-originated frames (offers) to
    // the right WebSocket session.
    let outbound_writer = {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            while let Some((peer_id, envelope)) = outbound_rx.recv().await {
                match sessions.get(&peer_id) {
                    Some(tx) => {
                        if tx.send(envelope).is_err() {
                            tracing::warn!(peer = %peer_id, "session writer gone, frame dropped");
                        }
                    }
                    None => {
                        tracing::debug!(peer = %peer_id, "no session for outbound frame");
                    }
                }
            }
        })
    };

    // Cycle tick.
    let tick_task = control.start().expect("control loop started once");

    // WebSocket p2p transport.
    let bind_addr = config
        .network
        .listen
        .first()
        .cloned()
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let ws_server = {
        let state = ws::WsState {
            router: router.clone(),
            registry: registry.clone(),
            sessions: sessions.clone(),
        };
        let addr = bind_addr.clone();
        let port = config.network.port;
        tokio::spawn(async move {
            if let Err(e) = ws::serve(state, &addr, port).await {
                tracing::error!(error = %e, "ws transport failed");
            }
        })
    };

    // HTTP transport + admin surface.
    let http_server = {
        let state = drover_api::ApiState {
            registry: registry.clone(),
            engine: engine.clone(),
            control: control.clone(),
            router: router.clone(),
            peer_id: peer_id.clone(),
            public_key: hex::encode(ledger.public_key()),
            require_access_codes: config.manager.require_access_codes,
            announced_addresses: config.network.announce.clone(),
            start_time: drover_core::now_ms(),
        };
        let addr = bind_addr.clone();
        let port = config.network.http_port;
        let with_admin = config.network.with_admin;
        tokio::spawn(async move {
            if let Err(e) = drover_api::serve(state, &addr, port, with_admin).await {
                tracing::error!(error = %e, "http surface failed");
            }
        })
    };

    tracing::info!(
        p2p_port = config.network.port,
        http_port = config.network.http_port,
        "droverd started"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            control.stop().await;
        }
        r = ws_server => tracing::error!("ws transport exited: {:?}", r),
        r = http_server => tracing::error!("http surface exited: {:?}", r),
        r = accrual_drain => tracing::error!("accrual drain exited: {:?}", r),
        r = outbound_writer => tracing::error!("outbound writer exited: {:?}", r),
        r = tick_task => tracing::error!("control loop exited: {:?}", r),
    }

    Ok(())
}
