//! Daemon wiring: the listener, the grey pipe, the reader, the periodic
//! scan, the sync receiver and signal handling, assembled from the
//! subsystem crates.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use greyd_blacklist::Registry;
use greyd_common::config::Config;
use greyd_common::pipe::GreyEvent;
use greyd_common::{Signal, internal};
use greyd_db::Handle;
use greyd_fw::FwDriver;
use greyd_grey::reader::broadcast;
use greyd_grey::{Greylister, Reader, scan_once};
use greyd_smtp::{GreydState, Listener};
use greyd_sync::SyncEngine;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast as tokio_broadcast, mpsc};

/// Byte capacity of the in-process grey pipe.
const PIPE_CAPACITY: usize = 16 * 1024;

/// Funnel every producer's events through the framed pipe encoding; the
/// pipe is the linearisation point for database mutations.
async fn pipe_writer(mut events: mpsc::UnboundedReceiver<GreyEvent>, mut pipe: DuplexStream) {
    while let Some(event) = events.recv().await {
        if pipe.write_all(event.encode().as_bytes()).await.is_err() {
            internal!(level = WARN, "grey pipe writer closed");
            return;
        }
    }
}

async fn scan_loop(
    greylister: Arc<Greylister>,
    db: Arc<tokio::sync::Mutex<Handle>>,
    mut fw: Box<dyn FwDriver>,
    sync: Option<Arc<SyncEngine>>,
    interval: i64,
    shutdown: tokio_broadcast::Sender<Signal>,
) {
    let mut receiver = shutdown.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1) as u64));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now().timestamp();
                let emit = {
                    let mut db = db.lock().await;
                    scan_once(&greylister, &mut db, now)
                };
                match emit {
                    Ok(emit) => {
                        for message in &emit.messages {
                            if let Err(err) = fw.apply(message) {
                                internal!(level = WARN, "firewall update failed: {err}");
                            }
                        }
                        if let Some(sync) = &sync {
                            for action in &emit.broadcasts {
                                broadcast(sync, action, now).await;
                            }
                        }
                    }
                    Err(err) => internal!(level = WARN, "database scan failed: {err}"),
                }
            }
            sig = receiver.recv() => {
                if matches!(sig, Ok(Signal::Shutdown)) {
                    return;
                }
            }
        }
    }
}

async fn sync_recv_loop(
    sync: Arc<SyncEngine>,
    grey_out: mpsc::UnboundedSender<GreyEvent>,
    shutdown: tokio_broadcast::Sender<Signal>,
) {
    let mut receiver = shutdown.subscribe();
    loop {
        tokio::select! {
            received = sync.recv_events() => {
                match received {
                    Ok(events) => {
                        for event in events {
                            if grey_out.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => internal!(level = WARN, "sync receive failed: {err}"),
                }
            }
            sig = receiver.recv() => {
                if matches!(sig, Ok(Signal::Shutdown)) {
                    return;
                }
            }
        }
    }
}

async fn signal_loop(
    config_path: Option<PathBuf>,
    registry: Arc<Registry>,
    shutdown: tokio_broadcast::Sender<Signal>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            internal!(level = ERROR, "cannot install SIGHUP handler: {err}");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            internal!(level = ERROR, "cannot install SIGTERM handler: {err}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                // Rebuild the blacklists; in-flight connections keep their
                // old references until they close.
                let Some(path) = &config_path else {
                    internal!(level = WARN, "reload requested but no configuration file to re-read");
                    continue;
                };
                match Config::load(path) {
                    Ok(config) => match registry.rebuild(&config.blacklists) {
                        Ok(()) => internal!(level = INFO, "{} blacklists reloaded", registry.len()),
                        Err(err) => internal!(level = WARN, "blacklist reload failed, keeping old set: {err}"),
                    },
                    Err(err) => internal!(level = WARN, "configuration reload failed: {err}"),
                }
                let _ = shutdown.send(Signal::Reload);
            }
            _ = terminate.recv() => {
                internal!(level = INFO, "shutdown signal received");
                let _ = shutdown.send(Signal::Shutdown);
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                internal!(level = INFO, "interrupt received");
                let _ = shutdown.send(Signal::Shutdown);
                return;
            }
        }
    }
}

/// Assemble and run the daemon until shutdown.
pub async fn run(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let registry = Arc::new(Registry::from_config(&config.blacklists)?);
    let state = Arc::new(Mutex::new(GreydState::new(
        config.firewall.max_cons,
        config.firewall.max_black,
    )));

    let sync = SyncEngine::from_config(&config.sync)?.map(Arc::new);

    let (shutdown, _) = tokio_broadcast::channel(8);
    let (grey_tx, grey_rx) = mpsc::unbounded_channel();
    let (pipe_in, pipe_out) = tokio::io::duplex(PIPE_CAPACITY);

    tokio::spawn(pipe_writer(grey_rx, pipe_in));

    if config.grey.enable {
        let fw = greyd_fw::from_config(&config.firewall.driver)?;
        let startup = Utc::now().timestamp();
        let greylister = Arc::new(Greylister::new(&config, startup)?);
        let db = Arc::new(tokio::sync::Mutex::new(Handle::open(&config.database)?));

        let reader = Reader::new(Arc::clone(&greylister), Arc::clone(&db), sync.clone());
        tokio::spawn(async move {
            if let Err(err) = reader.run(pipe_out).await {
                internal!(level = ERROR, "grey reader terminated: {err}");
            }
        });

        tokio::spawn(scan_loop(
            greylister,
            db,
            fw,
            sync.clone(),
            config.grey.db_scan_interval,
            shutdown.clone(),
        ));

        if let Some(sync) = sync.clone() {
            tokio::spawn(sync_recv_loop(sync, grey_tx.clone(), shutdown.clone()));
        }
    }

    tokio::spawn(signal_loop(
        config_path,
        Arc::clone(&registry),
        shutdown.clone(),
    ));

    let socket = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = Listener::new(socket, Arc::clone(&config), registry, state, grey_tx);
    listener.serve(shutdown).await?;

    internal!(level = INFO, "greyd finished");
    Ok(())
}
