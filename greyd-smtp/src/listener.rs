//! SMTP listener: accepts peers and drives each connection's state machine
//! from socket readiness, the stutter timer, and the inactivity deadline.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use greyd_blacklist::Registry;
use greyd_common::Signal;
use greyd_common::config::Config;
use greyd_common::pipe::GreyEvent;
use greyd_common::internal;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::SessionError;
use crate::con::{Con, GreydState};

/// Readiness-driven adapter: `try_read`/`try_write` give the non-blocking
/// semantics the state machine expects.
struct NbStream(Arc<TcpStream>);

impl Read for NbStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for NbStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn lock(state: &Mutex<GreydState>) -> std::sync::MutexGuard<'_, GreydState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Listener {
    socket: SocketAddr,
    config: Arc<Config>,
    registry: Arc<Registry>,
    state: Arc<Mutex<GreydState>>,
    grey_out: mpsc::UnboundedSender<GreyEvent>,
}

impl Listener {
    pub fn new(
        socket: SocketAddr,
        config: Arc<Config>,
        registry: Arc<Registry>,
        state: Arc<Mutex<GreydState>>,
        grey_out: mpsc::UnboundedSender<GreyEvent>,
    ) -> Self {
        Self {
            socket,
            config,
            registry,
            state,
            grey_out,
        }
    }

    pub async fn serve(
        &self,
        shutdown: broadcast::Sender<Signal>,
    ) -> Result<(), SessionError> {
        let listener =
            TcpListener::bind(self.socket)
                .await
                .map_err(|source| SessionError::BindFailed {
                    address: self.socket.to_string(),
                    source,
                })?;
        self.serve_with(listener, shutdown).await
    }

    /// Serve on an already-bound socket; tests bind ephemeral ports
    /// themselves.
    pub async fn serve_with(
        &self,
        listener: TcpListener,
        shutdown: broadcast::Sender<Signal>,
    ) -> Result<(), SessionError> {
        internal!(level = INFO, "smtp listener started on {}", self.socket);

        let mut receiver = shutdown.subscribe();
        let mut sessions = Vec::new();

        loop {
            tokio::select! {
                sig = receiver.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(
                            level = INFO,
                            "shutdown requested on {}, draining sessions",
                            self.socket
                        );
                        for session in sessions {
                            let _ = session.await;
                        }
                        return Ok(());
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection.map_err(SessionError::AcceptFailed)?;

                    let at_capacity = {
                        let gs = lock(&self.state);
                        gs.clients >= gs.max_cons
                    };
                    if at_capacity {
                        internal!(level = DEBUG, "refusing connection from {peer}, client cap reached");
                        continue;
                    }

                    sessions.push(tokio::spawn(drive(
                        stream,
                        peer,
                        Arc::clone(&self.config),
                        Arc::clone(&self.registry),
                        Arc::clone(&self.state),
                        self.grey_out.clone(),
                        shutdown.subscribe(),
                    )));
                    sessions.retain(|session| !session.is_finished());
                }
            }
        }
    }
}

async fn drive(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    registry: Arc<Registry>,
    state: Arc<Mutex<GreydState>>,
    grey_out: mpsc::UnboundedSender<GreyEvent>,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    let dst = stream.local_addr().ok().map(|addr| addr.ip());
    let stream = Arc::new(stream);
    let timeout = config.timeout;

    let mut con = {
        let mut gs = lock(&state);
        Con::new(
            NbStream(Arc::clone(&stream)),
            peer.ip(),
            dst,
            &config,
            &registry,
            &mut gs,
            Utc::now().timestamp(),
        )
    };

    while !con.done() {
        let now = Utc::now().timestamp();

        if con.has_output() {
            if con.w > now {
                // Stutter pacing; wait out the inter-byte delay.
                let delay = Duration::from_secs((con.w - now).max(1) as u64);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    sig = shutdown.recv() => {
                        if matches!(sig, Ok(Signal::Shutdown)) {
                            break;
                        }
                    }
                }
                continue;
            }
            if stream.writable().await.is_err() {
                break;
            }
            let gs = *lock(&state);
            con.handle_write(now, &gs);
        } else {
            if con.past_deadline(now, timeout) {
                internal!(level = DEBUG, "closing idle connection from {peer}");
                break;
            }
            let remaining = Duration::from_secs((timeout - (now - con.r)).max(1) as u64);
            tokio::select! {
                ready = stream.readable() => {
                    if ready.is_err() {
                        break;
                    }
                    con.handle_read(Utc::now().timestamp());
                    for event in con.take_events() {
                        if grey_out.send(event).is_err() {
                            internal!(level = WARN, "grey pipe closed, dropping event");
                        }
                    }
                }
                () = tokio::time::sleep(remaining) => {}
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        break;
                    }
                }
            }
        }
    }

    {
        let mut gs = lock(&state);
        con.close(&mut gs);
    }
    if con.had_error() {
        internal!(level = DEBUG, "connection from {peer} closed after protocol error");
    } else {
        internal!(level = DEBUG, "connection from {peer} finished");
    }
}
