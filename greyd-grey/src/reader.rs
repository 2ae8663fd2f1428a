//! The grey reader: drains framed events from the pipe and applies them to
//! the database. The pipe is the linearisation point; events are applied
//! strictly in arrival order.

use std::sync::Arc;

use chrono::Utc;
use greyd_db::Handle;
use greyd_sync::SyncEngine;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::greylister::{Broadcast, Greylister};
use crate::GreyError;

/// Replicate one local mutation to sync peers.
pub async fn broadcast(sync: &SyncEngine, action: &Broadcast, now: i64) {
    match action {
        Broadcast::Grey { ip, from, to, helo } => sync.send_grey(now, ip, from, to, helo).await,
        Broadcast::White { ip, expire, delete } => {
            sync.send_white(ip, now, *expire, *delete).await;
        }
        Broadcast::Trapped { ip, expire, delete } => {
            sync.send_trapped(ip, now, *expire, *delete).await;
        }
    }
}

pub struct Reader {
    greylister: Arc<Greylister>,
    db: Arc<Mutex<Handle>>,
    sync: Option<Arc<SyncEngine>>,
}

impl Reader {
    pub fn new(
        greylister: Arc<Greylister>,
        db: Arc<Mutex<Handle>>,
        sync: Option<Arc<SyncEngine>>,
    ) -> Self {
        Self {
            greylister,
            db,
            sync,
        }
    }

    /// Consume the pipe until EOF. A database failure drops the offending
    /// event and carries on; a framing error is fatal to the reader.
    pub async fn run<R>(self, pipe: R) -> Result<(), GreyError>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(pipe).lines();
        let mut parser = greyd_common::pipe::FrameParser::new();

        while let Some(line) = lines.next_line().await? {
            let event = match parser.feed_line(&line)? {
                Some(event) => event,
                None => continue,
            };

            let now = Utc::now().timestamp();
            let applied = {
                let mut db = self.db.lock().await;
                self.greylister.apply(&mut db, &event, now)
            };

            match applied {
                Ok(broadcasts) => {
                    if let Some(sync) = &self.sync {
                        for action in &broadcasts {
                            broadcast(sync, action, now).await;
                        }
                    }
                }
                Err(GreyError::Db(err)) => {
                    warn!(%err, ?event, "dropping grey event after database error");
                }
                Err(err) => return Err(err),
            }
        }

        debug!("grey pipe reached EOF");
        Ok(())
    }
}
