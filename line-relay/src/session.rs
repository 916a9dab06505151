//! One accepted connection and the two pumps that move its lines.
//!
//! The inbound pump reads lines and hands them to the dispatcher as
//! broadcasts; the outbound pump drains the session's queue back onto the
//! socket. They run as separate tasks and share a [`CancellationToken`]: when
//! either one stops it deregisters the session and cancels the token, which
//! stops the other. Both steps are safe to repeat, so it does not matter which
//! pump gets there first or whether both do.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    dispatcher::{DispatcherClosed, DispatcherHandle, SessionEntry, SessionId},
    line::{read_line, write_line},
};

pub struct Session<R, W> {
    id: SessionId,
    peer: SocketAddr,
    reader: R,
    writer: W,
    dispatcher: DispatcherHandle,
    shutdown: CancellationToken,
    max_line_bytes: usize,
}

/// Join handles for a started session's pumps.
pub struct SessionTasks {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl SessionTasks {
    /// Waits until both pumps have exited and the connection is released.
    pub async fn join(self) {
        let (reader, writer) = tokio::join!(self.reader, self.writer);
        for result in [reader, writer] {
            if let Err(err) = result {
                error!(error = ?err, "session pump panicked");
            }
        }
    }
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        reader: R,
        writer: W,
        dispatcher: DispatcherHandle,
        shutdown: CancellationToken,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            id,
            peer,
            reader,
            writer,
            dispatcher,
            shutdown,
            max_line_bytes,
        }
    }

    /// Registers the session with the dispatcher and spawns both pumps.
    pub fn start(self) -> Result<SessionTasks, DispatcherClosed> {
        let Session {
            id,
            peer,
            reader,
            writer,
            dispatcher,
            shutdown,
            max_line_bytes,
        } = self;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        dispatcher.add(SessionEntry {
            id,
            peer,
            outbound: outbound_tx,
        })?;

        let control = Arc::new(SessionControl {
            id,
            peer,
            dispatcher,
            shutdown,
        });

        let reader = tokio::spawn(pump_inbound(
            Arc::clone(&control),
            BufReader::new(reader),
            max_line_bytes,
        ));
        let writer = tokio::spawn(pump_outbound(control, writer, outbound_rx));

        Ok(SessionTasks { reader, writer })
    }
}

/// State shared by a session's two pumps.
///
/// Dropped when the second pump exits, which is also when the last half of
/// the connection goes away.
struct SessionControl {
    id: SessionId,
    peer: SocketAddr,
    dispatcher: DispatcherHandle,
    shutdown: CancellationToken,
}

impl SessionControl {
    fn teardown(&self, pump: &'static str) {
        if self.dispatcher.remove(self.id).is_err() {
            debug!(session = self.id, pump, "dispatcher gone before remove");
        }
        self.shutdown.cancel();
    }
}

impl Drop for SessionControl {
    fn drop(&mut self) {
        debug!(session = self.id, peer = %self.peer, "session closed");
    }
}

async fn pump_inbound<R>(control: Arc<SessionControl>, mut reader: R, max_line_bytes: usize)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = select! {
            biased;
            _ = control.shutdown.cancelled() => break,
            line = read_line(&mut reader, max_line_bytes) => line,
        };

        match line {
            Ok(Some(payload)) => {
                if control.shutdown.is_cancelled() {
                    break;
                }
                info!(
                    session = control.id,
                    peer = %control.peer,
                    payload = %String::from_utf8_lossy(&payload),
                    "receive"
                );
                if control.dispatcher.broadcast(control.id, payload).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(session = control.id, peer = %control.peer, "peer closed the connection");
                break;
            }
            Err(err) => {
                error!(session = control.id, peer = %control.peer, error = %err, "read failed");
                break;
            }
        }
    }

    control.teardown("reader");
}

async fn pump_outbound<W>(
    control: Arc<SessionControl>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let payload = select! {
            biased;
            _ = control.shutdown.cancelled() => break,
            next = outbound.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        debug!(
            session = control.id,
            peer = %control.peer,
            payload = %String::from_utf8_lossy(&payload),
            "send"
        );
        let written = select! {
            biased;
            _ = control.shutdown.cancelled() => break,
            written = write_line(&mut writer, &payload) => written,
        };
        if let Err(err) = written {
            error!(session = control.id, peer = %control.peer, error = %err, "write failed");
            break;
        }
    }

    control.teardown("writer");
}
