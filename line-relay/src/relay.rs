use std::{
    future::Future,
    net::SocketAddr,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::RelayConfig,
    dispatcher::{Dispatcher, DispatcherHandle, Registry, SessionId},
    session::Session,
};

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
    dispatcher: Dispatcher,
    handle: DispatcherHandle,
    shutdown: CancellationToken,
    next_id: SessionId,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let (dispatcher, handle) = Dispatcher::channel();
        Self {
            listener,
            config,
            dispatcher,
            handle,
            shutdown: CancellationToken::new(),
            next_id: 1,
        }
    }

    /// Binds the listening socket. Failing here means the relay never serves.
    pub async fn bind<A>(addr: A, config: RelayConfig) -> Result<Self>
    where
        A: ToSocketAddrs + std::fmt::Debug,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {addr:?}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle onto the relay's dispatcher, mostly useful for inspecting
    /// membership. Holding one keeps the dispatcher alive past shutdown.
    pub fn dispatcher(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            config,
            dispatcher,
            handle,
            shutdown: sessions_shutdown,
            mut next_id,
        } = self;
        let dispatcher_task: JoinHandle<Registry> = tokio::spawn(dispatcher.run());
        tokio::pin!(shutdown);

        let mut backoff = ACCEPT_BACKOFF_START;
        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        backoff = ACCEPT_BACKOFF_START;
                        let id = next_id;
                        next_id += 1;
                        admit(stream, peer, id, &handle, &sessions_shutdown, &config);
                    }
                    Err(err) => {
                        error!(error = %err, retry_in = ?backoff, "failed to accept connection");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                },
            }
        }

        handle_shutdown(listener, handle, sessions_shutdown, dispatcher_task).await
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    handle: &DispatcherHandle,
    shutdown: &CancellationToken,
    config: &RelayConfig,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = %err, "failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let session = Session::new(
        id,
        peer,
        read_half,
        write_half,
        handle.clone(),
        shutdown.child_token(),
        config.max_line_bytes,
    );

    // The pumps run detached; each deregisters itself on exit.
    if let Err(err) = session.start() {
        error!(%peer, error = %err, "could not register session");
    }
}

async fn handle_shutdown(
    listener: TcpListener,
    handle: DispatcherHandle,
    sessions_shutdown: CancellationToken,
    dispatcher_task: JoinHandle<Registry>,
) -> Result<()> {
    drop(listener);
    let online = handle.members().await.map(|members| members.len()).unwrap_or(0);
    info!(online, "relay shutting down");

    sessions_shutdown.cancel();
    drop(handle);

    let registry = dispatcher_task
        .await
        .context("dispatcher task failed")?;
    if !registry.is_empty() {
        warn!(remaining = registry.len(), "sessions still registered after shutdown");
    }
    Ok(())
}
