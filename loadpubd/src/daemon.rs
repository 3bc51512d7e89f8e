//! Wiring of listener, queue, dispatcher and registry.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use loadpub_common::config::DaemonConfig;
use loadpub_store::{SecretSealer, StoreProvider};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::listener::Listener;
use crate::queue::InboundQueue;
use crate::registry::Registry;
use crate::session::SessionSettings;

/// A running receiver.
pub struct Daemon {
    listener: Listener,
    queue: InboundQueue,
    dispatcher: JoinHandle<()>,
}

impl Daemon {
    /// Check the store, bind the listener and start the dispatcher.
    pub async fn start(config: &DaemonConfig, provider: Arc<dyn StoreProvider>) -> Result<Self> {
        Self::start_with(config, provider, |settings| settings).await
    }

    /// Like [`Daemon::start`], letting the caller adjust session settings.
    pub async fn start_with(
        config: &DaemonConfig,
        provider: Arc<dyn StoreProvider>,
        adjust: impl FnOnce(SessionSettings) -> SessionSettings,
    ) -> Result<Self> {
        provider.check().context("persistence store unavailable")?;

        let sealer = SecretSealer::shared().context("failed to initialize secret sealing")?;
        let settings = adjust(SessionSettings::new(&config.retry, sealer));
        let registry = Registry::new(provider, settings, config.sessions.idle_timeout);

        let queue = InboundQueue::new();
        let bind = format!("{}:{}", config.listener.bind, config.listener.port);
        let listener = Listener::start(bind.as_str(), queue.clone(), config.listener.max_line_bytes)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;

        let dispatcher = queue.spawn_consumer(
            config.sessions.max_batch,
            config.sessions.sweep_interval,
            registry,
        )?;

        info!(
            addr = %listener.local_addr(),
            idle_timeout = %humantime::format_duration(config.sessions.idle_timeout),
            "Receiver started"
        );
        Ok(Self {
            listener,
            queue,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn queue(&self) -> &InboundQueue {
        &self.queue
    }

    /// Stop the listener, drain the queue and wait for every session to
    /// finish what it accepted.
    pub async fn shutdown(self) {
        self.listener.stop().await;
        self.queue.close();
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "Dispatcher ended abnormally");
        }
        info!(
            enqueued = self.queue.enqueued(),
            rejected = self.queue.rejected(),
            "Receiver stopped"
        );
    }
}
