//! Per-connection session server.
//!
//! A [`SessionServer`] composes one connection's outbox, the dispatcher
//! loops, and a set of named services. Services registered *active*
//! participate in the idle-timeout reset; *passive* services (heartbeat) do
//! not, so a client sending only keep-alives still times out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::dispatch::{self, BinaryClaims, CHANNEL_CAPACITY};
use crate::service::Service;
use crate::transport::{MessageSource, Outbox};

/// How often the idle check runs. Deliberately a coarse poll rather than a
/// per-frame timer reset; the timer must not wake for every byte of PTY
/// output.
const IDLE_TICK: Duration = Duration::from_secs(10);

pub struct SessionServer {
    outbox: Outbox,
    idle_timeout: Duration,
    services: HashMap<&'static str, Arc<dyn Service>>,
    /// Registration order, for deterministic cleanup.
    order: Vec<&'static str>,
    active: HashSet<&'static str>,
    claims: BinaryClaims,
    claims_rx: mpsc::UnboundedReceiver<tokio::sync::oneshot::Sender<bytes::Bytes>>,
}

impl SessionServer {
    pub fn new(outbox: Outbox, idle_timeout: Duration) -> Self {
        let (claims, claims_rx) = dispatch::claim_queue();
        Self {
            outbox,
            idle_timeout,
            services: HashMap::new(),
            order: Vec::new(),
            active: HashSet::new(),
            claims,
            claims_rx,
        }
    }

    /// Handle services use to claim binary frames on this connection.
    pub fn binary_claims(&self) -> BinaryClaims {
        self.claims.clone()
    }

    /// Register a service whose inbound traffic resets the idle timer.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        let name = service.name();
        if self.insert(service) {
            self.active.insert(name);
        }
    }

    /// Register a service that does not keep the session alive.
    pub fn register_passive(&mut self, service: Arc<dyn Service>) {
        self.insert(service);
    }

    fn insert(&mut self, service: Arc<dyn Service>) -> bool {
        let name = service.name();
        if self.services.contains_key(name) {
            tracing::warn!("service {name} already registered");
            return false;
        }
        self.services.insert(name, service);
        self.order.push(name);
        true
    }

    /// Run the session to completion: dispatch frames until the connection
    /// dies (peer close, I/O error, idle timeout, or a service-requested
    /// close), then tear every service down exactly once.
    pub async fn serve(mut self, source: Box<dyn MessageSource>) {
        let cancel = self.outbox.cancel_token();
        let last_active = Arc::new(Mutex::new(Instant::now()));

        let idle_task = tokio::spawn(idle_watchdog(
            last_active.clone(),
            self.idle_timeout,
            self.outbox.clone(),
        ));

        let (text_tx, mut text_rx) = mpsc::channel::<crate::protocol::Envelope>(CHANNEL_CAPACITY);
        let (binary_tx, binary_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let binary_task = tokio::spawn(dispatch::route_binary(
            self.claims_rx,
            binary_rx,
            cancel.clone(),
        ));

        let services = self.services.clone();
        let active = std::mem::take(&mut self.active);
        let touch = last_active.clone();
        let text_task = tokio::spawn(async move {
            while let Some(envelope) = text_rx.recv().await {
                if active.contains(envelope.service.as_str()) {
                    *touch.lock() = Instant::now();
                }
                // Unknown service names are silently ignored.
                if let Some(service) = services.get(envelope.service.as_str()) {
                    service
                        .handle(&envelope.id, &envelope.action, envelope.data)
                        .await;
                }
            }
        });

        let cause = dispatch::read_loop(source, text_tx, binary_tx, cancel.clone()).await;
        tracing::debug!("session read loop ended: {cause}");
        cancel.cancel();

        let _ = text_task.await;
        let _ = binary_task.await;
        idle_task.abort();

        for name in &self.order {
            if let Some(service) = self.services.get(name) {
                service.cleanup(&cause).await;
            }
        }

        self.outbox.shutdown_sink().await;
    }
}

async fn idle_watchdog(last_active: Arc<Mutex<Instant>>, timeout: Duration, outbox: Outbox) {
    let mut ticker = tokio::time::interval(IDLE_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if last_active.lock().elapsed() > timeout {
            tracing::info!("idle timeout exceeded, closing connection");
            outbox.close();
            return;
        }
    }
}
