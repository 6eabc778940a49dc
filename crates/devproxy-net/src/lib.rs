//! Ties the interception pipeline's pieces together: certificate minting,
//! the CONNECT/tunnel listener, outbound forwarding, and the inactivity
//! watchdog. `devproxy-cli` is the only caller — it owns configuration and
//! plugin construction; this crate only knows how to run the wire protocol.

mod ca;
mod forward;
mod pipeline;
mod tls;
mod tunnel;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use devproxy_core::{Dispatcher, GlobalStore, PerRequestStore, WatchSet};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use ca::RootCa;
pub use forward::Forwarder;
pub use pipeline::{Pipeline, Watchdog};
pub use tls::CertificateMinter;

/// Default inactivity window before the proxy shuts itself down.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// A bound, ready-to-run proxy instance. Built once per process from a
/// `Dispatcher` (plugins already registered) and a `WatchSet` (already
/// compiled from configuration).
pub struct ProxyServer {
    pipeline: Arc<Pipeline>,
    minter: Arc<CertificateMinter>,
    watchdog: Arc<Watchdog>,
    listener: TcpListener,
}

impl ProxyServer {
    pub async fn bind(
        ip: IpAddr,
        port: u16,
        dispatcher: Dispatcher,
        watch: WatchSet,
        idle_timeout: Duration,
        drain_grace: Duration,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((ip, port)).await?;
        let root = RootCa::load_or_generate().await?;
        let minter = Arc::new(CertificateMinter::new(root));
        let forwarder = Forwarder::new()?;
        let global = Arc::new(GlobalStore::new());
        let per_request = Arc::new(PerRequestStore::new());
        let watchdog = Watchdog::new(idle_timeout, drain_grace);
        let pipeline = Arc::new(Pipeline::new(
            dispatcher,
            watch,
            global,
            per_request,
            forwarder,
            watchdog.clone(),
        ));
        Ok(Self { pipeline, minter, watchdog, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until the inactivity watchdog fires or `external_cancel` does,
    /// whichever comes first, then returns once in-flight connections have
    /// had their drain grace period.
    pub async fn run(self, external_cancel: CancellationToken) {
        let cancel = self.watchdog.cancellation();
        let watchdog = self.watchdog.clone();
        let watchdog_task = tokio::spawn(async move { watchdog.run().await });

        tokio::select! {
            _ = tunnel::serve(self.listener, self.pipeline, self.minter, cancel.clone()) => {}
            _ = external_cancel.cancelled() => {
                cancel.cancel();
            }
        }
        let _ = watchdog_task.await;
    }
}
