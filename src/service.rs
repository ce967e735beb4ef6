use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};

use crate::config::ServiceConfig;
use crate::error::SetupError;
use crate::metrics::{SampleWindow, SummaryPublisher};
use crate::region::SharedRegion;
use crate::server::{self, RequestServer, QUEUE_DEPTH};

/// Everything the collector owns, built once at startup and handed
/// explicitly to the request loop and the publisher.
pub struct Service {
    config: ServiceConfig,
    window: Arc<SampleWindow>,
    region: Arc<SharedRegion>,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl Service {
    /// Create the window, the shared region and the channel endpoint.
    /// Any failure here is fatal to the server. Must be called from
    /// inside a Tokio runtime.
    pub fn start(config: ServiceConfig) -> Result<Self, SetupError> {
        config.validate()?;

        // ── 1. Sample window ────────────────────────────────────
        let window = Arc::new(SampleWindow::new());

        // ── 2. Shared summary region ────────────────────────────
        let region = SharedRegion::create(&config.region_name).map_err(|source| {
            SetupError::Region {
                name: config.region_name.clone(),
                source,
            }
        })?;
        info!("shared region '{}' ready", config.region_name);

        // ── 3. Channel endpoint ─────────────────────────────────
        let socket_path = config.socket_path();
        if socket_path.exists() {
            warn!("removing stale endpoint {}", socket_path.display());
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(source) => {
                let _ = SharedRegion::unlink(&config.region_name);
                return Err(SetupError::Bind {
                    path: socket_path,
                    source,
                });
            }
        };
        info!(
            "'{}' listening at {}",
            config.service_name,
            socket_path.display()
        );

        Ok(Self {
            config,
            window,
            region: Arc::new(region),
            listener,
            socket_path,
        })
    }

    pub fn window(&self) -> Arc<SampleWindow> {
        self.window.clone()
    }

    pub fn region(&self) -> Arc<SharedRegion> {
        self.region.clone()
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Serve until `shutdown` flips, then tear down the endpoint and the
    /// region name.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let Self {
            config,
            window,
            region,
            listener,
            socket_path,
        } = self;

        let (queue, requests) = mpsc::channel(QUEUE_DEPTH);

        let publisher = tokio::spawn(
            SummaryPublisher::new(window.clone(), region.clone(), config.publish_period())
                .run(shutdown.clone()),
        );
        let acceptor = tokio::spawn(server::accept_loop(listener, queue, shutdown.clone()));

        RequestServer::new(window, region).run(requests, shutdown).await;

        let _ = acceptor.await;
        let _ = publisher.await;

        // ── Teardown ────────────────────────────────────────────
        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!("cannot remove {}: {e}", socket_path.display());
        }
        if let Err(e) = SharedRegion::unlink(&config.region_name) {
            warn!("cannot unlink region '{}': {e}", config.region_name);
        }
        info!("'{}' stopped", config.service_name);
    }
}
