use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::metrics::SampleWindow;
use crate::protocol::{self, Reply, Request};
use crate::region::SharedRegion;

/// How many decoded requests may wait for the request loop.
pub const QUEUE_DEPTH: usize = 64;

// ─── Channel plumbing ────────────────────────────────────────────

/// One in-flight request plus the slot its reply goes back through.
#[derive(Debug)]
pub struct Exchange {
    pub request: Request,
    pub reply_to: oneshot::Sender<Reply>,
}

/// Accept producers until shutdown, one task per connection.
/// Every connection funnels into the same single-consumer queue.
/// Connections still open at shutdown are aborted, closing their sockets.
pub async fn accept_loop(
    listener: UnixListener,
    queue: mpsc::Sender<Exchange>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = crate::shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_connection(stream, queue.clone()));
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            // Reap finished connections so the set stays small
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.abort_all();
    while connections.join_next().await.is_some() {}
    debug!("acceptor stopped");
}

/// Read request frames, hand each to the loop, write back its reply.
/// A failure here ends this connection only.
async fn serve_connection(mut stream: UnixStream, queue: mpsc::Sender<Exchange>) {
    loop {
        let request = match protocol::read_request(&mut stream).await {
            Ok(Some(request)) => request,
            // Producer hung up between requests
            Ok(None) => return,
            Err(e) => {
                warn!("receive failed: {e}");
                return;
            }
        };

        let (reply_to, reply) = oneshot::channel();
        if queue.send(Exchange { request, reply_to }).await.is_err() {
            // Request loop has stopped
            return;
        }
        let Ok(reply) = reply.await else {
            return;
        };

        if let Err(e) = protocol::write_reply(&mut stream, &reply).await {
            warn!("reply to pid {} failed: {e}", request.producer_id);
            return;
        }
    }
}

// ─── Request loop ────────────────────────────────────────────────

/// Single consumer of the request queue.
///
/// Idle until an exchange arrives, then Processing until its reply is
/// sent; requests are never pipelined.
pub struct RequestServer {
    window: Arc<SampleWindow>,
    region: Arc<SharedRegion>,
}

impl RequestServer {
    pub fn new(window: Arc<SampleWindow>, region: Arc<SharedRegion>) -> Self {
        Self { window, region }
    }

    /// Handle one request. Any value is accepted, NaN included.
    pub fn handle(&self, request: &Request) -> Reply {
        debug!(
            "received from pid={} value={:.3}",
            request.producer_id, request.value
        );

        self.window.push(request.value);

        // Only the arrival time; the summary fields belong to the publisher.
        if let Err(e) = self.region.touch_received(Utc::now()) {
            warn!("cannot stamp last-received time: {e}");
        }

        Reply::ack(request)
    }

    pub async fn run(
        self,
        mut requests: mpsc::Receiver<Exchange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let exchange = tokio::select! {
                biased;
                _ = crate::shutdown_requested(&mut shutdown) => break,
                next = requests.recv() => match next {
                    Some(exchange) => exchange,
                    None => break,
                },
            };

            let reply = self.handle(&exchange.request);
            if exchange.reply_to.send(reply).is_err() {
                warn!(
                    "pid {} disconnected before its reply",
                    exchange.request.producer_id
                );
            }
        }

        info!("request loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time;

    fn server() -> (RequestServer, Arc<SampleWindow>, Arc<SharedRegion>) {
        let window = Arc::new(SampleWindow::with_capacity(32));
        let region = Arc::new(SharedRegion::anonymous().unwrap());
        (
            RequestServer::new(window.clone(), region.clone()),
            window,
            region,
        )
    }

    #[test]
    fn handle_acks_and_records_the_sample() {
        let (server, window, _) = server();

        let reply = server.handle(&Request::reading(1234, 27.5));
        assert!(reply.as_str().contains("27.5"));
        assert!(reply.as_str().contains("1234"));

        let snap = window.snapshot();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.minimum, 27.5);
        assert_eq!(snap.maximum, 27.5);
    }

    #[test]
    fn handle_touches_only_the_received_stamp() {
        let (server, _, region) = server();
        let before = region.read().unwrap();

        server.handle(&Request::reading(1, 99.0));

        let after = region.read().unwrap();
        assert_eq!(after.count, 0);
        assert_eq!(after.average, 0.0);
        assert_eq!(after.last_updated, before.last_updated);
        assert!(after.last_received >= before.last_received);
    }

    #[test]
    fn extreme_values_are_accepted() {
        let (server, window, _) = server();
        server.handle(&Request::reading(7, -1e300));
        server.handle(&Request::reading(7, f64::INFINITY));
        let snap = window.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.minimum, -1e300);
        assert_eq!(snap.maximum, f64::INFINITY);
    }

    #[tokio::test]
    async fn run_replies_in_order_and_stops_on_shutdown() {
        let (server, window, _) = server();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.run(rx, shutdown));

        for (pid, value) in [(10, 1.0), (11, 2.0), (12, 3.0)] {
            let (reply_to, reply) = oneshot::channel();
            tx.send(Exchange {
                request: Request::reading(pid, value),
                reply_to,
            })
            .await
            .unwrap();
            let reply = reply.await.unwrap();
            assert!(reply.as_str().contains(&format!("pid {pid}")));
        }
        assert_eq!(window.snapshot().average, 2.0);

        stop.send(true).unwrap();
        time::timeout(Duration::from_secs(1), task)
            .await
            .expect("request loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_idle_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idle.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (server, _, _) = server();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (stop, shutdown) = watch::channel(false);
        let looping = tokio::spawn(server.run(rx, shutdown.clone()));
        let acceptor = tokio::spawn(accept_loop(listener, tx, shutdown));

        // One full exchange so the connection is certainly accepted.
        let mut idle = UnixStream::connect(&path).await.unwrap();
        protocol::write_request(&mut idle, &Request::reading(9, 1.0))
            .await
            .unwrap();
        protocol::read_reply(&mut idle).await.unwrap();

        stop.send(true).unwrap();
        time::timeout(Duration::from_secs(1), acceptor)
            .await
            .expect("acceptor did not stop")
            .unwrap();
        looping.await.unwrap();

        // The server side of the idle connection is gone: EOF, not a hang.
        let mut buf = [0u8; 1];
        let n = time::timeout(Duration::from_secs(1), idle.read(&mut buf))
            .await
            .expect("connection left open after shutdown")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn abandoned_exchange_does_not_stop_the_loop() {
        let (server, window, _) = server();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (_stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.run(rx, shutdown));

        let (reply_to, reply) = oneshot::channel();
        drop(reply);
        tx.send(Exchange {
            request: Request::reading(1, 5.0),
            reply_to,
        })
        .await
        .unwrap();

        let (reply_to, reply) = oneshot::channel();
        tx.send(Exchange {
            request: Request::reading(2, 7.0),
            reply_to,
        })
        .await
        .unwrap();
        assert!(reply.await.is_ok());
        assert_eq!(window.snapshot().count, 2);

        // Closing the queue also ends the loop.
        drop(tx);
        time::timeout(Duration::from_secs(1), task)
            .await
            .expect("request loop did not stop")
            .unwrap();
    }
}
