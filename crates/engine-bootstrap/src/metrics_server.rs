//! A deliberately minimal `/metrics` text endpoint (spec §11 "Metrics"):
//! the engine has no HTTP surface of its own, so this hand-rolls just
//! enough HTTP/1.1 to satisfy a Prometheus scrape rather than pulling in a
//! full web framework for one route.

use crate::metrics::Metrics;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::warn;

pub async fn serve(metrics: Arc<Metrics>, port: u16, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(%err, port, "metrics endpoint failed to bind, metrics will not be scrapeable");
            return;
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((mut socket, _)) = accepted else { continue };
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    // Best-effort: drain whatever the client sent so far and
                    // ignore its contents — every request gets the same body.
                    let _ = socket.read(&mut buf).await;
                    let body = metrics.encode_text();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
