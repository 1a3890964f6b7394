/*!
Binary waveform stream server.

While a client is connected the server captures back to back and writes one
waveform frame per capture. A failed capture or a failed write ends the
session; the controller keeps its configuration for the next client.
*/

use std::net::SocketAddr;
use std::sync::Arc;

use shared::{Result, ScopeError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::controller::{AcquisitionController, Capture};

/// Serves the waveform stream, one client at a time
pub struct StreamServer {
    listener: TcpListener,
    controller: Arc<AcquisitionController>,
}

impl StreamServer {
    pub fn new(listener: TcpListener, controller: Arc<AcquisitionController>) -> Self {
        Self { listener, controller }
    }

    /// Accept and serve clients until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => accepted?,
            };
            info!("📡 Waveform: connected with {}", peer);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.serve_session(stream, peer) => {}
            }
        }

        info!("Waveform server stopped");
        Ok(())
    }

    /// Stream frames until the client goes away or a capture fails
    async fn serve_session(&self, mut stream: TcpStream, peer: SocketAddr) {
        let mut frames = 0u64;
        let outcome = loop {
            let capture = match self.acquire().await {
                Ok(capture) => capture,
                Err(e) => break Err(e),
            };

            let frame = capture.to_frame().encode();
            if let Err(e) = stream.write_all(&frame).await {
                // broken pipe / reset: the client left
                debug!("Waveform write failed: {}", e);
                break Ok(());
            }
            frames += 1;
            trace!("Waveform: frame {} sent to {} ({} bytes)", frames, peer, frame.len());
        };

        match outcome {
            Ok(()) => info!("Waveform: {} disconnected after {} frames", peer, frames),
            Err(e) => warn!("Waveform: session with {} ended after {} frames: {}", peer, frames, e),
        }
    }

    /// Run one capture on the blocking pool; USB transfers block
    async fn acquire(&self) -> Result<Capture> {
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || controller.acquire())
            .await
            .map_err(|e| ScopeError::capture(format!("capture task failed: {}", e)))?
    }
}
