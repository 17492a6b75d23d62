//! Listener lifecycle
//!
//! [`ProxyServer`] owns the accept loop. Changing the port binds the new
//! listener first and only then stops the old loop, so a failed bind leaves the
//! proxy serving where it was. Connections already accepted are never touched
//! by a port change; they finish on their own.

pub mod dispatcher;

use crate::error::{Error, Result};
pub use dispatcher::Dispatcher;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
  local_addr: SocketAddr,
  stop: oneshot::Sender<()>,
  task: JoinHandle<()>,
}

pub struct ProxyServer {
  dispatcher: Arc<Dispatcher>,
  host: IpAddr,
  running: Mutex<Option<Running>>,
  /// Serializes start / rebind / shutdown
  lifecycle: tokio::sync::Mutex<()>,
}

impl ProxyServer {
  pub fn new(dispatcher: Arc<Dispatcher>, host: IpAddr) -> Self {
    Self {
      dispatcher,
      host,
      running: Mutex::new(None),
      lifecycle: tokio::sync::Mutex::new(()),
    }
  }

  /// Address of the active listener
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.running.lock().as_ref().map(|r| r.local_addr)
  }

  pub fn is_running(&self) -> bool {
    self.running.lock().is_some()
  }

  /// Start listening on `port` (0 picks a free one). Replaces a running listener.
  pub async fn start(&self, port: u16) -> Result<SocketAddr> {
    self.rebind(port).await
  }

  /// Bind `port`, then retire the previous listener
  pub async fn rebind(&self, port: u16) -> Result<SocketAddr> {
    let _guard = self.lifecycle.lock().await;
    let addr = SocketAddr::new(self.host, port);
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::other(format!("Failed to bind to {}: {}", addr, e)))?;
    let local_addr = listener.local_addr()?;
    let (stop, stopped) = oneshot::channel();
    let task = tokio::spawn(accept_loop(listener, self.dispatcher.clone(), stopped));
    let previous = self.running.lock().replace(Running {
      local_addr,
      stop,
      task,
    });
    tracing::info!("[proxy] listening on {}", local_addr);
    if let Some(previous) = previous {
      retire(previous).await;
    }
    Ok(local_addr)
  }

  /// Stop accepting; in-flight connections keep running
  pub async fn shutdown(&self) {
    let _guard = self.lifecycle.lock().await;
    let previous = self.running.lock().take();
    if let Some(previous) = previous {
      retire(previous).await;
    }
  }
}

async fn retire(running: Running) {
  let _ = running.stop.send(());
  if let Err(e) = running.task.await {
    tracing::error!("[proxy] accept loop on {} ended abnormally: {}", running.local_addr, e);
  }
  tracing::info!("[proxy] stopped listening on {}", running.local_addr);
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, mut stop: oneshot::Receiver<()>) {
  loop {
    tokio::select! {
      _ = &mut stop => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          let dispatcher = dispatcher.clone();
          tokio::spawn(async move {
            if let Err(e) = dispatcher.serve_connection(stream, peer).await {
              tracing::debug!("[proxy] connection from {} ended with error: {}", peer, e);
            }
          });
        }
        Err(e) => tracing::error!("[proxy] Failed to accept connection: {}", e),
      }
    }
  }
}
