//! Local tunnel listeners.
//!
//! A forwarder owns one TCP listener per requested port on the tunnel's
//! loopback address and proxies every accepted connection to the same port
//! on the bound pod over a cluster port-forward stream. It runs until its
//! stop token cancels or a port-forward dial fails; the owner turns a
//! failure into a recreate request.

use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::k8s::{ClusterApi, ClusterError, PodStream};
use crate::worker::PodRef;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("accept on {addr} failed: {source}")]
    Accept {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("port-forward dial for '{pod}' port {port} failed: {source}")]
    Dial {
        pod: String,
        port: u16,
        source: ClusterError,
    },
}

/// A set of bound listeners, ready to forward.
#[derive(Debug)]
pub struct Forwarder {
    listeners: Vec<(TcpListener, u16)>,
}

impl Forwarder {
    /// Binds a listener on `ip` for every requested port.
    pub async fn bind(ip: Ipv4Addr, ports: &[u16]) -> Result<Self, TunnelError> {
        let mut listeners = Vec::with_capacity(ports.len());
        for &port in ports {
            let addr = SocketAddr::from((ip, port));
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| TunnelError::Bind { addr, source })?;
            debug!("Listening on {}", addr);
            listeners.push((listener, port));
        }
        Ok(Self { listeners })
    }

    /// Serves accepted connections until `stop` cancels or a port-forward
    /// dial fails. Copy errors on established connections are logged and
    /// do not stop the forwarder.
    ///
    /// The listeners are wound down and released before this returns, so
    /// the address can be rebound immediately afterwards.
    pub async fn forward<C: ClusterApi>(
        self,
        cluster: C,
        pod: PodRef,
        stop: CancellationToken,
    ) -> Result<(), TunnelError> {
        let inner = stop.child_token();
        let (err_tx, mut err_rx) = mpsc::channel::<TunnelError>(1);

        let mut tasks = Vec::with_capacity(self.listeners.len());
        for (listener, port) in self.listeners {
            tasks.push(tokio::spawn(serve_listener(
                listener,
                port,
                cluster.clone(),
                pod.clone(),
                inner.clone(),
                err_tx.clone(),
            )));
        }
        drop(err_tx);

        let result = tokio::select! {
            _ = stop.cancelled() => Ok(()),
            err = err_rx.recv() => match err {
                Some(err) => Err(err),
                None => Ok(()),
            },
        };

        inner.cancel();
        for task in tasks {
            let _ = task.await;
        }
        result
    }
}

/// Owner-side handle to a running forward task.
#[derive(Debug)]
pub struct ForwarderHandle {
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ForwarderHandle {
    pub fn new(stop: CancellationToken, task: tokio::task::JoinHandle<()>) -> Self {
        Self { stop, task }
    }

    /// Stops the forwarder and waits until its listeners are released.
    /// Cancelling an already-stopped forwarder is fine.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

async fn serve_listener<C: ClusterApi>(
    listener: TcpListener,
    port: u16,
    cluster: C,
    pod: PodRef,
    stop: CancellationToken,
    err_tx: mpsc::Sender<TunnelError>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(source) => {
                    let addr = listener.local_addr().unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
                    let _ = err_tx.send(TunnelError::Accept { addr, source }).await;
                    return;
                }
            },
        };

        debug!("Accepted {} for '{}' port {}", peer, pod.key(), port);

        // the dial happens here, not in the proxy task, so a dead pod
        // stops the forwarder instead of failing connections one by one
        let upstream = match cluster.portforward(&pod, port).await {
            Ok(stream) => stream,
            Err(source) => {
                let _ = err_tx
                    .send(TunnelError::Dial {
                        pod: pod.key(),
                        port,
                        source,
                    })
                    .await;
                return;
            }
        };

        tokio::spawn(proxy(stream, upstream, pod.key(), port));
    }
}

/// Copies bytes both ways until either side closes.
async fn proxy(mut local: TcpStream, mut upstream: PodStream, pod: String, port: u16) {
    match tokio::io::copy_bidirectional(&mut local, &mut upstream).await {
        Ok((to_pod, from_pod)) => {
            debug!(
                "Connection to '{}' port {} closed ({} bytes out, {} bytes in)",
                pod, port, to_pod, from_pod
            );
        }
        Err(e) => {
            debug!("Connection to '{}' port {} errored: {}", pod, port, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{free_port, FakeCluster};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TEST_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    #[tokio::test]
    async fn test_forward_roundtrip() {
        let cluster = FakeCluster::new();
        let pod = PodRef::new("web-1", "default");
        let port = free_port();

        let forwarder = Forwarder::bind(TEST_IP, &[port]).await.unwrap();
        let stop = CancellationToken::new();
        let task = tokio::spawn(forwarder.forward(cluster.clone(), pod, stop.clone()));

        // the fake cluster echoes whatever it receives
        let mut stream = TcpStream::connect((TEST_IP, port)).await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(cluster.dials(), 1);

        stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_port() {
        let cluster = FakeCluster::new();
        let pod = PodRef::new("web-1", "default");
        let port = free_port();

        let forwarder = Forwarder::bind(TEST_IP, &[port]).await.unwrap();
        let stop = CancellationToken::new();
        let fwd_stop = stop.clone();
        let task = tokio::spawn(async move {
            let _ = forwarder.forward(cluster, pod, fwd_stop).await;
        });

        let handle = ForwarderHandle::new(stop, task);
        handle.shutdown().await;

        // the listener is gone by the time shutdown returns
        let _rebound = TcpListener::bind((TEST_IP, port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_ends_forward() {
        let cluster = FakeCluster::new();
        cluster.fail_portforward(true);
        let pod = PodRef::new("web-1", "default");
        let port = free_port();

        let forwarder = Forwarder::bind(TEST_IP, &[port]).await.unwrap();
        let stop = CancellationToken::new();
        let task = tokio::spawn(forwarder.forward(cluster, pod, stop));

        let _stream = TcpStream::connect((TEST_IP, port)).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::Dial { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let port = free_port();
        let _first = Forwarder::bind(TEST_IP, &[port]).await.unwrap();

        let err = Forwarder::bind(TEST_IP, &[port]).await.unwrap_err();
        assert!(matches!(err, TunnelError::Bind { .. }));
    }
}
