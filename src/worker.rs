//! Port-forward worker: connection registry, request processor, and reaper.
//!
//! The worker owns every piece of tunnel state - the loopback pool, the
//! host-file entries, the interface aliases, and the registry itself - and
//! mutates all of it from a single task that consumes create/delete
//! requests in FIFO order. Everything else (the endpoint reaper, forward
//! tasks, status readers) talks to it through channels or reads published
//! snapshots, so no locks are needed.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Endpoints;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hosts::{HostsError, HostsFile};
use crate::ippool::{IpPool, PoolError};
use crate::k8s::{self, Cluster, ClusterApi, ClusterError};
use crate::platform::{self, PlatformError};
use crate::tunnel::{Forwarder, ForwarderHandle, TunnelError};

/// Capacity of the request and reaper channels. Producers block when full.
const CHANNEL_CAPACITY: usize = 1024;

/// Reserved at startup whenever it falls inside the pool range; never
/// handed to a tunnel.
const CANONICAL_LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// A service in the remote cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub name: String,
    pub namespace: String,
}

impl ServiceId {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Stable registry key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A pod backing a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl PodRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A request consumed by the processor.
#[derive(Debug)]
pub enum Request {
    Create(CreateRequest),
    Delete(DeleteRequest),
}

#[derive(Debug)]
pub struct CreateRequest {
    pub service: ServiceId,
    pub hostnames: Vec<String>,
    /// Each port p is forwarded as ip:p -> pod:p.
    pub ports: Vec<u16>,
    /// Pins the tunnel to this pod instead of asking the cluster.
    pub endpoint: Option<PodRef>,
    pub recreate: bool,
    pub recreate_reason: String,
}

#[derive(Debug)]
pub struct DeleteRequest {
    pub service: ServiceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Running,
    Recreating,
    Waiting,
}

/// Live record for one managed service. Only the processor touches these.
#[derive(Debug)]
struct Connection {
    service: ServiceId,
    /// None while waiting for the service to gain endpoints.
    pod: Option<PodRef>,
    ip: Ipv4Addr,
    hostnames: Vec<String>,
    ports: Vec<u16>,
    status: TunnelStatus,
    status_reason: String,
    handle: Option<ForwarderHandle>,
}

impl Connection {
    fn view(&self) -> ConnectionView {
        ConnectionView {
            service: self.service.clone(),
            pod: self.pod.clone(),
            ip: self.ip,
            hostnames: self.hostnames.clone(),
            ports: self.ports.clone(),
            status: self.status,
            status_reason: self.status_reason.clone(),
            forwarding: self.handle.is_some(),
        }
    }
}

/// Snapshot of a connection as published to readers.
#[derive(Debug, Clone)]
pub struct ConnectionView {
    pub service: ServiceId,
    pub pod: Option<PodRef>,
    pub ip: Ipv4Addr,
    pub hostnames: Vec<String>,
    pub ports: Vec<u16>,
    pub status: TunnelStatus,
    pub status_reason: String,
    /// Whether a forwarder is currently attached.
    pub forwarding: bool,
}

/// Published registry snapshots, swapped wholesale by the processor.
/// Readers get a consistent point-in-time view without blocking.
pub type RegistryView = Arc<ArcSwap<HashMap<String, ConnectionView>>>;

/// Read-only access to the worker's registry.
#[derive(Clone)]
pub struct WorkerHandle {
    registry: RegistryView,
}

impl WorkerHandle {
    pub fn get(&self, service: &ServiceId) -> Option<ConnectionView> {
        self.registry.load().get(&service.key()).cloned()
    }

    pub fn connections(&self) -> Vec<ConnectionView> {
        let mut conns: Vec<ConnectionView> = self.registry.load().values().cloned().collect();
        conns.sort_by_key(|c| c.service.key());
        conns
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("a tunnel already exists for service '{0}'")]
    AlreadyExists(String),
    #[error("no tunnel exists for service '{0}'")]
    NotFound(String),
    #[error("address pool: {0}")]
    ResourceExhausted(#[source] PoolError),
    #[error("loopback alias: {0}")]
    Platform(#[source] PlatformError),
    #[error("hosts file: {0}")]
    Host(#[source] HostsError),
    #[error("cluster: {0}")]
    Cluster(#[source] ClusterError),
    #[error("tunnel: {0}")]
    Tunnel(#[source] TunnelError),
    #[error("teardown failed: {}", fmt_errors(.0))]
    Aggregate(Vec<Error>),
}

fn fmt_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Range tunnel addresses are drawn from.
    pub pool_cidr: Ipv4Net,
    /// Host file rewritten with tunnel hostnames.
    pub hosts_path: PathBuf,
}

/// Starts the worker against a real cluster: endpoint watcher, reaper, and
/// processor. Returns the request channel, a channel that resolves once
/// shutdown has finished, and a read handle onto the registry.
pub fn start(
    cluster: Cluster,
    config: WorkerConfig,
    cancel: CancellationToken,
) -> Result<(mpsc::Sender<Request>, oneshot::Receiver<()>, WorkerHandle), Error> {
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    cluster.watch_endpoints(event_tx, cancel.clone());
    spawn(cluster, config, cancel, event_rx)
}

/// Wires the worker from its parts. `start` is the production entry; tests
/// drive this directly with a fake cluster and their own event channel.
fn spawn<C: ClusterApi>(
    api: C,
    config: WorkerConfig,
    cancel: CancellationToken,
    events: mpsc::Receiver<Endpoints>,
) -> Result<(mpsc::Sender<Request>, oneshot::Receiver<()>, WorkerHandle), Error> {
    let mut pool = IpPool::new(config.pool_cidr);
    if config.pool_cidr.contains(&CANONICAL_LOOPBACK) {
        pool.acquire(CANONICAL_LOOPBACK)
            .map_err(Error::ResourceExhausted)?;
    }
    let hosts = HostsFile::open(&config.hosts_path).map_err(Error::Host)?;

    let (req_tx, req_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();
    let registry: RegistryView = Arc::new(ArcSwap::from_pointee(HashMap::new()));

    tokio::spawn(reap(
        events,
        registry.clone(),
        req_tx.clone(),
        cancel.clone(),
    ));

    let worker = Worker {
        api,
        pool,
        hosts,
        connections: HashMap::new(),
        registry: registry.clone(),
        req_tx: req_tx.clone(),
        cancel,
    };
    tokio::spawn(worker.run(req_rx, done_tx));

    Ok((req_tx, done_rx, WorkerHandle { registry }))
}

/// Reaps stale pod bindings: consumes endpoint updates and enqueues a
/// recreate whenever a connection's bound pod is no longer listed, or a
/// waiting connection's service gained endpoints. Never touches the
/// registry itself.
async fn reap(
    mut events: mpsc::Receiver<Endpoints>,
    registry: RegistryView,
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
) {
    loop {
        let endpoints = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(ep) => ep,
                None => return,
            },
        };

        let (Some(name), Some(namespace)) = (
            endpoints.metadata.name.clone(),
            endpoints.metadata.namespace.clone(),
        ) else {
            continue;
        };
        let service = ServiceId::new(name, namespace);

        let Some(conn) = registry.load().get(&service.key()).cloned() else {
            continue;
        };

        let live = k8s::pod_targets(&endpoints);
        let Some(reason) = recreate_reason(conn.pod.as_ref(), &live) else {
            continue;
        };

        debug!("Scheduling recreate for '{}': {}", service.key(), reason);
        let request = Request::Create(CreateRequest {
            service: conn.service,
            hostnames: conn.hostnames,
            ports: conn.ports,
            endpoint: None,
            recreate: true,
            recreate_reason: reason,
        });
        if requests.send(request).await.is_err() {
            return;
        }
    }
}

/// Decision table for the reaper: whether an endpoint update invalidates
/// the current pod binding, and with what reason.
fn recreate_reason(current: Option<&PodRef>, live: &[PodRef]) -> Option<String> {
    match current {
        Some(pod) if live.contains(pod) => None,
        Some(pod) => Some(format!("endpoints '{}' was removed", pod.key())),
        None if live.is_empty() => None,
        None => Some("found endpoints, service originally had none".to_string()),
    }
}

/// The request processor. Single writer of the registry, the pool, the
/// host file, and the alias state.
struct Worker<C: ClusterApi> {
    api: C,
    pool: IpPool,
    hosts: HostsFile,
    connections: HashMap<String, Connection>,
    registry: RegistryView,
    req_tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl<C: ClusterApi> Worker<C> {
    /// Request loop. Runs until the cancellation token fires, then tears
    /// down every connection and completes the done channel.
    async fn run(mut self, mut requests: mpsc::Receiver<Request>, done: oneshot::Sender<()>) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let (service, result) = match request {
                Request::Create(req) => {
                    let service = req.service.clone();
                    let result = self.create(req).await;
                    (service, result)
                }
                Request::Delete(req) => {
                    let service = req.service.clone();
                    let result = self.delete(&req.service).await;
                    (service, result)
                }
            };

            if let Err(err) = result {
                error!("Request for service '{}' failed: {}", service.key(), err);
            }
            self.publish();
        }

        self.shutdown().await;
        let _ = done.send(());
    }

    /// Tears down every connection. Per-connection failures are logged,
    /// never propagated; the done channel completes regardless.
    async fn shutdown(&mut self) {
        let keys: Vec<ServiceId> = self.connections.values().map(|c| c.service.clone()).collect();
        for service in keys {
            if let Err(err) = self.delete(&service).await {
                warn!("Failed to clean up tunnel for '{}': {}", service.key(), err);
            }
        }
        self.publish();
    }

    async fn create(&mut self, req: CreateRequest) -> Result<(), Error> {
        let key = req.service.key();

        // tunnels already under management are only replaced explicitly
        if self.connections.contains_key(&key) && !req.recreate {
            return Err(Error::AlreadyExists(key));
        }

        if req.recreate {
            info!("Recreating tunnel for '{}': {}", key, req.recreate_reason);
            self.set_status(
                &req.service,
                TunnelStatus::Recreating,
                req.recreate_reason.clone(),
            );
            self.publish();
            if let Some(conn) = self.connections.get_mut(&key) {
                if let Err(err) = stop_tunnel(&mut self.pool, &mut self.hosts, conn).await {
                    warn!("Failed to clean up previous tunnel for '{}': {}", key, err);
                }
            }
        }

        let ip = self.pool.acquire_any().map_err(Error::ResourceExhausted)?;
        let mut conn = Connection {
            service: req.service.clone(),
            pod: None,
            ip,
            hostnames: req.hostnames.clone(),
            ports: req.ports.clone(),
            status: TunnelStatus::Running,
            status_reason: String::new(),
            handle: None,
        };

        // anything acquired past this point unwinds on failure
        if let Err(err) = self.open_tunnel(&mut conn, &req).await {
            if let Err(cleanup) = stop_tunnel(&mut self.pool, &mut self.hosts, &mut conn).await {
                warn!("Failed to clean up half-made tunnel for '{}': {}", key, cleanup);
            }
            return Err(err);
        }

        self.connections.insert(key, conn);
        Ok(())
    }

    /// Creation steps after the address is allocated: interface alias,
    /// host entries, backend selection, listeners, forward task. The
    /// caller unwinds whatever these acquired if any of them fail.
    async fn open_tunnel(&mut self, conn: &mut Connection, req: &CreateRequest) -> Result<(), Error> {
        platform::alias_up(conn.ip).map_err(Error::Platform)?;

        self.hosts.add(conn.ip, &conn.hostnames).map_err(Error::Host)?;
        self.hosts.flush().map_err(Error::Host)?;

        let pod = match &req.endpoint {
            Some(pod) => Some(pod.clone()),
            None => match self.api.first_pod_endpoint(&req.service).await {
                Ok(pod) => pod,
                Err(err) if req.recreate => {
                    // reaper-driven recreates are best-effort; the next
                    // endpoint event reconciles again
                    warn!("Endpoint lookup for '{}' failed: {}", req.service.key(), err);
                    None
                }
                Err(err) => return Err(Error::Cluster(err)),
            },
        };

        let Some(pod) = pod else {
            info!(
                "No endpoints for '{}' yet, tunnel will start once some appear",
                req.service.key()
            );
            conn.status = TunnelStatus::Waiting;
            conn.status_reason = "No endpoints were found.".to_string();
            return Ok(());
        };

        info!("Creating tunnel for '{}' to pod '{}'", req.service.key(), pod.key());
        let forwarder = Forwarder::bind(conn.ip, &conn.ports)
            .await
            .map_err(Error::Tunnel)?;

        let stop = self.cancel.child_token();
        conn.pod = Some(pod.clone());

        let api = self.api.clone();
        let requests = self.req_tx.clone();
        let service = req.service.clone();
        let hostnames = conn.hostnames.clone();
        let ports = conn.ports.clone();
        let fwd_stop = stop.clone();
        let task = tokio::spawn(async move {
            let result = forwarder.forward(api, pod, fwd_stop.clone()).await;

            // a deliberate teardown (delete, recreate, shutdown) cancels
            // the token; only a spontaneous exit earns a recreate
            if fwd_stop.is_cancelled() {
                return;
            }

            let reason = match result {
                Ok(()) => "exit".to_string(),
                Err(err) => err.to_string(),
            };
            let request = Request::Create(CreateRequest {
                service,
                hostnames,
                ports,
                endpoint: None,
                recreate: true,
                recreate_reason: reason,
            });
            let _ = requests.send(request).await;
        });
        conn.handle = Some(ForwarderHandle::new(stop, task));

        Ok(())
    }

    async fn delete(&mut self, service: &ServiceId) -> Result<(), Error> {
        let key = service.key();
        let Some(mut conn) = self.connections.remove(&key) else {
            return Err(Error::NotFound(key));
        };

        if let Err(err) = stop_tunnel(&mut self.pool, &mut self.hosts, &mut conn).await {
            warn!("Failed to clean up tunnel for '{}': {}", key, err);
        }

        info!("Stopped tunnel for '{}'", key);
        Ok(())
    }

    /// Transitions the status of an existing connection; no other fields
    /// change. Used before teardown on recreate.
    fn set_status(&mut self, service: &ServiceId, status: TunnelStatus, reason: String) {
        if let Some(conn) = self.connections.get_mut(&service.key()) {
            conn.status = status;
            conn.status_reason = reason;
        }
    }

    /// Publishes a fresh registry snapshot for readers.
    fn publish(&self) {
        let snapshot: HashMap<String, ConnectionView> = self
            .connections
            .iter()
            .map(|(key, conn)| (key.clone(), conn.view()))
            .collect();
        self.registry.store(Arc::new(snapshot));
    }
}

/// Tears a connection down: forwarder first so the listeners stop before
/// their address goes away, then the address, the alias, and the host
/// entries. Every step is attempted; failures are aggregated.
async fn stop_tunnel(
    pool: &mut IpPool,
    hosts: &mut HostsFile,
    conn: &mut Connection,
) -> Result<(), Error> {
    if let Some(handle) = conn.handle.take() {
        handle.shutdown().await;
    }

    let mut errors = Vec::new();

    if let Err(err) = pool.release(conn.ip) {
        errors.push(Error::ResourceExhausted(err));
    }

    if let Err(err) = platform::alias_down(conn.ip) {
        errors.push(Error::Platform(err));
    }

    hosts.remove(&conn.hostnames);
    if let Err(err) = hosts.flush() {
        errors.push(Error::Host(err));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate(errors))
    }
}
