//! Kubernetes client, endpoint discovery, and port-forward dialing.
//!
//! This module handles all Kubernetes API interactions:
//! - Service discovery (listing services in the target namespaces)
//! - Endpoint lookup and the all-namespace endpoint watch
//! - Port-forward streams to individual pods

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::{
    api::{Api, ListParams},
    runtime::watcher,
    Client, Config,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::worker::{PodRef, ServiceId};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    #[error("failed to infer Kubernetes config: {0}")]
    Infer(#[from] kube::config::InferConfigError),
    #[error("failed to build Kubernetes client: {0}")]
    Client(#[source] kube::Error),
    #[error("endpoints lookup for '{service}' failed: {source}")]
    Endpoints {
        service: String,
        source: kube::Error,
    },
    #[error("service list in namespace '{namespace}' failed: {source}")]
    ListServices {
        namespace: String,
        source: kube::Error,
    },
    #[error("port-forward to '{pod}' port {port} failed: {source}")]
    PortForward {
        pod: String,
        port: u16,
        source: kube::Error,
    },
    #[error("port-forward to '{pod}' produced no stream for port {port}")]
    MissingStream { pod: String, port: u16 },
}

/// Object-safe byte stream to one pod port.
pub trait PodConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PodConn for T {}

pub type PodStream = Box<dyn PodConn>;

/// The slice of the cluster API the tunnel worker consumes. Implemented by
/// [`Cluster`] and by a scripted fake in tests.
#[async_trait]
pub trait ClusterApi: Clone + Send + Sync + 'static {
    /// First Pod target of the service's endpoints, if any.
    async fn first_pod_endpoint(
        &self,
        service: &ServiceId,
    ) -> Result<Option<PodRef>, ClusterError>;

    /// Opens a byte stream to one port of one pod.
    async fn portforward(&self, pod: &PodRef, port: u16) -> Result<PodStream, ClusterError>;
}

/// Information about a discovered Kubernetes service.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub ports: Vec<u16>,
}

/// Kubernetes client wrapper.
#[derive(Clone)]
pub struct Cluster {
    client: Client,
}

impl Cluster {
    /// Connects using the default kubeconfig, or a specific context when
    /// one is given.
    pub async fn connect(context: Option<&str>) -> Result<Self, ClusterError> {
        let config = match context {
            Some(ctx) => {
                info!("Using Kubernetes context: {}", ctx);
                Config::from_kubeconfig(&kube::config::KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    cluster: None,
                    user: None,
                })
                .await?
            }
            None => Config::infer().await?,
        };

        info!("Connecting to Kubernetes cluster: {}", config.cluster_url);

        let client = Client::try_from(config).map_err(ClusterError::Client)?;

        Ok(Self { client })
    }

    /// Lists all services in the given namespaces.
    pub async fn list_services(
        &self,
        namespaces: &[String],
    ) -> Result<Vec<ServiceInfo>, ClusterError> {
        let mut services = Vec::new();

        for namespace in namespaces {
            let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
            let list = api.list(&ListParams::default()).await.map_err(|source| {
                ClusterError::ListServices {
                    namespace: namespace.clone(),
                    source,
                }
            })?;

            for svc in list {
                let name = svc.metadata.name.unwrap_or_default();
                let ports: Vec<u16> = svc
                    .spec
                    .as_ref()
                    .and_then(|s| s.ports.as_ref())
                    .map(|ports| ports.iter().map(|p| p.port as u16).collect())
                    .unwrap_or_default();

                services.push(ServiceInfo {
                    name,
                    namespace: namespace.clone(),
                    ports,
                });
            }
        }

        info!("Discovered {} services", services.len());
        Ok(services)
    }

    /// Watches endpoints across all namespaces, forwarding every update to
    /// `events`. Runs in its own task until `cancel` fires.
    ///
    /// Both live updates and the re-list performed when the watch
    /// (re)starts are forwarded; deletions are not, since a removed
    /// backend surfaces as an update with its address gone. A full
    /// channel blocks this task rather than dropping events.
    pub fn watch_endpoints(&self, events: mpsc::Sender<Endpoints>, cancel: CancellationToken) {
        let api: Api<Endpoints> = Api::all(self.client.clone());
        let stream = watcher(api, watcher::Config::default());

        tokio::spawn(async move {
            let mut stream = stream.boxed();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = stream.next() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                match event {
                    Ok(watcher::Event::Apply(ep)) | Ok(watcher::Event::InitApply(ep)) => {
                        if events.send(ep).await.is_err() {
                            return;
                        }
                    }
                    Ok(watcher::Event::Init) => {
                        debug!("Endpoint watcher (re)listing");
                    }
                    Ok(watcher::Event::InitDone) => {
                        debug!("Endpoint watcher ready");
                    }
                    Ok(watcher::Event::Delete(_)) => {}
                    Err(e) => {
                        warn!("Endpoint watcher error: {}", e);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ClusterApi for Cluster {
    async fn first_pod_endpoint(
        &self,
        service: &ServiceId,
    ) -> Result<Option<PodRef>, ClusterError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &service.namespace);
        let endpoints = api
            .get(&service.name)
            .await
            .map_err(|source| ClusterError::Endpoints {
                service: service.key(),
                source,
            })?;

        Ok(pod_targets(&endpoints).into_iter().next())
    }

    async fn portforward(&self, pod: &PodRef, port: u16) -> Result<PodStream, ClusterError> {
        debug!("Port-forwarding to '{}' port {}", pod.key(), port);

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let mut pf = api
            .portforward(&pod.name, &[port])
            .await
            .map_err(|source| ClusterError::PortForward {
                pod: pod.key(),
                port,
                source,
            })?;

        let stream = pf
            .take_stream(port)
            .ok_or_else(|| ClusterError::MissingStream {
                pod: pod.key(),
                port,
            })?;

        let pod_key = pod.key();
        tokio::spawn(async move {
            if let Err(e) = pf.join().await {
                debug!("Port-forward to '{}' ended: {}", pod_key, e);
            }
        });

        Ok(Box::new(stream))
    }
}

/// Pods referenced by an endpoints object: every subset address whose
/// target is a Pod, in subset order.
pub fn pod_targets(endpoints: &Endpoints) -> Vec<PodRef> {
    let fallback_namespace = endpoints.metadata.namespace.as_deref().unwrap_or_default();

    let mut pods = Vec::new();
    for subset in endpoints.subsets.as_deref().unwrap_or(&[]) {
        for addr in subset.addresses.as_deref().unwrap_or(&[]) {
            let Some(target) = addr.target_ref.as_ref() else {
                continue;
            };
            if target.kind.as_deref() != Some("Pod") {
                continue;
            }
            let Some(name) = target.name.clone() else {
                continue;
            };
            let namespace = target
                .namespace
                .clone()
                .unwrap_or_else(|| fallback_namespace.to_string());
            pods.push(PodRef::new(name, namespace));
        }
    }
    pods
}
