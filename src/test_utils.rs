//! Shared test fixtures: a scripted cluster fake and small helpers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

use crate::k8s::{ClusterApi, ClusterError, PodStream};
use crate::worker::{PodRef, ServiceId};

/// Stand-in for the cluster: scripted endpoints per service and echoing
/// port-forward streams.
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    endpoints: HashMap<String, Vec<PodRef>>,
    fail_endpoints: bool,
    fail_portforward: bool,
    lookups: usize,
    dials: usize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_endpoints(&self, service: &ServiceId, pods: Vec<PodRef>) {
        self.inner.lock().unwrap().endpoints.insert(service.key(), pods);
    }

    pub fn fail_endpoints(&self, fail: bool) {
        self.inner.lock().unwrap().fail_endpoints = fail;
    }

    pub fn fail_portforward(&self, fail: bool) {
        self.inner.lock().unwrap().fail_portforward = fail;
    }

    /// How many endpoint lookups have been served.
    pub fn lookups(&self) -> usize {
        self.inner.lock().unwrap().lookups
    }

    /// How many port-forward dials have been attempted.
    pub fn dials(&self) -> usize {
        self.inner.lock().unwrap().dials
    }
}

fn api_error(message: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn first_pod_endpoint(
        &self,
        service: &ServiceId,
    ) -> Result<Option<PodRef>, ClusterError> {
        let mut state = self.inner.lock().unwrap();
        state.lookups += 1;
        if state.fail_endpoints {
            return Err(ClusterError::Endpoints {
                service: service.key(),
                source: api_error("scripted endpoints failure"),
            });
        }
        Ok(state
            .endpoints
            .get(&service.key())
            .and_then(|pods| pods.first().cloned()))
    }

    async fn portforward(&self, pod: &PodRef, port: u16) -> Result<PodStream, ClusterError> {
        {
            let mut state = self.inner.lock().unwrap();
            state.dials += 1;
            if state.fail_portforward {
                return Err(ClusterError::PortForward {
                    pod: pod.key(),
                    port,
                    source: api_error("scripted port-forward failure"),
                });
            }
        }

        let (near, far) = tokio::io::duplex(4096);
        tokio::spawn(echo(far));
        Ok(Box::new(near))
    }
}

async fn echo(mut stream: DuplexStream) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// An endpoints object listing `pods` as Pod targets in one subset.
pub fn endpoints_with_pods(service: &ServiceId, pods: &[PodRef]) -> Endpoints {
    let addresses: Vec<EndpointAddress> = pods
        .iter()
        .map(|pod| EndpointAddress {
            ip: "10.0.0.1".to_string(),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.name.clone()),
                namespace: Some(pod.namespace.clone()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Endpoints {
        metadata: ObjectMeta {
            name: Some(service.name.clone()),
            namespace: Some(service.namespace.clone()),
            ..Default::default()
        },
        subsets: if addresses.is_empty() {
            Some(Vec::new())
        } else {
            Some(vec![EndpointSubset {
                addresses: Some(addresses),
                ..Default::default()
            }])
        },
    }
}

/// Polls `check` until it passes or a generous deadline expires.
pub async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A TCP port that was free at probe time.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("probe bind")
        .local_addr()
        .expect("probe addr")
        .port()
}
