//! Serialized views of worker state.

use serde::Serialize;
use std::net::Ipv4Addr;

use crate::worker::{ConnectionView, PodRef, ServiceId, TunnelStatus};

/// A snapshot of the connection registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub connections: Vec<ConnectionInfo>,
}

/// One managed tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub service: TargetInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<TargetInfo>,
    pub ip: Ipv4Addr,
    pub hostnames: Vec<String>,
    pub ports: Vec<u16>,
    pub status: StatusInfo,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status_reason: String,
    pub forwarding: bool,
}

/// A named object in the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct TargetInfo {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusInfo {
    Running,
    Recreating,
    Waiting,
}

impl From<&ServiceId> for TargetInfo {
    fn from(service: &ServiceId) -> Self {
        TargetInfo {
            name: service.name.clone(),
            namespace: service.namespace.clone(),
        }
    }
}

impl From<&PodRef> for TargetInfo {
    fn from(pod: &PodRef) -> Self {
        TargetInfo {
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
        }
    }
}

impl From<TunnelStatus> for StatusInfo {
    fn from(status: TunnelStatus) -> Self {
        match status {
            TunnelStatus::Running => StatusInfo::Running,
            TunnelStatus::Recreating => StatusInfo::Recreating,
            TunnelStatus::Waiting => StatusInfo::Waiting,
        }
    }
}

impl From<ConnectionView> for ConnectionInfo {
    fn from(conn: ConnectionView) -> Self {
        ConnectionInfo {
            service: TargetInfo::from(&conn.service),
            pod: conn.pod.as_ref().map(TargetInfo::from),
            ip: conn.ip,
            hostnames: conn.hostnames,
            ports: conn.ports,
            status: conn.status.into(),
            status_reason: conn.status_reason,
            forwarding: conn.forwarding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_json() {
        let view = ConnectionView {
            service: ServiceId::new("web", "default"),
            pod: None,
            ip: Ipv4Addr::new(127, 0, 0, 2),
            hostnames: vec!["web.local".to_string()],
            ports: vec![8080],
            status: TunnelStatus::Waiting,
            status_reason: "No endpoints were found.".to_string(),
            forwarding: false,
        };

        let json = serde_json::to_value(ConnectionInfo::from(view)).unwrap();

        assert_eq!(json["service"]["name"], "web");
        assert_eq!(json["ip"], "127.0.0.2");
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["status_reason"], "No endpoints were found.");
        // an absent pod is omitted entirely
        assert!(json.get("pod").is_none());
    }
}
