//! svctun - stable loopback tunnels to Kubernetes services.
//!
//! Gives each exposed service its own loopback address and host-file
//! entry, then keeps a port-forward tunnel to a live backing pod alive
//! through pod churn, so cluster services are reachable locally under
//! stable names.

mod api;
mod hosts;
mod ippool;
mod k8s;
mod platform;
mod shutdown;
#[cfg(test)]
mod test_utils;
mod tunnel;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hosts::HostsFile;
use k8s::Cluster;
use worker::{CreateRequest, Request, ServiceId, WorkerConfig};

/// Stable loopback tunnels to Kubernetes services.
///
/// Discovers services in the target namespaces, binds each one to its own
/// loopback address with a host-file entry, and port-forwards its ports to
/// a live backing pod.
#[derive(Parser, Debug)]
#[command(name = "svctun")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubernetes namespaces to expose (comma-separated)
    #[arg(short, long, default_value = "default")]
    namespaces: String,

    /// Specific services to expose (format: service.namespace:port[,port...])
    #[arg(short, long)]
    services: Vec<String>,

    /// Expose every service discovered in the target namespaces
    #[arg(long, default_value = "true")]
    auto_discover: bool,

    /// Loopback range tunnels draw their addresses from
    #[arg(long, default_value = "127.0.0.1/8")]
    pool_cidr: Ipv4Net,

    /// Host file to write tunnel hostnames to (defaults to the system one)
    #[arg(long)]
    hosts_file: Option<PathBuf>,

    /// Port for the read-only status API (disabled when not set)
    #[arg(long)]
    api_port: Option<u16>,

    /// Kubernetes context to use (from kubeconfig). If not specified, uses
    /// the current context.
    #[arg(short = 'c', long)]
    context: Option<String>,

    /// Log level for svctun (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log level for libraries (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    lib_log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // svctun at its own level, everything else at the library level
    let filter = EnvFilter::new(format!(
        "{},svctun={}",
        args.lib_log_level.to_lowercase(),
        args.log_level.to_lowercase()
    ));

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting svctun");

    let namespaces: Vec<String> = args
        .namespaces
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let cluster = Cluster::connect(args.context.as_deref())
        .await
        .context("Failed to connect to Kubernetes. Check your kubeconfig.")?;

    let cancel = CancellationToken::new();
    let config = WorkerConfig {
        pool_cidr: args.pool_cidr,
        hosts_path: args
            .hosts_file
            .clone()
            .unwrap_or_else(HostsFile::default_path),
    };
    let (requests, done, handle) = worker::start(cluster.clone(), config, cancel.clone())
        .context("Failed to start the tunnel worker")?;

    // bare service names only stay unambiguous inside a single namespace
    let short_names = namespaces.len() == 1;
    let mut exposed = 0usize;

    if args.auto_discover {
        info!("Discovering services in namespaces {:?}", namespaces);
        match cluster.list_services(&namespaces).await {
            Ok(services) => {
                for svc in services {
                    if svc.ports.is_empty() {
                        continue;
                    }
                    let service = ServiceId::new(&svc.name, &svc.namespace);
                    info!("  {} (ports: {:?})", service.key(), svc.ports);
                    let request = Request::Create(CreateRequest {
                        hostnames: service_hostnames(&service, short_names),
                        ports: svc.ports,
                        service,
                        endpoint: None,
                        recreate: false,
                        recreate_reason: String::new(),
                    });
                    if requests.send(request).await.is_err() {
                        break;
                    }
                    exposed += 1;
                }
            }
            Err(e) => {
                warn!("Failed to discover services: {}", e);
            }
        }
    }

    for spec in &args.services {
        match parse_service_spec(spec) {
            Some((service, ports)) => {
                let request = Request::Create(CreateRequest {
                    hostnames: service_hostnames(&service, short_names),
                    ports,
                    service,
                    endpoint: None,
                    recreate: false,
                    recreate_reason: String::new(),
                });
                if requests.send(request).await.is_err() {
                    break;
                }
                exposed += 1;
            }
            None => {
                warn!("Ignoring malformed service spec '{}'", spec);
            }
        }
    }

    info!("Requested tunnels for {} services", exposed);

    if let Some(port) = args.api_port {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, handle, cancel).await {
                error!("Status API failed: {}", e);
            }
        });
    }

    info!("Press Ctrl+C to stop.");

    if let Err(e) = shutdown::wait_for_signal().await {
        warn!("Signal handler failed, shutting down: {}", e);
    }

    info!("Shutting down...");
    cancel.cancel();
    let _ = done.await;

    info!("svctun stopped");
    Ok(())
}

/// Host names a service answers to, shortest first. The bare name is only
/// included when a single namespace is exposed.
fn service_hostnames(service: &ServiceId, short_names: bool) -> Vec<String> {
    let mut hostnames = Vec::with_capacity(4);
    if short_names {
        hostnames.push(service.name.clone());
    }
    hostnames.push(format!("{}.{}", service.name, service.namespace));
    hostnames.push(format!("{}.{}.svc", service.name, service.namespace));
    hostnames.push(format!(
        "{}.{}.svc.cluster.local",
        service.name, service.namespace
    ));
    hostnames
}

/// Parses "service.namespace:port[,port...]".
fn parse_service_spec(spec: &str) -> Option<(ServiceId, Vec<u16>)> {
    let (name_part, ports_part) = spec.split_once(':')?;
    let (name, namespace) = name_part.split_once('.')?;

    let ports = ports_part
        .split(',')
        .map(|p| p.trim().parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    if name.is_empty() || namespace.is_empty() || ports.is_empty() {
        return None;
    }

    Some((ServiceId::new(name, namespace), ports))
}
