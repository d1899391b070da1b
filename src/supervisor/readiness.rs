//! TCP readiness probes for `condition: service_healthy` edges

use crate::error::{Result, TandemError};
use crate::service::{ReadinessProbe, ServiceDefinition};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpStream;

/// Address a dependency is probed at: its first published host port, on
/// the bound host address or loopback when bound to all interfaces.
pub fn probe_addr(def: &ServiceDefinition) -> Option<SocketAddr> {
    let binding = def.ports.iter().find(|p| p.host_port.is_some())?;
    let ip = match binding.host_ip {
        Some(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    Some(SocketAddr::new(ip, binding.host_port?))
}

/// Wait until `dependency` accepts TCP connections.
/// `service` is the dependent, named in the error.
pub async fn wait_ready(service: &str, dependency: &ServiceDefinition) -> Result<()> {
    let not_ready = || TandemError::DependencyNotReady {
        service: service.to_string(),
        dependency: dependency.name.clone(),
    };
    let addr = probe_addr(dependency).ok_or_else(not_ready)?;
    let probe: ReadinessProbe = dependency.healthcheck.unwrap_or_default();

    tracing::info!(
        "Service {} waiting for {} to accept connections on {}",
        service,
        dependency.name,
        addr
    );

    if !probe.start_period.is_zero() {
        tokio::time::sleep(probe.start_period).await;
    }

    for attempt in 0..=probe.retries {
        match tokio::time::timeout(probe.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                tracing::info!("{} is ready", dependency.name);
                return Ok(());
            }
            Ok(Err(e)) => tracing::debug!("{} probe {} failed: {}", dependency.name, attempt + 1, e),
            Err(_) => tracing::debug!("{} probe {} timed out", dependency.name, attempt + 1),
        }
        if attempt < probe.retries {
            tokio::time::sleep(probe.interval).await;
        }
    }

    Err(not_ready())
}
