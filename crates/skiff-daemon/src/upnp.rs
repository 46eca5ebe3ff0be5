//! UPnP IGD gateways as port forwarding collaborators.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use igd_next::{
    aio::{tokio::Tokio, Gateway},
    PortMappingProtocol, SearchOptions,
};
use skiff_core::{NatDevice, NatDiscovery, NatError, Protocol};
use tokio::net::UdpSocket;
use tracing::{debug, info};

pub struct UpnpDiscovery;

#[async_trait]
impl NatDiscovery for UpnpDiscovery {
    async fn discover(&self, timeout: Duration) -> Vec<Arc<dyn NatDevice>> {
        let options = SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        };
        match igd_next::aio::tokio::search_gateway(options).await {
            Ok(gateway) => {
                info!("found UPnP gateway at {}", gateway.addr);
                vec![Arc::new(UpnpDevice { gateway }) as Arc<dyn NatDevice>]
            }
            Err(e) => {
                debug!("no UPnP gateway: {}", e);
                Vec::new()
            }
        }
    }
}

pub struct UpnpDevice {
    gateway: Gateway<Tokio>,
}

impl UpnpDevice {
    /// Address of the interface that routes to the gateway.
    async fn local_ip(&self) -> Result<IpAddr, NatError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NatError::Mapping(format!("local address: {}", e)))?;
        socket
            .connect(self.gateway.addr)
            .await
            .map_err(|e| NatError::Mapping(format!("local address: {}", e)))?;
        socket
            .local_addr()
            .map(|a| a.ip())
            .map_err(|e| NatError::Mapping(format!("local address: {}", e)))
    }
}

fn igd_protocol(protocol: Protocol) -> PortMappingProtocol {
    match protocol {
        Protocol::Tcp => PortMappingProtocol::TCP,
        Protocol::Udp => PortMappingProtocol::UDP,
    }
}

/// IGD leases are whole seconds; zero would mean "permanent".
fn lease_secs(lease: Duration) -> u32 {
    lease.as_secs().clamp(1, u32::MAX as u64) as u32
}

#[async_trait]
impl NatDevice for UpnpDevice {
    fn name(&self) -> String {
        format!("upnp {}", self.gateway.addr)
    }

    async fn external_ip(&self) -> Result<IpAddr, NatError> {
        self.gateway
            .get_external_ip()
            .await
            .map_err(|e| NatError::ExternalIp(e.to_string()))
    }

    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<u16, NatError> {
        let local = SocketAddr::new(self.local_ip().await?, internal_port);
        let proto = igd_protocol(protocol);
        let lease = lease_secs(lease);
        if external_port == 0 {
            self.gateway
                .add_any_port(proto, local, lease, description)
                .await
                .map_err(|e| NatError::Mapping(e.to_string()))
        } else {
            self.gateway
                .add_port(proto, external_port, local, lease, description)
                .await
                .map(|()| external_port)
                .map_err(|e| NatError::Mapping(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_never_permanent() {
        assert_eq!(lease_secs(Duration::from_millis(10)), 1);
        assert_eq!(lease_secs(Duration::from_secs(120)), 120);
        assert_eq!(lease_secs(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn protocols_map_to_igd() {
        assert_eq!(igd_protocol(Protocol::Tcp), PortMappingProtocol::TCP);
        assert_eq!(igd_protocol(Protocol::Udp), PortMappingProtocol::UDP);
    }
}
