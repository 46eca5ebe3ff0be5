//! Port forwarding: the per-gateway retry ladder, TCP/UDP reconciliation and the
//! background refresher.
//!
//! The state lock is never held while talking to a gateway or to the reachability
//! endpoint. Reconciliation cycles are serialized through `CoreState::reconcile_gate`
//! because each one is a read-modify-write of the forwarded addresses spanning many
//! round-trips.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use rand::Rng;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    CoreError, NatDevice, NatDiscovery, NatError, PortMapping, PortMappingSettings, Protocol,
    SharedState, TransferEngine,
};

const RANDOM_ATTEMPTS: usize = 10;
const RANDOM_PORT_MIN: u16 = 1024;
const RANDOM_PORT_MAX: u16 = 65535;

/// Port of `host:port`, or of a bare port string. Zero is treated as absent.
fn port_of(addr: &str) -> Option<u16> {
    let port = addr.rsplit_once(':').map(|(_, p)| p).unwrap_or(addr);
    port.parse::<u16>().ok().filter(|p| *p != 0)
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, NatError>>,
) -> Result<T, NatError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(NatError::Timeout))
}

/// Acquires an external port on one gateway.
///
/// Tries the port of `hint` (or `local_port` when the hint does not parse), then lets the
/// gateway choose, then ten random ports in `[1024, 65535)`. The first success wins.
pub async fn negotiate(
    device: &dyn NatDevice,
    protocol: Protocol,
    local_port: u16,
    hint: Option<&str>,
    settings: &PortMappingSettings,
) -> Result<u16, NatError> {
    let description = format!("{} {}", settings.description, protocol);
    let lease = settings.lease();
    let explicit = hint.and_then(port_of).unwrap_or(local_port);

    let mut ladder = vec![explicit, 0];
    {
        let mut rng = rand::rng();
        ladder.extend((0..RANDOM_ATTEMPTS).map(|_| rng.random_range(RANDOM_PORT_MIN..RANDOM_PORT_MAX)));
    }

    let mut last_err = NatError::Mapping("no attempt made".to_string());
    for external in ladder {
        let call = device.add_port_mapping(protocol, local_port, external, &description, lease);
        match bounded(settings.call_timeout, call).await {
            Ok(port) => {
                debug!("{}: {} {} -> {} mapped", device.name(), protocol, port, local_port);
                return Ok(port);
            }
            Err(e) => {
                debug!("{}: {} {} -> {} refused: {}", device.name(), protocol, external, local_port, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

fn slot_mut(ports: &mut PortMapping, protocol: Protocol) -> &mut Option<String> {
    match protocol {
        Protocol::Tcp => &mut ports.tcp,
        Protocol::Udp => &mut ports.udp,
    }
}

/// Previously learned port of the same protocol, else the other protocol's.
fn hint_for(ports: &PortMapping, protocol: Protocol) -> Option<String> {
    match protocol {
        Protocol::Tcp => ports.tcp.clone().or_else(|| ports.udp.clone()),
        Protocol::Udp => ports.udp.clone().or_else(|| ports.tcp.clone()),
    }
}

/// Negotiates one protocol on one gateway and records `ip:port` on success.
async fn map_on_device(
    state: &SharedState,
    device: &dyn NatDevice,
    protocol: Protocol,
    local_port: u16,
    settings: &PortMappingSettings,
) -> Result<String, NatError> {
    let ip = bounded(settings.call_timeout, device.external_ip()).await?;
    let hint = hint_for(&state.lock().await.ports, protocol);

    let port = negotiate(device, protocol, local_port, hint.as_deref(), settings).await?;
    let external = SocketAddr::new(ip, port).to_string();

    let mut guard = state.lock().await;
    *slot_mut(&mut guard.ports, protocol) = Some(external.clone());
    Ok(external)
}

/// One protocol's row in a negotiation pass.
struct Negotiation {
    protocol: Protocol,
    mapped: bool,
}

impl Negotiation {
    fn new(protocol: Protocol) -> Self {
        Self { protocol, mapped: false }
    }
}

/// Runs one reconciliation cycle over `devices` and pushes the resulting address to
/// the engine.
///
/// UDP has priority: TCP is only advertised when it matches UDP, and when the two
/// disagree UDP is renegotiated on the TCP port. A failed realignment drops both.
pub async fn reconcile(
    state: &SharedState,
    devices: &[Arc<dyn NatDevice>],
) -> Result<PortMapping, CoreError> {
    let gate = state.lock().await.reconcile_gate.clone();
    let _cycle = gate.lock().await;

    let (settings, local_addr) = {
        let guard = state.lock().await;
        (guard.settings.clone(), guard.local_listen_addr.clone())
    };
    let local_port =
        port_of(&local_addr).ok_or_else(|| CoreError::InvalidListenAddr(local_addr.clone()))?;

    let mut table = [Negotiation::new(Protocol::Udp), Negotiation::new(Protocol::Tcp)];
    for device in devices {
        for entry in table.iter_mut().filter(|e| !e.mapped) {
            match map_on_device(state, device.as_ref(), entry.protocol, local_port, &settings).await {
                Ok(external) => {
                    info!("{} forwarded via {} as {}", entry.protocol, device.name(), external);
                    entry.mapped = true;
                }
                Err(e) => debug!("{} not forwarded via {}: {}", entry.protocol, device.name(), e),
            }
        }
    }

    let mismatch = {
        let mut guard = state.lock().await;
        for entry in table.iter().filter(|e| !e.mapped) {
            *slot_mut(&mut guard.ports, entry.protocol) = None;
        }
        let ports = &mut guard.ports;
        let mismatch = matches!((&ports.tcp, &ports.udp), (Some(tcp), Some(udp)) if tcp != udp);
        if mismatch {
            ports.udp = None;
        }
        mismatch
    };

    if mismatch {
        debug!("tcp and udp external ports differ, renegotiating udp on the tcp port");
        let mut realigned = false;
        for device in devices {
            if map_on_device(state, device.as_ref(), Protocol::Udp, local_port, &settings)
                .await
                .is_ok()
            {
                realigned = true;
                break;
            }
        }
        if !realigned {
            let mut guard = state.lock().await;
            guard.ports = PortMapping::default();
            warn!("udp could not follow the tcp port, port forwarding abandoned");
        }
    }

    let mut guard = state.lock().await;
    let advertised = match guard.ports.udp.clone() {
        None => {
            guard.ports.tcp = None;
            guard.local_listen_addr.clone()
        }
        Some(udp) => {
            if guard.ports.tcp.as_deref() != Some(udp.as_str()) {
                guard.ports.tcp = None;
            }
            udp
        }
    };
    commit_listen_addr(guard.engine.as_ref(), &advertised);
    Ok(guard.ports.clone())
}

/// Writes `addr` to the engine unless it is already the listen address.
pub fn commit_listen_addr(engine: &dyn TransferEngine, addr: &str) -> bool {
    if engine.listen_addr() == addr {
        return false;
    }
    engine.set_listen_addr(addr);
    info!("listen address set to {}", addr);
    true
}

/// Discovery followed by one reconciliation cycle.
pub async fn refresh_port_mapping(
    state: &SharedState,
    discovery: &dyn NatDiscovery,
) -> Result<PortMapping, CoreError> {
    let (timeout, slack) = {
        let guard = state.lock().await;
        (guard.settings.discovery_timeout, guard.settings.call_timeout)
    };
    let devices = tokio::time::timeout(timeout + slack, discovery.discover(timeout))
        .await
        .unwrap_or_default();
    debug!("discovered {} gateway(s)", devices.len());
    reconcile(state, &devices).await
}

pub(crate) struct RefresherHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Wake {
    Cancelled,
    Shutdown,
    Timer,
}

async fn wait_for_any(
    cancel: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
    interval: Duration,
) -> Wake {
    if *cancel.borrow() {
        return Wake::Cancelled;
    }
    if *shutdown.borrow() {
        return Wake::Shutdown;
    }
    tokio::select! {
        _ = cancel.changed() => Wake::Cancelled,
        _ = shutdown.changed() => Wake::Shutdown,
        _ = tokio::time::sleep(interval) => Wake::Timer,
    }
}

async fn run_refresher(
    state: SharedState,
    discovery: Arc<dyn NatDiscovery>,
    previous: Option<JoinHandle<()>>,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    loop {
        match wait_for_any(&mut cancel, &mut shutdown, interval).await {
            Wake::Timer => {}
            Wake::Cancelled => {
                debug!("port mapping refresher cancelled");
                return;
            }
            Wake::Shutdown => {
                info!("engine shutting down, port mapping refresher stopped");
                return;
            }
        }
        match refresh_port_mapping(&state, discovery.as_ref()).await {
            Ok(ports) => debug!("port mapping refreshed: tcp={:?} udp={:?}", ports.tcp, ports.udp),
            Err(e) => warn!("port mapping refresh failed: {}", e),
        }
    }
}

/// Starts the refresher, replacing a running one. The previous instance is cancelled
/// and joined before the new one begins its first wait.
pub async fn start_port_mapping_loop(state: &SharedState, discovery: Arc<dyn NatDiscovery>) {
    let mut guard = state.lock().await;
    let previous = guard.refresher.take().map(|prev| {
        let _ = prev.cancel.send(true);
        prev.task
    });
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let shutdown = guard.engine.shutdown_signal();
    let interval = guard.settings.refresh_interval;
    let task = tokio::spawn(run_refresher(
        state.clone(),
        discovery,
        previous,
        cancel_rx,
        shutdown,
        interval,
    ));
    guard.refresher = Some(RefresherHandle { cancel: cancel_tx, task });
    info!("port mapping refresher started, interval {:?}", interval);
}

pub async fn stop_port_mapping_loop(state: &SharedState) {
    let handle = state.lock().await.refresher.take();
    if let Some(handle) = handle {
        let _ = handle.cancel.send(true);
        let _ = handle.task.await;
        info!("port mapping refresher stopped");
    }
}

/// Asks the reachability endpoint whether the forwarded (or local) port answers from
/// the outside. Any failure reads as unreachable.
pub async fn check_external_reachable(state: &SharedState) -> bool {
    let (url, limit) = {
        let guard = state.lock().await;
        let port = guard
            .ports
            .tcp
            .as_deref()
            .or(guard.ports.udp.as_deref())
            .and_then(port_of)
            .or_else(|| port_of(&guard.local_listen_addr));
        let Some(port) = port else {
            return false;
        };
        (
            format!("{}{}", guard.settings.port_check_url, port),
            guard.settings.call_timeout,
        )
    };

    let client = match reqwest::Client::builder().timeout(limit).build() {
        Ok(c) => c,
        Err(e) => {
            warn!("could not build http client: {}", e);
            return false;
        }
    };
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            debug!("reachability probe {} failed: {}", url, e);
            return false;
        }
    };
    if !response.status().is_success() {
        return false;
    }
    match response.text().await {
        Ok(body) => body == "1",
        Err(_) => false,
    }
}
