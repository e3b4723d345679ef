//! Operational node discovery over multicast DNS.
//!
//! A commissioned node advertises `<CFID>-<NODEID>._matter._tcp.local`. The SRV record of the
//! instance names the host and port, A/AAAA records of the host carry its addresses, and TXT
//! keys `SII`, `SAI` and `SAT` carry its MRP timing in milliseconds.
//!
//! Queries go out on IPv4 and on every IPv6 capable interface at the same time, like the
//! commissionable device discovery of the controller.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Type};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    dns::{self, DnsMessage, RecordData},
    AddressResolver, FailureCallback, LookupHandle, NodeLookupRequest,
};
use crate::{
    address::{MrpConfig, PeerAddress, ResolveResult},
    driver::{EventSink, SetupEvent},
    error::SetupError,
    peer::PeerId,
};

pub const OPERATIONAL_SERVICE: &str = "_matter._tcp.local";

const MDNS_PORT: u16 = 5353;
const QUERY_INTERVAL: Duration = Duration::from_secs(1);
/// largest mDNS message, jumbo frames included
const MAX_MESSAGE_SIZE: usize = 9000;
/// SII and SAI above one hour are not valid
const MAX_MRP_INTERVAL_MS: u32 = 3_600_000;

/// One received mDNS message and the interface it arrived on (IPv6 only).
#[derive(Debug, Clone)]
pub struct Response {
    pub message: DnsMessage,
    pub interface: Option<u32>,
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn txt_interval(txt: &std::collections::BTreeMap<String, String>, key: &str) -> Option<u32> {
    let value = txt.get(key)?;
    match value.parse::<u32>() {
        Ok(v) if v <= MAX_MRP_INTERVAL_MS => Some(v),
        _ => {
            log::debug!("ignoring {}={}", key, value);
            None
        }
    }
}

/// Assemble a result for `instance` from everything received so far.
/// None until an SRV record and at least one usable address of its target were seen.
pub fn resolve_from_responses(
    instance: &str,
    responses: &[Response],
    default_mrp: MrpConfig,
) -> Option<ResolveResult> {
    let records = || {
        responses
            .iter()
            .flat_map(|r| r.message.records().map(move |rec| (rec, r.interface)))
    };

    let (port, target) = records().find_map(|(rec, _)| match &rec.data {
        RecordData::Srv { port, target, .. } if rec.name.eq_ignore_ascii_case(instance) => {
            Some((*port, target.clone()))
        }
        _ => None,
    })?;

    let mut mrp = default_mrp;
    if let Some(txt) = records().find_map(|(rec, _)| match &rec.data {
        RecordData::Txt(txt) if rec.name.eq_ignore_ascii_case(instance) => Some(txt),
        _ => None,
    }) {
        if let Some(v) = txt_interval(txt, "SII") {
            mrp.idle_interval_ms = v;
        }
        if let Some(v) = txt_interval(txt, "SAI") {
            mrp.active_interval_ms = v;
        }
        if let Some(v) = txt.get("SAT").and_then(|v| v.parse::<u16>().ok()) {
            mrp.active_threshold_ms = v;
        }
    }

    let mut routable_v6 = None;
    let mut v4 = None;
    let mut link_local = None;
    for (rec, interface) in records() {
        if !rec.name.eq_ignore_ascii_case(&target) {
            continue;
        }
        match rec.data {
            RecordData::Aaaa(ip) if is_link_local(&ip) => {
                if let (None, Some(scope)) = (link_local, interface) {
                    link_local = Some(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope)));
                }
            }
            RecordData::Aaaa(ip) => {
                routable_v6.get_or_insert(SocketAddr::new(IpAddr::V6(ip), port));
            }
            RecordData::A(ip) => {
                v4.get_or_insert(SocketAddr::new(IpAddr::V4(ip), port));
            }
            _ => {}
        }
    }
    let address = routable_v6.or(v4).or(link_local)?;
    Some(ResolveResult {
        address: PeerAddress(address),
        mrp,
    })
}

async fn listen_v4(
    query: Vec<u8>,
    sender: mpsc::UnboundedSender<Response>,
    cancel: CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Ok(());
    }
    let stdsocket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    stdsocket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    stdsocket.set_reuse_port(true)?;
    let addr: std::net::SocketAddrV4 = "0.0.0.0:5353".parse()?;
    stdsocket.bind(&socket2::SockAddr::from(addr))?;
    let maddr: std::net::Ipv4Addr = "224.0.0.251".parse()?;
    stdsocket.join_multicast_v4(&maddr, &std::net::Ipv4Addr::UNSPECIFIED)?;
    stdsocket.set_nonblocking(true)?;
    let socket = tokio::net::UdpSocket::from_std(stdsocket.into())?;
    let target = SocketAddr::new(IpAddr::V4(maddr), MDNS_PORT);
    receive_loop(&socket, target, &query, None, sender, cancel).await
}

async fn listen_v6(
    query: Vec<u8>,
    interface: u32,
    sender: mpsc::UnboundedSender<Response>,
    cancel: CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Ok(());
    }
    let stdsocket = socket2::Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    stdsocket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    stdsocket.set_reuse_port(true)?;
    let addr: std::net::SocketAddrV6 = "[::]:5353".parse()?;
    stdsocket.bind(&socket2::SockAddr::from(addr))?;
    let maddr: Ipv6Addr = "ff02::fb".parse()?;
    stdsocket.join_multicast_v6(&maddr, interface)?;
    stdsocket.set_multicast_if_v6(interface)?;
    stdsocket.set_nonblocking(true)?;
    let socket = tokio::net::UdpSocket::from_std(stdsocket.into())?;
    let target = SocketAddr::V6(SocketAddrV6::new(maddr, MDNS_PORT, 0, interface));
    receive_loop(&socket, target, &query, Some(interface), sender, cancel).await
}

async fn receive_loop(
    socket: &tokio::net::UdpSocket,
    target: SocketAddr,
    query: &[u8],
    interface: Option<u32>,
    sender: mpsc::UnboundedSender<Response>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut resend = tokio::time::interval(QUERY_INTERVAL);
    loop {
        let mut buf = vec![0; MAX_MESSAGE_SIZE];
        let (n, addr) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = resend.tick() => {
                log::trace!("mdns query to {}", target);
                socket.send_to(query, target).await?;
                continue;
            }
            v = socket.recv_from(&mut buf) => v?,
        };
        buf.truncate(n);
        let message = match dns::parse_dns(&buf, addr) {
            Ok(message) => message,
            Err(e) => {
                log::trace!("undecodable mdns message from {}: {:#}", addr, e);
                continue;
            }
        };
        if !message.is_response() {
            continue;
        }
        log::trace!("mdns response from {} ({} records)", addr, message.records().count());
        if sender.send(Response { message, interface }).is_err() {
            return Ok(());
        }
    }
}

/// Query until the node can be resolved. Runs until cancelled or resolved.
async fn resolve_node(request: NodeLookupRequest, default_mrp: MrpConfig) -> Result<ResolveResult> {
    let instance = format!("{}.{}", request.instance_name(), OPERATIONAL_SERVICE);
    let query = dns::create_query(&instance, dns::TYPE_SRV)?;
    let stop = CancellationToken::new();
    let _stop_listeners = stop.clone().drop_guard();
    let (sender, mut receiver) = mpsc::unbounded_channel();

    match if_addrs::get_if_addrs() {
        Ok(ifaces) => {
            let mut seen = Vec::new();
            for iface in ifaces {
                if !iface.ip().is_ipv6() {
                    continue;
                }
                let Some(index) = iface.index else { continue };
                if seen.contains(&index) {
                    continue;
                }
                seen.push(index);
                let (query, sender, stop) = (query.clone(), sender.clone(), stop.child_token());
                tokio::spawn(async move {
                    if let Err(e) = listen_v6(query, index, sender, stop).await {
                        log::debug!("mdns on interface {}: {:#}", index, e);
                    }
                });
            }
        }
        Err(e) => log::debug!("listing interfaces: {}", e),
    }
    let v4_stop = stop.child_token();
    let v4_query = query.clone();
    tokio::spawn(async move {
        if let Err(e) = listen_v4(v4_query, sender, v4_stop).await {
            log::debug!("mdns on ipv4: {:#}", e);
        }
    });

    let mut responses = Vec::new();
    while let Some(response) = receiver.recv().await {
        responses.push(response);
        if let Some(result) = resolve_from_responses(&instance, &responses, default_mrp) {
            log::debug!("{} resolved to {}", instance, result.address);
            return Ok(result);
        }
    }
    anyhow::bail!("no mdns socket could be opened for {}", instance)
}

/// [AddressResolver] over mDNS. Results are posted to the driver through an [EventSink].
pub struct MdnsResolver {
    sink: EventSink,
    timeout: Duration,
    default_mrp: MrpConfig,
    next_handle: u64,
    lookups: Arc<Mutex<HashMap<LookupHandle, (PeerId, CancellationToken)>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MdnsResolver {
    pub fn new(sink: EventSink, timeout: Duration, default_mrp: MrpConfig) -> Self {
        Self {
            sink,
            timeout,
            default_mrp,
            next_handle: 0,
            lookups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_lookups(&self) -> usize {
        lock(&self.lookups).len()
    }

    /// One-shot lookup outside of any session setup.
    pub async fn resolve(&self, request: NodeLookupRequest) -> Result<ResolveResult> {
        tokio::time::timeout(self.timeout, resolve_node(request, self.default_mrp))
            .await
            .context(format!("resolving {} timed out", request.instance_name()))?
    }
}

impl AddressResolver for MdnsResolver {
    fn lookup_node(&mut self, request: NodeLookupRequest) -> Result<LookupHandle, SetupError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            log::error!("mdns lookup without tokio runtime: {}", e);
            SetupError::IncorrectState
        })?;
        self.next_handle += 1;
        let handle = LookupHandle(self.next_handle);
        let cancel = CancellationToken::new();
        lock(&self.lookups).insert(handle, (request.peer, cancel.clone()));

        let sink = self.sink.clone();
        let lookups = self.lookups.clone();
        let timeout = self.timeout;
        let default_mrp = self.default_mrp;
        runtime.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                r = tokio::time::timeout(timeout, resolve_node(request, default_mrp)) => r,
            };
            if lock(&lookups).remove(&handle).is_none() {
                return;
            }
            let peer = request.peer;
            let event = match outcome {
                Ok(Ok(result)) => SetupEvent::AddressResolved {
                    peer,
                    handle,
                    result,
                },
                Ok(Err(e)) => SetupEvent::AddressResolutionFailed {
                    peer,
                    handle,
                    error: SetupError::AddressResolution(format!("{:#}", e)),
                },
                Err(_) => {
                    log::debug!("lookup of {} timed out", request.instance_name());
                    SetupEvent::AddressResolutionFailed {
                        peer,
                        handle,
                        error: SetupError::Timeout,
                    }
                }
            };
            sink.post(event);
        });
        Ok(handle)
    }

    fn cancel_lookup(
        &mut self,
        handle: LookupHandle,
        failure_callback: FailureCallback,
    ) -> Result<(), SetupError> {
        let (peer, cancel) = lock(&self.lookups)
            .remove(&handle)
            .ok_or(SetupError::IncorrectState)?;
        cancel.cancel();
        if failure_callback == FailureCallback::Call {
            self.sink.post(SetupEvent::AddressResolutionFailed {
                peer,
                handle,
                error: SetupError::Cancelled,
            });
        }
        Ok(())
    }
}
