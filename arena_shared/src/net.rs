//! Packet router.
//!
//! Many logical packet streams share one physical transport. Every packet
//! starts with a header string `"<port>::<id>"` written through the codec:
//! the port selects a [`NetworkContext`], the id selects a listener inside it.
//!
//! Ingest pipeline (per context):
//! 1. reject data whose header cannot be decoded (malformed)
//! 2. on the server, reject data without an authenticated sender
//! 3. decode `port::id`
//! 4. silently drop other ports' packets
//! 5. fire the listeners registered for `id`, or warn about an unmapped id
//!
//! Delivery classes are chosen per packet: [`Reliability::Reliable`]
//! (ordered, higher latency) or [`Reliability::Unreliable`] (unordered,
//! low latency, may be lost or stale).

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    codec::{BufferReader, BufferWriter, CodecError},
    signal::{Connection, Signal},
};

/// Reserved separator between port and id in the packet header.
pub const SEPARATOR: &str = "::";

/// Identifies a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Which end of the connection a router lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Server,
    Client,
}

/// Delivery class of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// A connected peer as the router sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub authenticated: bool,
}

impl Peer {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            authenticated: true,
        }
    }
}

/// Connected peers, shared between a session and its routers.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    inner: Arc<RwLock<BTreeMap<PeerId, Peer>>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Peer) -> bool {
        self.write().insert(peer.id, peer).is_none()
    }

    pub fn remove(&self, id: PeerId) -> Option<Peer> {
        self.write().remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<Peer> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn is_authenticated(&self, id: PeerId) -> bool {
        self.read().get(&id).is_some_and(|p| p.authenticated)
    }

    /// Peer ids in ascending order.
    pub fn ids(&self) -> Vec<PeerId> {
        self.read().keys().copied().collect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<PeerId, Peer>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<PeerId, Peer>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Where an outbound packet goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Client to server.
    Server,
    /// Server to the listed peers.
    Peers(Vec<PeerId>),
}

impl Target {
    pub fn includes(&self, peer: PeerId) -> bool {
        match self {
            Target::Server => false,
            Target::Peers(peers) => peers.contains(&peer),
        }
    }
}

/// A finalized packet handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPacket {
    pub port: String,
    pub id: String,
    pub reliability: Reliability,
    pub target: Target,
    /// Full wire bytes, header included.
    pub data: Bytes,
}

/// A packet accepted by a context and handed to its listeners.
#[derive(Debug, Clone)]
pub struct RoutedPacket {
    pub port: String,
    pub id: String,
    pub sender: Option<PeerId>,
    /// Positioned just past the header.
    pub reader: BufferReader,
}

/// Router errors. Ingest errors are logged where they are detected; the
/// returned value is for callers that want to count or assert on them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("server-bound packet without an authenticated sender")]
    Unauthenticated,
    #[error("no listener for packet id {0:?}")]
    Unmapped(String),
    #[error("{0:?} must be non-empty and must not contain \"::\"")]
    InvalidName(String),
    #[error("port {0:?} is already bound")]
    PortInUse(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Physical transport below the routers.
pub trait Transport: Send + Sync {
    fn send(&self, packet: &OutboundPacket);
}

/// Transport that discards everything. Useful for headless tests and for
/// sessions mirrored through [`NetworkManager::posted`].
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _packet: &OutboundPacket) {}
}

/// Transport that hands packets to an async writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundPacket>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, packet: &OutboundPacket) {
        if self.tx.send(packet.clone()).is_err() {
            debug!(id = %packet.id, "Transport writer gone, dropping packet");
        }
    }
}

/// One inbound datagram or frame, as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub sender: Option<PeerId>,
    pub data: Bytes,
}

/// FIFO of inbound data, filled by transports and drained by the session.
#[derive(Debug, Clone, Default)]
pub struct InboundQueue {
    inner: Arc<Mutex<VecDeque<Inbound>>>,
}

impl InboundQueue {
    pub fn push(&self, sender: Option<PeerId>, data: Bytes) {
        self.lock().push_back(Inbound { sender, data });
    }

    pub fn drain(&self) -> Vec<Inbound> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Inbound>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Decides whether a peer may receive traffic on a port.
pub type Eligibility = Arc<dyn Fn(&Peer) -> bool + Send + Sync>;

/// Router counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub sent: AtomicU64,
    pub routed: AtomicU64,
    pub unmapped: AtomicU64,
    pub foreign_port: AtomicU64,
    pub malformed: AtomicU64,
    pub unauthenticated: AtomicU64,
}

impl RouterStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn validate_name(name: &str) -> Result<(), RouterError> {
    if name.is_empty() || name.contains(SEPARATOR) {
        return Err(RouterError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Reads and splits the `port::id` header.
fn decode_header(reader: &mut BufferReader) -> Result<(String, String), RouterError> {
    let header = reader
        .read_str()
        .map_err(|e| RouterError::Malformed(e.to_string()))?;
    match header.split_once(SEPARATOR) {
        Some((port, id)) if !port.is_empty() && !id.is_empty() => {
            Ok((port.to_string(), id.to_string()))
        }
        _ => Err(RouterError::Malformed(format!("bad header {header:?}"))),
    }
}

/// One port's packet router.
pub struct NetworkContext {
    port: String,
    side: Side,
    eligibility: Eligibility,
    transport: Arc<dyn Transport>,
    roster: Roster,
    listeners: RwLock<HashMap<String, Signal<RoutedPacket>>>,
    posted: Signal<OutboundPacket>,
    stats: RouterStats,
}

impl fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkContext")
            .field("port", &self.port)
            .field("side", &self.side)
            .finish()
    }
}

impl NetworkContext {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Begins a packet with the given id. The header is already written.
    pub fn packet(&self, id: &str) -> Result<PacketBuilder<'_>, RouterError> {
        validate_name(id)?;
        let mut writer = BufferWriter::new();
        writer.write_str(&format!("{}{SEPARATOR}{id}", self.port))?;
        Ok(PacketBuilder {
            ctx: self,
            id: id.to_string(),
            writer,
            reliability: Reliability::Reliable,
            recipients: None,
            ignore: Vec::new(),
        })
    }

    /// Registers a listener for packets with `id`.
    pub fn listen<F>(&self, id: &str, f: F) -> Result<Connection, RouterError>
    where
        F: Fn(RoutedPacket) + Send + Sync + 'static,
    {
        validate_name(id)?;
        let mut listeners = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        let signal = listeners
            .entry(id.to_string())
            .or_insert_with(|| Signal::new("packet_listener"));
        Ok(signal.connect(f))
    }

    /// Full ingest pipeline for data delivered straight to this context.
    pub fn ingest(
        &self,
        sender: Option<PeerId>,
        data: Bytes,
    ) -> Result<Option<RoutedPacket>, RouterError> {
        let mut reader = BufferReader::new(data);
        let (port, id) = match decode_header(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                RouterStats::bump(&self.stats.malformed);
                warn!(port = %self.port, error = %e, "Dropping malformed packet");
                return Err(e);
            }
        };
        self.check_sender(sender)?;
        if port != self.port {
            RouterStats::bump(&self.stats.foreign_port);
            trace!(own = %self.port, %port, "Packet for another port");
            return Ok(None);
        }
        self.dispatch(sender, id, reader).map(Some)
    }

    fn check_sender(&self, sender: Option<PeerId>) -> Result<(), RouterError> {
        if self.side != Side::Server {
            return Ok(());
        }
        match sender {
            Some(peer) if self.roster.is_authenticated(peer) => Ok(()),
            _ => {
                RouterStats::bump(&self.stats.unauthenticated);
                warn!(port = %self.port, ?sender, "Dropping packet from unauthenticated sender");
                Err(RouterError::Unauthenticated)
            }
        }
    }

    fn dispatch(
        &self,
        sender: Option<PeerId>,
        id: String,
        reader: BufferReader,
    ) -> Result<RoutedPacket, RouterError> {
        let signal = self
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .filter(|s| s.subscriber_count() > 0)
            .cloned();
        let Some(signal) = signal else {
            RouterStats::bump(&self.stats.unmapped);
            warn!(port = %self.port, %id, "Unmapped packet id");
            return Err(RouterError::Unmapped(id));
        };

        let packet = RoutedPacket {
            port: self.port.clone(),
            id,
            sender,
            reader,
        };
        RouterStats::bump(&self.stats.routed);
        signal.fire(packet.clone());
        Ok(packet)
    }

    fn resolve_target(&self, recipients: Option<Vec<PeerId>>, ignore: &[PeerId]) -> Target {
        if self.side == Side::Client {
            return Target::Server;
        }
        let candidates = recipients.unwrap_or_else(|| self.roster.ids());
        let peers = candidates
            .into_iter()
            .filter(|id| !ignore.contains(id))
            .filter(|id| self.roster.get(*id).is_some_and(|p| (self.eligibility)(&p)))
            .collect();
        Target::Peers(peers)
    }
}

/// Builder for one outbound packet. Reliable and addressed to every
/// eligible peer unless told otherwise.
pub struct PacketBuilder<'a> {
    ctx: &'a NetworkContext,
    id: String,
    writer: BufferWriter,
    reliability: Reliability,
    recipients: Option<Vec<PeerId>>,
    ignore: Vec<PeerId>,
}

impl<'a> PacketBuilder<'a> {
    /// Payload writer, positioned after the header.
    pub fn body(&mut self) -> &mut BufferWriter {
        &mut self.writer
    }

    pub fn unreliable(mut self) -> Self {
        self.reliability = Reliability::Unreliable;
        self
    }

    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    /// Server only: restricts delivery to these peers.
    pub fn to(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.recipients = Some(peers.into_iter().collect());
        self
    }

    /// Server only: never deliver to these peers.
    pub fn ignore(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.ignore.extend(peers);
        self
    }

    /// Finalizes the buffer and hands it to the transport. Returns the number
    /// of recipients (1 for client-to-server).
    pub fn send(self) -> usize {
        let ctx = self.ctx;
        let target = ctx.resolve_target(self.recipients, &self.ignore);
        let count = match &target {
            Target::Server => 1,
            Target::Peers(peers) => peers.len(),
        };
        if count == 0 {
            debug!(port = %ctx.port, id = %self.id, "No eligible recipients, packet dropped");
            return 0;
        }

        let packet = OutboundPacket {
            port: ctx.port.clone(),
            id: self.id,
            reliability: self.reliability,
            target,
            data: self.writer.finalize(),
        };
        ctx.transport.send(&packet);
        RouterStats::bump(&ctx.stats.sent);
        ctx.posted.fire(packet);
        count
    }
}

/// Owns the transport, the authentication roster and every port bound on it.
pub struct NetworkManager {
    side: Side,
    transport: Arc<dyn Transport>,
    roster: Roster,
    contexts: Vec<Arc<NetworkContext>>,
    inbound: InboundQueue,
    posted: Signal<OutboundPacket>,
}

impl NetworkManager {
    pub fn new(side: Side, transport: Arc<dyn Transport>, roster: Roster) -> Self {
        Self {
            side,
            transport,
            roster,
            contexts: Vec::new(),
            inbound: InboundQueue::default(),
            posted: Signal::new("packet_posted"),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Queue transports push into; drained by [`NetworkManager::pump`].
    pub fn inbound(&self) -> InboundQueue {
        self.inbound.clone()
    }

    /// Fired for every packet any context of this manager sends. Used to
    /// mirror two sessions living in the same process.
    pub fn posted(&self) -> &Signal<OutboundPacket> {
        &self.posted
    }

    /// Binds a new port. `eligibility` defaults to "every peer".
    pub fn context(
        &mut self,
        port: &str,
        eligibility: Option<Eligibility>,
    ) -> Result<Arc<NetworkContext>, RouterError> {
        validate_name(port)?;
        if self.contexts.iter().any(|c| c.port == port) {
            return Err(RouterError::PortInUse(port.to_string()));
        }
        let ctx = Arc::new(NetworkContext {
            port: port.to_string(),
            side: self.side,
            eligibility: eligibility.unwrap_or_else(|| Arc::new(|_: &Peer| true)),
            transport: self.transport.clone(),
            roster: self.roster.clone(),
            listeners: RwLock::new(HashMap::new()),
            posted: self.posted.clone(),
            stats: RouterStats::default(),
        });
        self.contexts.push(ctx.clone());
        Ok(ctx)
    }

    pub fn get(&self, port: &str) -> Option<Arc<NetworkContext>> {
        self.contexts.iter().find(|c| c.port == port).cloned()
    }

    /// Hands data to the context bound to its port. Returns whether a
    /// listener received it.
    pub fn ingest(&self, sender: Option<PeerId>, data: Bytes) -> bool {
        let mut reader = BufferReader::new(data.clone());
        let port = match decode_header(&mut reader) {
            Ok((port, _)) => port,
            Err(e) => {
                warn!(error = %e, "Dropping malformed packet");
                return false;
            }
        };
        match self.get(&port) {
            Some(ctx) => matches!(ctx.ingest(sender, data), Ok(Some(_))),
            None => {
                trace!(%port, "No context bound for port");
                false
            }
        }
    }

    /// Routes everything queued in arrival order. Returns the number of
    /// inbound items processed.
    pub fn pump(&self) -> usize {
        let batch = self.inbound.drain();
        let n = batch.len();
        for Inbound { sender, data } in batch {
            self.ingest(sender, data);
        }
        n
    }

    /// Drops every listener and unbinds every port.
    pub fn shutdown(&mut self) {
        for ctx in self.contexts.drain(..) {
            let listeners = ctx.listeners.read().unwrap_or_else(|p| p.into_inner());
            for signal in listeners.values() {
                signal.clear();
            }
        }
        self.posted.clear();
        self.inbound.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn server_with_peer() -> (NetworkManager, PeerId) {
        let roster = Roster::new();
        let peer = PeerId(7);
        roster.insert(Peer::new(peer, "alice"));
        (
            NetworkManager::new(Side::Server, Arc::new(NullTransport), roster),
            peer,
        )
    }

    fn counter() -> (Arc<AtomicU32>, impl Fn(RoutedPacket) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        (hits, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn packet_roundtrips_through_listener() {
        let mut client = NetworkManager::new(Side::Client, Arc::new(NullTransport), Roster::new());
        let (mut server, peer) = server_with_peer();
        let c = client.context("game", None).unwrap();
        let s = server.context("game", None).unwrap();

        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        s.listen("move", move |mut p: RoutedPacket| {
            *g.lock().unwrap() = Some((p.sender, p.reader.read_u8().unwrap()));
        })
        .unwrap();

        let outbound = Arc::new(Mutex::new(Vec::new()));
        let o = outbound.clone();
        client.posted().connect(move |p| o.lock().unwrap().push(p));

        let mut packet = c.packet("move").unwrap();
        packet.body().write_u8(42);
        assert_eq!(packet.unreliable().send(), 1);

        let sent = outbound.lock().unwrap().pop().unwrap();
        assert_eq!(sent.target, Target::Server);
        assert_eq!(sent.reliability, Reliability::Unreliable);
        assert!(server.ingest(Some(peer), sent.data));
        assert_eq!(*got.lock().unwrap(), Some((Some(peer), 42)));
    }

    #[test]
    fn ports_are_isolated_on_shared_transport() {
        let (mut server, peer) = server_with_peer();
        let a = server.context("a", None).unwrap();
        let b = server.context("b", None).unwrap();
        let (a_hits, a_cb) = counter();
        let (b_hits, b_cb) = counter();
        a.listen("x", a_cb).unwrap();
        b.listen("x", b_cb).unwrap();

        let mut w = BufferWriter::new();
        w.write_str("a::x").unwrap();
        let data = w.finalize();
        assert!(server.ingest(Some(peer), data.clone()));
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 0);

        // Offered directly, the other router drops it without error.
        assert!(b.ingest(Some(peer), data).unwrap().is_none());
        assert_eq!(b_hits.load(Ordering::SeqCst), 0);
        assert_eq!(RouterStats::get(&b.stats().foreign_port), 1);
    }

    #[test]
    fn server_rejects_unauthenticated_sender() {
        let (mut server, _peer) = server_with_peer();
        let ctx = server.context("game", None).unwrap();
        let (hits, cb) = counter();
        ctx.listen("x", cb).unwrap();

        let mut w = BufferWriter::new();
        w.write_str("game::x").unwrap();
        let data = w.finalize();
        assert_eq!(
            ctx.ingest(None, data.clone()).unwrap_err(),
            RouterError::Unauthenticated
        );
        assert_eq!(
            ctx.ingest(Some(PeerId(99)), data).unwrap_err(),
            RouterError::Unauthenticated
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_and_unmapped_are_dropped() {
        let (mut server, peer) = server_with_peer();
        let ctx = server.context("game", None).unwrap();

        assert!(matches!(
            ctx.ingest(Some(peer), Bytes::from_static(&[9])),
            Err(RouterError::Malformed(_))
        ));

        let mut w = BufferWriter::new();
        w.write_str("no-separator").unwrap();
        assert!(matches!(
            ctx.ingest(Some(peer), w.finalize()),
            Err(RouterError::Malformed(_))
        ));

        let mut w = BufferWriter::new();
        w.write_str("game::nobody").unwrap();
        assert_eq!(
            ctx.ingest(Some(peer), w.finalize()).unwrap_err(),
            RouterError::Unmapped("nobody".to_string())
        );
        assert_eq!(RouterStats::get(&ctx.stats().unmapped), 1);
    }

    #[test]
    fn panicking_listener_does_not_poison_router() {
        let (mut server, peer) = server_with_peer();
        let ctx = server.context("game", None).unwrap();
        ctx.listen("x", |_| panic!("handler bug")).unwrap();
        let (hits, cb) = counter();
        ctx.listen("x", cb).unwrap();

        let mut w = BufferWriter::new();
        w.write_str("game::x").unwrap();
        let data = w.finalize();
        assert!(ctx.ingest(Some(peer), data.clone()).is_ok());
        assert!(ctx.ingest(Some(peer), data).is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn recipients_respect_ignore_and_eligibility() {
        let (mut server, alice) = server_with_peer();
        let bob = PeerId(8);
        let carol = PeerId(9);
        server.roster().insert(Peer::new(bob, "bob"));
        server.roster().insert(Peer::new(carol, "carol"));

        let ctx = server
            .context("team", Some(Arc::new(move |p: &Peer| p.id != carol)))
            .unwrap();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let s = sent.clone();
        server.posted().connect(move |p| s.lock().unwrap().push(p.target));

        assert_eq!(ctx.packet("hi").unwrap().ignore([bob]).send(), 1);
        assert_eq!(ctx.packet("hi").unwrap().to([carol]).send(), 0);
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &[Target::Peers(vec![alice])]
        );
    }

    #[test]
    fn names_with_separator_are_rejected() {
        let (mut server, _) = server_with_peer();
        assert!(matches!(
            server.context("a::b", None),
            Err(RouterError::InvalidName(_))
        ));
        let ctx = server.context("a", None).unwrap();
        assert!(ctx.packet("x::y").is_err());
        assert!(ctx.listen("", |_| {}).is_err());
        assert!(matches!(
            server.context("a", None),
            Err(RouterError::PortInUse(_))
        ));
    }

    #[test]
    fn pump_drains_in_arrival_order() {
        let (mut server, peer) = server_with_peer();
        let ctx = server.context("game", None).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        ctx.listen("n", move |mut p: RoutedPacket| {
            o.lock().unwrap().push(p.reader.read_u8().unwrap());
        })
        .unwrap();

        let queue = server.inbound();
        for n in [3u8, 1, 2] {
            let mut w = BufferWriter::new();
            w.write_str("game::n").unwrap().write_u8(n);
            queue.push(Some(peer), w.finalize());
        }
        assert_eq!(server.pump(), 3);
        assert_eq!(*order.lock().unwrap(), vec![3, 1, 2]);
        assert!(queue.is_empty());
    }
}
