//! # Packet Router
//!
//! The router owns the packet-type registry, request/response correlation and
//! inbound dispatch. Every other component sends and receives through it.
//!
//! ## Dispatch Table
//!
//! Handlers are plain function pointers `fn(&mut C, Packet)` where `C` is the
//! component that owns the router (the `Node`). Registration assigns dense,
//! monotonically increasing type ids in registration order; the table is
//! indexed by that id. The router never calls a handler itself: [`PacketRouter::route`]
//! returns a [`Route`] and the owner invokes it with `&mut self`, so handlers
//! get full access to node state without aliasing the router.
//!
//! ## Request Lifecycle
//!
//! ```text
//! send_request ──► PendingRequest{created_at, expires_at, callback}
//!                       │
//!         ┌─────────────┴──────────────┐
//!   matching Response            sweep_expired(now)
//!   (route → Resolve)            (callback(None))
//!         └──────── entry removed ─────┘
//! ```
//!
//! Both paths remove the entry before handing out the callback, so a request
//! resolves exactly once even when a response and the deadline land on the
//! same tick. A response that finds no pending entry is *late* and falls back
//! to the plain handler for its type.
//!
//! ## Errors
//!
//! Registry problems are [`ConfigurationError`]s. They indicate a deployment
//! bug (duplicate registration, unregistered inbound type) and are fatal;
//! callers propagate them rather than retrying.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::identity::{Address, NodeId, SimContext};
use crate::messages::{Packet, PacketType, RespondableInfo, ResponseInfo};
use crate::protocols::Transport;

// ============================================================================
// Configuration
// ============================================================================

/// Deadline applied when a request doesn't specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum outstanding requests per node.
/// Requests beyond this are not sent and resolve as timeouts on the next sweep.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 4096;

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub request_timeout: Duration,
    pub max_pending_requests: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Fatal registry/deployment errors. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A handler was registered twice for the same type.
    DuplicateRegistration(PacketType),
    /// A packet type was sent before being registered.
    UnregisteredType(PacketType),
    /// An inbound packet carried a type id this node never assigned.
    UnknownTypeId(u16),
    /// An inbound type id maps to a different type locally.
    TypeMismatch { type_id: u16, expected: PacketType, actual: PacketType },
    /// A request was made with a type that can't carry a reply address.
    NotRespondable(PacketType),
    /// A response was sent with a type that isn't a response type.
    NotResponse(PacketType),
    /// A broadcast was made with a type that isn't broadcastable.
    NotBroadcastable(PacketType),
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRegistration(t) => write!(f, "handler for {t:?} registered twice"),
            Self::UnregisteredType(t) => write!(f, "packet type {t:?} is not registered"),
            Self::UnknownTypeId(id) => write!(f, "inbound type id {id} is not registered"),
            Self::TypeMismatch { type_id, expected, actual } => write!(
                f,
                "type id {type_id} is registered as {expected:?} but carried {actual:?}"
            ),
            Self::NotRespondable(t) => write!(f, "packet type {t:?} is not respondable"),
            Self::NotResponse(t) => write!(f, "packet type {t:?} is not a response type"),
            Self::NotBroadcastable(t) => write!(f, "packet type {t:?} is not broadcastable"),
        }
    }
}

impl std::error::Error for ConfigurationError {}

// ============================================================================
// Handlers and Routes
// ============================================================================

/// Inbound handler for one packet type.
pub type Handler<C> = fn(&mut C, Packet) -> anyhow::Result<()>;

/// Resolution of a request: `Some(response)` or `None` on timeout.
pub type ResponseCallback<C> = Box<dyn FnOnce(&mut C, Option<Packet>) -> anyhow::Result<()> + Send>;

/// Receive middleware. Returning `false` aborts dispatch silently.
pub type ReceiveMiddleware = Box<dyn Fn(&Packet) -> bool + Send + Sync>;

/// Whether inbound packets pass through the broadcast de-duplication guard
/// before reaching the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    Plain,
    BroadcastGuarded,
}

struct HandlerEntry<C> {
    packet_type: PacketType,
    handler: Handler<C>,
    kind: HandlerKind,
}

/// Why an inbound packet was not dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Middleware,
    LateResponse,
}

/// What the owner should do with an inbound packet.
pub enum Route<C> {
    Handle {
        handler: Handler<C>,
        kind: HandlerKind,
        packet: Packet,
    },
    Resolve {
        callback: ResponseCallback<C>,
        packet: Packet,
    },
    Drop(DropReason),
}

struct PendingRequest<C> {
    created_at: Duration,
    expires_at: Duration,
    packet_type: PacketType,
    on_resolve: ResponseCallback<C>,
}

/// Counters exposed for telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub sent: u64,
    pub received: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub late_responses: u64,
    pub dropped_by_middleware: u64,
}

// ============================================================================
// Router
// ============================================================================

pub struct PacketRouter<C> {
    local_id: NodeId,
    local_address: Address,
    ctx: Arc<SimContext>,
    transport: Arc<dyn Transport>,
    config: RouterConfig,
    type_ids: HashMap<PacketType, u16>,
    entries: Vec<HandlerEntry<C>>,
    /// Keyed by request unique id; ordered so sweeps resolve deterministically.
    pending: BTreeMap<u64, PendingRequest<C>>,
    /// Requests refused for capacity, resolved as timeouts on the next sweep.
    overflow: Vec<ResponseCallback<C>>,
    middleware: Vec<ReceiveMiddleware>,
    stats: RouterStats,
}

impl<C> PacketRouter<C> {
    pub fn new(
        local_id: NodeId,
        local_address: Address,
        ctx: Arc<SimContext>,
        transport: Arc<dyn Transport>,
        config: RouterConfig,
    ) -> Self {
        Self {
            local_id,
            local_address,
            ctx,
            transport,
            config,
            type_ids: HashMap::new(),
            entries: Vec::new(),
            pending: BTreeMap::new(),
            overflow: Vec::new(),
            middleware: Vec::new(),
            stats: RouterStats::default(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_address(&self) -> Address {
        self.local_address
    }

    pub fn now(&self) -> Duration {
        self.ctx.now()
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len() + self.overflow.len()
    }

    pub fn is_pending(&self, request_id: u64) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub fn type_id(&self, packet_type: PacketType) -> Option<u16> {
        self.type_ids.get(&packet_type).copied()
    }

    /// Register the handler for `packet_type`, returning its dense type id.
    pub fn register_handler(&mut self, packet_type: PacketType, handler: Handler<C>) -> Result<u16, ConfigurationError> {
        self.register(packet_type, handler, HandlerKind::Plain)
    }

    pub(crate) fn register(
        &mut self,
        packet_type: PacketType,
        handler: Handler<C>,
        kind: HandlerKind,
    ) -> Result<u16, ConfigurationError> {
        if self.type_ids.contains_key(&packet_type) {
            warn!(node = %self.local_id, ?packet_type, "duplicate handler registration");
            return Err(ConfigurationError::DuplicateRegistration(packet_type));
        }
        // PacketType is closed, so the table never outgrows u16.
        let type_id = self.entries.len() as u16;
        self.type_ids.insert(packet_type, type_id);
        self.entries.push(HandlerEntry { packet_type, handler, kind });
        trace!(node = %self.local_id, ?packet_type, type_id, "registered handler");
        Ok(type_id)
    }

    pub fn add_receive_middleware(&mut self, middleware: ReceiveMiddleware) {
        self.middleware.push(middleware);
    }

    fn stamp(&self, packet: &mut Packet) -> Result<(), ConfigurationError> {
        let packet_type = packet.packet_type();
        let type_id = self.type_id(packet_type).ok_or(ConfigurationError::UnregisteredType(packet_type))?;
        let kinds = packet_type.kinds();
        if packet.response.is_some() && !kinds.response {
            return Err(ConfigurationError::NotResponse(packet_type));
        }
        if packet.broadcast.is_some() && !kinds.broadcastable {
            return Err(ConfigurationError::NotBroadcastable(packet_type));
        }

        packet.header.unique_id = self.ctx.next_unique_id();
        packet.header.sender_id = Some(self.local_id);
        packet.header.type_id = type_id;
        packet.header.sent_at = self.ctx.now();
        if kinds.respondable {
            packet.respondable = Some(RespondableInfo { sender_address: self.local_address });
        }
        Ok(())
    }

    /// Stamp and hand a packet to the transport. Returns its unique id.
    pub fn send(&mut self, to: Address, mut packet: Packet) -> Result<u64, ConfigurationError> {
        self.stamp(&mut packet)?;
        let unique_id = packet.header.unique_id;
        trace!(node = %self.local_id, %to, packet_type = ?packet.packet_type(), unique_id, "send");
        self.stats.sent += 1;
        self.transport.send(to, packet);
        Ok(unique_id)
    }

    /// Send a request whose `callback` fires exactly once: with the response,
    /// or with `None` once `timeout` (default from config) has elapsed.
    pub fn send_request(
        &mut self,
        to: Address,
        mut packet: Packet,
        timeout: Option<Duration>,
        callback: ResponseCallback<C>,
    ) -> Result<u64, ConfigurationError> {
        let packet_type = packet.packet_type();
        if !packet_type.kinds().respondable {
            return Err(ConfigurationError::NotRespondable(packet_type));
        }
        self.stamp(&mut packet)?;
        let unique_id = packet.header.unique_id;

        if self.pending.len() >= self.config.max_pending_requests {
            debug!(node = %self.local_id, ?packet_type, "pending request table full, request not sent");
            self.overflow.push(callback);
            return Ok(unique_id);
        }

        let created_at = self.ctx.now();
        let expires_at = created_at + timeout.unwrap_or(self.config.request_timeout);
        self.pending.insert(
            unique_id,
            PendingRequest { created_at, expires_at, packet_type, on_resolve: callback },
        );
        trace!(node = %self.local_id, %to, ?packet_type, unique_id, "send request");
        self.stats.sent += 1;
        self.transport.send(to, packet);
        Ok(unique_id)
    }

    /// Answer `request` with `response`, correlated by the request's unique id.
    pub fn send_response(&mut self, request: &Packet, mut response: Packet) -> Result<u64, ConfigurationError> {
        let response_type = response.packet_type();
        if !response_type.kinds().response {
            return Err(ConfigurationError::NotResponse(response_type));
        }
        let to = request
            .reply_address()
            .ok_or(ConfigurationError::NotRespondable(request.packet_type()))?;
        response.response = Some(ResponseInfo {
            caller_id: request.header.unique_id,
            round_trip: Duration::ZERO,
        });
        self.send(to, response)
    }

    /// Decide what to do with an inbound packet.
    ///
    /// Runs the receive middleware, then either resolves a pending request,
    /// routes a late response to its fallback handler, or dispatches to the
    /// registered handler. An unregistered inbound type is an error.
    pub fn route(&mut self, mut packet: Packet) -> Result<Route<C>, ConfigurationError> {
        self.stats.received += 1;

        if !self.middleware.iter().all(|m| m(&packet)) {
            self.stats.dropped_by_middleware += 1;
            trace!(node = %self.local_id, packet_type = ?packet.packet_type(), "dropped by receive middleware");
            return Ok(Route::Drop(DropReason::Middleware));
        }

        let actual = packet.packet_type();
        let type_id = packet.header.type_id;
        let entry = self.entries.get(usize::from(type_id));
        if let Some(entry) = entry {
            if entry.packet_type != actual {
                warn!(node = %self.local_id, type_id, expected = ?entry.packet_type, ?actual, "type id mismatch");
                return Err(ConfigurationError::TypeMismatch { type_id, expected: entry.packet_type, actual });
            }
        }

        if let Some(info) = packet.response {
            if let Some(pending) = self.pending.remove(&info.caller_id) {
                let round_trip = self.ctx.now().saturating_sub(pending.created_at);
                packet.response = Some(ResponseInfo { round_trip, ..info });
                self.stats.resolved += 1;
                trace!(
                    node = %self.local_id,
                    caller_id = info.caller_id,
                    request_type = ?pending.packet_type,
                    rtt_ms = round_trip.as_millis() as u64,
                    "request resolved"
                );
                return Ok(Route::Resolve { callback: pending.on_resolve, packet });
            }
            self.stats.late_responses += 1;
            return Ok(match entry {
                Some(entry) => Route::Handle { handler: entry.handler, kind: entry.kind, packet },
                None => {
                    trace!(node = %self.local_id, caller_id = info.caller_id, "late response without handler dropped");
                    Route::Drop(DropReason::LateResponse)
                }
            });
        }

        match entry {
            Some(entry) => Ok(Route::Handle { handler: entry.handler, kind: entry.kind, packet }),
            None => {
                warn!(node = %self.local_id, type_id, ?actual, "inbound packet of unregistered type");
                Err(ConfigurationError::UnknownTypeId(type_id))
            }
        }
    }

    /// Remove every request whose deadline has passed and return their
    /// callbacks, in request order. Each must be invoked with `None`.
    pub fn sweep_expired(&mut self) -> Vec<ResponseCallback<C>> {
        let now = self.ctx.now();
        let mut expired: Vec<ResponseCallback<C>> = std::mem::take(&mut self.overflow);
        self.stats.timed_out += expired.len() as u64;

        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(node = %self.local_id, request_id = id, request_type = ?pending.packet_type, "request timed out");
                self.stats.timed_out += 1;
                expired.push(pending.on_resolve);
            }
        }
        expired
    }
}
