//! Collaborator trait definitions for the overlay.
//!
//! The overlay never touches sockets. It hands fully stamped packets to a
//! [`Transport`] and is handed inbound packets by whoever drives the node
//! (`Node::receive`), which plays the role of the receive callback.
//!
//! ## Delivery Contract
//!
//! | Property | Guarantee |
//! |----------|-----------|
//! | Duplication | Never: each sent packet is delivered at most once |
//! | Loss | Allowed, silently (offline/sleeping nodes, lossy links) |
//! | Ordering | None |
//!
//! Because loss is silent, every request made through the router carries a
//! deadline and is resolved by the timeout sweep if nothing comes back.

use crate::identity::Address;
use crate::messages::Packet;

/// Outbound half of the transport collaborator.
pub trait Transport: Send + Sync {
    /// Hand a packet to the network. Never fails from the caller's view:
    /// undeliverable packets are dropped.
    fn send(&self, to: Address, packet: Packet);
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, to: Address, packet: Packet) {
        (**self).send(to, packet)
    }
}
