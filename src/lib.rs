//! A reliability layer on top of UDP for small, frequent application messages.
//!
//! UDP gives neither delivery nor ordering guarantees; this crate adds
//!  per-packet delivery *tracking* on top (which packets arrived, and how fast)
//!  without the retransmission and head-of-line blocking machinery of TCP. The
//!  application learns what was lost and decides what to do about it.
//!
//! Every non-management packet carries a fixed 11-byte header:
//! ```ascii
//! 0:  app id (u8)
//! 1:  packet type (u8)
//! 2:  client index (u8)
//! 3:  sequence (u16)
//! 5:  ack (u16)
//! 7:  ack bitfield (u32)
//! 11: payload (0..=245 bytes)
//! ```
//! The sequence number identifies this packet; the ack and ack bitfield
//!  piggy-back receive state for the opposite direction onto every outgoing
//!  packet, acknowledging up to 33 peer packets at a time. Sequence numbers
//!  are 16 bit and wrap around, all comparisons use serial number arithmetic
//!  ([reliability::sequence_greater_than]).
//!
//! There are two roles with one network task each ([client::Client::run] and
//!  [server::Server::run]): a server multiplexes up to a configured number of
//!  peers over a single socket, routing by the client index it assigned during
//!  the handshake, while a client talks to exactly one server. Each task owns
//!  its connection state outright and is driven by socket readiness, a command
//!  channel, and a periodic tick - there are no locks on the packet path.
//!
//! Round trip times are measured from the piggy-backed acks and folded into an
//!  exponentially weighted moving average per connection; a binary congestion
//!  classifier ([congestion::CongestionMonitor]) on top of that average
//!  throttles keep-alive traffic to peers that are struggling.

pub mod client;
pub mod config;
pub mod congestion;
pub mod connection_list;
pub mod event_handler;
pub mod packet_header;
pub mod peer_addr;
pub mod reliability;
pub mod round_trip;
pub mod server;
pub mod socket;
