use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::CongestionConfig;
use crate::congestion::CongestionMonitor;
use crate::packet_header::{AckBitfield, PacketSeq, ReliabilitySegment};
use crate::round_trip::{RoundTripTracker, ACK_WINDOW};

/// Index of the oldest slot in the ack bitfield.
const OLDEST_TRACKED_BIT: u16 = ACK_WINDOW as u16 - 1;

/// Wraparound-aware comparison of 16-bit sequence numbers: `a` is considered
///  greater than `b` iff a forward wrap of at most half the sequence space
///  reaches `a` from `b` (RFC 1982 style serial number arithmetic).
pub fn sequence_greater_than(a: PacketSeq, b: PacketSeq) -> bool {
    const HALF_SEQUENCE: PacketSeq = PacketSeq::MAX / 2;

    ((a > b) && (a - b <= HALF_SEQUENCE)) || ((a < b) && (b - a > HALF_SEQUENCE))
}

/// One connection's sequencing and acknowledgement state - the engine behind
///  the reliability segment of every non-management packet.
///
/// Exactly one instance exists per client/server pair: embedded in the
///  server's connection slot, or owned by the client directly. It is never
///  shared across peers, and only ever touched from the role's network task.
///
/// Outgoing packets get stamped via [Self::next_segment], which consumes one
///  local sequence number and reports back to the peer what has been received
///  from it. Incoming segments go through [Self::process_segment], which
///  updates the receive-side bitfield and harvests acknowledgements for RTT
///  and congestion tracking. Invalid or stale segments are rejected without
///  side effects - reordering, duplication and adversarial input must never
///  desync this state machine.
pub struct ReliabilityContext {
    /// Sequence number of the next outgoing packet.
    local_sequence: PacketSeq,
    /// Highest sequence number received from the peer.
    remote_sequence: PacketSeq,
    /// Bit `i` set iff our packet `local_sequence - 1 - i` was acked by the peer.
    /// Starts all-ones so that nothing is in flight initially.
    local_ack_field: AckBitfield,
    /// Bit `i` set iff the peer's packet `remote_sequence - i` was received.
    /// Starts with bit 0 clear: packet 0 has not been received yet.
    remote_ack_field: AckBitfield,
    /// Time since the last accepted packet; the sole detector of a dead peer.
    last_packet_received: Duration,
    /// Packets that fell off the tracked window without ever being acked.
    presumed_lost: u64,
    round_trip: RoundTripTracker,
    congestion: CongestionMonitor,
}

impl ReliabilityContext {
    pub fn new(config: &CongestionConfig) -> ReliabilityContext {
        ReliabilityContext {
            local_sequence: 0,
            remote_sequence: 0,
            local_ack_field: AckBitfield::MAX,
            remote_ack_field: AckBitfield::MAX ^ 1,
            last_packet_received: Duration::ZERO,
            presumed_lost: 0,
            round_trip: RoundTripTracker::new(),
            congestion: CongestionMonitor::new(config),
        }
    }

    /// Advance per-tick state: the dead-peer accumulator and the congestion
    ///  monitor's quiet time.
    pub fn on_update(&mut self, delta_time: Duration) {
        self.last_packet_received += delta_time;

        self.congestion
            .on_update(delta_time, self.round_trip.average());
    }

    pub fn last_packet_received(&self) -> Duration {
        self.last_packet_received
    }

    pub fn is_congested(&self) -> bool {
        self.congestion.is_congested()
    }

    pub fn round_trip_average(&self) -> Duration {
        self.round_trip.average()
    }

    pub fn num_round_trip_samples(&self) -> u64 {
        self.round_trip.num_samples()
    }

    pub fn num_presumed_lost(&self) -> u64 {
        self.presumed_lost
    }

    /// Consume one local sequence number and produce the reliability segment
    ///  for the next outgoing packet: our sequence number, plus the ack data
    ///  telling the peer which of its packets we have seen.
    pub fn next_segment(&mut self) -> ReliabilitySegment {
        let sequence = self.local_sequence;

        // The oldest tracked slot is about to leave the window. If it was
        //  never acked, the packet sent 31 sequence numbers ago is presumed
        //  lost - evict it without an RTT sample.
        if self.local_ack_field & (1 << OLDEST_TRACKED_BIT) == 0 {
            self.presumed_lost += 1;
            trace!(
                "packet {} fell off the ack window unacknowledged - presumed lost",
                sequence.wrapping_sub(OLDEST_TRACKED_BIT)
            );
        }

        self.round_trip.record_send(sequence, Instant::now());

        self.local_sequence = self.local_sequence.wrapping_add(1);
        // make room for the new in-flight packet at bit 0; the high bit is
        //  discarded
        self.local_ack_field <<= 1;

        ReliabilitySegment {
            sequence,
            ack: self.remote_sequence,
            ack_bitfield: self.remote_ack_field,
        }
    }

    /// Process an incoming packet's reliability segment. Returns false iff the
    ///  packet is stale or a duplicate, in which case no state was touched and
    ///  the payload must not be dispatched.
    pub fn process_segment(&mut self, segment: &ReliabilitySegment) -> bool {
        if !self.process_received_sequence(segment.sequence) {
            return false;
        }

        // the peer is alive
        self.last_packet_received = Duration::ZERO;

        self.process_received_ack(segment.ack, segment.ack_bitfield);

        true
    }

    /// Fold a received sequence number into the remote tracking state.
    fn process_received_sequence(&mut self, received: PacketSeq) -> bool {
        if sequence_greater_than(received, self.remote_sequence) {
            let distance = received.wrapping_sub(self.remote_sequence);

            if distance > OLDEST_TRACKED_BIT {
                // the gap cannot be represented in the bitfield: everything
                //  previously tracked is out of the window now
                trace!("received sequence {} jumps past the ack window - clearing tracked acks", received);
                self.remote_ack_field = 1;
            } else {
                self.remote_ack_field = (self.remote_ack_field << distance) | 1;
            }
            self.remote_sequence = received;
        } else {
            let distance = self.remote_sequence.wrapping_sub(received);

            if distance > OLDEST_TRACKED_BIT || self.remote_ack_field & (1 << distance) != 0 {
                // too old to track, or a duplicate
                return false;
            }

            // out-of-order arrival inside the window
            self.remote_ack_field |= 1 << distance;
        }

        true
    }

    /// Fold the peer's ack data into the local tracking state, sampling RTT
    ///  for every newly acknowledged packet. Returns true iff at least one
    ///  packet was newly acknowledged.
    fn process_received_ack(&mut self, ack: PacketSeq, ack_bitfield: AckBitfield) -> bool {
        // The ack refers to a packet the peer *received*, so it can never be
        //  our not-yet-sent next sequence number or beyond. Anything else is a
        //  corrupted packet or a bad actor. The equality check is strict on
        //  purpose - it must hold across the wraparound boundary as well.
        if sequence_greater_than(ack, self.local_sequence) || ack == self.local_sequence {
            return false;
        }

        let distance = self.local_sequence.wrapping_sub(ack);
        if distance as usize > ACK_WINDOW {
            return false;
        }

        // Align bit positions: the peer's bit i refers to packet `ack - i`,
        //  our bit j refers to packet `local_sequence - 1 - j`.
        let aligned = ack_bitfield << (distance - 1);

        // logical implication: a bit we had not marked acked, that the peer
        //  says is acked, is new information
        let newly_acked = !self.local_ack_field & aligned;

        let now = Instant::now();
        let mut remaining = newly_acked;
        while remaining != 0 {
            let bit = remaining.trailing_zeros() as u16;
            remaining &= remaining - 1;

            let acked_sequence = self.local_sequence.wrapping_sub(1).wrapping_sub(bit);
            let round_trip = now.duration_since(self.round_trip.send_timestamp(acked_sequence));
            self.record_round_trip(round_trip);

            trace!("packet {} acknowledged, rtt {:?}", acked_sequence, round_trip);
        }

        self.local_ack_field |= aligned;

        newly_acked != 0
    }

    fn record_round_trip(&mut self, round_trip: Duration) {
        self.round_trip.add_sample(round_trip);

        self.congestion
            .on_round_trip_change(self.round_trip.average());
    }
}
