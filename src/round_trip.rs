use std::time::Duration;

use tokio::time::Instant;

use crate::packet_header::PacketSeq;

/// Number of packets tracked by the ack bitfield, and therefore the number of
///  send timestamps that can be attributed to an acknowledgement. This bounds
///  the protocol's maximum safe in-flight count: a slot is overwritten every
///  32 packets, so an RTT sample is only meaningful while its packet is still
///  inside the unacknowledged window.
pub const ACK_WINDOW: usize = 32;

/// Weight of a new sample in the RTT moving average.
const NEW_SAMPLE_WEIGHT: f64 = 0.1;

/// Round-trip sampler: a fixed ring of send timestamps keyed by sequence
///  number, folded into an exponentially weighted moving average on
///  acknowledgement.
pub struct RoundTripTracker {
    average: Duration,
    num_samples: u64,
    send_timestamps: [Instant; ACK_WINDOW],
}

impl RoundTripTracker {
    pub fn new() -> RoundTripTracker {
        RoundTripTracker {
            average: Duration::ZERO,
            num_samples: 0,
            send_timestamps: [Instant::now(); ACK_WINDOW],
        }
    }

    pub fn record_send(&mut self, sequence: PacketSeq, timestamp: Instant) {
        self.send_timestamps[sequence as usize % ACK_WINDOW] = timestamp;
    }

    pub fn send_timestamp(&self, sequence: PacketSeq) -> Instant {
        self.send_timestamps[sequence as usize % ACK_WINDOW]
    }

    pub fn add_sample(&mut self, round_trip: Duration) {
        self.average = self.average.mul_f64(1.0 - NEW_SAMPLE_WEIGHT)
            + round_trip.mul_f64(NEW_SAMPLE_WEIGHT);
        self.num_samples += 1;
    }

    pub fn average(&self) -> Duration {
        self.average
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }
}
