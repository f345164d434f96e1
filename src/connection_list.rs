use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::CongestionConfig;
use crate::packet_header::ClientIndex;
use crate::peer_addr::PeerAddr;
use crate::reliability::ReliabilityContext;

/// One server-side peer record: the peer's endpoint and its reliability state.
/// Exists only while its slot in the [ConnectionList] is active.
pub struct Connection {
    pub peer: PeerAddr,
    pub reliability: ReliabilityContext,
}

/// Fixed-capacity slot table mapping a small client index to a peer and its
///  [ReliabilityContext]. Only the server needs this - it multiplexes many
///  peers over one socket, and the client index embedded in each packet is the
///  routing key.
///
/// A client index is stable for the connection's lifetime and reused only
///  after explicit removal.
pub struct ConnectionList {
    slots: Vec<Option<Connection>>,
    by_addr: FxHashMap<PeerAddr, ClientIndex>,
    congestion_config: CongestionConfig,
    count: usize,
}

impl ConnectionList {
    pub fn with_capacity(capacity: usize, congestion_config: CongestionConfig) -> ConnectionList {
        assert!(capacity < ClientIndex::MAX as usize);

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        ConnectionList {
            slots,
            by_addr: FxHashMap::default(),
            congestion_config,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_active(&self, index: ClientIndex) -> bool {
        self.slots
            .get(index as usize)
            .is_some_and(|slot| slot.is_some())
    }

    pub fn get(&self, index: ClientIndex) -> Option<&Connection> {
        self.slots.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: ClientIndex) -> Option<&mut Connection> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    /// The active index for a peer address, if it already holds a slot. Used
    ///  to keep retransmitted connection requests from allocating twice.
    pub fn index_of(&self, peer: PeerAddr) -> Option<ClientIndex> {
        self.by_addr.get(&peer).copied()
    }

    /// Allocate the lowest free slot for a new peer, or None if the pool is
    ///  exhausted.
    pub fn add(&mut self, peer: PeerAddr) -> Option<ClientIndex> {
        let free = self.slots.iter().position(|slot| slot.is_none())?;
        let index = free as ClientIndex;

        self.slots[free] = Some(Connection {
            peer,
            reliability: ReliabilityContext::new(&self.congestion_config),
        });
        self.by_addr.insert(peer, index);
        self.count += 1;

        debug!("allocated connection slot {} for {:?}", index, peer);
        Some(index)
    }

    /// Clear a slot, making its index available for reuse. Returns false if
    ///  the slot was not active.
    pub fn remove(&mut self, index: ClientIndex) -> bool {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return false;
        };
        let Some(connection) = slot.take() else {
            return false;
        };

        self.by_addr.remove(&connection.peer);
        self.count -= 1;

        debug!("cleared connection slot {} ({:?})", index, connection.peer);
        true
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (ClientIndex, &Connection)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|conn| (index as ClientIndex, conn)))
    }

    pub fn iter_active_mut(&mut self) -> impl Iterator<Item = (ClientIndex, &mut Connection)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|conn| (index as ClientIndex, conn)))
    }
}
