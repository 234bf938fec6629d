//! Device registry
//!
//! Slots are assigned once, in discovery order, and never handed to another
//! device. A removed slot stays empty so late completions carrying its id
//! cannot be mistaken for another device's.

use crate::usb::device::InterruptDevice;
use crate::usb::transfers::StreamState;
use protocol::{DeviceSummary, SlotId};

/// Per-slot counters, logged at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Reports handed to the sink
    pub reports: u64,
    /// Completed payloads rejected by the decoder
    pub discarded: u64,
    /// Transient transfer failures
    pub transient_errors: u64,
    /// Reads submitted after the first one
    pub resubmits: u64,
}

/// One claimed device and its stream
pub struct Slot<D> {
    pub device: D,
    pub state: StreamState,
    /// Receive buffer, `None` while the backend holds it
    buffer: Option<Vec<u8>>,
    pub stats: SlotStats,
}

impl<D: InterruptDevice> Slot<D> {
    fn new(device: D) -> Self {
        Self {
            device,
            state: StreamState::Idle,
            buffer: None,
            stats: SlotStats::default(),
        }
    }

    /// Take the receive buffer for a submit, allocating on first use
    pub fn take_buffer(&mut self) -> Vec<u8> {
        let len = self.device.endpoint().buffer_len();
        match self.buffer.take() {
            Some(mut buffer) => {
                buffer.resize(len, 0);
                buffer
            }
            None => vec![0u8; len],
        }
    }

    /// Put the buffer back once its read has retired
    pub fn store_buffer(&mut self, buffer: Vec<u8>) {
        self.buffer = Some(buffer);
    }
}

/// Arena of claimed devices addressed by [`SlotId`]
pub struct DeviceRegistry<D> {
    slots: Vec<Option<Slot<D>>>,
}

impl<D: InterruptDevice> DeviceRegistry<D> {
    pub fn new(devices: Vec<D>) -> Self {
        Self {
            slots: devices.into_iter().map(|d| Some(Slot::new(d))).collect(),
        }
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of live slots in slot order
    pub fn ids(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| SlotId(i))
            .collect()
    }

    pub fn get(&self, slot: SlotId) -> Option<&Slot<D>> {
        self.slots.get(slot.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut Slot<D>> {
        self.slots.get_mut(slot.0).and_then(Option::as_mut)
    }

    /// Take a slot out of the registry. The id is not reused.
    pub fn remove(&mut self, slot: SlotId) -> Option<Slot<D>> {
        self.slots.get_mut(slot.0).and_then(Option::take)
    }

    /// Reads in flight across all slots
    pub fn outstanding(&self) -> usize {
        self.iter().map(|(_, s)| s.state.outstanding()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &Slot<D>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (SlotId(i), s)))
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.iter()
            .map(|(id, s)| s.device.summary(id, !s.state.is_idle()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDevice;

    fn registry(n: usize) -> DeviceRegistry<MockDevice> {
        DeviceRegistry::new(
            (0..n)
                .map(|i| MockDevice::mouse(0x1000 + i as u16))
                .collect(),
        )
    }

    #[test]
    fn test_slots_follow_discovery_order() {
        let registry = registry(3);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.ids(), vec![SlotId(0), SlotId(1), SlotId(2)]);
        assert_eq!(
            registry.get(SlotId(2)).map(|s| s.device.info().product_id),
            Some(0x1002)
        );
    }

    #[test]
    fn test_removed_slot_is_not_reused() {
        let mut registry = registry(3);
        assert!(registry.remove(SlotId(1)).is_some());
        assert!(registry.remove(SlotId(1)).is_none());
        assert!(registry.get(SlotId(1)).is_none());
        assert_eq!(registry.ids(), vec![SlotId(0), SlotId(2)]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_outstanding_counts_pending_and_cancelling() {
        let mut registry = registry(3);
        assert_eq!(registry.outstanding(), 0);

        registry.get_mut(SlotId(0)).unwrap().state = StreamState::pending();
        registry.get_mut(SlotId(2)).unwrap().state = StreamState::Cancelling;
        assert_eq!(registry.outstanding(), 2);

        let summaries = registry.summaries();
        assert!(summaries[0].streaming);
        assert!(!summaries[1].streaming);
    }

    #[test]
    fn test_buffer_sized_to_max_packet() {
        let mut registry = registry(1);
        let slot = registry.get_mut(SlotId(0)).unwrap();

        let buffer = slot.take_buffer();
        assert_eq!(buffer.len(), 8);

        let ptr = buffer.as_ptr();
        slot.store_buffer(buffer);
        let again = slot.take_buffer();
        assert_eq!(again.as_ptr(), ptr);
    }

    #[test]
    fn test_unknown_slot() {
        let mut registry = registry(1);
        assert!(registry.get(SlotId(5)).is_none());
        assert!(registry.get_mut(SlotId(5)).is_none());
        assert!(registry.remove(SlotId(5)).is_none());
    }
}
