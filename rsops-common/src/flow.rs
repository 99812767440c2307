//! Socket filter flow counter.
//!
//! Walks a fixed Ethernet + IPv4 header layout, keeps TCP, UDP and ICMP, and
//! counts packets per (source, destination) address pair.

use crate::{
    Decision, Frame, FlowCountTable, FlowKey, TableError, ETH_HLEN, FLOW_MIN_FRAME_LEN,
    IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPV4_DADDR_OFFSET, IPV4_PROTOCOL_OFFSET,
    IPV4_SADDR_OFFSET,
};

/// Transport protocols that get a flow counter
#[inline(always)]
pub fn is_counted_protocol(protocol: u8) -> bool {
    matches!(protocol, IPPROTO_TCP | IPPROTO_UDP | IPPROTO_ICMP)
}

/// Extract the flow key of a frame, or `None` if the frame is truncated or
/// carries a protocol we do not count.
#[inline(always)]
pub fn flow_key_of<F: Frame + ?Sized>(frame: &F) -> Option<FlowKey> {
    // The Ethernet header is skipped without looking at the EtherType.
    if frame.len() < FLOW_MIN_FRAME_LEN {
        return None;
    }

    let protocol = frame.load_u8(ETH_HLEN + IPV4_PROTOCOL_OFFSET)?;
    if !is_counted_protocol(protocol) {
        return None;
    }

    let saddr = frame.load_be_u32(ETH_HLEN + IPV4_SADDR_OFFSET)?;
    let daddr = frame.load_be_u32(ETH_HLEN + IPV4_DADDR_OFFSET)?;
    Some(FlowKey::new(saddr, daddr))
}

/// Count one packet for its flow.
///
/// Always returns [`Decision::Drop`]: the program is a counting tap and the
/// socket it is attached to never delivers packets.
#[inline(always)]
pub fn classify_and_count<F, T>(frame: &F, flows: &mut T) -> Decision
where
    F: Frame + ?Sized,
    T: FlowCountTable,
{
    let Some(key) = flow_key_of(frame) else {
        return Decision::Drop;
    };

    if !flows.increment(key) {
        // Lost the creation race to another core: count on its entry.
        if let Err(TableError::Occupied) = flows.insert(key, 1) {
            flows.increment(key);
        }
    }

    Decision::Drop
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::collections::HashMap;
    use std::vec;
    use std::vec::Vec;

    /// In-memory stand-in for the kernel hash map
    struct FakeFlowTable {
        entries: HashMap<FlowKey, i64>,
        capacity: usize,
    }

    impl FakeFlowTable {
        fn new(capacity: usize) -> Self {
            Self {
                entries: HashMap::new(),
                capacity,
            }
        }

        fn count(&self, key: FlowKey) -> Option<i64> {
            self.entries.get(&key).copied()
        }
    }

    impl FlowCountTable for FakeFlowTable {
        fn increment(&mut self, key: FlowKey) -> bool {
            match self.entries.get_mut(&key) {
                Some(count) => {
                    *count = count.wrapping_add(1);
                    true
                }
                None => false,
            }
        }

        fn insert(&mut self, key: FlowKey, count: i64) -> Result<(), TableError> {
            if self.entries.contains_key(&key) {
                return Err(TableError::Occupied);
            }
            if self.entries.len() >= self.capacity {
                return Err(TableError::Full);
            }
            self.entries.insert(key, count);
            Ok(())
        }
    }

    /// Table whose first insert loses to a concurrent writer
    struct RacingFlowTable {
        inner: FakeFlowTable,
        raced: bool,
    }

    impl FlowCountTable for RacingFlowTable {
        fn increment(&mut self, key: FlowKey) -> bool {
            self.inner.increment(key)
        }

        fn insert(&mut self, key: FlowKey, count: i64) -> Result<(), TableError> {
            if !self.raced {
                self.raced = true;
                self.inner.insert(key, 1)?;
                return Err(TableError::Occupied);
            }
            self.inner.insert(key, count)
        }
    }

    fn create_test_frame(protocol: u8, saddr: [u8; 4], daddr: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HLEN + 20 + 8];
        // Ethernet: dst, src, EtherType IPv4
        frame[12] = 0x08;
        frame[13] = 0x00;
        let ip = ETH_HLEN;
        frame[ip] = 0x45;
        frame[ip + 8] = 64;
        frame[ip + IPV4_PROTOCOL_OFFSET] = protocol;
        frame[ip + IPV4_SADDR_OFFSET..ip + IPV4_SADDR_OFFSET + 4].copy_from_slice(&saddr);
        frame[ip + IPV4_DADDR_OFFSET..ip + IPV4_DADDR_OFFSET + 4].copy_from_slice(&daddr);
        frame
    }

    #[test]
    fn test_first_and_second_observation() {
        let mut table = FakeFlowTable::new(256);
        let frame = create_test_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2]);
        let key = FlowKey(0x0A00_0001_0A00_0002);

        assert_eq!(table.count(key), None);
        assert_eq!(classify_and_count(frame.as_slice(), &mut table), Decision::Drop);
        assert_eq!(table.count(key), Some(1));
        assert_eq!(classify_and_count(frame.as_slice(), &mut table), Decision::Drop);
        assert_eq!(table.count(key), Some(2));
    }

    #[test]
    fn test_counted_protocols() {
        for protocol in [IPPROTO_TCP, IPPROTO_UDP, IPPROTO_ICMP] {
            let mut table = FakeFlowTable::new(256);
            let frame = create_test_frame(protocol, [172, 16, 0, 1], [172, 16, 0, 9]);
            classify_and_count(frame.as_slice(), &mut table);
            assert_eq!(table.entries.len(), 1, "protocol {protocol} not counted");
        }
    }

    #[test]
    fn test_other_protocols_leave_table_untouched() {
        // IGMP, IPv6-in-IPv4, GRE, ESP, SCTP, raw
        for protocol in [2u8, 41, 47, 50, 132, 255, 0] {
            let mut table = FakeFlowTable::new(256);
            let frame = create_test_frame(protocol, [10, 0, 0, 1], [10, 0, 0, 2]);
            assert_eq!(classify_and_count(frame.as_slice(), &mut table), Decision::Drop);
            assert!(table.entries.is_empty(), "protocol {protocol} was counted");
        }
    }

    #[test]
    fn test_truncated_frames_leave_table_untouched() {
        let full = create_test_frame(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2]);
        let mut table = FakeFlowTable::new(256);

        for len in 0..FLOW_MIN_FRAME_LEN {
            assert_eq!(classify_and_count(&full[..len], &mut table), Decision::Drop);
        }
        assert!(table.entries.is_empty());

        // Exactly Ethernet + minimal IPv4 is enough
        classify_and_count(&full[..FLOW_MIN_FRAME_LEN], &mut table);
        assert_eq!(table.entries.len(), 1);
    }

    #[test]
    fn test_swapped_addresses_are_distinct_flows() {
        let mut table = FakeFlowTable::new(256);
        let forward = create_test_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2]);
        let reverse = create_test_frame(IPPROTO_TCP, [10, 0, 0, 2], [10, 0, 0, 1]);

        classify_and_count(forward.as_slice(), &mut table);
        classify_and_count(reverse.as_slice(), &mut table);

        assert_eq!(table.count(FlowKey(0x0A00_0001_0A00_0002)), Some(1));
        assert_eq!(table.count(FlowKey(0x0A00_0002_0A00_0001)), Some(1));
    }

    #[test]
    fn test_ports_and_protocol_share_a_flow() {
        let mut table = FakeFlowTable::new(256);
        let mut tcp = create_test_frame(IPPROTO_TCP, [10, 1, 1, 1], [10, 2, 2, 2]);
        tcp[34..36].copy_from_slice(&443u16.to_be_bytes());
        let mut udp = create_test_frame(IPPROTO_UDP, [10, 1, 1, 1], [10, 2, 2, 2]);
        udp[34..36].copy_from_slice(&53u16.to_be_bytes());

        classify_and_count(tcp.as_slice(), &mut table);
        classify_and_count(udp.as_slice(), &mut table);

        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.count(FlowKey::new(0x0A01_0101, 0x0A02_0202)), Some(2));
    }

    #[test]
    fn test_ethertype_is_not_checked() {
        let mut table = FakeFlowTable::new(256);
        let mut frame = create_test_frame(IPPROTO_ICMP, [10, 0, 0, 1], [10, 0, 0, 2]);
        frame[12] = 0x86;
        frame[13] = 0xDD;

        classify_and_count(frame.as_slice(), &mut table);
        assert_eq!(table.entries.len(), 1);
    }

    #[test]
    fn test_counter_wraps_on_overflow() {
        let mut table = FakeFlowTable::new(256);
        let frame = create_test_frame(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2]);
        let key = flow_key_of(frame.as_slice()).unwrap();
        table.entries.insert(key, i64::MAX);

        classify_and_count(frame.as_slice(), &mut table);
        assert_eq!(table.count(key), Some(i64::MIN));
    }

    #[test]
    fn test_full_table_skips_new_flows() {
        let mut table = FakeFlowTable::new(1);
        let first = create_test_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2]);
        let second = create_test_frame(IPPROTO_TCP, [10, 0, 0, 3], [10, 0, 0, 4]);

        assert_eq!(classify_and_count(first.as_slice(), &mut table), Decision::Drop);
        assert_eq!(classify_and_count(second.as_slice(), &mut table), Decision::Drop);
        assert_eq!(table.entries.len(), 1);

        // Known flows keep counting
        classify_and_count(first.as_slice(), &mut table);
        assert_eq!(table.count(flow_key_of(first.as_slice()).unwrap()), Some(2));
    }

    #[test]
    fn test_lost_insert_race_still_counts() {
        let mut table = RacingFlowTable {
            inner: FakeFlowTable::new(256),
            raced: false,
        };
        let frame = create_test_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2]);
        let key = flow_key_of(frame.as_slice()).unwrap();

        classify_and_count(frame.as_slice(), &mut table);
        // One packet from the other core plus ours
        assert_eq!(table.inner.count(key), Some(2));
    }

    #[test]
    fn test_flow_key_of() {
        let frame = create_test_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(flow_key_of(frame.as_slice()), Some(FlowKey(0x0A00_0001_0A00_0002)));

        let frame = create_test_frame(89, [10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(flow_key_of(frame.as_slice()), None);
    }
}
