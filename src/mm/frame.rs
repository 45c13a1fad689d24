//! Frame table: the bounded pool of physical user frames, with clock-hand
//! eviction that hands control to the victim's owning supplemental page
//! table.
//!
//! Grounded on `keos-project3/src/lazy_pager.rs`'s eviction/loader
//! dispatch shape, generalized from a single process's pager into a
//! system-wide table whose eviction crosses into an arbitrary owner's SPT,
//! per `spec.md` §4.3/§5.

use super::spt::SupplementalPageTable;
use super::{HardwarePageTable, KernelAddr, Pid, Va};
use crate::config::PAGE_SIZE;
use crate::error::Result;
use std::sync::{Arc, Mutex, Weak};

struct FrameOwner {
    pid: Pid,
    upage: Va,
    spt: Weak<SupplementalPageTable>,
}

struct FrameSlot {
    in_use: bool,
    pinned: bool,
    owner: Option<FrameOwner>,
}

struct FrameTableState {
    slots: Vec<FrameSlot>,
    clock_hand: usize,
}

/// Owns both the frame bookkeeping (pinned/owner/clock hand) and the
/// simulated physical page content behind each frame — there being no
/// real physical memory in a hosted build for a `KernelAddr` to actually
/// address.
pub struct FrameTable {
    hw: Arc<dyn HardwarePageTable>,
    content: Vec<Mutex<[u8; PAGE_SIZE]>>,
    state: Mutex<FrameTableState>,
}

impl FrameTable {
    pub fn new(hw: Arc<dyn HardwarePageTable>, frame_count: usize) -> Self {
        let slots = (0..frame_count)
            .map(|_| FrameSlot {
                in_use: false,
                pinned: false,
                owner: None,
            })
            .collect();
        let content = (0..frame_count).map(|_| Mutex::new([0u8; PAGE_SIZE])).collect();
        FrameTable {
            hw,
            content,
            state: Mutex::new(FrameTableState { slots, clock_hand: 0 }),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.content.len()
    }

    pub fn read_frame(&self, kaddr: KernelAddr) -> [u8; PAGE_SIZE] {
        *self.content[kaddr].lock().unwrap()
    }

    pub fn write_frame(&self, kaddr: KernelAddr, data: &[u8; PAGE_SIZE]) {
        *self.content[kaddr].lock().unwrap() = *data;
    }

    /// Take a free frame, or evict one if the pool is exhausted. The
    /// returned frame is `pinned` until [`FrameTable::unpin`] is called.
    pub fn alloc(&self) -> Result<KernelAddr> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some((idx, slot)) = state
                .slots
                .iter_mut()
                .enumerate()
                .find(|(_, s)| !s.in_use)
            {
                slot.in_use = true;
                slot.pinned = true;
                slot.owner = None;
                return Ok(idx);
            }
        }
        self.evict_one()
    }

    pub fn bind(&self, kaddr: KernelAddr, pid: Pid, upage: Va, spt: &Arc<SupplementalPageTable>) {
        let mut state = self.state.lock().unwrap();
        state.slots[kaddr].owner = Some(FrameOwner {
            pid,
            upage,
            spt: Arc::downgrade(spt),
        });
    }

    pub fn unpin(&self, kaddr: KernelAddr) {
        self.state.lock().unwrap().slots[kaddr].pinned = false;
    }

    pub fn free(&self, kaddr: KernelAddr) {
        let mut state = self.state.lock().unwrap();
        let slot = &mut state.slots[kaddr];
        slot.in_use = false;
        slot.pinned = false;
        slot.owner = None;
    }

    fn evict_one(&self) -> Result<KernelAddr> {
        let mut state = self.state.lock().unwrap();
        let n = state.slots.len();
        let mut scanned = 0;
        while scanned < 2 * n {
            let idx = state.clock_hand;
            state.clock_hand = (state.clock_hand + 1) % n;
            scanned += 1;

            if state.slots[idx].pinned || !state.slots[idx].in_use {
                continue;
            }
            let Some(owner) = &state.slots[idx].owner else {
                continue;
            };
            let pid = owner.pid;
            let upage = owner.upage;
            let spt_weak = owner.spt.clone();

            if self.hw.is_accessed(pid, upage) {
                self.hw.clear_accessed(pid, upage);
                continue;
            }

            let Some(spt) = spt_weak.upgrade() else {
                // owning process is gone; just reclaim the frame. Leave
                // `in_use` set — the frame is handed straight back to our
                // caller as its new allocation, not returned to the free
                // pool, so a concurrent alloc()'s free-slot scan must not
                // see it as available before the caller rebinds it.
                state.slots[idx].owner = None;
                state.slots[idx].pinned = true;
                return Ok(idx);
            };

            // pin the victim while we drop the table lock to call back
            // into its owner's SPT (which may itself take the BufferCache
            // or SwapArea locks, both below FrameTable in lock order).
            state.slots[idx].pinned = true;
            drop(state);

            let evicted = spt.evict(upage, pid, self.hw.as_ref(), self);

            let mut state = self.state.lock().unwrap();
            evicted?;
            // `spt.evict` routed through `FrameTable::free`, which cleared
            // `in_use` as part of returning the frame to the pool. The
            // frame isn't going to the pool, though — it's handed straight
            // back to our caller as its new allocation — so restore
            // `in_use` before a concurrent alloc()'s free-slot scan can
            // see this slot as available and claim it out from under the
            // caller who is about to rebind it.
            state.slots[idx].in_use = true;
            state.slots[idx].owner = None;
            state.slots[idx].pinned = true;
            return Ok(idx);
        }
        panic!("FrameTable: eviction failed to find a victim after a full sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::fault::SimulatedPageTable;
    use crate::mm::spt::{Backing, SpteKind};

    #[test]
    fn alloc_reuses_freed_frames_before_evicting() {
        let hw: Arc<dyn HardwarePageTable> = Arc::new(SimulatedPageTable::new());
        let ft = FrameTable::new(hw, 2);
        let a = ft.alloc().unwrap();
        ft.unpin(a);
        ft.free(a);
        let b = ft.alloc().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn eviction_calls_back_into_the_owning_spt() {
        let hw: Arc<dyn HardwarePageTable> = Arc::new(SimulatedPageTable::new());
        let ft = FrameTable::new(hw.clone(), 1);
        let spt = Arc::new(SupplementalPageTable::new(Arc::new(crate::mm::swap::SwapArea::new(
            Arc::new(crate::device::MemDisk::new(64)),
            0,
            4,
        ))));
        spt.add(0x1000, SpteKind::Tmp, Backing::None, false);

        let kaddr = ft.alloc().unwrap();
        ft.bind(kaddr, 1, 0x1000, &spt);
        hw.map(1, 0x1000, kaddr, true);
        ft.unpin(kaddr);

        // second allocation with no free frames forces eviction of the
        // only resident frame, which must route through spt.evict.
        let _second = ft.alloc().unwrap();
    }

    #[test]
    fn clock_spares_a_recently_accessed_frame_over_an_unreferenced_peer() {
        let hw: Arc<SimulatedPageTable> = Arc::new(SimulatedPageTable::new());
        let hw_dyn: Arc<dyn HardwarePageTable> = hw.clone();
        let ft = FrameTable::new(hw_dyn.clone(), 2);
        let swap = Arc::new(crate::mm::swap::SwapArea::new(
            Arc::new(crate::device::MemDisk::new(64)),
            0,
            4,
        ));
        let spt = Arc::new(SupplementalPageTable::new(swap));

        let hot = ft.alloc().unwrap();
        ft.bind(hot, 1, 0x1000, &spt);
        hw.map(1, 0x1000, hot, true);
        spt.add(0x1000, SpteKind::Tmp, Backing::None, true);
        ft.unpin(hot);

        let cold = ft.alloc().unwrap();
        ft.bind(cold, 1, 0x2000, &spt);
        hw.map(1, 0x2000, cold, true);
        spt.add(0x2000, SpteKind::Tmp, Backing::None, true);
        ft.unpin(cold);

        // simulate a sweep already having passed over both frames, then a
        // fresh access to `hot` only: `cold`'s accessed bit stays clear so
        // the next eviction must pick it over `hot`.
        hw.clear_accessed(1, 0x1000);
        hw.clear_accessed(1, 0x2000);
        hw.map(1, 0x1000, hot, true); // re-sets hot's simulated accessed bit

        let _third = ft.alloc().unwrap();

        assert!(hw.translate(1, 0x1000).is_some(), "recently-accessed frame must survive one sweep");
        assert!(hw.translate(1, 0x2000).is_none(), "unreferenced peer is the one evicted");
    }
}
