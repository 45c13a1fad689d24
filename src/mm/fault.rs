//! The hardware page table abstraction consumed by this layer, an
//! in-memory stand-in for tests, and the page-fault dispatcher that ties
//! [`FrameTable`] and [`SupplementalPageTable`] together.
//!
//! Grounded on the teacher's `lazy_pager.rs` `PageFaultReason`/
//! `handle_page_fault` dispatch (decode the fault, decide demand-paging vs.
//! fatal, delegate), adapted from a single in-process `LazyPager` into the
//! spec's three-way split across a shared `FrameTable`, one
//! `SupplementalPageTable` per process, and this dispatcher.

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};
use crate::mm::frame::FrameTable;
use crate::mm::spt::SupplementalPageTable;
use crate::mm::{KernelAddr, Pid, Va};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The hardware page table, consumed by this layer as an external
/// collaborator per `spec.md` §6. A fresh `map` is expected to install the
/// mapping with `accessed` already set (the fault that is about to be
/// satisfied counts as the access) and `dirty` clear.
pub trait HardwarePageTable: Send + Sync {
    fn map(&self, pid: Pid, va: Va, kaddr: KernelAddr, writable: bool);
    fn unmap(&self, pid: Pid, va: Va);
    fn is_accessed(&self, pid: Pid, va: Va) -> bool;
    fn clear_accessed(&self, pid: Pid, va: Va);
    fn is_dirty(&self, pid: Pid, va: Va) -> bool;
    fn clear_dirty(&self, pid: Pid, va: Va);
    fn translate(&self, pid: Pid, va: Va) -> Option<KernelAddr>;
}

#[derive(Clone, Copy)]
struct Pte {
    kaddr: KernelAddr,
    #[allow(dead_code)]
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A `HashMap`-backed simulation of a hardware page table, keyed by
/// `(pid, va)`. For tests only: a real embedder of this crate backs
/// [`HardwarePageTable`] with the actual MMU.
pub struct SimulatedPageTable {
    table: Mutex<HashMap<(Pid, Va), Pte>>,
}

impl SimulatedPageTable {
    pub fn new() -> Self {
        SimulatedPageTable {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Test-only hook: real hardware sets the dirty bit itself on a user
    /// write. The simulation has no real memory backing a virtual address,
    /// so tests poke it directly after writing to the frame they got back
    /// from [`FrameTable::read_frame`]/`write_frame`.
    pub fn set_dirty(&self, pid: Pid, va: Va, value: bool) {
        if let Some(pte) = self.table.lock().unwrap().get_mut(&(pid, va)) {
            pte.dirty = value;
        }
    }
}

impl Default for SimulatedPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwarePageTable for SimulatedPageTable {
    fn map(&self, pid: Pid, va: Va, kaddr: KernelAddr, writable: bool) {
        self.table.lock().unwrap().insert(
            (pid, va),
            Pte {
                kaddr,
                writable,
                accessed: true,
                dirty: false,
            },
        );
    }

    fn unmap(&self, pid: Pid, va: Va) {
        self.table.lock().unwrap().remove(&(pid, va));
    }

    fn is_accessed(&self, pid: Pid, va: Va) -> bool {
        self.table.lock().unwrap().get(&(pid, va)).is_some_and(|p| p.accessed)
    }

    fn clear_accessed(&self, pid: Pid, va: Va) {
        if let Some(pte) = self.table.lock().unwrap().get_mut(&(pid, va)) {
            pte.accessed = false;
        }
    }

    fn is_dirty(&self, pid: Pid, va: Va) -> bool {
        self.table.lock().unwrap().get(&(pid, va)).is_some_and(|p| p.dirty)
    }

    fn clear_dirty(&self, pid: Pid, va: Va) {
        if let Some(pte) = self.table.lock().unwrap().get_mut(&(pid, va)) {
            pte.dirty = false;
        }
    }

    fn translate(&self, pid: Pid, va: Va) -> Option<KernelAddr> {
        self.table.lock().unwrap().get(&(pid, va)).map(|p| p.kaddr)
    }
}

/// Dispatches page faults across all processes registered with it. Owns no
/// per-process state itself beyond the `pid -> SupplementalPageTable`
/// directory; the frame pool and hardware page table are shared singletons.
pub struct PagingFaultHandler {
    frame_table: Arc<FrameTable>,
    hw: Arc<dyn HardwarePageTable>,
    processes: Mutex<HashMap<Pid, Arc<SupplementalPageTable>>>,
}

impl PagingFaultHandler {
    pub fn new(frame_table: Arc<FrameTable>, hw: Arc<dyn HardwarePageTable>) -> Self {
        PagingFaultHandler {
            frame_table,
            hw,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_process(&self, pid: Pid, spt: Arc<SupplementalPageTable>) {
        self.processes.lock().unwrap().insert(pid, spt);
    }

    /// Remove and return the process's table, e.g. at process exit once the
    /// caller has torn down its mapped ranges via
    /// [`SupplementalPageTable::remove_range`].
    pub fn unregister_process(&self, pid: Pid) -> Option<Arc<SupplementalPageTable>> {
        self.processes.lock().unwrap().remove(&pid)
    }

    /// Resolve a page fault at `fault_addr` for `pid`, whose user stack
    /// pointer is currently `user_sp`. Per `spec.md`'s page-fault decision
    /// table: an existing SPTE is lazily loaded; a missing one is only
    /// tolerated within one page below `user_sp` (stack growth), and is
    /// otherwise fatal to the caller, who is expected to terminate the
    /// faulting process on `Err`.
    pub fn handle_fault(&self, pid: Pid, fault_addr: Va, user_sp: Va) -> Result<()> {
        let page = fault_addr - (fault_addr % PAGE_SIZE);
        let spt = {
            let processes = self.processes.lock().unwrap();
            processes
                .get(&pid)
                .cloned()
                .ok_or(KernelError::InvalidArgument("page fault for a process with no registered SPT"))?
        };

        if spt.contains(page) {
            return spt.load(page, pid, self.hw.as_ref(), &self.frame_table);
        }

        let stack_growth_floor = user_sp.saturating_sub(PAGE_SIZE);
        if page >= stack_growth_floor {
            spt.add_stack_page(page, pid, self.hw.as_ref(), &self.frame_table)
        } else {
            Err(KernelError::Unmapped(fault_addr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::spt::{Backing, SpteKind};
    use crate::mm::swap::SwapArea;
    use crate::device::MemDisk;

    fn handler() -> (PagingFaultHandler, Arc<SimulatedPageTable>) {
        let hw = Arc::new(SimulatedPageTable::new());
        let hw_dyn: Arc<dyn HardwarePageTable> = hw.clone();
        let frame_table = Arc::new(FrameTable::new(hw_dyn.clone(), 4));
        (PagingFaultHandler::new(frame_table, hw_dyn), hw)
    }

    #[test]
    fn fault_within_stack_window_grows_the_stack() {
        let (handler, hw) = handler();
        let swap = Arc::new(SwapArea::new(Arc::new(MemDisk::new(64)), 0, 4));
        let spt = Arc::new(SupplementalPageTable::new(swap));
        handler.register_process(1, spt);

        let user_sp = 0x8048000;
        let fault_addr = user_sp - 4;
        handler.handle_fault(1, fault_addr, user_sp).unwrap();
        assert!(hw.translate(1, fault_addr - (fault_addr % PAGE_SIZE)).is_some());
    }

    #[test]
    fn fault_far_below_stack_pointer_is_fatal() {
        let (handler, _hw) = handler();
        let swap = Arc::new(SwapArea::new(Arc::new(MemDisk::new(64)), 0, 4));
        let spt = Arc::new(SupplementalPageTable::new(swap));
        handler.register_process(1, spt);

        let user_sp = 0x8048000;
        let fault_addr = user_sp - 4 * PAGE_SIZE;
        assert!(handler.handle_fault(1, fault_addr, user_sp).is_err());
    }

    #[test]
    fn fault_on_a_known_spte_loads_it() {
        let (handler, hw) = handler();
        let swap = Arc::new(SwapArea::new(Arc::new(MemDisk::new(64)), 0, 4));
        let spt = Arc::new(SupplementalPageTable::new(swap));
        spt.add(0x1000, SpteKind::Tmp, Backing::None, false);
        handler.register_process(2, spt);

        handler.handle_fault(2, 0x1000, 0x9000000).unwrap();
        assert!(hw.translate(2, 0x1000).is_some());
    }

    #[test]
    fn fault_for_an_unregistered_process_is_an_error() {
        let (handler, _hw) = handler();
        assert!(handler.handle_fault(99, 0x1000, 0x9000000).is_err());
    }
}
