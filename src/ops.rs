//! Platform services required by the transfer engine
//!
//! The engine is portable across boards; everything board-specific — how to
//! busy-wait a microsecond, how to make a DMA buffer visible to the
//! controller, how CPU addresses map onto the bus — comes in through the
//! [`HostOps`] trait supplied at construction time.

use core::sync::atomic::{fence, Ordering};

/// Board-provided services.
pub trait HostOps: Send {
    /// Busy-wait for approximately `us` microseconds.
    ///
    /// Called between polling iterations; accuracy only has to be good
    /// enough to keep the iteration budgets meaningful.
    fn delay_us(&self, us: u32);

    /// Write back any dirty data-cache lines covering `[ptr, ptr + len)`
    /// so the controller's DMA engine observes CPU writes.
    fn cache_clean(&self, ptr: *const u8, len: usize);

    /// Invalidate data-cache lines covering `[ptr, ptr + len)` so the CPU
    /// observes what the controller's DMA engine wrote to memory.
    fn cache_invalidate(&self, ptr: *const u8, len: usize);

    /// Translate a CPU address into the bus address the DMA engine uses.
    ///
    /// Identity by default, which is correct for identity-mapped firmware
    /// environments.
    fn bus_addr(&self, ptr: *const u8) -> u64 {
        ptr as usize as u64
    }
}

/// [`HostOps`] for cache-coherent, identity-mapped platforms.
///
/// Cache maintenance degrades to a compiler/CPU fence, which is all a
/// coherent interconnect needs before handing a buffer to the DMA engine.
/// The delay is a calibration-free spin; boards with a real timebase should
/// supply their own implementation instead.
pub struct CoherentOps;

/// Spin iterations per microsecond for the fallback delay. Deliberately
/// conservative; overshooting a poll interval is harmless.
const SPINS_PER_US: u32 = 100;

impl HostOps for CoherentOps {
    fn delay_us(&self, us: u32) {
        for _ in 0..us.saturating_mul(SPINS_PER_US) {
            core::hint::spin_loop();
        }
    }

    fn cache_clean(&self, _ptr: *const u8, _len: usize) {
        fence(Ordering::SeqCst);
    }

    fn cache_invalidate(&self, _ptr: *const u8, _len: usize) {
        fence(Ordering::SeqCst);
    }
}
