//! Test doubles: an in-memory register block and a scripted card model
//!
//! `RegBlock` is 256 bytes of plain memory overlaid with the
//! [`SdhciRegisters`] layout. `FakeCard` implements [`HostOps`] and uses
//! every delay tick to advance a tiny hardware model: self-clearing reset
//! bits, clock stabilization, tuning completion, and command/transfer
//! completion interrupts. Together they let the full request path run
//! against "hardware" that raises completions within the timeout.
//!
//! Plain memory has no write-1-to-clear semantics, so a status bit the
//! engine clears stays readable afterwards; the model raises each bit only
//! when its phase arrives, which keeps the sequencing meaningful anyway.

use core::cell::{Cell, UnsafeCell};
use core::ptr;

use crate::ops::HostOps;
use crate::regs::SdhciRegisters;

/// 256-byte in-memory register block.
#[repr(align(256))]
pub struct RegBlock {
    mem: UnsafeCell<[u8; 0x100]>,
}

impl RegBlock {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            mem: UnsafeCell::new([0; 0x100]),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.mem.get().cast()
    }

    pub fn regs(&self) -> &SdhciRegisters {
        unsafe { &*(self.base() as *const SdhciRegisters) }
    }

    pub fn read8(&self, off: usize) -> u8 {
        unsafe { ptr::read_volatile(self.base().add(off)) }
    }

    pub fn write8(&self, off: usize, v: u8) {
        unsafe { ptr::write_volatile(self.base().add(off), v) }
    }

    pub fn or8(&self, off: usize, v: u8) {
        self.write8(off, self.read8(off) | v);
    }

    pub fn read16(&self, off: usize) -> u16 {
        unsafe { ptr::read_volatile(self.base().add(off).cast::<u16>()) }
    }

    pub fn write16(&self, off: usize, v: u16) {
        unsafe { ptr::write_volatile(self.base().add(off).cast::<u16>(), v) }
    }

    pub fn or16(&self, off: usize, v: u16) {
        self.write16(off, self.read16(off) | v);
    }

    pub fn read32(&self, off: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base().add(off).cast::<u32>()) }
    }

    pub fn write32(&self, off: usize, v: u32) {
        unsafe { ptr::write_volatile(self.base().add(off).cast::<u32>(), v) }
    }

    /// Capabilities for a well-equipped spec 3.0 controller: 100 MHz base
    /// clock, SDMA+ADMA2, high-speed, 3.3V and 1.8V, card inserted+stable.
    pub fn seed_default(&self) {
        self.write16(0xFE, crate::regs::SPEC_VER_300 as u16);
        self.write32(
            0x40,
            (100 << 8)      // base clock MHz
                | (1 << 19) // ADMA2
                | (1 << 21) // high speed
                | (1 << 22) // SDMA
                | (1 << 24) // 3.3V
                | (1 << 26), // 1.8V
        );
        self.write32(0x44, 1 << 1); // SDR104 (tuning available)
        self.write32(0x24, (1 << 16) | (1 << 17)); // card inserted + stable
    }
}

/// Scripted card/controller model driven from the platform delay hook.
pub struct FakeCard {
    base: *mut u8,
    last_cmd: Cell<u16>,
    pio_blocks: Cell<u16>,
    xfer_pending: Cell<bool>,
    /// Error-interrupt-status bits to raise instead of completing the next
    /// command.
    pub fail_next_cmd: Cell<u16>,
    /// Commands observed (register values), newest last.
    pub issued: UnsafeCell<Vec<u16>>,
}

// SAFETY: test-only; every test runs the model on a single thread.
unsafe impl Send for FakeCard {}
unsafe impl Sync for FakeCard {}

impl FakeCard {
    pub fn new(block: &RegBlock) -> Self {
        Self {
            base: block.base(),
            last_cmd: Cell::new(0),
            pio_blocks: Cell::new(0),
            xfer_pending: Cell::new(false),
            fail_next_cmd: Cell::new(0),
            issued: UnsafeCell::new(Vec::new()),
        }
    }

    pub fn issued_opcodes(&self) -> Vec<u8> {
        unsafe { &*self.issued.get() }
            .iter()
            .map(|cmd| (cmd >> 8) as u8)
            .collect()
    }

    fn read8(&self, off: usize) -> u8 {
        unsafe { ptr::read_volatile(self.base.add(off)) }
    }

    fn write8(&self, off: usize, v: u8) {
        unsafe { ptr::write_volatile(self.base.add(off), v) }
    }

    fn read16(&self, off: usize) -> u16 {
        unsafe { ptr::read_volatile(self.base.add(off).cast::<u16>()) }
    }

    fn write16(&self, off: usize, v: u16) {
        unsafe { ptr::write_volatile(self.base.add(off).cast::<u16>(), v) }
    }

    fn or16(&self, off: usize, v: u16) {
        self.write16(off, self.read16(off) | v);
    }

    fn tick(&self) {
        // Self-clearing software reset.
        if self.read8(0x2F) != 0 {
            self.write8(0x2F, 0);
        }

        // Internal clock stabilizes one tick after being enabled.
        let cc = self.read16(0x2C);
        if cc & 0x1 != 0 && cc & 0x2 == 0 {
            self.write16(0x2C, cc | 0x2);
        }

        // Tuning completes successfully.
        let hc2 = self.read16(0x3E);
        if hc2 & (1 << 6) != 0 {
            self.write16(0x3E, (hc2 & !(1 << 6)) | (1 << 7));
        }

        let cmd = self.read16(0x0E);
        if cmd != 0 && cmd != self.last_cmd.get() {
            // New command latched.
            self.last_cmd.set(cmd);
            unsafe { &mut *self.issued.get() }.push(cmd);

            let fail = self.fail_next_cmd.replace(0);
            if fail != 0 {
                self.or16(0x32, fail);
                self.or16(0x30, 1 << 15);
                return;
            }

            self.or16(0x30, 1 << 0); // command complete
            if cmd & (1 << 5) != 0 {
                // Data present: DMA transfers complete on a later tick,
                // PIO raises one buffer-ready per block first.
                let mode = self.read16(0x0C);
                if mode & 0x1 != 0 {
                    self.xfer_pending.set(true);
                } else {
                    self.pio_blocks.set(self.read16(0x06));
                }
            }
        } else if self.pio_blocks.get() > 0 {
            let mode = self.read16(0x0C);
            let ready = if mode & (1 << 4) != 0 { 1 << 5 } else { 1 << 4 };
            self.or16(0x30, ready);
            self.pio_blocks.set(self.pio_blocks.get() - 1);
            if self.pio_blocks.get() == 0 {
                self.xfer_pending.set(true);
            }
        } else if self.xfer_pending.get() {
            self.xfer_pending.set(false);
            self.or16(0x30, 1 << 1); // transfer complete
        }
    }
}

impl HostOps for FakeCard {
    fn delay_us(&self, _us: u32) {
        self.tick();
    }

    fn cache_clean(&self, _ptr: *const u8, _len: usize) {}

    fn cache_invalidate(&self, _ptr: *const u8, _len: usize) {}

    // Host test buffers live at 64-bit addresses; pretend the platform has
    // a 32-bit DMA window so the descriptor builder accepts them.
    fn bus_addr(&self, ptr: *const u8) -> u64 {
        (ptr as usize as u64) & 0x0FFF_FFFF
    }
}
