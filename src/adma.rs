//! ADMA2 scatter-gather descriptor table
//!
//! The ADMA2 engine walks an in-memory table of 8-byte descriptors, one per
//! data block here, transferring until it hits the entry marked end-of-list.
//! The table is owned by the host instance and reused across transfers; the
//! hardware reads it asynchronously, so it must be written back to memory
//! before the command arming the DMA engine is issued.
//!
//! The builder keeps the end-of-list invariant by construction: every entry
//! is composed in one shot with its `end` attribute already decided, and the
//! rest of the table is zeroed (invalid) first, so no half-built state ever
//! carries a stray `end` mark.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Error, Result};

/// Fixed descriptor-table capacity: the largest multi-block transfer this
/// engine accepts is `ADMA_TABLE_CAPACITY - 1` blocks, leaving room for the
/// trailing invalid entry.
pub const ADMA_TABLE_CAPACITY: usize = 128;

/// Attribute bit: descriptor is valid
const ATTR_VALID: u16 = 1 << 0;
/// Attribute bit: end of descriptor list
const ATTR_END: u16 = 1 << 1;
/// Attribute bit: raise DMA interrupt when this descriptor completes
const ATTR_INT: u16 = 1 << 2;
/// Action field: transfer data (ACT = 0b10, bits 4-5)
const ATTR_ACT_TRAN: u16 = 0b10 << 4;

/// One 32-bit ADMA2 descriptor: 16-bit attributes, 16-bit length, 32-bit
/// bus address. Layout is consumed directly by hardware.
#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AdmaDescriptor {
    attr: u16,
    length: u16,
    addr: u32,
}

impl AdmaDescriptor {
    fn transfer(addr: u32, length: u16, last: bool) -> Self {
        let mut attr = ATTR_VALID | ATTR_INT | ATTR_ACT_TRAN;
        if last {
            attr |= ATTR_END;
        }
        Self { attr, length, addr }
    }

    /// Descriptor carries the valid attribute.
    pub fn is_valid(&self) -> bool {
        self.attr & ATTR_VALID != 0
    }

    /// Descriptor is the end-of-list mark.
    pub fn is_end(&self) -> bool {
        self.attr & ATTR_END != 0
    }

    /// Transfer length in bytes.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Bus address of the described chunk.
    pub fn addr(&self) -> u32 {
        self.addr
    }
}

/// Reusable descriptor table, zeroed before every build.
pub struct AdmaTable {
    entries: [AdmaDescriptor; ADMA_TABLE_CAPACITY],
}

impl AdmaTable {
    /// Fresh, all-invalid table.
    pub const fn new() -> Self {
        Self {
            entries: [AdmaDescriptor {
                attr: 0,
                length: 0,
                addr: 0,
            }; ADMA_TABLE_CAPACITY],
        }
    }

    /// Populate one descriptor per block for a contiguous buffer at
    /// `bus_addr`.
    ///
    /// Fails rather than truncating when the block count (plus the trailing
    /// invalid entry) exceeds the table capacity, or when the buffer does
    /// not fit the engine's 32-bit address space.
    pub fn build(&mut self, bus_addr: u64, block_size: u32, block_count: u32) -> Result<()> {
        if block_count == 0 || block_size == 0 || block_size > u32::from(u16::MAX) {
            return Err(Error::InvalidArgument);
        }
        if block_count as usize + 1 > ADMA_TABLE_CAPACITY {
            return Err(Error::InvalidArgument);
        }
        let span = u64::from(block_size) * u64::from(block_count);
        if bus_addr.checked_add(span).is_none() || bus_addr + span > u64::from(u32::MAX) {
            return Err(Error::InvalidArgument);
        }

        self.entries = [AdmaDescriptor::default(); ADMA_TABLE_CAPACITY];
        let last = block_count - 1;
        for i in 0..block_count {
            let addr = (bus_addr + u64::from(i) * u64::from(block_size)) as u32;
            self.entries[i as usize] =
                AdmaDescriptor::transfer(addr, block_size as u16, i == last);
        }
        Ok(())
    }

    /// All table entries, including the invalid tail.
    pub fn entries(&self) -> &[AdmaDescriptor] {
        &self.entries
    }

    /// Start address and byte length of the region the hardware will read;
    /// the caller flushes exactly this span before arming the engine.
    pub fn region(&self) -> (*const u8, usize) {
        (
            self.entries.as_ptr().cast(),
            core::mem::size_of_val(&self.entries),
        )
    }
}

impl Default for AdmaTable {
    fn default() -> Self {
        Self::new()
    }
}
