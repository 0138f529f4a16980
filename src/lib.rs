//! SDHCI (SD Host Controller Interface) command/data transfer engine
//!
//! This crate implements the transfer engine at the heart of an SDHCI-class
//! SD/MMC host controller driver: command issue over the SD bus, clock /
//! voltage / bus-power negotiation, ADMA2 scatter-gather descriptor
//! programming, and completion waiting with bounded timeouts.
//!
//! The generic card stack above this crate (CMD0/ACMD41 enumeration, UHS
//! tuning algorithms, partition handling) issues its commands through
//! [`SdhciHost::request`]; board glue below it provides the mapped register
//! block and a [`HostOps`] implementation for delays and cache maintenance.
//!
//! One [`SdhciHost`] is created per physical controller and owned by its
//! caller; there are no process-wide singletons. The only concurrency the
//! engine itself deals with is the hardware interrupt:
//! [`SdhciHost::handle_interrupt`] runs in interrupt context and talks to the
//! waiting request thread purely through an atomic event channel.

#![cfg_attr(not(test), no_std)]

pub mod adma;
pub mod clock;
pub mod command;
pub mod event;
pub mod host;
pub mod irq;
pub mod ops;
pub mod regs;
#[cfg(test)]
mod testutil;
pub mod wait;

pub use adma::{AdmaTable, ADMA_TABLE_CAPACITY};
pub use command::{CommandDescriptor, CommandKind, Response, ResponseKind};
pub use event::EventFlags;
pub use host::{
    AutoCmd, BusWidth, DataDescriptor, DataDirection, HostConfig, HostProperties, IoSettings,
    PowerMode, SdhciHost, SignalVoltage, SlotType, SpecVersion, TimingMode,
};
pub use ops::{CoherentOps, HostOps};
pub use wait::{CompletionWaiter, EventWaiter, PolledWaiter, WAIT_FOREVER};

/// Errors surfaced by the transfer engine.
///
/// The card stack above is expected to treat [`Error::Busy`] and
/// [`Error::Timeout`] as retryable; everything else calls for card
/// re-enumeration or a controller reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Command or data line is inhibited. The request was rejected before
    /// any register write; retry once the bus is idle.
    Busy,
    /// No hardware signal within the allotted window. Surfaced verbatim,
    /// never retried internally.
    Timeout,
    /// Hardware-reported CRC / end-bit / index / DMA error, carrying the raw
    /// error-interrupt-status bits for diagnostics.
    Io(u16),
    /// The requested response class cannot be represented by the controller.
    /// Rejected before any register write.
    InvalidResponseType,
    /// Out-of-range argument (clock, block geometry, descriptor capacity).
    InvalidArgument,
    /// The controller does not implement the requested capability
    /// (voltage, bus width, tuning).
    Unsupported,
    /// No card in the slot.
    NoDevice,
}

/// Result type for all engine operations.
pub type Result<T> = core::result::Result<T, Error>;
