//! Transfer-completion waiting
//!
//! Two interchangeable strategies behind one [`CompletionWaiter`] contract,
//! selected at host construction time:
//!
//! - [`EventWaiter`] consumes events posted by the interrupt aggregator
//!   ([`crate::SdhciHost::handle_interrupt`]); the signal-enable registers
//!   are routed to the interrupt controller.
//! - [`PolledWaiter`] reads the interrupt-status registers directly and
//!   clears what it observes; interrupt signalling stays off.
//!
//! Every wait is bounded: a finite millisecond budget converts into a fixed
//! number of polling iterations separated by a fixed micro-delay, and
//! [`WAIT_FOREVER`] is a saturating budget rather than an unbounded spin.
//! Hitting the budget converts deterministically into [`Error::Timeout`]
//! with no side effects on controller register state.

use tock_registers::interfaces::{Readable, Writeable};

use crate::event::{error_bits, EventFlags, EVT_ERROR_MASK};
use crate::ops::HostOps;
use crate::regs::{
    SdhciRegisters, ERR_ADMA, ERR_CMD_TIMEOUT, ERR_DATA_TIMEOUT, INT_ERROR_SUMMARY,
};
use crate::{Error, Result};

/// Sentinel: wait without a caller-imposed deadline.
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Delay between polling iterations (microseconds)
const POLL_INTERVAL_US: u32 = 100;

/// Iteration budget for the post-transfer ADMA error-status check
const ADMA_ERROR_POLLS: u32 = 8;

/// Error-interrupt-status bits that mean "the card never answered" rather
/// than "the exchange was corrupted": command timeout and data timeout.
const ERR_TIMEOUT_BITS: u16 = ERR_CMD_TIMEOUT | ERR_DATA_TIMEOUT;

/// Hardware handles a waiter needs: the register block, the event channel
/// fed by the interrupt aggregator, and the platform delay hook.
pub struct WaitHw<'a> {
    pub(crate) regs: &'a SdhciRegisters,
    pub(crate) events: &'a EventFlags,
    pub(crate) ops: &'a dyn HostOps,
    /// Set for the transfer-complete wait of an ADMA transfer; enables the
    /// bounded ADMA error-status poll.
    pub(crate) check_adma: bool,
}

/// One completion-wait strategy.
pub trait CompletionWaiter: Send + Sync {
    /// Whether the host should route interrupt signals to the interrupt
    /// controller (signal-enable registers) for this strategy.
    fn uses_interrupts(&self) -> bool;

    /// Wait until the normal-interrupt-status bit in `mask` fires, an error
    /// is reported, or `timeout_ms` elapses.
    ///
    /// `mask` uses the normal-interrupt-status bit positions (which the
    /// event channel mirrors verbatim in its low half).
    fn wait(&self, hw: &WaitHw<'_>, mask: u16, timeout_ms: u32) -> Result<()>;
}

/// Map a non-zero error-interrupt-status value onto the error taxonomy:
/// pure timeout bits surface as [`Error::Timeout`], anything else as
/// [`Error::Io`] carrying the raw mask.
pub(crate) fn classify_error(err: u16) -> Error {
    if err != 0 && err & !ERR_TIMEOUT_BITS == 0 {
        Error::Timeout
    } else {
        Error::Io(err)
    }
}

fn iteration_budget(timeout_ms: u32) -> u64 {
    if timeout_ms == WAIT_FOREVER {
        u64::MAX
    } else {
        (u64::from(timeout_ms) * 1000 / u64::from(POLL_INTERVAL_US)).max(1)
    }
}

/// Event-driven strategy: waits on the event channel, never reads the
/// status registers itself.
pub struct EventWaiter;

impl CompletionWaiter for EventWaiter {
    fn uses_interrupts(&self) -> bool {
        true
    }

    fn wait(&self, hw: &WaitHw<'_>, mask: u16, timeout_ms: u32) -> Result<()> {
        let want = u32::from(mask) | EVT_ERROR_MASK;
        for _ in 0..iteration_budget(timeout_ms) {
            let fired = hw.events.take(want);
            let err = error_bits(fired);
            if err != 0 {
                return Err(classify_error(err));
            }
            if fired & u32::from(mask) != 0 {
                return Ok(());
            }
            hw.ops.delay_us(POLL_INTERVAL_US);
        }
        Err(Error::Timeout)
    }
}

/// Busy-polled strategy: reads the status registers directly, clearing the
/// completion bit at the register on observation.
pub struct PolledWaiter;

impl CompletionWaiter for PolledWaiter {
    fn uses_interrupts(&self) -> bool {
        false
    }

    fn wait(&self, hw: &WaitHw<'_>, mask: u16, timeout_ms: u32) -> Result<()> {
        let regs = hw.regs;
        for _ in 0..iteration_budget(timeout_ms) {
            let err = regs.err_status.get();
            if err != 0 || regs.int_status.get() & INT_ERROR_SUMMARY != 0 {
                regs.err_status.set(err);
                return Err(classify_error(err));
            }
            if regs.int_status.get() & mask != 0 {
                regs.int_status.set(mask);
                if hw.check_adma {
                    check_adma_errors(hw)?;
                }
                return Ok(());
            }
            hw.ops.delay_us(POLL_INTERVAL_US);
        }
        Err(Error::Timeout)
    }
}

/// Bounded poll of the ADMA error-status register after a completed ADMA
/// transfer. The interrupt aggregator deliberately leaves the ADMA bit of
/// the error-interrupt-status register uncleared so it is still visible
/// here.
fn check_adma_errors(hw: &WaitHw<'_>) -> Result<()> {
    for _ in 0..ADMA_ERROR_POLLS {
        let adma_state = hw.regs.adma_error.get();
        let pending = hw.regs.err_status.get() & ERR_ADMA;
        if adma_state != 0 || pending != 0 {
            let raw = if pending != 0 { pending } else { ERR_ADMA };
            return Err(Error::Io(raw));
        }
        hw.ops.delay_us(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EVT_CMD_COMPLETE, EVT_ERROR_SHIFT, EVT_TRANSFER_COMPLETE};
    use crate::ops::CoherentOps;
    use crate::testutil::RegBlock;

    const CMD_COMPLETE: u16 = 1 << 0;

    fn hw<'a>(block: &'a RegBlock, events: &'a EventFlags, check_adma: bool) -> WaitHw<'a> {
        WaitHw {
            regs: block.regs(),
            events,
            ops: &CoherentOps,
            check_adma,
        }
    }

    #[test]
    fn test_event_waiter_consumes_posted_event() {
        let block = RegBlock::new();
        let events = EventFlags::new();
        events.post(EVT_CMD_COMPLETE | EVT_TRANSFER_COMPLETE);
        let hw = hw(&block, &events, false);
        assert_eq!(EventWaiter.wait(&hw, CMD_COMPLETE, 10), Ok(()));
        // Unrelated events stay pending for later waits.
        assert_eq!(events.peek(), EVT_TRANSFER_COMPLETE);
    }

    #[test]
    fn test_event_waiter_maps_error_events() {
        let block = RegBlock::new();
        let events = EventFlags::new();
        events.post(0x0002u32 << EVT_ERROR_SHIFT); // command CRC
        let hw = hw(&block, &events, false);
        assert_eq!(
            EventWaiter.wait(&hw, CMD_COMPLETE, 10),
            Err(Error::Io(0x0002))
        );
    }

    #[test]
    fn test_event_waiter_times_out() {
        let block = RegBlock::new();
        let events = EventFlags::new();
        let hw = hw(&block, &events, false);
        assert_eq!(EventWaiter.wait(&hw, CMD_COMPLETE, 1), Err(Error::Timeout));
    }

    #[test]
    fn test_polled_waiter_observes_status_bit() {
        let block = RegBlock::new();
        let events = EventFlags::new();
        block.or16(0x30, CMD_COMPLETE);
        let hw = hw(&block, &events, false);
        assert_eq!(PolledWaiter.wait(&hw, CMD_COMPLETE, 10), Ok(()));
    }

    #[test]
    fn test_polled_waiter_maps_error_bits() {
        let block = RegBlock::new();
        let events = EventFlags::new();
        block.or16(0x32, 1 << 1); // command CRC
        let hw = hw(&block, &events, false);
        assert_eq!(
            PolledWaiter.wait(&hw, CMD_COMPLETE, 10),
            Err(Error::Io(1 << 1))
        );
    }

    #[test]
    fn test_polled_waiter_hardware_timeout_bit_is_timeout() {
        let block = RegBlock::new();
        let events = EventFlags::new();
        block.or16(0x32, 1 << 0); // command timeout error
        let hw = hw(&block, &events, false);
        assert_eq!(
            PolledWaiter.wait(&hw, CMD_COMPLETE, 10),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn test_polled_waiter_adma_error_check() {
        let block = RegBlock::new();
        let events = EventFlags::new();
        block.or16(0x30, CMD_COMPLETE);
        block.or8(0x54, 0x01); // ADMA error state
        let hw = hw(&block, &events, true);
        assert_eq!(
            PolledWaiter.wait(&hw, CMD_COMPLETE, 10),
            Err(Error::Io(ERR_ADMA))
        );
    }

    #[test]
    fn test_classify_mixed_errors_are_io() {
        assert_eq!(classify_error(1 << 0), Error::Timeout);
        assert_eq!(classify_error(1 << 4), Error::Timeout);
        assert_eq!(classify_error((1 << 0) | (1 << 1)), Error::Io(0x3));
        assert_eq!(classify_error(1 << 5), Error::Io(1 << 5));
    }
}
