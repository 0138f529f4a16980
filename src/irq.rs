//! Interrupt/status aggregator
//!
//! The single entry point invoked on a hardware interrupt. Runs in
//! interrupt context, performs no blocking operation, and communicates with
//! the (possibly blocked) request thread exclusively through the event
//! channel: normal-status bits are posted verbatim in the low event half,
//! error-status bits shifted into the high half.

use tock_registers::interfaces::{Readable, Writeable};

use crate::event::EVT_ERROR_SHIFT;
use crate::host::SdhciHost;
use crate::ops::HostOps;
use crate::regs::{
    ERR_ADMA, INT_BUFFER_READ_READY, INT_BUFFER_WRITE_READY, INT_CMD_COMPLETE, INT_DMA,
    INT_ERROR_SUMMARY, INT_TRANSFER_COMPLETE,
};
use crate::wait::CompletionWaiter;

/// Normal-status bits the engine consumes directly.
const HANDLED: u16 = INT_CMD_COMPLETE
    | INT_TRANSFER_COMPLETE
    | INT_DMA
    | INT_BUFFER_WRITE_READY
    | INT_BUFFER_READ_READY;

impl<P: HostOps, W: CompletionWaiter> SdhciHost<P, W> {
    /// Drain pending interrupt status: clear each observed bit at the
    /// register (write-1-to-clear) and post it as an event.
    ///
    /// Error bits are posted with the raw error-status value, then cleared
    /// — except the ADMA error bit, which is deliberately left pending so
    /// the polled ADMA error check after transfer completion can still
    /// observe it. Uninterpreted normal-status bits are posted and cleared
    /// as well rather than silently dropped.
    pub fn handle_interrupt(&self) {
        let regs = self.regs();
        let status = regs.int_status.get();

        let handled = status & HANDLED;
        if handled != 0 {
            regs.int_status.set(handled);
            self.events.post(u32::from(handled));
        }

        let err = regs.err_status.get();
        if err != 0 {
            self.events.post(u32::from(err) << EVT_ERROR_SHIFT);
            regs.err_status.set(err & !ERR_ADMA);
        }

        let leftover = status & !HANDLED & !INT_ERROR_SUMMARY;
        if leftover != 0 {
            regs.int_status.set(leftover);
            self.events.post(u32::from(leftover));
        }
    }
}
