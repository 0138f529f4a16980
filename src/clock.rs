//! Clock, power and signal-voltage control
//!
//! Divider search for both controller generations, SD-clock gating with
//! bounded stabilization polling, bus-power sequencing and signal-voltage
//! switching, and derivation of the data-timeout counter from the running
//! SD clock.

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use crate::host::{SdhciHost, SignalVoltage, SpecVersion};
use crate::ops::HostOps;
use crate::regs::{
    CAPABILITIES, CLOCK_CONTROL, HOST_CONTROL2, MAX_DIV_SPEC_200, MAX_DIV_SPEC_300, POWER_CONTROL,
    TIMEOUT_CONTROL,
};
use crate::wait::CompletionWaiter;
use crate::{Error, Result};

/// Budget for the internal-clock-stable poll (milliseconds)
const CLOCK_STABLE_TIMEOUT_MS: u32 = 20;

/// Delay between stabilization poll iterations (microseconds)
const CLOCK_POLL_INTERVAL_US: u32 = 10;

/// Settle delay after every bus-power transition (microseconds)
const POWER_SETTLE_US: u32 = 10_000;

/// Data-timeout counter fallback: the largest value the 4-bit field takes.
/// Timeout derivation fails closed to this rather than erroring.
pub const TIMEOUT_EXP_MAX: u8 = 14;

/// Find the smallest legal clock divisor such that
/// `base_hz / divisor <= target_hz`.
///
/// Spec 3.0 controllers divide by any even value up to 2046; older
/// controllers divide by powers of two up to 256. The first (smallest)
/// divisor satisfying the inequality wins, which selects the highest SD
/// clock not exceeding the target — the policy the standard mandates.
///
/// A return of 0 (spec 3.0) or 1 (spec 2.0) means the base clock is used
/// undivided.
pub fn divider_for(base_hz: u32, target_hz: u32, version: SpecVersion) -> u32 {
    if version >= SpecVersion::V3 {
        if target_hz == 0 {
            return MAX_DIV_SPEC_300;
        }
        if base_hz <= target_hz {
            return 0;
        }
        let mut div = MAX_DIV_SPEC_300;
        let mut d = 2;
        while d <= MAX_DIV_SPEC_300 {
            if base_hz / d <= target_hz {
                div = d;
                break;
            }
            d += 2;
        }
        div
    } else {
        if target_hz == 0 {
            return MAX_DIV_SPEC_200;
        }
        let mut d = 1;
        while d < MAX_DIV_SPEC_200 {
            if base_hz / d <= target_hz {
                break;
            }
            d *= 2;
        }
        d
    }
}

/// SD clock resulting from a divisor returned by [`divider_for`].
pub fn sd_clock_for(base_hz: u32, divider: u32) -> u32 {
    if divider <= 1 {
        base_hz
    } else {
        base_hz / divider
    }
}

/// Derive the data-timeout counter exponent for a requested timeout.
///
/// The counter expires after `2^(exponent + 13)` SD-clock cycles. Returns
/// the first exponent whose period covers `timeout_ms`; if even the longest
/// representable period is too short, fails closed to [`TIMEOUT_EXP_MAX`].
pub fn timeout_exponent(timeout_ms: u32, sd_clock_hz: u32) -> u8 {
    if sd_clock_hz == 0 {
        return TIMEOUT_EXP_MAX;
    }
    for exp in 0..14u8 {
        let period_ms = (1u64 << (u32::from(exp) + 13)) * 1000 / u64::from(sd_clock_hz);
        if period_ms >= u64::from(timeout_ms) {
            return exp;
        }
    }
    TIMEOUT_EXP_MAX
}

impl<P: HostOps, W: CompletionWaiter> SdhciHost<P, W> {
    /// Program the divider for `target_hz` and gate the SD clock on.
    ///
    /// Returns the SD clock actually achieved. The internal clock is
    /// enabled first and polled (bounded) for stability before the card
    /// clock is released, per the controller spec's clock-supply sequence.
    pub(crate) fn enable_clock(&self, target_hz: u32) -> Result<u32> {
        let regs = self.regs();
        let divider = divider_for(self.base_clock_hz, target_hz, self.version);
        let field = (divider >> 1) as u16;

        regs.clock_control.write(
            CLOCK_CONTROL::FREQ_SELECT.val(field & 0xFF)
                + CLOCK_CONTROL::FREQ_SELECT_HI.val((field >> 8) & 0x3)
                + CLOCK_CONTROL::INTERNAL_CLK_EN::SET,
        );

        let mut stable = false;
        for _ in 0..(CLOCK_STABLE_TIMEOUT_MS * 1000 / CLOCK_POLL_INTERVAL_US) {
            if regs.clock_control.is_set(CLOCK_CONTROL::INTERNAL_CLK_STABLE) {
                stable = true;
                break;
            }
            self.ops.delay_us(CLOCK_POLL_INTERVAL_US);
        }
        if !stable {
            log::error!("sdhci: internal clock never stabilized");
            return Err(Error::Timeout);
        }

        regs.clock_control.modify(CLOCK_CONTROL::SD_CLK_EN::SET);

        let actual = sd_clock_for(self.base_clock_hz, divider);
        log::debug!(
            "sdhci: clock {} Hz requested, divider {} -> {} Hz",
            target_hz,
            divider,
            actual
        );
        Ok(actual)
    }

    /// Gate the SD clock off.
    ///
    /// Refused with [`Error::Busy`] while the command or data line is
    /// inhibited: cutting the clock under an in-flight transaction is
    /// invalid, and the caller has to retry once the bus drains.
    pub(crate) fn disable_clock(&self) -> Result<()> {
        if self.card_busy() {
            return Err(Error::Busy);
        }
        let regs = self.regs();
        regs.clock_control.modify(CLOCK_CONTROL::SD_CLK_EN::CLEAR);
        regs.clock_control
            .modify(CLOCK_CONTROL::INTERNAL_CLK_EN::CLEAR);
        Ok(())
    }

    /// Switch bus power on or off at the given voltage.
    ///
    /// Spec 3.0 controllers share the power-control register with the eMMC
    /// hardware-reset line; the full-register write keeps that bit clear.
    /// Every transition is followed by a fixed settle delay.
    pub(crate) fn set_bus_power(&self, on: bool, voltage: SignalVoltage) -> Result<()> {
        let regs = self.regs();
        if !on {
            regs.power_control.set(0);
        } else if self.version >= SpecVersion::V3 {
            regs.power_control.write(
                voltage_select(voltage)
                    + POWER_CONTROL::BUS_POWER::SET
                    + POWER_CONTROL::EMMC_HW_RESET::CLEAR,
            );
        } else {
            regs.power_control
                .write(voltage_select(voltage) + POWER_CONTROL::BUS_POWER::SET);
        }
        self.ops.delay_us(POWER_SETTLE_US);
        Ok(())
    }

    /// Switch the signal voltage, preserving the bus-power on/off state.
    ///
    /// The capability gate runs before any register write, so an
    /// unsupported request leaves the power state exactly as it was.
    pub(crate) fn switch_voltage(&self, voltage: SignalVoltage) -> Result<()> {
        let regs = self.regs();
        let supported = match voltage {
            SignalVoltage::V33 => regs.capabilities.is_set(CAPABILITIES::SUPPORT_3V3),
            SignalVoltage::V30 => regs.capabilities.is_set(CAPABILITIES::SUPPORT_3V0),
            SignalVoltage::V18 => regs.capabilities.is_set(CAPABILITIES::SUPPORT_1V8),
        };
        if !supported {
            return Err(Error::Unsupported);
        }

        let was_on = regs.power_control.is_set(POWER_CONTROL::BUS_POWER);

        // Power must be masked while the select bits change.
        regs.power_control.set(0);

        if self.version >= SpecVersion::V3 {
            if voltage == SignalVoltage::V18 {
                regs.host_control2.modify(HOST_CONTROL2::SIGNALING_1V8::SET);
            } else {
                regs.host_control2
                    .modify(HOST_CONTROL2::SIGNALING_1V8::CLEAR);
            }
        }

        let mut value = voltage_select(voltage);
        if was_on {
            value += POWER_CONTROL::BUS_POWER::SET;
        }
        regs.power_control.write(value);
        self.ops.delay_us(POWER_SETTLE_US);

        log::debug!("sdhci: signal voltage now {:?}", voltage);
        Ok(())
    }

    /// Program the data-timeout counter for the requested window, derived
    /// from the SD clock currently applied.
    pub(crate) fn program_data_timeout(&self, timeout_ms: u32) {
        let sd_clock = self.io.lock().sd_clock_hz;
        let exp = timeout_exponent(timeout_ms, sd_clock);
        self.regs()
            .timeout_control
            .write(TIMEOUT_CONTROL::COUNTER.val(exp));
    }
}

fn voltage_select(
    voltage: SignalVoltage,
) -> tock_registers::fields::FieldValue<u8, POWER_CONTROL::Register> {
    match voltage {
        SignalVoltage::V33 => POWER_CONTROL::BUS_VOLTAGE::V3_3,
        SignalVoltage::V30 => POWER_CONTROL::BUS_VOLTAGE::V3_0,
        SignalVoltage::V18 => POWER_CONTROL::BUS_VOLTAGE::V1_8,
    }
}
