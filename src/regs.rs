//! SDHCI register definitions using tock-registers
//!
//! Standard SDHCI register block and bitfields per the SD Host Controller
//! Simplified Specification. Offsets and field widths are bit-exact; the
//! card stack depends on this layout matching real silicon.

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

register_bitfields! [
    u32,
    /// Present State Register (0x24)
    pub PRESENT_STATE [
        /// Command Inhibit (CMD)
        CMD_INHIBIT OFFSET(0) NUMBITS(1) [],
        /// Command Inhibit (DAT)
        DAT_INHIBIT OFFSET(1) NUMBITS(1) [],
        /// DAT Line Active
        DAT_ACTIVE OFFSET(2) NUMBITS(1) [],
        /// Re-Tuning Request
        RETUNE_REQUEST OFFSET(3) NUMBITS(1) [],
        /// Write Transfer Active
        WRITE_ACTIVE OFFSET(8) NUMBITS(1) [],
        /// Read Transfer Active
        READ_ACTIVE OFFSET(9) NUMBITS(1) [],
        /// Buffer Write Enable
        BUFFER_WRITE_ENABLE OFFSET(10) NUMBITS(1) [],
        /// Buffer Read Enable
        BUFFER_READ_ENABLE OFFSET(11) NUMBITS(1) [],
        /// Card Inserted
        CARD_INSERTED OFFSET(16) NUMBITS(1) [],
        /// Card State Stable
        CARD_STABLE OFFSET(17) NUMBITS(1) [],
        /// Card Detect Pin Level
        CARD_DETECT_PIN OFFSET(18) NUMBITS(1) [],
        /// Write Protect Switch Pin Level
        WRITE_PROTECT OFFSET(19) NUMBITS(1) [],
        /// DAT[3:0] Line Signal Level
        DAT_LEVEL OFFSET(20) NUMBITS(4) []
    ],

    /// Capabilities Register, low word (0x40)
    pub CAPABILITIES [
        /// Timeout Clock Frequency
        TIMEOUT_CLK_FREQ OFFSET(0) NUMBITS(6) [],
        /// Timeout Clock Unit (0=KHz, 1=MHz)
        TIMEOUT_CLK_UNIT OFFSET(7) NUMBITS(1) [],
        /// Base Clock Frequency for SD Clock (MHz)
        BASE_CLK_FREQ OFFSET(8) NUMBITS(8) [],
        /// Max Block Length (0=512, 1=1024, 2=2048)
        MAX_BLOCK_LEN OFFSET(16) NUMBITS(2) [],
        /// 8-bit Support for Embedded Device
        SUPPORT_8BIT OFFSET(18) NUMBITS(1) [],
        /// ADMA2 Support
        SUPPORT_ADMA2 OFFSET(19) NUMBITS(1) [],
        /// High Speed Support
        SUPPORT_HIGHSPEED OFFSET(21) NUMBITS(1) [],
        /// SDMA Support
        SUPPORT_SDMA OFFSET(22) NUMBITS(1) [],
        /// Suspend/Resume Support
        SUPPORT_SUSPEND OFFSET(23) NUMBITS(1) [],
        /// Voltage Support 3.3V
        SUPPORT_3V3 OFFSET(24) NUMBITS(1) [],
        /// Voltage Support 3.0V
        SUPPORT_3V0 OFFSET(25) NUMBITS(1) [],
        /// Voltage Support 1.8V
        SUPPORT_1V8 OFFSET(26) NUMBITS(1) [],
        /// 64-bit System Bus Support
        SUPPORT_64BIT OFFSET(28) NUMBITS(1) []
    ],

    /// Capabilities Register, high word (0x44)
    pub CAPABILITIES_EXT [
        /// SDR50 Support
        SUPPORT_SDR50 OFFSET(0) NUMBITS(1) [],
        /// SDR104 Support
        SUPPORT_SDR104 OFFSET(1) NUMBITS(1) [],
        /// DDR50 Support
        SUPPORT_DDR50 OFFSET(2) NUMBITS(1) [],
        /// Use Tuning for SDR50
        USE_SDR50_TUNING OFFSET(13) NUMBITS(1) [],
        /// Re-Tuning Modes
        RETUNING_MODES OFFSET(14) NUMBITS(2) [],
        /// Clock Multiplier
        CLK_MULTIPLIER OFFSET(16) NUMBITS(8) []
    ]
];

register_bitfields! [
    u16,
    /// Block Size Register (0x04)
    pub BLOCK_SIZE [
        /// Transfer Block Size
        XFER_BLOCK_SIZE OFFSET(0) NUMBITS(12) [],
        /// SDMA Buffer Boundary (7 = 512KB)
        SDMA_BOUNDARY OFFSET(12) NUMBITS(3) []
    ],

    /// Transfer Mode Register (0x0C)
    pub TRANSFER_MODE [
        /// DMA Enable
        DMA_ENABLE OFFSET(0) NUMBITS(1) [],
        /// Block Count Enable
        BLOCK_COUNT_ENABLE OFFSET(1) NUMBITS(1) [],
        /// Auto CMD Enable
        AUTO_CMD OFFSET(2) NUMBITS(2) [
            Disabled = 0,
            Cmd12 = 1,
            Cmd23 = 2
        ],
        /// Data Transfer Direction (1=read, 0=write)
        DATA_DIRECTION OFFSET(4) NUMBITS(1) [
            Write = 0,
            Read = 1
        ],
        /// Multi / Single Block Select
        MULTI_BLOCK OFFSET(5) NUMBITS(1) []
    ],

    /// Command Register (0x0E)
    pub COMMAND [
        /// Response Length Class
        RESPONSE_CLASS OFFSET(0) NUMBITS(2) [
            None = 0,
            Long136 = 1,
            Short48 = 2,
            Short48Busy = 3
        ],
        /// Command CRC Check Enable
        CRC_CHECK OFFSET(3) NUMBITS(1) [],
        /// Command Index Check Enable
        INDEX_CHECK OFFSET(4) NUMBITS(1) [],
        /// Data Present Select
        DATA_PRESENT OFFSET(5) NUMBITS(1) [],
        /// Command Type
        CMD_TYPE OFFSET(6) NUMBITS(2) [
            Normal = 0,
            Suspend = 1,
            Resume = 2,
            Abort = 3
        ],
        /// Command Index
        CMD_INDEX OFFSET(8) NUMBITS(6) []
    ],

    /// Clock Control Register (0x2C)
    pub CLOCK_CONTROL [
        /// Internal Clock Enable
        INTERNAL_CLK_EN OFFSET(0) NUMBITS(1) [],
        /// Internal Clock Stable
        INTERNAL_CLK_STABLE OFFSET(1) NUMBITS(1) [],
        /// SD Clock Enable
        SD_CLK_EN OFFSET(2) NUMBITS(1) [],
        /// Programmable Clock Mode
        PROG_CLK_MODE OFFSET(5) NUMBITS(1) [],
        /// Upper Bits of SDCLK Frequency Select (spec 3.0)
        FREQ_SELECT_HI OFFSET(6) NUMBITS(2) [],
        /// SDCLK Frequency Select
        FREQ_SELECT OFFSET(8) NUMBITS(8) []
    ],

    /// Normal Interrupt Status Register (0x30)
    ///
    /// The same layout serves the status-enable (0x34) and signal-enable
    /// (0x38) registers.
    pub INT_STATUS [
        /// Command Complete
        CMD_COMPLETE OFFSET(0) NUMBITS(1) [],
        /// Transfer Complete
        TRANSFER_COMPLETE OFFSET(1) NUMBITS(1) [],
        /// Block Gap Event
        BLOCK_GAP OFFSET(2) NUMBITS(1) [],
        /// DMA Interrupt (SDMA boundary / descriptor interrupt)
        DMA_INT OFFSET(3) NUMBITS(1) [],
        /// Buffer Write Ready
        BUFFER_WRITE_READY OFFSET(4) NUMBITS(1) [],
        /// Buffer Read Ready
        BUFFER_READ_READY OFFSET(5) NUMBITS(1) [],
        /// Card Insertion
        CARD_INSERT OFFSET(6) NUMBITS(1) [],
        /// Card Removal
        CARD_REMOVE OFFSET(7) NUMBITS(1) [],
        /// Card Interrupt
        CARD_INT OFFSET(8) NUMBITS(1) [],
        /// Re-Tuning Event
        RETUNE OFFSET(12) NUMBITS(1) [],
        /// Error Interrupt (summary of 0x32)
        ERROR OFFSET(15) NUMBITS(1) []
    ],

    /// Error Interrupt Status Register (0x32)
    ///
    /// The same layout serves the error status-enable (0x36) and error
    /// signal-enable (0x3A) registers.
    pub ERR_STATUS [
        /// Command Timeout Error
        CMD_TIMEOUT OFFSET(0) NUMBITS(1) [],
        /// Command CRC Error
        CMD_CRC OFFSET(1) NUMBITS(1) [],
        /// Command End Bit Error
        CMD_END_BIT OFFSET(2) NUMBITS(1) [],
        /// Command Index Error
        CMD_INDEX OFFSET(3) NUMBITS(1) [],
        /// Data Timeout Error
        DATA_TIMEOUT OFFSET(4) NUMBITS(1) [],
        /// Data CRC Error
        DATA_CRC OFFSET(5) NUMBITS(1) [],
        /// Data End Bit Error
        DATA_END_BIT OFFSET(6) NUMBITS(1) [],
        /// Current Limit Error
        CURRENT_LIMIT OFFSET(7) NUMBITS(1) [],
        /// Auto CMD Error
        AUTO_CMD OFFSET(8) NUMBITS(1) [],
        /// ADMA Error
        ADMA OFFSET(9) NUMBITS(1) [],
        /// Tuning Error
        TUNING OFFSET(10) NUMBITS(1) []
    ],

    /// Host Control 2 Register (0x3E)
    pub HOST_CONTROL2 [
        /// UHS Mode Select
        UHS_MODE OFFSET(0) NUMBITS(3) [
            Sdr12 = 0,
            Sdr25 = 1,
            Sdr50 = 2,
            Sdr104 = 3,
            Ddr50 = 4
        ],
        /// 1.8V Signaling Enable
        SIGNALING_1V8 OFFSET(3) NUMBITS(1) [],
        /// Driver Strength Select
        DRIVER_STRENGTH OFFSET(4) NUMBITS(2) [],
        /// Execute Tuning (self-clearing)
        EXEC_TUNING OFFSET(6) NUMBITS(1) [],
        /// Sampling Clock Select (set by hardware on tuning success)
        SAMPLING_CLK OFFSET(7) NUMBITS(1) [],
        /// Preset Value Enable
        PRESET_VALUE_EN OFFSET(15) NUMBITS(1) []
    ],

    /// Host Controller Version Register (0xFE)
    pub HOST_VERSION [
        /// Specification Version Number (0=1.0, 1=2.0, 2=3.0)
        SPEC_VERSION OFFSET(0) NUMBITS(8) [],
        /// Vendor Version Number
        VENDOR_VERSION OFFSET(8) NUMBITS(8) []
    ]
];

register_bitfields! [
    u8,
    /// Host Control 1 Register (0x28)
    pub HOST_CONTROL1 [
        /// LED Control
        LED OFFSET(0) NUMBITS(1) [],
        /// Data Transfer Width (1=4-bit)
        DATA_WIDTH_4BIT OFFSET(1) NUMBITS(1) [],
        /// High Speed Enable
        HIGH_SPEED OFFSET(2) NUMBITS(1) [],
        /// DMA Select
        DMA_SELECT OFFSET(3) NUMBITS(2) [
            Sdma = 0,
            Adma2_32 = 2,
            Adma2_64 = 3
        ],
        /// Extended Data Transfer Width (1=8-bit)
        DATA_WIDTH_8BIT OFFSET(5) NUMBITS(1) [],
        /// Card Detect Test Level
        CD_TEST_LEVEL OFFSET(6) NUMBITS(1) [],
        /// Card Detect Signal Selection
        CD_SIGNAL_SEL OFFSET(7) NUMBITS(1) []
    ],

    /// Power Control Register (0x29)
    pub POWER_CONTROL [
        /// SD Bus Power
        BUS_POWER OFFSET(0) NUMBITS(1) [],
        /// SD Bus Voltage Select
        BUS_VOLTAGE OFFSET(1) NUMBITS(3) [
            V1_8 = 5,
            V3_0 = 6,
            V3_3 = 7
        ],
        /// eMMC Hardware Reset (active low on embedded slots)
        EMMC_HW_RESET OFFSET(4) NUMBITS(1) []
    ],

    /// Timeout Control Register (0x2E)
    pub TIMEOUT_CONTROL [
        /// Data Timeout Counter Exponent (TMCLK * 2^(13+n))
        COUNTER OFFSET(0) NUMBITS(4) []
    ],

    /// Software Reset Register (0x2F)
    pub SOFTWARE_RESET [
        /// Software Reset for All (self-clearing)
        RESET_ALL OFFSET(0) NUMBITS(1) [],
        /// Software Reset for CMD Line (self-clearing)
        RESET_CMD OFFSET(1) NUMBITS(1) [],
        /// Software Reset for DAT Line (self-clearing)
        RESET_DATA OFFSET(2) NUMBITS(1) []
    ]
];

/// SDHCI controller register block.
///
/// One instance of this layout exists per controller, mapped at the MMIO
/// base handed to [`crate::SdhciHost::new`]. Never aliased outside the
/// owning host instance.
#[repr(C)]
pub struct SdhciRegisters {
    /// SDMA System Address / Argument 2 (0x00)
    pub sdma_addr: ReadWrite<u32>,
    /// Block Size Register (0x04)
    pub block_size: ReadWrite<u16, BLOCK_SIZE::Register>,
    /// Block Count Register (0x06)
    pub block_count: ReadWrite<u16>,
    /// Argument Register (0x08)
    pub argument: ReadWrite<u32>,
    /// Transfer Mode Register (0x0C)
    pub transfer_mode: ReadWrite<u16, TRANSFER_MODE::Register>,
    /// Command Register (0x0E)
    pub command: ReadWrite<u16, COMMAND::Register>,
    /// Response Registers 0-3 (0x10, 0x14, 0x18, 0x1C)
    pub response: [ReadOnly<u32>; 4],
    /// Buffer Data Port Register (0x20)
    pub buffer_data: ReadWrite<u32>,
    /// Present State Register (0x24)
    pub present_state: ReadOnly<u32, PRESENT_STATE::Register>,
    /// Host Control 1 Register (0x28)
    pub host_control1: ReadWrite<u8, HOST_CONTROL1::Register>,
    /// Power Control Register (0x29)
    pub power_control: ReadWrite<u8, POWER_CONTROL::Register>,
    /// Block Gap Control Register (0x2A)
    pub block_gap_control: ReadWrite<u8>,
    /// Wakeup Control Register (0x2B)
    pub wakeup_control: ReadWrite<u8>,
    /// Clock Control Register (0x2C)
    pub clock_control: ReadWrite<u16, CLOCK_CONTROL::Register>,
    /// Timeout Control Register (0x2E)
    pub timeout_control: ReadWrite<u8, TIMEOUT_CONTROL::Register>,
    /// Software Reset Register (0x2F)
    pub software_reset: ReadWrite<u8, SOFTWARE_RESET::Register>,
    /// Normal Interrupt Status Register (0x30), write-1-to-clear
    pub int_status: ReadWrite<u16, INT_STATUS::Register>,
    /// Error Interrupt Status Register (0x32), write-1-to-clear
    pub err_status: ReadWrite<u16, ERR_STATUS::Register>,
    /// Normal Interrupt Status Enable Register (0x34)
    pub int_status_enable: ReadWrite<u16, INT_STATUS::Register>,
    /// Error Interrupt Status Enable Register (0x36)
    pub err_status_enable: ReadWrite<u16, ERR_STATUS::Register>,
    /// Normal Interrupt Signal Enable Register (0x38)
    pub int_signal_enable: ReadWrite<u16, INT_STATUS::Register>,
    /// Error Interrupt Signal Enable Register (0x3A)
    pub err_signal_enable: ReadWrite<u16, ERR_STATUS::Register>,
    /// Auto CMD Error Status Register (0x3C)
    pub acmd_error: ReadOnly<u16>,
    /// Host Control 2 Register (0x3E)
    pub host_control2: ReadWrite<u16, HOST_CONTROL2::Register>,
    /// Capabilities Register, low word (0x40)
    pub capabilities: ReadOnly<u32, CAPABILITIES::Register>,
    /// Capabilities Register, high word (0x44)
    pub capabilities_ext: ReadOnly<u32, CAPABILITIES_EXT::Register>,
    /// Maximum Current Capabilities Register (0x48)
    pub max_current: ReadOnly<u32>,
    _reserved0: u32,
    /// Force Event Register for Auto CMD Error Status (0x50)
    pub force_acmd_error: WriteOnly<u16>,
    /// Force Event Register for Error Interrupt Status (0x52)
    pub force_err_status: WriteOnly<u16>,
    /// ADMA Error Status Register (0x54)
    pub adma_error: ReadOnly<u8>,
    _reserved1: [u8; 3],
    /// ADMA System Address Register, low word (0x58)
    pub adma_addr_lo: ReadWrite<u32>,
    /// ADMA System Address Register, high word (0x5C)
    pub adma_addr_hi: ReadWrite<u32>,
    _reserved2: [u8; 0x9C],
    /// Slot Interrupt Status Register (0xFC)
    pub slot_int_status: ReadOnly<u16>,
    /// Host Controller Version Register (0xFE)
    pub host_version: ReadOnly<u16, HOST_VERSION::Register>,
}

// The card stack relies on this block overlaying real silicon exactly.
const _: () = assert!(core::mem::size_of::<SdhciRegisters>() == 0x100);

/// Host version register value for spec 1.0 controllers
pub const SPEC_VER_100: u8 = 0;
/// Host version register value for spec 2.0 controllers
pub const SPEC_VER_200: u8 = 1;
/// Host version register value for spec 3.0 controllers
pub const SPEC_VER_300: u8 = 2;

/// Maximum clock divisor for spec 2.0 controllers (powers of two)
pub const MAX_DIV_SPEC_200: u32 = 256;
/// Maximum clock divisor for spec 3.0 controllers (even values)
pub const MAX_DIV_SPEC_300: u32 = 2046;

/// Default SDMA buffer boundary field value (7 = 512KB)
pub const DEFAULT_SDMA_BOUNDARY: u16 = 7;

// Raw status-bit masks, for mask arithmetic alongside the typed fields.

/// Normal status: command complete
pub const INT_CMD_COMPLETE: u16 = 1 << 0;
/// Normal status: transfer complete
pub const INT_TRANSFER_COMPLETE: u16 = 1 << 1;
/// Normal status: DMA interrupt
pub const INT_DMA: u16 = 1 << 3;
/// Normal status: buffer write ready
pub const INT_BUFFER_WRITE_READY: u16 = 1 << 4;
/// Normal status: buffer read ready
pub const INT_BUFFER_READ_READY: u16 = 1 << 5;
/// Normal status: error summary bit
pub const INT_ERROR_SUMMARY: u16 = 1 << 15;

/// Error status: command timeout
pub const ERR_CMD_TIMEOUT: u16 = 1 << 0;
/// Error status: data timeout
pub const ERR_DATA_TIMEOUT: u16 = 1 << 4;
/// Error status: ADMA error
pub const ERR_ADMA: u16 = 1 << 9;

/// STOP_TRANSMISSION - forces the card to stop a multi-block transfer
pub const CMD_STOP_TRANSMISSION: u8 = 12;
/// READ_SINGLE_BLOCK
pub const CMD_READ_SINGLE_BLOCK: u8 = 17;
/// READ_MULTIPLE_BLOCK
pub const CMD_READ_MULTIPLE_BLOCK: u8 = 18;
/// WRITE_SINGLE_BLOCK
pub const CMD_WRITE_SINGLE_BLOCK: u8 = 24;
/// WRITE_MULTIPLE_BLOCK
pub const CMD_WRITE_MULTIPLE_BLOCK: u8 = 25;
