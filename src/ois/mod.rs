//! OIS controller (LC898129) flash programming, firmware update and gyro
//! calibration.
//!
//! The controller exposes a 16-bit RAM address space over the camera control
//! bus. Its internal 24-bit IO space (system registers and the flash
//! controller) is reached indirectly through an address latch and a data
//! port in RAM space. All operations are blocking and bounded: every wait is
//! a busy poll with a fixed attempt cap.

use core::fmt;

use embedded_hal_1::delay::DelayNs;

use crate::bus::{AddrWidth, DataWidth, RegisterBus};

mod calibration;
mod code;
mod flash;
mod info;
mod update;
mod user_area;

pub use calibration::{
    correct_from_profile, persist_offsets, recalibrate, AxisPair, CalError, CorrectionProfile, RecalResult,
    RECAL_DIFF_LIMIT, RECAL_OFFSET_LIMIT,
};
pub use code::{CodeEntry, CodeTable, ImageSelect};
pub use flash::{ERASE_ADDRESS_MAX, FLASH_BLOCKS, RW_ADDRESS_MAX, USER_RESERVE};
pub use info::{GyroOffsets, InfoArea, TempCompensation, INFO_WORDS};
pub use update::{check_and_update, read_firmware_version, OisTarget, UpdateConfig, UpdateOutcome};
pub use user_area::{UareaCursor, UAREA_WRITE_MAX, UAREA_WRITE_WORDS_MAX};

#[cfg(test)]
mod sim;
#[cfg(test)]
mod tests;

/// Register map. RAM addresses are 16 bits, IO addresses 24 bits.
pub(crate) mod reg {
    // RAM space
    pub const IO_ADDR_LATCH: u16 = 0xC000;
    pub const IO_DATA_PORT: u16 = 0xD000;

    pub const PMEM_CTRL: u16 = 0x3000;
    pub const PMEM_BURST: u16 = 0x4000;
    pub const PMEM_BUSY: u16 = 0x0088;

    pub const FLASH_CPU_RELEASE: u16 = 0xF001;
    pub const FLASH_ACCESS: u16 = 0xF007;
    pub const FLASH_RECORD_EVEN: u16 = 0xF008;
    pub const FLASH_RECORD_ODD: u16 = 0xF009;
    pub const FLASH_BLOCK: u16 = 0xF00A;
    pub const FLASH_RECORD_SIZE: u16 = 0xF00B;
    pub const FLASH_CTRL: u16 = 0xF00C;
    pub const FLASH_CHECKSUM: u16 = 0xF00D;
    pub const PMEM_CHECKSUM: u16 = 0xF00E;
    pub const GYRO_RECAL: u16 = 0xF014;
    pub const STATUS: u16 = 0xF100;
    pub const FW_VERSION: u16 = 0x8000;

    pub const GYRO_OFFSET_X: u16 = 0x1A28;
    pub const GYRO_OFFSET_Y: u16 = 0x1A2C;
    pub const GYRO_FACTORY_OFFSET: u16 = 0x1A6C;

    pub const ANGLE_OFFSET_X: u16 = 0x0240;
    pub const ANGLE_OFFSET_Y: u16 = 0x0244;
    pub const ANGLE_OFFSET_Z: u16 = 0x03A8;
    pub const ACCEL_OFFSET_X: u16 = 0x0454;
    pub const ACCEL_OFFSET_Y: u16 = 0x0480;
    pub const ACCEL_OFFSET_Z: u16 = 0x04AC;

    pub const UAREA_ADDR: u16 = 0x5000;
    pub const UAREA_DATA: u16 = 0x5001;
    pub const UAREA_BURST: u16 = 0x5002;
    pub const UAREA_LOAD: u16 = 0x5004;
    pub const UAREA_ERASE: u16 = 0x5005;
    pub const UAREA_PROGRAM: u16 = 0x5006;
    pub const UAREA_PMEM_MARK: u16 = 0x500F;

    // IO space
    pub const SYSDSP_REMAP: u32 = 0xD0_00AC;
    pub const SYSDSP_CVER: u32 = 0xD0_0100;
    pub const ROMINFO: u32 = 0xE0_50D4;

    pub const FLA_RDAT: u32 = 0xE0_7000;
    pub const FLA_WDAT: u32 = 0xE0_7004;
    pub const FLA_ACSCNT: u32 = 0xE0_7008;
    pub const FLA_ADR: u32 = 0xE0_700C;
    pub const FLA_CMD: u32 = 0xE0_7010;
    pub const FLA_WP: u32 = 0xE0_7014;
    pub const FLA_INT: u32 = 0xE0_7018;
    pub const FLA_MODE: u32 = 0xE0_701C;
    pub const RSTB_FLA: u32 = 0xE0_74CC;
    pub const UNLK_CODE1: u32 = 0xE0_7554;
    pub const CLK_FLAON: u32 = 0xE0_7664;
    pub const UNLK_CODE2: u32 = 0xE0_7AA8;
    pub const UNLK_CODE3: u32 = 0xE0_7CCC;

    pub const READ_STATUS_BUSY: u32 = 0x0100_0000;
}

/// Phase of a controller operation, used to qualify timeouts and
/// verification failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// Flash write protection release.
    Unlock,
    /// Flash write protection restore.
    Lock,
    /// Unlock at the start of a full flash update.
    UpdateUnlock,
    /// Lock while unwinding a failed erase.
    EraseUnwind,
    /// Lock after programming, or while unwinding a failed program.
    ProgramUnwind,
    /// Program memory download and its checksum.
    Pmem,
    /// Multi-block erase of the user area.
    Erase,
    /// Record programming.
    Program,
    /// Final flash checksum.
    FlashChecksum,
    /// Temperature compensation patch after a full update.
    TempComp,
    /// ROM info check after remapping to flash.
    RomInfo,
    /// Single flash controller command (block erase, page write).
    FlashCommand,
    /// Info area checksum readback.
    InfoArea,
    /// Controller never reached idle command state.
    Idle,
    /// Firmware version still not current after an update.
    Version,
    /// Gyro recalibration on the controller.
    Recalibration,
    /// User area load into program memory.
    UserAreaLoad,
    /// User area erase before commit.
    UserAreaErase,
    /// User area program during commit.
    UserAreaProgram,
}

impl Stage {
    /// Legacy numeric phase code.
    pub const fn code(self, verify: bool) -> u8 {
        match (self, verify) {
            (Stage::Unlock, _) => 0x01,
            (Stage::FlashCommand, _) => 0x02,
            (Stage::Lock, _) => 0x03,
            (Stage::InfoArea, _) => 0x05,
            (Stage::UserAreaLoad, _) | (Stage::UserAreaErase, _) => 0x10,
            (Stage::UserAreaProgram, _) => 0x20,
            (Stage::Pmem, false) => 0x21,
            (Stage::Pmem, true) => 0x22,
            (Stage::Erase, _) => 0x31,
            (Stage::EraseUnwind, _) => 0x32,
            (Stage::UpdateUnlock, _) => 0x33,
            (Stage::Program, _) => 0x41,
            (Stage::ProgramUnwind, _) => 0x43,
            (Stage::FlashChecksum, false) => 0x51,
            (Stage::FlashChecksum, true) => 0x52,
            (Stage::TempComp, _) | (Stage::RomInfo, _) => 0x53,
            (Stage::Version, _) => 0x54,
            (Stage::Idle, _) => 0x60,
            (Stage::Recalibration, _) => 0x70,
        }
    }
}

/// OIS controller error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error<E> {
    /// Transport failure, passed through unchanged.
    Bus(E),
    /// Flash area selector not accepted by the primitive.
    InvalidArea { area: u8 },
    /// Flash address out of range for the primitive.
    InvalidAddress { address: u32 },
    /// Transfer length out of range for the primitive.
    InvalidLength { len: usize },
    /// Code table image shorter than its declared size.
    MalformedImage,
    /// A bounded poll ran out of attempts.
    Timeout(Stage),
    /// A checksum or readback comparison failed.
    Verify(Stage),
    /// No code table entry matches the module.
    UnknownModule { index: u16 },
    /// Controller revision does not support the requested feature.
    Unsupported,
}

impl<E> Error<E> {
    /// Legacy numeric code naming the failed phase.
    pub fn code(&self) -> u8 {
        match self {
            Error::Bus(_) => 0xFE,
            Error::InvalidArea { .. } => 10,
            Error::InvalidAddress { .. } => 9,
            Error::InvalidLength { .. } | Error::MalformedImage => 0xFF,
            Error::Timeout(stage) => stage.code(false),
            Error::Verify(stage) => stage.code(true),
            Error::UnknownModule { .. } | Error::Unsupported => 0xF0,
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(e) => write!(f, "bus error: {:?}", e),
            Error::InvalidArea { area } => write!(f, "invalid flash area {:#x}", area),
            Error::InvalidAddress { address } => write!(f, "invalid flash address {:#x}", address),
            Error::InvalidLength { len } => write!(f, "invalid transfer length {}", len),
            Error::MalformedImage => f.write_str("code table image shorter than declared size"),
            Error::Timeout(stage) => write!(f, "{:?} timed out (code {:#04x})", stage, stage.code(false)),
            Error::Verify(stage) => write!(f, "{:?} verification failed (code {:#04x})", stage, stage.code(true)),
            Error::UnknownModule { index } => write!(f, "no firmware for module {:#06x}", index),
            Error::Unsupported => f.write_str("unsupported controller revision"),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for Error<E> {}

/// Flash area ("MAT") selector.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FlashArea {
    /// Main firmware area.
    User = 0,
    /// Calibration area 0 (gyro offsets).
    Info0 = 1,
    /// Calibration area 1 (temperature compensation).
    Info1 = 2,
    /// Calibration area 2.
    Info2 = 4,
    /// Trim area. Never writable through the public primitives.
    Trim = 16,
}

impl FlashArea {
    fn checked<E>(self) -> Result<Self, Error<E>> {
        match self {
            FlashArea::Trim => Err(Error::InvalidArea { area: self as u8 }),
            area => Ok(area),
        }
    }
}

impl TryFrom<u8> for FlashArea {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(FlashArea::User),
            1 => Ok(FlashArea::Info0),
            2 => Ok(FlashArea::Info1),
            4 => Ok(FlashArea::Info2),
            16 => Ok(FlashArea::Trim),
            v => Err(v),
        }
    }
}

// ============================================================================
// Register access
// ============================================================================

/// Raw controller register access over a [`RegisterBus`].
pub(crate) struct Regs<B> {
    bus: B,
}

impl<B: RegisterBus> Regs<B> {
    pub(crate) fn ram_write32(&mut self, addr: u16, value: u32) -> Result<(), Error<B::Error>> {
        self.bus
            .write(addr as u32, value, AddrWidth::Word, DataWidth::Dword)
            .map_err(Error::Bus)
    }

    pub(crate) fn ram_read32(&mut self, addr: u16) -> Result<u32, Error<B::Error>> {
        self.bus
            .read(addr as u32, AddrWidth::Word, DataWidth::Dword)
            .map_err(Error::Bus)
    }

    pub(crate) fn io_write32(&mut self, addr: u32, value: u32) -> Result<(), Error<B::Error>> {
        self.ram_write32(reg::IO_ADDR_LATCH, addr)?;
        self.ram_write32(reg::IO_DATA_PORT, value)
    }

    pub(crate) fn io_read32(&mut self, addr: u32) -> Result<u32, Error<B::Error>> {
        self.ram_write32(reg::IO_ADDR_LATCH, addr)?;
        self.ram_read32(reg::IO_DATA_PORT)
    }

    pub(crate) fn write_burst(&mut self, addr: u16, data: &[u8]) -> Result<(), Error<B::Error>> {
        self.bus
            .write_burst(addr as u32, AddrWidth::Word, data)
            .map_err(Error::Bus)
    }

    pub(crate) fn read_burst(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), Error<B::Error>> {
        self.bus.read_burst(addr as u32, AddrWidth::Word, buf).map_err(Error::Bus)
    }
}

/// Handle to one OIS controller.
///
/// Owns the transport (already pointed at the controller) and a blocking
/// delay source. Use [`crate::bus::Retarget`] to borrow a shared camera bus
/// for the lifetime of the handle.
pub struct Ois<B, D> {
    pub(crate) regs: Regs<B>,
    pub(crate) delay: D,
}

impl<B: RegisterBus, D: DelayNs> Ois<B, D> {
    pub fn new(bus: B, delay: D) -> Self {
        Self { regs: Regs { bus }, delay }
    }

    /// Give back the transport and delay.
    pub fn release(self) -> (B, D) {
        (self.regs.bus, self.delay)
    }

    /// Firmware version byte from the version word at 0x8000.
    pub fn firmware_version(&mut self) -> Result<u8, Error<B::Error>> {
        Ok((self.regs.ram_read32(reg::FW_VERSION)? & 0xFF) as u8)
    }

    /// `true` while the controller is busy executing a command.
    pub fn is_busy(&mut self) -> Result<bool, Error<B::Error>> {
        Ok(self.regs.ram_read32(reg::STATUS)? & reg::READ_STATUS_BUSY != 0)
    }

    /// Poll the command status until idle.
    pub(crate) fn wait_idle(&mut self, poll: crate::utils::Poll) -> Result<(), Error<B::Error>> {
        let regs = &mut self.regs;
        let idle = poll.run(&mut self.delay, || {
            Ok(regs.ram_read32(reg::STATUS)? & reg::READ_STATUS_BUSY == 0)
        })?;
        if idle {
            Ok(())
        } else {
            warn!("controller did not reach idle");
            Err(Error::Timeout(Stage::Idle))
        }
    }

    /// Poll a RAM register until `value & mask == 0`.
    pub(crate) fn wait_ram_clear(
        &mut self,
        addr: u16,
        mask: u32,
        poll: crate::utils::Poll,
        stage: Stage,
    ) -> Result<(), Error<B::Error>> {
        let regs = &mut self.regs;
        if poll.run(&mut self.delay, || Ok(regs.ram_read32(addr)? & mask == 0))? {
            Ok(())
        } else {
            Err(Error::Timeout(stage))
        }
    }

    /// Poll an IO register until `value & mask == 0`.
    pub(crate) fn wait_io_clear(
        &mut self,
        addr: u32,
        mask: u32,
        poll: crate::utils::Poll,
        stage: Stage,
    ) -> Result<(), Error<B::Error>> {
        let regs = &mut self.regs;
        if poll.run(&mut self.delay, || Ok(regs.io_read32(addr)? & mask == 0))? {
            Ok(())
        } else {
            Err(Error::Timeout(stage))
        }
    }

    /// Run `f` with the flash controller in access mode, restoring the
    /// protected mode on every exit path.
    pub(crate) fn with_flash_access<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error<B::Error>>,
    ) -> Result<T, Error<B::Error>> {
        self.regs.io_write32(reg::FLA_MODE, 0)?;
        let res = f(self);
        let restore = self.regs.io_write32(reg::FLA_MODE, 2);
        let value = res?;
        restore?;
        Ok(value)
    }
}
