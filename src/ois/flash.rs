//! Flash programming primitives.

use embedded_hal_1::delay::DelayNs;

use super::code::{CodeEntry, CodeTable, ImageSelect};
use super::info::TempCompensation;
use super::{reg, Error, FlashArea, Ois, Stage};
use crate::bus::RegisterBus;
use crate::utils::Poll;

/// Erase blocks in the user area.
pub const FLASH_BLOCKS: u8 = 14;
/// Trailing user blocks kept unless a full-chip erase is requested.
pub const USER_RESERVE: u8 = 2;
/// Highest address accepted by [`Ois::block_erase`].
pub const ERASE_ADDRESS_MAX: u32 = 0x3CFF;
/// Highest address accepted by the read and page write primitives.
pub const RW_ADDRESS_MAX: u32 = 0x3FFF;

cfg_if::cfg_if! {
    if #[cfg(feature = "pmem-burst-64")] {
        const PMEM_BURST_LEN: usize = 64;
    } else {
        const PMEM_BURST_LEN: usize = 120;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "flash-burst-32")] {
        const FLASH_BURST_LEN: usize = 32;
    } else {
        const FLASH_BURST_LEN: usize = 64;
    }
}

const FLASH_RECORD_LEN: usize = 64;

const BOOT_SETTLE_MS: u32 = 15;
const WP_READY: u32 = 0x80;
const FLA_INT_BUSY: u32 = 0x80;

const UNLOCK_POLL: Poll = Poll::before(11, 1);
const PMEM_POLL: Poll = Poll::after(11, 1);
const ERASE_POLL: Poll = Poll::after(101, 5);
const PROGRAM_POLL: Poll = Poll::after(251, 1);
const CHECKSUM_POLL: Poll = Poll::before(101, 1);
const COMMAND_POLL: Poll = Poll::before(101, 0);

// Flash controller commands.
const CMD_READ: u32 = 1;
const CMD_PAGE_LOAD: u32 = 2;
const CMD_BLOCK_ERASE: u32 = 4;
const CMD_PAGE_PROGRAM: u32 = 8;

// FLASH_CTRL commands.
const CTRL_ERASE: u32 = 0x20;
const CTRL_COMMIT_EVEN: u32 = 0x04;
const CTRL_COMMIT_ODD: u32 = 0x08;
const CTRL_CHECKSUM: u32 = 0x100;

fn check_address<E>(address: u32, max: u32) -> Result<(), Error<E>> {
    if address > max {
        return Err(Error::InvalidAddress { address });
    }
    Ok(())
}

/// Replace a protocol failure with the unwind stage, keeping transport errors.
fn unwind<E>(err: Error<E>, stage: Stage) -> Error<E> {
    match err {
        Error::Bus(e) => Error::Bus(e),
        _ => Error::Timeout(stage),
    }
}

impl<B: RegisterBus, D: DelayNs> Ois<B, D> {
    /// Put the controller into boot mode.
    ///
    /// Success is not observable here; callers confirm through a later
    /// version or status read.
    pub fn enter_boot_mode(&mut self) -> Result<(), Error<B::Error>> {
        let remap = self.regs.io_read32(reg::SYSDSP_REMAP)?;
        self.regs.io_write32(reg::SYSDSP_REMAP, (remap & 0x1) | 0x1400)?;
        self.delay.delay_ms(BOOT_SETTLE_MS);
        Ok(())
    }

    /// Release flash write protection.
    pub fn unlock(&mut self) -> Result<(), Error<B::Error>> {
        let regs = &mut self.regs;
        let ready = UNLOCK_POLL.run(&mut self.delay, || {
            regs.io_write32(reg::UNLK_CODE1, 0xAAAA_AAAA)?;
            regs.io_write32(reg::UNLK_CODE2, 0x5555_5555)?;
            Ok(regs.io_read32(reg::FLA_WP)? & WP_READY != 0)
        })?;
        if !ready {
            error!("flash unlock timed out");
            return Err(Error::Timeout(Stage::Unlock));
        }
        Ok(())
    }

    /// Restore flash write protection.
    pub fn lock(&mut self) -> Result<(), Error<B::Error>> {
        let regs = &mut self.regs;
        let locked = UNLOCK_POLL.run(&mut self.delay, || {
            regs.io_write32(reg::FLA_WP, 0x10)?;
            Ok(regs.io_read32(reg::FLA_WP)? & WP_READY == 0)
        })?;
        if !locked {
            error!("flash lock timed out");
            return Err(Error::Timeout(Stage::Lock));
        }
        Ok(())
    }

    pub(crate) fn write_permission(&mut self) -> Result<(), Error<B::Error>> {
        self.regs.io_write32(reg::RSTB_FLA, 0x0000_0001)?;
        self.regs.io_write32(reg::CLK_FLAON, 0x0000_0010)
    }

    pub(crate) fn additional_unlock(&mut self) -> Result<(), Error<B::Error>> {
        self.regs.io_write32(reg::UNLK_CODE3, 0x0000_ACD5)
    }

    /// Full unlock sequence ahead of a single flash controller command.
    fn open_area(&mut self, area: FlashArea) -> Result<(), Error<B::Error>> {
        self.unlock()?;
        self.write_permission()?;
        if area != FlashArea::User {
            self.regs.io_write32(reg::UNLK_CODE3, 0x0000_C5AD)?;
        }
        self.additional_unlock()
    }

    fn wait_command(&mut self) -> Result<(), Error<B::Error>> {
        self.wait_io_clear(reg::FLA_INT, FLA_INT_BUSY, COMMAND_POLL, Stage::FlashCommand)
    }

    /// Stream a program memory image and verify its checksum.
    pub fn pmem_update(&mut self, select: ImageSelect, entry: &CodeEntry) -> Result<(), Error<B::Error>> {
        let image = entry.pmem_image(select)?;
        debug!("pmem load: {} words", image.size);

        self.regs.ram_write32(reg::PMEM_CTRL, 0x0008_0000)?;
        for chunk in image.data[..image.size as usize * 5].chunks(PMEM_BURST_LEN) {
            self.regs.write_burst(reg::PMEM_BURST, chunk)?;
        }

        let [hi, lo] = image.size.to_be_bytes();
        self.regs.write_burst(reg::PMEM_CHECKSUM, &[hi, lo, 0, 0])?;
        self.wait_ram_clear(reg::PMEM_BUSY, u32::MAX, PMEM_POLL, Stage::Pmem)
            .inspect_err(|_| error!("pmem load did not complete"))?;

        let mut sum = [0u8; 8];
        self.regs.read_burst(reg::PMEM_CHECKSUM, &mut sum)?;
        if sum != image.checksum.to_be_bytes() {
            error!("pmem checksum mismatch");
            return Err(Error::Verify(Stage::Pmem));
        }

        if select == ImageSelect::FromCode {
            self.regs.ram_write32(reg::FLASH_CPU_RELEASE, 0)?;
        }
        Ok(())
    }

    /// Erase user-area blocks `start..end`.
    ///
    /// A timeout on any block aborts the whole erase. Write protection mode is
    /// restored before returning.
    pub fn erase_user_area(&mut self, start: u8, end: u8) -> Result<(), Error<B::Error>> {
        self.with_flash_access(|ois| {
            ois.regs.ram_write32(reg::FLASH_ACCESS, 0)?;
            for block in start..end {
                ois.regs.ram_write32(reg::FLASH_BLOCK, (block as u32) << 10)?;
                ois.regs.ram_write32(reg::FLASH_CTRL, CTRL_ERASE)?;
                ois.delay.delay_ms(5);
                ois.wait_ram_clear(reg::FLASH_CTRL, u32::MAX, ERASE_POLL, Stage::Erase)
                    .inspect_err(|_| error!("erase of block {} timed out", block))?;
            }
            Ok(())
        })
    }

    /// Send one 64-byte flash record to the even or odd staging buffer.
    fn send_record(&mut self, odd: bool, record: &[u8]) -> Result<(), Error<B::Error>> {
        let addr = if odd { reg::FLASH_RECORD_ODD } else { reg::FLASH_RECORD_EVEN };
        let mut buf = [0u8; FLASH_BURST_LEN + 1];
        for (n, part) in record.chunks(FLASH_BURST_LEN).enumerate() {
            buf[0] = (n * FLASH_BURST_LEN) as u8;
            buf[1..].copy_from_slice(part);
            self.regs.write_burst(addr, &buf)?;
        }
        Ok(())
    }

    fn wait_record(&mut self, mask: u32) -> Result<(), Error<B::Error>> {
        self.wait_ram_clear(reg::FLASH_CTRL, mask, PROGRAM_POLL, Stage::Program)
            .inspect_err(|_| error!("flash record program timed out"))
    }

    /// Program the flash image with even/odd staging buffers.
    ///
    /// Records 1.. go first, alternating odd and even staging buffers; each
    /// buffer has its own commit command. Record 0 is written last from the
    /// even buffer.
    pub fn program_flash(&mut self, entry: &CodeEntry) -> Result<(), Error<B::Error>> {
        let image = entry.flash_image()?;
        self.with_flash_access(|ois| {
            ois.regs.ram_write32(reg::FLASH_ACCESS, 0)?;
            ois.regs.ram_write32(reg::FLASH_BLOCK, 0x10)?;

            for (n, record) in image.chunks_exact(FLASH_RECORD_LEN).enumerate().skip(1) {
                let odd = n % 2 == 1;
                ois.send_record(odd, record)?;
                ois.regs.ram_write32(reg::FLASH_RECORD_SIZE, 0x10)?;
                ois.wait_record(u32::MAX)?;
                let commit = if odd { CTRL_COMMIT_ODD } else { CTRL_COMMIT_EVEN };
                ois.regs.ram_write32(reg::FLASH_CTRL, commit)?;
            }
            ois.wait_record(u32::MAX)?;

            ois.regs.ram_write32(reg::FLASH_BLOCK, 0)?;
            ois.send_record(false, &image[..FLASH_RECORD_LEN])?;
            ois.regs.ram_write32(reg::FLASH_RECORD_SIZE, 0x10)?;
            ois.wait_record(u32::MAX)?;
            ois.regs.ram_write32(reg::FLASH_CTRL, CTRL_COMMIT_EVEN)?;
            ois.wait_record(CTRL_COMMIT_EVEN | CTRL_COMMIT_ODD)
        })
    }

    /// Full flash update of `entry`, followed by the temperature
    /// compensation patch and a remap to flash.
    ///
    /// `erase_all` also erases the reserved trailing user blocks.
    pub fn update_flash(
        &mut self,
        erase_all: bool,
        entry: &CodeEntry,
        temp_comp: &TempCompensation,
    ) -> Result<(), Error<B::Error>> {
        self.pmem_update(ImageSelect::UpdateCode, entry)?;

        self.unlock().map_err(|e| unwind(e, Stage::UpdateUnlock))?;
        self.write_permission()?;
        self.additional_unlock()?;

        let end = if erase_all { FLASH_BLOCKS } else { FLASH_BLOCKS - USER_RESERVE };
        if let Err(e) = self.erase_user_area(0, end) {
            self.lock().map_err(|e| unwind(e, Stage::EraseUnwind))?;
            return Err(e);
        }
        if let Err(e) = self.program_flash(entry) {
            self.lock().map_err(|e| unwind(e, Stage::ProgramUnwind))?;
            return Err(e);
        }
        self.lock().map_err(|e| unwind(e, Stage::ProgramUnwind))?;

        self.with_flash_access(|ois| {
            ois.regs.ram_write32(reg::FLASH_BLOCK, 0)?;
            ois.regs.ram_write32(reg::FLASH_CHECKSUM, entry.from_code_valid_size)?;
            ois.regs.ram_write32(reg::FLASH_CTRL, CTRL_CHECKSUM)?;
            ois.delay.delay_ms(6);
            ois.wait_ram_clear(reg::FLASH_CTRL, u32::MAX, CHECKSUM_POLL, Stage::FlashChecksum)?;
            let sum = ois.regs.ram_read32(reg::FLASH_CHECKSUM)?;
            if u64::from(sum) != entry.from_code_checksum {
                error!("flash checksum {:#x} does not match image", sum);
                return Err(Error::Verify(Stage::FlashChecksum));
            }
            Ok(())
        })?;

        self.write_temp_comp(temp_comp).map_err(|e| match e {
            Error::Bus(e) => Error::Bus(e),
            _ => Error::Verify(Stage::TempComp),
        })?;

        self.regs.io_write32(reg::SYSDSP_REMAP, 0x0000_1000)?;
        self.delay.delay_ms(BOOT_SETTLE_MS);
        let rom = self.regs.io_read32(reg::ROMINFO)?;
        if rom != 0x0A {
            error!("rom info {:#x} after remap", rom);
            return Err(Error::Verify(Stage::RomInfo));
        }
        info!("flash update of image 0x{:04x} complete", entry.index);
        Ok(())
    }

    /// Boot the controller, then load and start the program memory image
    /// embedded in the flash blob of image `index`.
    pub fn pmem_download(&mut self, codes: &CodeTable, index: u16) -> Result<(), Error<B::Error>> {
        let Some(entry) = codes.find(index) else {
            error!("no firmware image for module 0x{:04x}", index);
            return Err(Error::UnknownModule { index });
        };
        self.enter_boot_mode()?;
        self.pmem_update(ImageSelect::FromCode, entry)
    }

    /// Erase one block of `area` containing `address`.
    pub fn block_erase(&mut self, area: FlashArea, address: u32) -> Result<(), Error<B::Error>> {
        let area = area.checked()?;
        check_address(address, ERASE_ADDRESS_MAX)?;

        self.open_area(area)?;
        self.regs
            .io_write32(reg::FLA_ADR, ((area as u32) << 16) | (address & 0x3C00))?;
        self.regs.io_write32(reg::FLA_CMD, CMD_BLOCK_ERASE)?;
        self.delay.delay_ms(5);
        let res = self.wait_command();
        self.lock()?;
        res
    }

    /// Erase a whole info area, in flash access mode.
    pub fn erase_info_area(&mut self, area: FlashArea) -> Result<(), Error<B::Error>> {
        if matches!(area, FlashArea::User) {
            return Err(Error::InvalidArea { area: area as u8 });
        }
        self.with_flash_access(|ois| ois.block_erase(area, 0))
    }

    /// Read one word from flash.
    pub fn single_read(&mut self, area: FlashArea, address: u32) -> Result<u32, Error<B::Error>> {
        let area = area.checked()?;
        check_address(address, RW_ADDRESS_MAX)?;

        self.regs.io_write32(reg::FLA_ACSCNT, 0)?;
        self.regs
            .io_write32(reg::FLA_ADR, ((area as u32) << 16) | (address & RW_ADDRESS_MAX))?;
        self.regs.io_write32(reg::FLA_CMD, CMD_READ)?;
        self.regs.io_read32(reg::FLA_RDAT)
    }

    /// Read `out.len()` consecutive words (1..=256) from flash.
    pub fn multi_read(&mut self, area: FlashArea, address: u32, out: &mut [u32]) -> Result<(), Error<B::Error>> {
        let area = area.checked()?;
        check_address(address, RW_ADDRESS_MAX)?;
        if out.is_empty() || out.len() > 256 {
            return Err(Error::InvalidLength { len: out.len() });
        }

        self.regs.io_write32(reg::FLA_ACSCNT, out.len() as u32 - 1)?;
        self.regs
            .io_write32(reg::FLA_ADR, ((area as u32) << 16) | (address & RW_ADDRESS_MAX))?;
        self.regs.io_write32(reg::FLA_CMD, CMD_READ)?;
        for word in out.iter_mut() {
            *word = self.regs.io_read32(reg::FLA_RDAT)?;
        }
        Ok(())
    }

    /// Program one 16-word page at `address` (rounded down to the page).
    pub fn page_write(&mut self, area: FlashArea, address: u32, data: &[u32; 16]) -> Result<(), Error<B::Error>> {
        let area = area.checked()?;
        check_address(address, RW_ADDRESS_MAX)?;

        self.open_area(area)?;
        self.regs
            .io_write32(reg::FLA_ADR, ((area as u32) << 16) | (address & 0x3FF0))?;
        self.regs.io_write32(reg::FLA_CMD, CMD_PAGE_LOAD)?;
        for &word in data {
            self.regs.io_write32(reg::FLA_WDAT, word)?;
        }
        let res = self.wait_command().and_then(|()| {
            self.regs.io_write32(reg::FLA_CMD, CMD_PAGE_PROGRAM)?;
            self.wait_command()
        });
        self.lock()?;
        res
    }
}
