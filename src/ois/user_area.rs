//! User data area served from program memory.
//!
//! The controller firmware mirrors a user data region of flash into program
//! memory. Reads and writes go through a small mailbox at 0x5000..0x5006;
//! [`Ois::commit_user_area`] writes the mirror back to flash.

use embedded_hal_1::delay::DelayNs;

use super::code::{CodeEntry, ImageSelect};
use super::{reg, Error, Ois, Stage};
use crate::bus::RegisterBus;
use crate::utils::Poll;

/// Controller revision without user area support.
const CVER_NO_UAREA: u32 = 0x0141;
/// Marker left in RAM once program memory holds a running image.
const PMEM_INITIALIZED: u32 = 0x706D_656D;

/// Maximum bytes per user area burst write.
pub const UAREA_WRITE_MAX: usize = 254;
/// Maximum words per user area word write.
pub const UAREA_WRITE_WORDS_MAX: usize = 63;

const LOAD_POLL: Poll = Poll::after(101, 1);
const ERASE_POLL: Poll = Poll::after(21, 1);
const PROGRAM_POLL: Poll = Poll::after(301, 1);

/// Where a user area access starts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UareaCursor {
    /// Set the mailbox address first.
    At(u32),
    /// Continue from where the previous access stopped.
    Continue,
}

impl<B: RegisterBus, D: DelayNs> Ois<B, D> {
    fn require_user_area(&mut self) -> Result<(), Error<B::Error>> {
        if self.regs.io_read32(reg::SYSDSP_CVER)? == CVER_NO_UAREA {
            return Err(Error::Unsupported);
        }
        Ok(())
    }

    fn seek_user_area(&mut self, cursor: UareaCursor) -> Result<(), Error<B::Error>> {
        match cursor {
            UareaCursor::At(addr) => self.regs.ram_write32(reg::UAREA_ADDR, addr),
            UareaCursor::Continue => Ok(()),
        }
    }

    /// Mirror the user area into program memory, booting `entry`'s image
    /// first if program memory is not running yet.
    pub fn load_user_area(&mut self, entry: &CodeEntry) -> Result<(), Error<B::Error>> {
        self.require_user_area()?;

        if self.regs.ram_read32(reg::UAREA_PMEM_MARK)? != PMEM_INITIALIZED {
            self.enter_boot_mode()?;
            self.pmem_update(ImageSelect::UpdateCode, entry)?;
            self.regs.ram_write32(reg::FLASH_ACCESS, 0)?;
        }

        self.with_flash_access(|ois| {
            ois.regs.ram_write32(reg::UAREA_LOAD, 0)?;
            ois.wait_ram_clear(reg::UAREA_LOAD, u32::MAX, LOAD_POLL, Stage::UserAreaLoad)
        })
    }

    /// Burst read `buf.len()` bytes of user data.
    pub fn read_user_area(&mut self, cursor: UareaCursor, buf: &mut [u8]) -> Result<(), Error<B::Error>> {
        self.require_user_area()?;
        if buf.is_empty() || buf.len() > u16::MAX as usize {
            return Err(Error::InvalidLength { len: buf.len() });
        }
        self.seek_user_area(cursor)?;
        self.regs.ram_write32(reg::UAREA_BURST, buf.len() as u32 - 1)?;
        self.delay.delay_ms(1);
        self.regs.read_burst(reg::UAREA_BURST, buf)
    }

    /// Word-wise read of user data, most significant byte first.
    ///
    /// `buf.len()` must be a non-zero multiple of 4.
    pub fn read_user_area_words(&mut self, cursor: UareaCursor, buf: &mut [u8]) -> Result<(), Error<B::Error>> {
        self.require_user_area()?;
        if buf.is_empty() || buf.len() % 4 != 0 || buf.len() > u8::MAX as usize {
            return Err(Error::InvalidLength { len: buf.len() });
        }
        self.seek_user_area(cursor)?;
        for chunk in buf.chunks_exact_mut(4) {
            let word = self.regs.ram_read32(reg::UAREA_DATA)?;
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        Ok(())
    }

    /// Write up to 254 bytes of user data into the program memory mirror.
    pub fn write_user_area(&mut self, cursor: UareaCursor, data: &[u8]) -> Result<(), Error<B::Error>> {
        self.require_user_area()?;
        if data.is_empty() || data.len() > UAREA_WRITE_MAX {
            return Err(Error::InvalidLength { len: data.len() });
        }
        self.seek_user_area(cursor)?;
        self.regs.write_burst(reg::UAREA_DATA, data)
    }

    /// Write up to 63 words of user data, least significant byte first.
    pub fn write_user_area_words(&mut self, cursor: UareaCursor, words: &[u32]) -> Result<(), Error<B::Error>> {
        self.require_user_area()?;
        if words.is_empty() || words.len() > UAREA_WRITE_WORDS_MAX {
            return Err(Error::InvalidLength { len: words.len() });
        }
        let mut buf = [0u8; UAREA_WRITE_WORDS_MAX * 4];
        for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        self.seek_user_area(cursor)?;
        self.regs.write_burst(reg::UAREA_DATA, &buf[..words.len() * 4])
    }

    /// Write the program memory mirror back to flash.
    pub fn commit_user_area(&mut self) -> Result<(), Error<B::Error>> {
        self.require_user_area()?;
        self.unlock()?;
        // A failed lock is reported over the commit result.
        let res = self.commit_user_area_unlocked();
        self.lock()?;
        res
    }

    fn commit_user_area_unlocked(&mut self) -> Result<(), Error<B::Error>> {
        self.write_permission()?;
        self.additional_unlock()?;

        self.with_flash_access(|ois| {
            ois.regs.ram_write32(reg::UAREA_ERASE, 0)?;
            ois.delay.delay_ms(10);
            ois.wait_ram_clear(reg::UAREA_ERASE, u32::MAX, ERASE_POLL, Stage::UserAreaErase)?;

            ois.regs.ram_write32(reg::UAREA_PROGRAM, 0)?;
            ois.delay.delay_ms(300);
            ois.wait_ram_clear(reg::UAREA_PROGRAM, u32::MAX, PROGRAM_POLL, Stage::UserAreaProgram)
        })
    }
}
