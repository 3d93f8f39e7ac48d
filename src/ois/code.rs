//! Firmware code table.
//!
//! The images themselves are vendor blobs compiled into the integrating
//! firmware; this module only describes and indexes them.

use super::Error;

/// One downloadable firmware image pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CodeEntry {
    /// `vendor << 8 | revision`.
    pub index: u16,
    /// Program memory image loaded before flashing.
    pub update_code: &'static [u8],
    /// Declared size of `update_code`, in 5-byte program words.
    pub update_code_size: u16,
    /// Expected program memory checksum after loading `update_code`.
    pub update_code_checksum: u64,
    /// Flash image. Its header also embeds a program memory image.
    pub from_code: &'static [u8],
    /// Bytes of `from_code` written to flash.
    pub from_code_size: u32,
    /// Expected flash checksum register value after programming.
    pub from_code_checksum: u64,
    /// Size value handed to the flash checksum engine.
    pub from_code_valid_size: u32,
}

/// Which image is streamed into program memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageSelect {
    /// The standalone update image, used to drive a flash update.
    UpdateCode,
    /// The image embedded in the flash blob header; the controller CPU is
    /// released afterwards.
    FromCode,
}

/// Program memory image resolved from a [`CodeEntry`].
pub(crate) struct PmemImage {
    pub data: &'static [u8],
    pub size: u16,
    pub checksum: u64,
}

const FROM_CODE_HEADER: usize = 32;

impl CodeEntry {
    pub const fn vendor(&self) -> u8 {
        (self.index >> 8) as u8
    }

    pub const fn revision(&self) -> u8 {
        self.index as u8
    }

    pub(crate) fn pmem_image<E>(&self, select: ImageSelect) -> Result<PmemImage, Error<E>> {
        let image = match select {
            ImageSelect::UpdateCode => PmemImage {
                data: self.update_code,
                size: self.update_code_size,
                checksum: self.update_code_checksum,
            },
            ImageSelect::FromCode => {
                let header = self.from_code.get(..FROM_CODE_HEADER).ok_or(Error::MalformedImage)?;
                let mut sum = [0u8; 8];
                sum.copy_from_slice(&header[12..20]);
                PmemImage {
                    data: &self.from_code[FROM_CODE_HEADER..],
                    size: u16::from_le_bytes([header[8], header[9]]),
                    checksum: u64::from_le_bytes(sum),
                }
            }
        };
        if image.data.len() < image.size as usize * 5 {
            return Err(Error::MalformedImage);
        }
        Ok(image)
    }

    /// Flash image bytes covered by `from_code_size`, in 64-byte records.
    pub(crate) fn flash_image<E>(&self) -> Result<&'static [u8], Error<E>> {
        let size = self.from_code_size as usize;
        if size < 64 || size % 64 != 0 || self.from_code.len() < size {
            return Err(Error::MalformedImage);
        }
        Ok(&self.from_code[..size])
    }
}

/// Keyed lookup over the compiled-in images.
#[derive(Debug, Copy, Clone)]
pub struct CodeTable {
    entries: &'static [CodeEntry],
}

impl CodeTable {
    pub const fn new(entries: &'static [CodeEntry]) -> Self {
        Self { entries }
    }

    pub fn find(&self, index: u16) -> Option<&'static CodeEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    pub fn entries(&self) -> &'static [CodeEntry] {
        self.entries
    }
}
