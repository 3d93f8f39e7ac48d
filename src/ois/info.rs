//! Info area ("INF_MAT") calibration pages.
//!
//! Each page is 64 words. Word 63 carries a 16-bit byte sum of the page in
//! its low half; the high half is covered by the sum.

use embedded_hal_1::delay::DelayNs;

use super::{reg, Error, FlashArea, Ois, Stage};
use crate::bus::RegisterBus;

/// Words per info area page.
pub const INFO_WORDS: usize = 64;

const CHECKSUM_WORD: usize = INFO_WORDS - 1;
const PAGE_WORDS: usize = 16;

/// In-memory image of one info area page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InfoArea {
    pub words: [u32; INFO_WORDS],
}

impl Default for InfoArea {
    fn default() -> Self {
        Self { words: [0; INFO_WORDS] }
    }
}

impl InfoArea {
    /// Byte sum over words 0..=62 and the high half of word 63.
    pub fn checksum(&self) -> u16 {
        let body = self.words[..CHECKSUM_WORD]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .fold(0u16, |acc, b| acc.wrapping_add(b as u16));
        let [_, _, b2, b3] = self.words[CHECKSUM_WORD].to_le_bytes();
        body.wrapping_add(b2 as u16).wrapping_add(b3 as u16)
    }

    /// Checksum currently stored in word 63.
    pub fn stored_checksum(&self) -> u16 {
        self.words[CHECKSUM_WORD] as u16
    }

    /// Recompute the checksum and store it, keeping the high half of word 63.
    pub fn seal(&mut self) -> u16 {
        let sum = self.checksum();
        self.words[CHECKSUM_WORD] = (self.words[CHECKSUM_WORD] & 0xFFFF_0000) | sum as u32;
        sum
    }

    pub fn is_valid(&self) -> bool {
        self.stored_checksum() == self.checksum()
    }

    /// Persisted byte layout: little-endian words.
    pub fn to_le_bytes(&self) -> [u8; INFO_WORDS * 4] {
        let mut out = [0u8; INFO_WORDS * 4];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_le_bytes(bytes: &[u8; INFO_WORDS * 4]) -> Self {
        let mut area = Self::default();
        for (word, chunk) in area.words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        area
    }
}

/// Temperature compensation coefficients stored in info area 1.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TempCompensation {
    pub rcode_x: u32,
    pub rcode_y: u32,
    pub rcode_z: u32,
    pub shag: u32,
    pub shbg: u32,
    pub shcg: u32,
    pub shoutag: u32,
    pub shoutbg: u32,
    pub shab: u32,
    pub shac: u32,
    pub shaa: u32,
    pub shbb: u32,
    pub shbc: u32,
    pub shba: u32,
    pub shcb: u32,
    pub shcc: u32,
    pub shca: u32,
    pub tab: u32,
    pub tac: u32,
    pub taa: u32,
    pub tbb: u32,
    pub tbc: u32,
    pub tba: u32,
    pub temp_off: u32,
    pub tag: u32,
    pub tbg: u32,
    pub shiftg: u32,
    pub shoutag1: u32,
    pub shoutbg1: u32,
    pub tcx: u8,
    pub tbx: u8,
    pub tax: u8,
}

impl TempCompensation {
    /// Write the coefficients into their info area slots (words 0..=29).
    pub fn encode_into(&self, area: &mut InfoArea) {
        let w = &mut area.words;
        let fields = [
            self.rcode_x,
            self.rcode_y,
            self.rcode_z,
            self.shag,
            self.shbg,
            self.shcg,
            self.shoutag,
            self.shoutbg,
            self.shoutag1,
            self.shoutbg1,
            self.tag,
            self.tbg,
            self.shiftg,
            self.shab,
            self.shac,
            self.shaa,
            self.shbb,
            self.shbc,
            self.shba,
            self.shcb,
            self.shcc,
            self.shca,
            self.tab,
            self.tac,
            self.taa,
            self.tbb,
            self.tbc,
            self.tba,
            self.temp_off,
        ];
        w[..fields.len()].copy_from_slice(&fields);
        w[29] = (self.tcx as u32) << 16 | (self.tbx as u32) << 8 | self.tax as u32;
    }
}

/// Angle and accelerometer offsets held in controller RAM.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GyroOffsets {
    pub angle: [i32; 3],
    pub accel: [i32; 3],
}

impl GyroOffsets {
    /// Info area 0 words holding X/Y/Z: accel high half over angle high half.
    pub const INFO_WORD: usize = 10;

    pub fn encode_into(&self, area: &mut InfoArea) {
        for axis in 0..3 {
            area.words[Self::INFO_WORD + axis] =
                (self.accel[axis] as u32 & 0xFFFF_0000) | (self.angle[axis] as u32 >> 16);
        }
    }

    /// Inverse of [`GyroOffsets::encode_into`]; low halves are lost.
    pub fn decode(area: &InfoArea) -> Self {
        let mut out = Self::default();
        for axis in 0..3 {
            let w = area.words[Self::INFO_WORD + axis];
            out.accel[axis] = (w & 0xFFFF_0000) as i32;
            out.angle[axis] = (w << 16) as i32;
        }
        out
    }
}

impl<B: RegisterBus, D: DelayNs> Ois<B, D> {
    /// Read one info area page.
    pub fn read_info_area(&mut self, area: FlashArea) -> Result<InfoArea, Error<B::Error>> {
        let mut page = InfoArea::default();
        self.multi_read(area, 0, &mut page.words)?;
        Ok(page)
    }

    /// Read, erase, modify, seal, rewrite and verify one info area page.
    ///
    /// On failure after the erase the page is left erased or partially
    /// written; there is no rollback. Returns the stored checksum.
    pub fn rewrite_info_area(
        &mut self,
        area: FlashArea,
        modify: impl FnOnce(&mut InfoArea),
    ) -> Result<u16, Error<B::Error>> {
        if matches!(area, FlashArea::User | FlashArea::Trim) {
            return Err(Error::InvalidArea { area: area as u8 });
        }

        self.with_flash_access(|ois| {
            let mut page = ois.read_info_area(area)?;
            ois.block_erase(area, 0)?;

            modify(&mut page);
            let sum = page.seal();

            for (n, chunk) in page.words.chunks_exact(PAGE_WORDS).enumerate() {
                let mut data = [0u32; PAGE_WORDS];
                data.copy_from_slice(chunk);
                ois.page_write(area, (n * PAGE_WORDS) as u32, &data)?;
            }

            let readback = ois.read_info_area(area)?;
            if readback.checksum() != sum || readback.stored_checksum() != sum {
                error!("info area {} checksum mismatch after write", area as u8);
                return Err(Error::Verify(Stage::InfoArea));
            }
            debug!("info area {} written, checksum 0x{:04x}", area as u8, sum);
            Ok(sum)
        })
    }

    /// Patch the temperature compensation coefficients into info area 1.
    pub fn write_temp_comp(&mut self, params: &TempCompensation) -> Result<u16, Error<B::Error>> {
        self.rewrite_info_area(FlashArea::Info1, |page| params.encode_into(page))
    }

    /// Live offset table from controller RAM.
    pub fn read_gyro_offsets(&mut self) -> Result<GyroOffsets, Error<B::Error>> {
        let mut read = |addr| self.regs.ram_read32(addr).map(|v| v as i32);
        Ok(GyroOffsets {
            angle: [read(reg::ANGLE_OFFSET_X)?, read(reg::ANGLE_OFFSET_Y)?, read(reg::ANGLE_OFFSET_Z)?],
            accel: [read(reg::ACCEL_OFFSET_X)?, read(reg::ACCEL_OFFSET_Y)?, read(reg::ACCEL_OFFSET_Z)?],
        })
    }

    /// Persist an offset table into info area 0.
    pub fn write_gyro_offsets(&mut self, offsets: &GyroOffsets) -> Result<u16, Error<B::Error>> {
        self.rewrite_info_area(FlashArea::Info0, |page| offsets.encode_into(page))
    }
}
