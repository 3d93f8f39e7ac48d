//! Register-level model of the controller used by the unit tests.

extern crate std;

use std::collections::BTreeMap;
use std::vec::Vec;

use embedded_hal_1::delay::DelayNs;

use super::reg;
use crate::bus::{AddrWidth, DataWidth, RegisterBus};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Nack;

/// Delay that only accounts for the requested time.
#[derive(Debug, Default)]
pub(crate) struct NoDelay {
    pub ns: u64,
}

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.ns += ns as u64;
    }
}

pub(crate) struct SimOis {
    pub target: u8,
    /// Bus target seen by every transfer.
    pub targets_seen: Vec<u8>,
    pub calls: usize,
    /// Fail the transfer with this call number (0-based).
    pub nack_at: Option<usize>,

    pub ram: BTreeMap<u16, u32>,
    pub io: BTreeMap<u32, u32>,
    latch: u32,
    pub ram_writes: Vec<(u16, u32)>,

    pub flash: BTreeMap<(u8, u32), u32>,
    pub unlocked: bool,
    /// Write protect requests dropped before one takes effect.
    pub wp_ignore: u32,
    fla_addr: u32,
    read_cursor: u32,
    page: Vec<u32>,
    page_base: u32,
    pub fla_int_stuck: bool,
    pub corrupt_info_readback: bool,

    pub pmem_loads: usize,
    pub pmem_bytes: usize,
    /// Program memory checksum reported after a load.
    pub pmem_sum: u64,
    /// Flash checksum reported by a correct programming run.
    pub flash_sum: u32,
    /// Number of upcoming checksum runs that report a corrupt sum.
    pub fail_flash_checksum: u32,
    /// Version reported once the controller is remapped to flash.
    pub flashed_version: u32,
    /// (staging register, record offset byte) per record burst.
    pub records: Vec<(u16, u8)>,
    pub ctrl_log: Vec<u32>,

    /// Status byte reported after a recalibration run.
    pub recal_status: u8,

    pub uarea: Vec<u8>,
    uarea_cursor: usize,
}

impl SimOis {
    pub fn new(target: u8) -> Self {
        let mut ram = BTreeMap::new();
        ram.insert(reg::FW_VERSION, 0x01);
        Self {
            target,
            targets_seen: Vec::new(),
            calls: 0,
            nack_at: None,
            ram,
            io: BTreeMap::new(),
            latch: 0,
            ram_writes: Vec::new(),
            flash: BTreeMap::new(),
            unlocked: false,
            wp_ignore: 0,
            fla_addr: 0,
            read_cursor: 0,
            page: Vec::new(),
            page_base: 0,
            fla_int_stuck: false,
            corrupt_info_readback: false,
            pmem_loads: 0,
            pmem_bytes: 0,
            pmem_sum: 0,
            flash_sum: 0,
            fail_flash_checksum: 0,
            flashed_version: 0,
            records: Vec::new(),
            ctrl_log: Vec::new(),
            recal_status: 0,
            uarea: std::vec![0; 256],
            uarea_cursor: 0,
        }
    }

    fn access(&mut self) -> Result<(), Nack> {
        let n = self.calls;
        self.calls += 1;
        self.targets_seen.push(self.target);
        if self.nack_at == Some(n) {
            return Err(Nack);
        }
        Ok(())
    }

    fn flash_word(&self, area: u8, addr: u32) -> u32 {
        self.flash.get(&(area, addr)).copied().unwrap_or(0xFFFF_FFFF)
    }

    fn io_write(&mut self, addr: u32, value: u32) {
        let area = (self.fla_addr >> 16) as u8;
        let base = self.fla_addr & 0xFFFF;
        match addr {
            reg::UNLK_CODE2 if value == 0x5555_5555 => self.unlocked = true,
            reg::FLA_WP if value == 0x10 => {
                if self.wp_ignore > 0 {
                    self.wp_ignore -= 1;
                } else {
                    self.unlocked = false;
                }
            }
            reg::FLA_ADR => self.fla_addr = value,
            reg::FLA_CMD => match value {
                1 => self.read_cursor = base,
                2 => {
                    self.page.clear();
                    self.page_base = base;
                }
                4 if self.unlocked => {
                    let block = base & 0x3C00;
                    self.flash
                        .retain(|&(a, w), _| a != area || !(block..block + 0x400).contains(&w));
                }
                8 if self.unlocked => {
                    for (i, word) in core::mem::take(&mut self.page).into_iter().enumerate() {
                        self.flash.insert((area, self.page_base + i as u32), word);
                    }
                }
                _ => {}
            },
            reg::FLA_WDAT => self.page.push(value),
            reg::SYSDSP_REMAP if value == 0x1000 => {
                self.io.insert(addr, value);
                if self.flashed_version != 0 {
                    self.ram.insert(reg::FW_VERSION, self.flashed_version);
                }
            }
            _ => {
                self.io.insert(addr, value);
            }
        }
    }

    fn io_read(&mut self, addr: u32) -> u32 {
        match addr {
            reg::FLA_RDAT => {
                let area = (self.fla_addr >> 16) as u8;
                let cursor = self.read_cursor;
                self.read_cursor += 1;
                let word = self.flash_word(area, cursor);
                if self.corrupt_info_readback && area != 0 && cursor == 5 {
                    word ^ 0x0000_0100
                } else {
                    word
                }
            }
            reg::FLA_WP => {
                if self.unlocked {
                    0x80
                } else {
                    0
                }
            }
            reg::FLA_INT => {
                if self.fla_int_stuck {
                    0x80
                } else {
                    0
                }
            }
            reg::ROMINFO => 0x0A,
            reg::SYSDSP_CVER => self.io.get(&addr).copied().unwrap_or(0x0142),
            _ => self.io.get(&addr).copied().unwrap_or(0),
        }
    }

    fn ram_write(&mut self, addr: u16, value: u32) {
        self.ram_writes.push((addr, value));
        match addr {
            reg::IO_ADDR_LATCH => self.latch = value,
            reg::IO_DATA_PORT => self.io_write(self.latch, value),
            reg::PMEM_CTRL => self.pmem_loads += 1,
            reg::FLASH_CTRL => {
                self.ctrl_log.push(value);
                if value == 0x100 {
                    let sum = if self.fail_flash_checksum > 0 {
                        self.fail_flash_checksum -= 1;
                        self.flash_sum ^ 0xDEAD
                    } else {
                        self.flash_sum
                    };
                    self.ram.insert(reg::FLASH_CHECKSUM, sum);
                }
            }
            reg::GYRO_RECAL => {
                self.ram.insert(addr, (self.recal_status as u32) << 24);
            }
            reg::UAREA_ADDR => self.uarea_cursor = value as usize,
            _ => {
                self.ram.insert(addr, value);
            }
        }
    }

    fn ram_read(&mut self, addr: u16) -> u32 {
        match addr {
            reg::IO_DATA_PORT => self.io_read(self.latch),
            reg::UAREA_DATA => {
                let at = self.uarea_cursor;
                self.uarea_cursor += 4;
                u32::from_be_bytes([self.uarea[at], self.uarea[at + 1], self.uarea[at + 2], self.uarea[at + 3]])
            }
            _ => self.ram.get(&addr).copied().unwrap_or(0),
        }
    }
}

impl RegisterBus for SimOis {
    type Error = Nack;

    fn read(&mut self, addr: u32, aw: AddrWidth, dw: DataWidth) -> Result<u32, Nack> {
        assert_eq!((aw, dw), (AddrWidth::Word, DataWidth::Dword));
        self.access()?;
        Ok(self.ram_read(addr as u16))
    }

    fn write(&mut self, addr: u32, value: u32, aw: AddrWidth, dw: DataWidth) -> Result<(), Nack> {
        assert_eq!((aw, dw), (AddrWidth::Word, DataWidth::Dword));
        self.access()?;
        self.ram_write(addr as u16, value);
        Ok(())
    }

    fn read_burst(&mut self, addr: u32, _aw: AddrWidth, buf: &mut [u8]) -> Result<(), Nack> {
        self.access()?;
        match addr as u16 {
            reg::PMEM_CHECKSUM => buf.copy_from_slice(&self.pmem_sum.to_be_bytes()[..buf.len()]),
            reg::UAREA_BURST => {
                let at = self.uarea_cursor;
                buf.copy_from_slice(&self.uarea[at..at + buf.len()]);
                self.uarea_cursor += buf.len();
            }
            _ => buf.fill(0),
        }
        Ok(())
    }

    fn write_burst(&mut self, addr: u32, _aw: AddrWidth, data: &[u8]) -> Result<(), Nack> {
        self.access()?;
        match addr as u16 {
            reg::PMEM_BURST => self.pmem_bytes += data.len(),
            reg::FLASH_RECORD_EVEN | reg::FLASH_RECORD_ODD => self.records.push((addr as u16, data[0])),
            reg::UAREA_DATA => {
                let at = self.uarea_cursor;
                self.uarea[at..at + data.len()].copy_from_slice(data);
                self.uarea_cursor += data.len();
            }
            _ => {}
        }
        Ok(())
    }

    fn target(&self) -> u8 {
        self.target
    }

    fn set_target(&mut self, target: u8) {
        self.target = target;
    }
}
