//! Firmware update orchestration.

use embedded_hal_1::delay::DelayNs;

use super::code::{CodeEntry, CodeTable};
use super::info::TempCompensation;
use super::{Error, Ois, Stage};
use crate::bus::{RegisterBus, Retarget};
use crate::utils::Poll;

/// Flash attempts per update, including the first.
const MAX_ATTEMPTS: u8 = 2;
const SETTLE_MS: u32 = 20;
const CHECK_IDLE_POLL: Poll = Poll::before(100, 10);
const UPDATE_IDLE_POLL: Poll = Poll::before(20, 10);

/// OIS controller sitting behind a camera sensor on the shared bus.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OisTarget {
    RearWide,
    RearTele,
}

impl OisTarget {
    /// 7-bit bus address of the controller.
    pub const fn address(self) -> u8 {
        match self {
            OisTarget::RearWide => 0x76 >> 1,
            OisTarget::RearTele => 0x78 >> 1,
        }
    }

    /// Controller paired with a camera sensor, by sensor id.
    pub fn from_sensor_id(sensor_id: u16) -> Option<Self> {
        match sensor_id {
            0x363 => Some(OisTarget::RearWide),
            0x481 => Some(OisTarget::RearTele),
            _ => None,
        }
    }
}

/// Firmware update configuration.
#[derive(Debug, Copy, Clone)]
pub struct UpdateConfig {
    pub target: OisTarget,
    /// Lowest firmware version that needs no update.
    pub known_good_version: u8,
    /// RAM word holding the calibration id.
    pub cal_id_addr: u16,
    /// RAM word holding the module maker code.
    pub module_maker_addr: u16,
    /// Image index used when both identity words read zero.
    pub blank_device_index: u16,
    /// Also erase the reserved user blocks.
    pub erase_all: bool,
    pub codes: CodeTable,
    /// Temperature compensation sets, selected by image revision (1-based).
    pub temp_comp: &'static [TempCompensation],
}

impl UpdateConfig {
    pub const fn new(
        target: OisTarget,
        known_good_version: u8,
        codes: CodeTable,
        temp_comp: &'static [TempCompensation],
    ) -> Self {
        Self {
            target,
            known_good_version,
            cal_id_addr: 0x8004,
            module_maker_addr: 0x8008,
            blank_device_index: 0x0901,
            erase_all: false,
            codes,
            temp_comp,
        }
    }

    fn is_current(&self, version: u8) -> bool {
        version != 0 && version >= self.known_good_version
    }

    /// Image index for a module: vendor from the module maker word, revision
    /// from the calibration id.
    pub fn image_index(&self, module_maker: u32, cal_id: u16) -> u16 {
        if module_maker == 0 && cal_id == 0 {
            return self.blank_device_index;
        }
        let vendor = (module_maker & 0xFF) as u16;
        let revision = cal_id & 0x0F;
        vendor << 8 | revision
    }

    fn temp_comp_for(&self, entry: &CodeEntry) -> Option<&'static TempCompensation> {
        let slot = (entry.index & 0x0F).checked_sub(1)?;
        self.temp_comp.get(slot as usize)
    }
}

/// Result of [`check_and_update`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateOutcome {
    /// Firmware was already current.
    UpToDate { version: u8 },
    /// Firmware was reflashed.
    Updated { version: u8, attempts: u8 },
}

enum VersionCheck {
    Current(u8),
    Stale { module_maker: u32, cal_id: u16 },
}

impl<B: RegisterBus, D: DelayNs> Ois<B, D> {
    fn check_version(&mut self, config: &UpdateConfig) -> Result<VersionCheck, Error<B::Error>> {
        let version = self.firmware_version()?;
        let cal_id = self.regs.ram_read32(config.cal_id_addr)? as u16;
        let module_maker = self.regs.ram_read32(config.module_maker_addr)?;
        info!(
            "ois fw 0x{:02x}, cal id 0x{:04x}, module maker 0x{:08x}",
            version, cal_id, module_maker
        );

        if config.is_current(version) {
            return Ok(VersionCheck::Current(version));
        }
        self.wait_idle(CHECK_IDLE_POLL)?;
        Ok(VersionCheck::Stale { module_maker, cal_id })
    }

    /// One flash attempt: boot mode, full update, settle, then idle gate.
    pub fn run_update(
        &mut self,
        erase_all: bool,
        entry: &CodeEntry,
        temp_comp: &TempCompensation,
    ) -> Result<(), Error<B::Error>> {
        self.enter_boot_mode()?;
        self.update_flash(erase_all, entry, temp_comp)?;
        self.delay.delay_ms(SETTLE_MS);
        self.wait_idle(UPDATE_IDLE_POLL)
    }

    /// Bring the firmware up to date, flashing at most twice.
    pub fn update_if_needed(&mut self, config: &UpdateConfig) -> Result<UpdateOutcome, Error<B::Error>> {
        let (module_maker, cal_id) = match self.check_version(config)? {
            VersionCheck::Current(version) => return Ok(UpdateOutcome::UpToDate { version }),
            VersionCheck::Stale { module_maker, cal_id } => (module_maker, cal_id),
        };

        let index = config.image_index(module_maker, cal_id);
        let Some((entry, temp_comp)) = config
            .codes
            .find(index)
            .and_then(|entry| Some((entry, config.temp_comp_for(entry)?)))
        else {
            error!("no firmware image for module 0x{:04x}", index);
            return Err(Error::UnknownModule { index });
        };

        let mut last = Error::Verify(Stage::Version);
        for attempt in 1..=MAX_ATTEMPTS {
            info!("flashing image 0x{:04x}, attempt {}", index, attempt);
            match self.run_update(config.erase_all, entry, temp_comp) {
                Ok(()) => {}
                Err(Error::Bus(e)) => return Err(Error::Bus(e)),
                Err(e) => {
                    warn!("flash attempt {} failed, code 0x{:02x}", attempt, e.code());
                    last = e;
                }
            }

            let version = self.firmware_version()?;
            if config.is_current(version) {
                info!("ois fw updated to 0x{:02x}", version);
                return Ok(UpdateOutcome::Updated { version, attempts: attempt });
            }
            warn!("ois fw 0x{:02x} after attempt {}", version, attempt);
        }

        error!("ois firmware update failed, code 0x{:02x}", last.code());
        Err(last)
    }
}

/// Check the OIS firmware paired with the camera on `bus` and reflash it if
/// it is stale.
///
/// The bus target is switched to the controller for the duration of the
/// call and restored on every exit path.
pub fn check_and_update<B, D>(bus: &mut B, delay: D, config: &UpdateConfig) -> Result<UpdateOutcome, Error<B::Error>>
where
    B: RegisterBus + ?Sized,
    D: DelayNs,
{
    let mut ois = Ois::new(Retarget::new(bus, config.target.address()), delay);
    ois.update_if_needed(config)
}

/// Firmware version byte of the controller paired with the camera on `bus`.
pub fn read_firmware_version<B, D>(bus: &mut B, delay: D, target: OisTarget) -> Result<u8, Error<B::Error>>
where
    B: RegisterBus + ?Sized,
    D: DelayNs,
{
    let mut ois = Ois::new(Retarget::new(bus, target.address()), delay);
    let version = ois.firmware_version()?;
    debug!("ois fw version 0x{:02x}", version);
    Ok(version)
}
