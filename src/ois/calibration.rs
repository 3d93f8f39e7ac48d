//! Gyro offset recalibration.

use core::fmt;

use embedded_hal_1::delay::DelayNs;

use super::update::OisTarget;
use super::{reg, Error, Ois, Stage};
use crate::bus::{RegisterBus, Retarget};
use crate::utils::Poll;

/// Largest accepted recalibrated offset magnitude.
pub const RECAL_OFFSET_LIMIT: i32 = 0x600;
/// Largest accepted factory-to-recalibrated drift magnitude.
pub const RECAL_DIFF_LIMIT: i32 = 0x1000;

const RECAL_POLL: Poll = Poll::before(100, 10);
const FACTORY_UNSET: u16 = 0xFFFF;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AxisPair {
    pub x: i16,
    pub y: i16,
}

/// Outcome of an on-controller gyro recalibration.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecalResult {
    pub factory: AxisPair,
    pub recalibrated: AxisPair,
    /// `factory - recalibrated`, wrapping.
    pub diff: AxisPair,
}

impl RecalResult {
    pub fn within_tolerance(&self) -> bool {
        let ok = |offset: i16, diff: i16| {
            (offset as i32).abs() <= RECAL_OFFSET_LIMIT && (diff as i32).abs() <= RECAL_DIFF_LIMIT
        };
        ok(self.recalibrated.x, self.diff.x) && ok(self.recalibrated.y, self.diff.y)
    }
}

/// Seed table for [`correct_from_profile`].
///
/// The addresses are module specific and supplied by the integrator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CorrectionProfile {
    /// Pre-calibrated offset words, one table per supported profile.
    pub sources: [[u16; 4]; 2],
    /// Runtime offset registers receiving the swapped words.
    pub targets: [u16; 4],
}

/// Gyro calibration error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalError<E> {
    /// Controller access failed.
    Ois(Error<E>),
    /// The controller reported a failed recalibration.
    Hardware { status: u8, result: RecalResult },
    /// The recalibrated offsets are outside the accepted bounds.
    OutOfTolerance(RecalResult),
    /// Unknown correction profile.
    InvalidProfile { index: u32 },
}

impl<E> From<Error<E>> for CalError<E> {
    fn from(e: Error<E>) -> Self {
        CalError::Ois(e)
    }
}

impl<E: fmt::Debug> fmt::Display for CalError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalError::Ois(e) => write!(f, "{}", e),
            CalError::Hardware { status, .. } => write!(f, "recalibration failed, status {:#04x}", status),
            CalError::OutOfTolerance(r) => write!(
                f,
                "recalibration out of tolerance: offset ({}, {}), diff ({}, {})",
                r.recalibrated.x, r.recalibrated.y, r.diff.x, r.diff.y
            ),
            CalError::InvalidProfile { index } => write!(f, "invalid correction profile {}", index),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for CalError<E> {}

fn swap_halves(word: u32) -> u32 {
    ((word & 0x00FF_00FF) << 8) | ((word >> 8) & 0x00FF_00FF)
}

impl<B: RegisterBus, D: DelayNs> Ois<B, D> {
    /// Run the controller's gyro recalibration and judge the result.
    ///
    /// Rejected results are still returned inside the error.
    pub fn recalibrate(&mut self) -> Result<RecalResult, CalError<B::Error>> {
        let live_x = self.regs.ram_read32(reg::GYRO_OFFSET_X)?;
        let live_y = self.regs.ram_read32(reg::GYRO_OFFSET_Y)?;
        let factory = self.regs.ram_read32(reg::GYRO_FACTORY_OFFSET)?;

        self.regs.ram_write32(reg::GYRO_RECAL, 0)?;
        self.wait_idle(RECAL_POLL).map_err(|e| match e {
            Error::Bus(e) => Error::Bus(e),
            _ => Error::Timeout(Stage::Recalibration),
        })?;
        let status = (self.regs.ram_read32(reg::GYRO_RECAL)? >> 24) as u8;

        let factory_x = match factory as u16 {
            FACTORY_UNSET => live_x as u16,
            x => x,
        } as i16;
        let factory_y = match (factory >> 16) as u16 {
            FACTORY_UNSET => (live_y >> 16) as u16,
            y => y,
        } as i16;

        let recal_x = (self.regs.ram_read32(reg::ANGLE_OFFSET_X)? >> 16) as i16;
        let recal_y = (self.regs.ram_read32(reg::ANGLE_OFFSET_Y)? >> 16) as i16;

        let result = RecalResult {
            factory: AxisPair { x: factory_x, y: factory_y },
            recalibrated: AxisPair { x: recal_x, y: recal_y },
            diff: AxisPair {
                x: factory_x.wrapping_sub(recal_x),
                y: factory_y.wrapping_sub(recal_y),
            },
        };
        debug!(
            "gyro recal: factory ({}, {}) recal ({}, {}) status {}",
            factory_x, factory_y, recal_x, recal_y, status
        );

        if status != 0 {
            warn!("gyro recalibration reported status 0x{:02x}", status);
            return Err(CalError::Hardware { status, result });
        }
        if !result.within_tolerance() {
            warn!(
                "gyro recal rejected: offset ({}, {}) diff ({}, {})",
                recal_x, recal_y, result.diff.x, result.diff.y
            );
            return Err(CalError::OutOfTolerance(result));
        }
        Ok(result)
    }

    /// Store the recalibrated X/Y angle offsets in info area 0.
    pub fn persist_offsets(&mut self, result: &RecalResult) -> Result<u16, Error<B::Error>> {
        let mut offsets = self.read_gyro_offsets()?;
        offsets.angle[0] = (result.recalibrated.x as i32) << 16;
        offsets.angle[1] = (result.recalibrated.y as i32) << 16;
        self.write_gyro_offsets(&offsets)
    }

    /// Seed the runtime offset registers from a stored profile.
    pub fn correct_from_profile(&mut self, map: &CorrectionProfile, index: u32) -> Result<(), CalError<B::Error>> {
        let sources = map
            .sources
            .get(index as usize)
            .ok_or(CalError::InvalidProfile { index })?;
        for (&src, &dst) in sources.iter().zip(map.targets.iter()) {
            let word = self.regs.ram_read32(src)?;
            self.regs.ram_write32(dst, swap_halves(word))?;
        }
        Ok(())
    }
}

/// Recalibrate the gyro offsets of the controller paired with the camera on
/// `bus`.
pub fn recalibrate<B, D>(bus: &mut B, delay: D, target: OisTarget) -> Result<RecalResult, CalError<B::Error>>
where
    B: RegisterBus + ?Sized,
    D: DelayNs,
{
    Ois::new(Retarget::new(bus, target.address()), delay).recalibrate()
}

/// Persist a recalibration result on the controller paired with the camera
/// on `bus`.
pub fn persist_offsets<B, D>(
    bus: &mut B,
    delay: D,
    target: OisTarget,
    result: &RecalResult,
) -> Result<u16, Error<B::Error>>
where
    B: RegisterBus + ?Sized,
    D: DelayNs,
{
    Ois::new(Retarget::new(bus, target.address()), delay).persist_offsets(result)
}

/// Seed the runtime gyro offsets from correction profile `index`.
pub fn correct_from_profile<B, D>(
    bus: &mut B,
    delay: D,
    target: OisTarget,
    map: &CorrectionProfile,
    index: u32,
) -> Result<(), CalError<B::Error>>
where
    B: RegisterBus + ?Sized,
    D: DelayNs,
{
    Ois::new(Retarget::new(bus, target.address()), delay).correct_from_profile(map, index)
}
