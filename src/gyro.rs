//! Camera module gyro (ICM-20690) power sequencing.
//!
//! The gyro feeds the OIS controller over its auxiliary SPI port; the host
//! only wakes it up, checks its identity and programs the OIS output path.

use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::bus::{AddrWidth, DataWidth, RegisterBus};

const PWR_MGMT_1: u8 = 0x6B;
const PWR_MGMT_2: u8 = 0x6C;
const WHO_AM_I: u8 = 0x75;
const ACCEL_CONFIG: u8 = 0x1C;
const ACCEL_CONFIG2: u8 = 0x1D;
const OIS_GYRO_CONFIG: u8 = 0x68;
const OIS_ACCEL_CONFIG: u8 = 0x69;
const AUX_CONFIG: u8 = 0x70;

const DEVICE_ID: u8 = 0x20;

/// OIS output configuration applied after the identity check.
const OIS_SETUP: [(u8, u8); 7] = [
    // +-8 g
    (ACCEL_CONFIG, 0x12),
    // 5.05 Hz accel DLPF
    (ACCEL_CONFIG2, 0x06),
    // +-500 dps, 250 Hz DLPF, 8 kHz ODR
    (OIS_GYRO_CONFIG, 0x28),
    // 1 kHz accel ODR
    (OIS_ACCEL_CONFIG, 0x10),
    (PWR_MGMT_2, 0x00),
    // aux bus is the OIS SPI
    (AUX_CONFIG, 0x02),
    (PWR_MGMT_2, 0x00),
];

/// Gyro configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct Config {
    /// 7-bit bus address.
    pub address: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self { address: 0xD0 >> 1 }
    }
}

/// Gyro error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    Bus(E),
    /// WHO_AM_I did not match.
    WrongDevice { who_am_i: u8 },
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(e) => write!(f, "bus error: {:?}", e),
            Error::WrongDevice { who_am_i } => write!(f, "unexpected gyro id {:#04x}", who_am_i),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for Error<E> {}

struct State<B> {
    bus: B,
    active: bool,
}

impl<B: RegisterBus> State<B> {
    fn write(&mut self, reg: u8, value: u8) -> Result<(), Error<B::Error>> {
        self.bus
            .write(reg as u32, value as u32, AddrWidth::Byte, DataWidth::Byte)
            .map_err(|e| {
                error!("gyro write 0x{:02x} failed", reg);
                Error::Bus(e)
            })
    }

    fn read(&mut self, reg: u8) -> Result<u8, Error<B::Error>> {
        self.bus
            .read(reg as u32, AddrWidth::Byte, DataWidth::Byte)
            .map(|v| v as u8)
            .map_err(|e| {
                error!("gyro read 0x{:02x} failed", reg);
                Error::Bus(e)
            })
    }
}

/// Camera gyro handle. Every operation is serialized by an internal mutex.
pub struct CamGyro<M: RawMutex, B> {
    state: Mutex<M, RefCell<State<B>>>,
}

impl<M: RawMutex, B: RegisterBus> CamGyro<M, B> {
    /// Take ownership of a transport and point it at the gyro.
    pub fn new(mut bus: B, config: Config) -> Self {
        bus.set_target(config.address);
        Self {
            state: Mutex::new(RefCell::new(State { bus, active: false })),
        }
    }

    /// Wake the gyro, check its identity and route its output to the OIS.
    pub fn enable(&self) -> Result<(), Error<B::Error>> {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            // wake up, auto clock source
            s.write(PWR_MGMT_1, 0x01)?;

            let who_am_i = s.read(WHO_AM_I)?;
            if who_am_i != DEVICE_ID {
                error!("gyro id 0x{:02x}, expected 0x{:02x}", who_am_i, DEVICE_ID);
                return Err(Error::WrongDevice { who_am_i });
            }

            for (reg, value) in OIS_SETUP {
                s.write(reg, value)?;
            }
            s.active = true;
            debug!("gyro enabled");
            Ok(())
        })
    }

    /// Put the gyro and accelerometer axes to sleep.
    pub fn disable(&self) -> Result<(), Error<B::Error>> {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.write(PWR_MGMT_2, 0x3F).inspect_err(|_| error!("failed to disable gyro"))?;
            s.active = false;
            debug!("gyro disabled");
            Ok(())
        })
    }

    pub fn is_active(&self) -> bool {
        self.state.lock(|s| s.borrow().active)
    }

    /// Give back the transport.
    pub fn release(self) -> B {
        self.state.into_inner().into_inner().bus
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    use super::*;

    struct MockGyro {
        target: u8,
        who_am_i: u8,
        writes: Vec<(u8, u8)>,
    }

    impl MockGyro {
        fn new(who_am_i: u8) -> Self {
            Self { target: 0, who_am_i, writes: Vec::new() }
        }
    }

    impl RegisterBus for MockGyro {
        type Error = ();

        fn read(&mut self, addr: u32, aw: AddrWidth, dw: DataWidth) -> Result<u32, ()> {
            assert_eq!((aw, dw), (AddrWidth::Byte, DataWidth::Byte));
            Ok(if addr == WHO_AM_I as u32 { self.who_am_i as u32 } else { 0 })
        }

        fn write(&mut self, addr: u32, value: u32, _aw: AddrWidth, _dw: DataWidth) -> Result<(), ()> {
            self.writes.push((addr as u8, value as u8));
            Ok(())
        }

        fn read_burst(&mut self, _addr: u32, _aw: AddrWidth, _buf: &mut [u8]) -> Result<(), ()> {
            unreachable!()
        }

        fn write_burst(&mut self, _addr: u32, _aw: AddrWidth, _data: &[u8]) -> Result<(), ()> {
            unreachable!()
        }

        fn target(&self) -> u8 {
            self.target
        }

        fn set_target(&mut self, target: u8) {
            self.target = target;
        }
    }

    #[test]
    fn enable_programs_ois_path() {
        let gyro = CamGyro::<CriticalSectionRawMutex, _>::new(MockGyro::new(0x20), Config::default());
        gyro.enable().unwrap();
        assert!(gyro.is_active());

        let bus = gyro.release();
        assert_eq!(bus.target, 0x68);
        assert_eq!(
            bus.writes,
            [(0x6B, 0x01), (0x1C, 0x12), (0x1D, 0x06), (0x68, 0x28), (0x69, 0x10), (0x6C, 0x00), (0x70, 0x02), (0x6C, 0x00)]
        );
    }

    #[test]
    fn wrong_device_stops_after_wakeup() {
        let gyro = CamGyro::<CriticalSectionRawMutex, _>::new(MockGyro::new(0x98), Config::default());
        assert_eq!(gyro.enable(), Err(Error::WrongDevice { who_am_i: 0x98 }));
        assert!(!gyro.is_active());
        assert_eq!(gyro.release().writes, [(0x6B, 0x01)]);
    }

    #[test]
    fn disable_sleeps_all_axes() {
        let gyro = CamGyro::<CriticalSectionRawMutex, _>::new(MockGyro::new(0x20), Config::default());
        gyro.enable().unwrap();
        gyro.disable().unwrap();
        assert!(!gyro.is_active());
        assert_eq!(gyro.release().writes.last(), Some(&(0x6C, 0x3F)));
    }
}
