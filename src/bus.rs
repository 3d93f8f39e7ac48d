//! Register transport shared by the OIS controller and the camera gyro.
//!
//! Devices on the camera control interface are addressed with a 7-bit bus
//! target and a register address that is either one or two bytes wide.
//! Register values are one, two or four bytes, sent most significant byte
//! first.

use core::ops::{Deref, DerefMut};

use embedded_hal_1::i2c::{I2c, Operation};

/// Width of a register address on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddrWidth {
    Byte,
    Word,
}

impl AddrWidth {
    fn encode(self, addr: u32, out: &mut [u8; 2]) -> usize {
        match self {
            AddrWidth::Byte => {
                out[0] = addr as u8;
                1
            }
            AddrWidth::Word => {
                *out = (addr as u16).to_be_bytes();
                2
            }
        }
    }
}

/// Width of a register value on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataWidth {
    Byte,
    Word,
    Dword,
}

impl DataWidth {
    pub const fn len(self) -> usize {
        match self {
            DataWidth::Byte => 1,
            DataWidth::Word => 2,
            DataWidth::Dword => 4,
        }
    }
}

/// Register-level access to a device on the camera control bus.
///
/// Errors are bus-level only (NACK, arbitration loss, timeout). Protocol
/// level failures are reported by the drivers built on top of this trait.
pub trait RegisterBus {
    type Error: core::fmt::Debug;

    /// Read one register.
    fn read(&mut self, addr: u32, aw: AddrWidth, dw: DataWidth) -> Result<u32, Self::Error>;

    /// Write one register.
    fn write(&mut self, addr: u32, value: u32, aw: AddrWidth, dw: DataWidth) -> Result<(), Self::Error>;

    /// Read `buf.len()` consecutive bytes starting at `addr`.
    fn read_burst(&mut self, addr: u32, aw: AddrWidth, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Write `data` in one transfer, tagged with the register address `addr`.
    fn write_burst(&mut self, addr: u32, aw: AddrWidth, data: &[u8]) -> Result<(), Self::Error>;

    /// Current 7-bit bus target.
    fn target(&self) -> u8;

    /// Point subsequent transfers at another 7-bit bus target.
    fn set_target(&mut self, target: u8);
}

impl<T: RegisterBus + ?Sized> RegisterBus for &mut T {
    type Error = T::Error;

    fn read(&mut self, addr: u32, aw: AddrWidth, dw: DataWidth) -> Result<u32, Self::Error> {
        T::read(self, addr, aw, dw)
    }

    fn write(&mut self, addr: u32, value: u32, aw: AddrWidth, dw: DataWidth) -> Result<(), Self::Error> {
        T::write(self, addr, value, aw, dw)
    }

    fn read_burst(&mut self, addr: u32, aw: AddrWidth, buf: &mut [u8]) -> Result<(), Self::Error> {
        T::read_burst(self, addr, aw, buf)
    }

    fn write_burst(&mut self, addr: u32, aw: AddrWidth, data: &[u8]) -> Result<(), Self::Error> {
        T::write_burst(self, addr, aw, data)
    }

    fn target(&self) -> u8 {
        T::target(self)
    }

    fn set_target(&mut self, target: u8) {
        T::set_target(self, target)
    }
}

// ============================================================================
// I2C transport
// ============================================================================

/// [`RegisterBus`] over a blocking `embedded-hal` I2C bus.
pub struct I2cBus<I2C> {
    i2c: I2C,
    target: u8,
}

impl<I2C: I2c> I2cBus<I2C> {
    /// Create a transport talking to `target` (7-bit address).
    pub fn new(i2c: I2C, target: u8) -> Self {
        Self { i2c, target }
    }

    /// Release the underlying I2C bus.
    pub fn release(self) -> I2C {
        self.i2c
    }
}

impl<I2C: I2c> RegisterBus for I2cBus<I2C> {
    type Error = I2C::Error;

    fn read(&mut self, addr: u32, aw: AddrWidth, dw: DataWidth) -> Result<u32, Self::Error> {
        let mut a = [0u8; 2];
        let alen = aw.encode(addr, &mut a);
        let mut d = [0u8; 4];
        let dlen = dw.len();
        self.i2c.write_read(self.target, &a[..alen], &mut d[..dlen])?;
        Ok(d[..dlen].iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
    }

    fn write(&mut self, addr: u32, value: u32, aw: AddrWidth, dw: DataWidth) -> Result<(), Self::Error> {
        let mut buf = [0u8; 6];
        let mut a = [0u8; 2];
        let alen = aw.encode(addr, &mut a);
        buf[..alen].copy_from_slice(&a[..alen]);
        let dlen = dw.len();
        let bytes = value.to_be_bytes();
        buf[alen..alen + dlen].copy_from_slice(&bytes[4 - dlen..]);
        self.i2c.write(self.target, &buf[..alen + dlen])
    }

    fn read_burst(&mut self, addr: u32, aw: AddrWidth, buf: &mut [u8]) -> Result<(), Self::Error> {
        let mut a = [0u8; 2];
        let alen = aw.encode(addr, &mut a);
        self.i2c.write_read(self.target, &a[..alen], buf)
    }

    fn write_burst(&mut self, addr: u32, aw: AddrWidth, data: &[u8]) -> Result<(), Self::Error> {
        let mut a = [0u8; 2];
        let alen = aw.encode(addr, &mut a);
        // Adjacent writes in one transaction go out without a repeated start.
        self.i2c
            .transaction(self.target, &mut [Operation::Write(&a[..alen]), Operation::Write(data)])
    }

    fn target(&self) -> u8 {
        self.target
    }

    fn set_target(&mut self, target: u8) {
        self.target = target;
    }
}

// ============================================================================
// Scoped target redirection
// ============================================================================

/// Temporarily points a shared transport at another device.
///
/// The previous target is restored when the guard is dropped, on every exit
/// path.
pub struct Retarget<'a, B: RegisterBus + ?Sized> {
    bus: &'a mut B,
    saved: u8,
}

impl<'a, B: RegisterBus + ?Sized> Retarget<'a, B> {
    pub fn new(bus: &'a mut B, target: u8) -> Self {
        let saved = bus.target();
        bus.set_target(target);
        trace!("bus target {:#x} -> {:#x}", saved, target);
        Self { bus, saved }
    }

    /// Target that will be restored on drop.
    pub fn saved_target(&self) -> u8 {
        self.saved
    }
}

impl<B: RegisterBus + ?Sized> Drop for Retarget<'_, B> {
    fn drop(&mut self) {
        self.bus.set_target(self.saved);
    }
}

impl<B: RegisterBus + ?Sized> Deref for Retarget<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.bus
    }
}

impl<B: RegisterBus + ?Sized> DerefMut for Retarget<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.bus
    }
}

impl<B: RegisterBus + ?Sized> RegisterBus for Retarget<'_, B> {
    type Error = B::Error;

    fn read(&mut self, addr: u32, aw: AddrWidth, dw: DataWidth) -> Result<u32, Self::Error> {
        self.bus.read(addr, aw, dw)
    }

    fn write(&mut self, addr: u32, value: u32, aw: AddrWidth, dw: DataWidth) -> Result<(), Self::Error> {
        self.bus.write(addr, value, aw, dw)
    }

    fn read_burst(&mut self, addr: u32, aw: AddrWidth, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.read_burst(addr, aw, buf)
    }

    fn write_burst(&mut self, addr: u32, aw: AddrWidth, data: &[u8]) -> Result<(), Self::Error> {
        self.bus.write_burst(addr, aw, data)
    }

    fn target(&self) -> u8 {
        self.bus.target()
    }

    fn set_target(&mut self, target: u8) {
        self.bus.set_target(target)
    }
}
