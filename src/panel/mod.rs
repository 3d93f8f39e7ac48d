//! Display panel refresh-rate switching.
//!
//! A [`PanelSwitch`] owns the panel behind a DSI command transport and moves
//! it between display modes on a dedicated worker task, optionally watching
//! the tearing-effect (TE) pulses that follow a switch. Chip specific
//! behavior (gamma tables, TE2 edges, brightness control) lives behind the
//! [`SwitchOps`] trait.

use core::fmt;
use core::str::FromStr;

use embedded_hal_async::delay::DelayNs;

mod gamma;
mod ops;
mod s6e3hc2;
mod switch;

pub use gamma::{CalibrationError, GammaData, GammaFixup, GammaFixupInfo, GammaTable, GAMMA_TABLES};
pub use ops::{DefaultSwitch, PanelOps, SwitchOps, PANEL_SWITCH_COMPATIBLE, S6E3HC2_COMPATIBLE};
pub use s6e3hc2::{S6e3hc2, Wrctrld};
pub use switch::{IdleMode, PanelSwitch, SwitchConfig};

/// Most display modes a panel can expose.
pub const MAX_MODES: usize = 4;
/// Longest vendor id kept for gamma fixup matching.
pub const VENDOR_ID_LEN: usize = 16;

// ==============================
// Modes

/// Active area and refresh rate of a display mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DisplayTiming {
    pub width: u16,
    pub height: u16,
    /// Refresh rate in Hz.
    pub refresh_rate: u32,
}

impl DisplayTiming {
    pub const fn new(width: u16, height: u16, refresh_rate: u32) -> Self {
        Self {
            width,
            height,
            refresh_rate,
        }
    }
}

impl fmt::Display for DisplayTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.refresh_rate)
    }
}

impl FromStr for DisplayTiming {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<ModeDescriptor>()? {
            ModeDescriptor {
                size: Some((width, height)),
                refresh_rate: Some(refresh_rate),
            } => Ok(Self::new(width, height, refresh_rate)),
            _ => Err(ParseModeError),
        }
    }
}

/// A mode descriptor could not be parsed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParseModeError;

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected <width>x<height>, @<rate> or <width>x<height>@<rate>")
    }
}

impl core::error::Error for ParseModeError {}

/// Partial mode description used to look modes up by text.
///
/// Any of `WxH`, `@R` and `WxH@R` is accepted; missing parts match anything.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModeDescriptor {
    pub size: Option<(u16, u16)>,
    pub refresh_rate: Option<u32>,
}

impl ModeDescriptor {
    pub fn matches(&self, timing: &DisplayTiming) -> bool {
        self.size.is_none_or(|size| size == (timing.width, timing.height))
            && self.refresh_rate.is_none_or(|rate| rate == timing.refresh_rate)
    }
}

impl FromStr for ModeDescriptor {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (size, rate) = match s.split_once('@') {
            Some((size, rate)) => (size, Some(rate)),
            None => (s, None),
        };

        let size = match size {
            "" => None,
            size => {
                let (w, h) = size.split_once('x').ok_or(ParseModeError)?;
                Some((w.parse().map_err(|_| ParseModeError)?, h.parse().map_err(|_| ParseModeError)?))
            }
        };
        let refresh_rate = rate
            .map(|r| r.parse().map_err(|_| ParseModeError))
            .transpose()?;

        if size.is_none() && refresh_rate.is_none() {
            return Err(ParseModeError);
        }
        Ok(Self { size, refresh_rate })
    }
}

/// A display mode exposed by the panel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DisplayMode {
    pub timing: DisplayTiming,
    /// The panel switches into this mode without a full modeset.
    pub seamless: bool,
}

impl DisplayMode {
    pub const fn new(timing: DisplayTiming, seamless: bool) -> Self {
        Self { timing, seamless }
    }

    pub const fn refresh_rate(&self) -> u32 {
        self.timing.refresh_rate
    }
}

// ==============================
// Transport

/// Command sets stored per mode in the panel description.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdSet {
    /// Sequence that moves the panel into the mode's timing.
    TimingSwitch,
    /// Leave low-power mode.
    Nolp,
    /// Run after the low-power exit has been applied.
    PostNolp,
}

/// DSI command transport to the panel.
#[allow(async_fn_in_trait)]
pub trait DsiBus {
    type Error: fmt::Debug;

    /// Send one DCS/generic write. `last` ends the current transfer batch.
    async fn write(&mut self, payload: &[u8], last: bool) -> Result<(), Self::Error>;

    /// Read the response to `cmd` into `buf`, returning the bytes received.
    async fn read(&mut self, cmd: u8, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Send one of the command sets described for `mode`.
    async fn send_cmd_set(&mut self, mode: &DisplayMode, set: CmdSet) -> Result<(), Self::Error>;
}

impl<T: DsiBus + ?Sized> DsiBus for &mut T {
    type Error = T::Error;

    async fn write(&mut self, payload: &[u8], last: bool) -> Result<(), Self::Error> {
        T::write(self, payload, last).await
    }

    async fn read(&mut self, cmd: u8, buf: &mut [u8]) -> Result<usize, Self::Error> {
        T::read(self, cmd, buf).await
    }

    async fn send_cmd_set(&mut self, mode: &DisplayMode, set: CmdSet) -> Result<(), Self::Error> {
        T::send_cmd_set(self, mode, set).await
    }
}

// ==============================
// Panel state

/// Brightness state the DDIC is programmed from.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Backlight {
    /// Display brightness value currently programmed.
    pub brightness: u32,
    pub dimming: bool,
    pub hbm_enabled: bool,
    /// Active high brightness range, 0 when none applies.
    pub hbm_range: u32,
    pub hbm_dimming: bool,
}

/// One TE2 edge pair, in scan lines.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Te2Edge {
    pub rising: u32,
    pub falling: u32,
}

/// Which edge pair is in use.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Te2Rate {
    Hz60 = 0,
    #[default]
    Hz90 = 1,
}

impl Te2Rate {
    pub const fn for_refresh_rate(refresh_rate: u32) -> Self {
        match refresh_rate {
            60 => Te2Rate::Hz60,
            _ => Te2Rate::Hz90,
        }
    }
}

/// TE2 edge configuration.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Te2Config {
    /// The panel supports TE2 edge programming.
    pub ready: bool,
    pub edges: [Te2Edge; 2],
    pub current: Te2Rate,
}

impl Te2Config {
    pub fn current_edge(&self) -> Te2Edge {
        self.edges[self.current as usize]
    }

    /// Parse the `"r f r f"` text table (60 Hz pair, then 90 Hz pair).
    pub fn parse_edges(text: &str) -> Option<[Te2Edge; 2]> {
        let mut values = [0u32; 4];
        let mut words = text.split_whitespace();
        for v in values.iter_mut() {
            *v = words.next()?.parse().ok()?;
        }
        if words.next().is_some() {
            return None;
        }
        Some([
            Te2Edge {
                rising: values[0],
                falling: values[1],
            },
            Te2Edge {
                rising: values[2],
                falling: values[3],
            },
        ])
    }
}

impl fmt::Display for Te2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b] = self.edges;
        write!(f, "{} {} {} {}", a.rising, a.falling, b.rising, b.falling)
    }
}

/// Panel error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    Bus(E),
    /// Mode index out of range, or no mode matches the request.
    UnknownMode,
    TooManyModes,
    /// Empty command payload.
    InvalidLength,
    /// Mode descriptor text could not be parsed.
    InvalidDescriptor,
    /// The panel does not implement the operation.
    Unsupported,
    /// The panel is not powered or not initialized yet.
    NotReady,
    /// No gamma source exists for this refresh rate.
    UnsupportedRate { rate: u32 },
    /// No mode with this refresh rate holds gamma data.
    MissingGamma { rate: u32 },
    /// No packet plan covers this brightness.
    NoPacketPlan { brightness: u32 },
    InvalidTe2Table,
    InvalidCalibration(CalibrationError),
}

impl<E> From<CalibrationError> for Error<E> {
    fn from(e: CalibrationError) -> Self {
        Error::InvalidCalibration(e)
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(e) => write!(f, "dsi error: {:?}", e),
            Error::UnknownMode => f.write_str("unknown display mode"),
            Error::TooManyModes => write!(f, "more than {} display modes", MAX_MODES),
            Error::InvalidLength => f.write_str("empty command"),
            Error::InvalidDescriptor => f.write_str("invalid mode descriptor"),
            Error::Unsupported => f.write_str("not supported by this panel"),
            Error::NotReady => f.write_str("panel not ready"),
            Error::UnsupportedRate { rate } => write!(f, "no gamma source for {} Hz", rate),
            Error::MissingGamma { rate } => write!(f, "no gamma data for {} Hz", rate),
            Error::NoPacketPlan { brightness } => write!(f, "no gamma packet plan for brightness {}", brightness),
            Error::InvalidTe2Table => f.write_str("invalid TE2 table"),
            Error::InvalidCalibration(e) => write!(f, "invalid gamma calibration: {}", e),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for Error<E> {}

/// The panel hardware: DSI transport, delay and the programmable state.
pub struct Panel<B, D> {
    bus: B,
    delay: D,
    modes: heapless::Vec<DisplayMode, MAX_MODES>,
    pub backlight: Backlight,
    pub te2: Te2Config,
    /// Panel identity read by the integrator, matched against gamma fixups.
    pub vendor_id: heapless::Vec<u8, VENDOR_ID_LEN>,
    pub power_on: bool,
}

impl<B: DsiBus, D: DelayNs> Panel<B, D> {
    pub fn new(bus: B, delay: D, modes: &[DisplayMode]) -> Result<Self, Error<B::Error>> {
        let modes = heapless::Vec::from_slice(modes).map_err(|_| Error::TooManyModes)?;
        Ok(Self {
            bus,
            delay,
            modes,
            backlight: Backlight::default(),
            te2: Te2Config::default(),
            vendor_id: heapless::Vec::new(),
            power_on: false,
        })
    }

    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    pub fn mode(&self, index: usize) -> Result<&DisplayMode, Error<B::Error>> {
        self.modes.get(index).ok_or(Error::UnknownMode)
    }

    /// First mode matching `desc`.
    pub fn find_mode(&self, desc: &ModeDescriptor) -> Option<usize> {
        self.modes.iter().position(|m| desc.matches(&m.timing))
    }

    pub(crate) fn delay(&mut self) -> &mut D {
        &mut self.delay
    }

    /// Send a command payload; `last` ends the transfer batch.
    pub async fn write(&mut self, payload: &[u8], last: bool) -> Result<(), Error<B::Error>> {
        if payload.is_empty() {
            return Err(Error::InvalidLength);
        }
        self.bus.write(payload, last).await.map_err(|e| {
            warn!("dsi write 0x{:02x} failed", payload[0]);
            Error::Bus(e)
        })
    }

    /// Send a single command ending its batch.
    pub async fn cmd(&mut self, payload: &[u8]) -> Result<(), Error<B::Error>> {
        self.write(payload, true).await
    }

    pub async fn read(&mut self, cmd: u8, buf: &mut [u8]) -> Result<usize, Error<B::Error>> {
        self.bus.read(cmd, buf).await.map_err(|e| {
            warn!("dsi read 0x{:02x} failed", cmd);
            Error::Bus(e)
        })
    }

    pub async fn send_cmd_set(&mut self, index: usize, set: CmdSet) -> Result<(), Error<B::Error>> {
        let mode = *self.mode(index)?;
        self.bus.send_cmd_set(&mode, set).await.map_err(Error::Bus)
    }

    /// Give back the transport and delay.
    pub fn release(self) -> (B, D) {
        (self.bus, self.delay)
    }
}
