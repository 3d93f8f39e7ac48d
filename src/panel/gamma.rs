//! Gamma tables of the S6E3HC2 DDIC.
//!
//! Each mode keeps two copies of its tables: the live copy sent to the panel
//! and the native copy captured from hardware, which the live copy returns to
//! when a calibration is withdrawn.

use core::fmt;

use embedded_hal_async::delay::DelayNs;

use super::{DsiBus, Error, Panel};

/// One gamma command table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GammaTable {
    pub cmd: u8,
    /// Parameter bytes following the command.
    pub len: usize,
    /// Leading parameter bytes that only exist in OTP.
    pub prefix_len: usize,
    /// Offset of the first non-prefix byte in the DDIC flash.
    pub flash_offset: u16,
}

pub const GAMMA_TABLES: [GammaTable; 3] = [
    GammaTable {
        cmd: 0xC8,
        len: 135,
        prefix_len: 0,
        flash_offset: 0x0000,
    },
    GammaTable {
        cmd: 0xC9,
        len: 180,
        prefix_len: 0,
        flash_offset: 0x0087,
    },
    GammaTable {
        cmd: 0xB3,
        len: 47,
        prefix_len: 2,
        flash_offset: 0x013B,
    },
];

const NUM_TABLES: usize = GAMMA_TABLES.len();
/// Tables a calibration payload carries per refresh rate.
const NUM_CALIBRATED: usize = NUM_TABLES - 1;

const fn table_offsets() -> [usize; NUM_TABLES + 1] {
    let mut out = [0; NUM_TABLES + 1];
    let mut i = 0;
    while i < NUM_TABLES {
        out[i + 1] = out[i] + GAMMA_TABLES[i].len + 1;
        i += 1;
    }
    out
}

const OFFSETS: [usize; NUM_TABLES + 1] = table_offsets();
const BUF_LEN: usize = OFFSETS[NUM_TABLES];

/// Largest accepted calibration payload.
pub(crate) const CALIBRATION_MAX: usize = 1024;

// ==============================
// Buffers

/// Gamma tables of one mode, each stored as command byte plus parameters.
#[derive(Clone, Eq, PartialEq)]
pub struct GammaData {
    live: [u8; BUF_LEN],
    native: [u8; BUF_LEN],
}

impl GammaData {
    pub const fn new() -> Self {
        Self {
            live: [0; BUF_LEN],
            native: [0; BUF_LEN],
        }
    }

    /// Live command buffer of table `index`.
    pub fn table(&self, index: usize) -> &[u8] {
        &self.live[OFFSETS[index]..OFFSETS[index + 1]]
    }

    /// Buffer of table `index` as captured from the panel.
    pub fn native_table(&self, index: usize) -> &[u8] {
        &self.native[OFFSETS[index]..OFFSETS[index + 1]]
    }

    fn table_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.live[OFFSETS[index]..OFFSETS[index + 1]]
    }

    pub(crate) fn capture_native(&mut self) {
        self.native = self.live;
    }

    pub(crate) fn restore_native(&mut self) {
        self.live = self.native;
    }

    /// Copy OTP-only prefix bytes from `otp` into this flash sourced copy.
    pub(crate) fn copy_prefixes_from(&mut self, otp: &GammaData) {
        for (i, info) in GAMMA_TABLES.iter().enumerate() {
            if info.prefix_len == 0 {
                continue;
            }
            let range = 1..1 + info.prefix_len;
            self.table_mut(i)[range.clone()].copy_from_slice(&otp.table(i)[range]);
        }
    }

    fn overwrite_bands(&mut self, bands: &[u8], fixup: Option<&GammaFixupInfo>) {
        for (i, rec) in Records::new(bands).enumerate() {
            let Ok((tag, data)) = rec else {
                return;
            };
            let info = &GAMMA_TABLES[i];
            let dst = &mut self.table_mut(i)[1 + info.prefix_len..];
            dst.copy_from_slice(data);
            for f in fixup.iter().flat_map(|f| f.locations).filter(|f| f.cmd == tag) {
                f.apply(dst);
            }
        }
    }
}

impl Default for GammaData {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GammaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GammaData")
            .field("calibrated", &(self.live != self.native))
            .finish()
    }
}

// ==============================
// Packet plans

#[derive(Debug, Copy, Clone)]
struct Packet {
    table: usize,
    /// Send only this many parameter bytes.
    max_len: Option<usize>,
}

const fn full(table: usize) -> Packet {
    Packet { table, max_len: None }
}

/// Brightness band and the command groups used to send gamma inside it.
///
/// Each group goes out as one transfer batch.
#[derive(Debug)]
struct PacketPlan {
    brightness_below: u32,
    groups: &'static [&'static [Packet]],
}

const C8: usize = 0;
const C9: usize = 1;
const B3: usize = 2;

static PACKET_PLANS: [PacketPlan; 3] = [
    PacketPlan {
        brightness_below: 0x39,
        groups: &[&[full(C9)], &[full(C8), full(B3)]],
    },
    PacketPlan {
        brightness_below: 0xB6,
        groups: &[
            &[
                full(C8),
                Packet {
                    table: C9,
                    max_len: Some(45),
                },
            ],
            &[full(C9), full(B3)],
        ],
    },
    PacketPlan {
        brightness_below: u32::MAX,
        groups: &[&[full(C8), full(B3)], &[full(C9)]],
    },
];

fn select_packet_plan(brightness: u32) -> Option<&'static PacketPlan> {
    PACKET_PLANS.iter().find(|p| brightness < p.brightness_below)
}

/// Send `gamma` using the packet plan of the current brightness.
pub(crate) async fn write_gamma<B: DsiBus, D: DelayNs>(
    panel: &mut Panel<B, D>,
    gamma: &GammaData,
) -> Result<(), Error<B::Error>> {
    let brightness = panel.backlight.brightness;
    let Some(plan) = select_packet_plan(brightness) else {
        error!("no gamma packet plan for brightness {}", brightness);
        return Err(Error::NoPacketPlan { brightness });
    };

    for group in plan.groups {
        for (n, packet) in group.iter().enumerate() {
            let len = packet.max_len.unwrap_or(GAMMA_TABLES[packet.table].len);
            let buf = &gamma.table(packet.table)[..len + 1];
            panel.write(buf, n + 1 == group.len()).await?;
        }
    }
    Ok(())
}

// ==============================
// Acquisition

/// Read every table from OTP.
pub(crate) async fn read_otp<B: DsiBus, D: DelayNs>(
    panel: &mut Panel<B, D>,
    gamma: &mut GammaData,
) -> Result<(), Error<B::Error>> {
    for (i, info) in GAMMA_TABLES.iter().enumerate() {
        let buf = gamma.table_mut(i);
        buf[0] = info.cmd;
        let n = panel.read(info.cmd, &mut buf[1..]).await?;
        if n != info.len {
            warn!("gamma 0x{:02x}: read {} of {} bytes", info.cmd, n, info.len);
        }
    }
    Ok(())
}

const FLASH_MODE_EN: [u8; 3] = [0xF1, 0xF1, 0xA2];
const FLASH_MODE_DIS: [u8; 3] = [0xF1, 0xA5, 0xA5];
const PGM_EN: [u8; 2] = [0xC0, 0x02];
const PGM_DIS: [u8; 2] = [0xC0, 0x00];
const EXE_INST: [u8; 2] = [0xC0, 0x03];
const WRITE_EN: [u8; 13] = [0xC1, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05];
const QUAD_EN: [u8; 12] = [0xC1, 0x00, 0x00, 0x00, 0x01, 0x40, 0x02, 0x00, 0x00, 0x00, 0x00, 0x10];
const FLASH_READ: [u8; 14] = [
    0xC1, 0x00, 0x00, 0x00, 0x6B, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x05, 0x01,
];
const GPAR: [u8; 2] = [0xB0, 0x0B];
const FLASH_DATA: u8 = 0xFB;

/// Read every table from the DDIC flash, one byte per indirect read.
///
/// The flash is put back into program-disabled mode on every exit path.
pub(crate) async fn read_flash<B: DsiBus, D: DelayNs>(
    panel: &mut Panel<B, D>,
    gamma: &mut GammaData,
) -> Result<(), Error<B::Error>> {
    let res = read_flash_tables(panel, gamma).await;
    let pgm = panel.cmd(&PGM_DIS).await;
    let mode = panel.cmd(&FLASH_MODE_DIS).await;
    res?;
    pgm?;
    mode
}

async fn read_flash_tables<B: DsiBus, D: DelayNs>(
    panel: &mut Panel<B, D>,
    gamma: &mut GammaData,
) -> Result<(), Error<B::Error>> {
    for cmd in [&FLASH_MODE_EN[..], &PGM_EN, &WRITE_EN, &EXE_INST] {
        panel.cmd(cmd).await?;
    }
    panel.delay().delay_us(950).await;
    panel.cmd(&QUAD_EN).await?;
    panel.cmd(&EXE_INST).await?;
    panel.delay().delay_ms(30).await;

    for (i, info) in GAMMA_TABLES.iter().enumerate() {
        let buf = gamma.table_mut(i);
        buf[0] = info.cmd;
        for (j, offset) in (info.prefix_len..info.len).zip(info.flash_offset..) {
            let mut rd = FLASH_READ;
            rd[9..11].copy_from_slice(&offset.to_be_bytes());
            panel.cmd(&rd).await?;
            panel.cmd(&EXE_INST).await?;
            panel.delay().delay_us(200).await;
            panel.cmd(&GPAR).await?;

            let mut data = [0u8; 2];
            let n = panel.read(FLASH_DATA, &mut data).await?;
            if n != data.len() {
                warn!("gamma flash 0x{:04x}: short read", offset);
            }
            buf[1 + j] = data[1];
        }
    }
    Ok(())
}

// ==============================
// Calibration payloads

/// Calibration payload rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationError {
    /// Not hex bytes separated by whitespace, or too long.
    Syntax,
    Empty,
    /// A record length is zero or runs past the payload.
    Framing,
    RecordCount { found: usize, expected: usize },
    TagMismatch { index: usize, expected: u8, found: u8 },
    Length { tag: u8, len: usize },
    /// No mode with gamma data has this refresh rate.
    UnknownRate { rate: u8 },
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationError::Syntax => f.write_str("not a hex byte list"),
            CalibrationError::Empty => f.write_str("empty payload"),
            CalibrationError::Framing => f.write_str("bad record length"),
            CalibrationError::RecordCount { found, expected } => {
                write!(f, "{} records, expected {}", found, expected)
            }
            CalibrationError::TagMismatch { index, expected, found } => {
                write!(f, "record {} is {:#04x}, expected {:#04x}", index, found, expected)
            }
            CalibrationError::Length { tag, len } => write!(f, "record {:#04x} has {} bytes", tag, len),
            CalibrationError::UnknownRate { rate } => write!(f, "no gamma for {} Hz", rate),
        }
    }
}

impl core::error::Error for CalibrationError {}

const RECORD_HEADER: usize = 3;

/// `tag, len (BE u16), data[len]` records.
#[derive(Clone)]
struct Records<'a> {
    rest: &'a [u8],
}

impl<'a> Records<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { rest: payload }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(u8, &'a [u8]), CalibrationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let rest = core::mem::take(&mut self.rest);
        if rest.len() <= RECORD_HEADER {
            return Some(Err(CalibrationError::Framing));
        }
        let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        if len == 0 || RECORD_HEADER + len > rest.len() {
            return Some(Err(CalibrationError::Framing));
        }
        self.rest = &rest[RECORD_HEADER + len..];
        Some(Ok((rest[0], &rest[RECORD_HEADER..RECORD_HEADER + len])))
    }
}

/// Check the per-table records of one refresh rate.
fn validate_bands(bands: &[u8]) -> Result<(), CalibrationError> {
    let mut count = 0;
    for rec in Records::new(bands) {
        let (tag, data) = rec?;
        if count < NUM_CALIBRATED {
            let info = &GAMMA_TABLES[count];
            if tag != info.cmd {
                return Err(CalibrationError::TagMismatch {
                    index: count,
                    expected: info.cmd,
                    found: tag,
                });
            }
            if data.len() != info.len - info.prefix_len {
                return Err(CalibrationError::Length { tag, len: data.len() });
            }
        }
        count += 1;
    }
    if count != NUM_CALIBRATED {
        return Err(CalibrationError::RecordCount {
            found: count,
            expected: NUM_CALIBRATED,
        });
    }
    Ok(())
}

/// Overwrite the live tables of the modes named in `payload`.
///
/// `payload` holds one outer record per refresh rate whose data is the
/// per-table records. Everything is validated before the first byte is
/// copied. Returns the number of refresh rates applied.
pub(crate) fn apply_calibration(
    payload: &[u8],
    mut gamma_for_rate: impl FnMut(u8) -> Option<usize>,
    gamma: &mut [Option<GammaData>],
    fixup: Option<&GammaFixupInfo>,
) -> Result<usize, CalibrationError> {
    let mut count = 0;
    for rec in Records::new(payload) {
        let (rate, bands) = rec?;
        gamma_for_rate(rate).ok_or(CalibrationError::UnknownRate { rate })?;
        validate_bands(bands)?;
        count += 1;
    }
    if count == 0 {
        return Err(CalibrationError::Empty);
    }

    for (rate, bands) in Records::new(payload).flatten() {
        if let Some(data) = gamma_for_rate(rate).and_then(|i| gamma.get_mut(i)?.as_mut()) {
            data.overwrite_bands(bands, fixup);
        }
    }
    Ok(count)
}

/// Parse whitespace separated hex bytes.
pub(crate) fn parse_hex_bytes(text: &str) -> Result<heapless::Vec<u8, CALIBRATION_MAX>, CalibrationError> {
    let mut out = heapless::Vec::new();
    for word in text.split_whitespace() {
        let byte = u8::from_str_radix(word.trim_start_matches("0x"), 16).map_err(|_| CalibrationError::Syntax)?;
        out.push(byte).map_err(|_| CalibrationError::Syntax)?;
    }
    if out.is_empty() {
        return Err(CalibrationError::Empty);
    }
    Ok(out)
}

// ==============================
// Fixups

/// Copy the `mask` bits of byte `src` over byte `dst` of a calibrated table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GammaFixup {
    pub cmd: u8,
    pub src: u8,
    pub dst: u8,
    pub mask: u8,
}

impl GammaFixup {
    fn apply(&self, buf: &mut [u8]) {
        let (src, dst) = (self.src as usize, self.dst as usize);
        if src >= buf.len() || dst >= buf.len() {
            warn!("gamma fixup 0x{:02x} out of range", self.cmd);
            return;
        }
        if self.mask != 0 {
            buf[dst] = (buf[dst] & !self.mask) | (buf[src] & self.mask);
        }
    }
}

/// Fixups that apply to one panel id.
#[derive(Debug, Copy, Clone)]
pub struct GammaFixupInfo {
    pub panel_id: &'static [u8],
    pub locations: &'static [GammaFixup],
}

impl GammaFixupInfo {
    pub fn matches(&self, vendor_id: &[u8]) -> bool {
        !vendor_id.is_empty() && vendor_id == self.panel_id
    }
}
