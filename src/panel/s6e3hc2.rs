//! Samsung S6E3HC2 DDIC: per-mode gamma, TE2 edges and brightness control
//! around each refresh-rate switch.

use bitfield_struct::bitfield;
use embedded_hal_async::delay::DelayNs;

use super::gamma::{self, GammaData, GammaFixupInfo, CALIBRATION_MAX};
use super::ops::SwitchOps;
use super::{Backlight, CmdSet, DisplayMode, DsiBus, Error, Panel, Te2Edge, Te2Rate, MAX_MODES};

const UNLOCK: [u8; 3] = [0xF0, 0x5A, 0x5A];
const LOCK: [u8; 3] = [0xF0, 0xA5, 0xA5];
const WRCTRLD: u8 = 0x53;
const TE2_EDGE: u8 = 0xB9;
const TE2_GLOBAL_PARA: [u8; 3] = [0xB0, 0x2C, 0xF2];
const TE2_TOUT_ENABLE: [u8; 2] = [0xF2, 0x01];

/// Refresh rate whose gamma lives in OTP.
const OTP_RATE: u32 = 60;
/// Refresh rate whose gamma lives in the DDIC flash.
const FLASH_RATE: u32 = 90;

/// WRCTRLD (0x53) parameter.
#[bitfield(u8, defmt = cfg(feature = "defmt"))]
#[derive(PartialEq, Eq)]
pub struct Wrctrld {
    #[bits(3)]
    __: u8,
    /// [3] brightness dimming
    pub dimming: bool,
    /// [4] 90 Hz frame rate
    pub frame_rate_90: bool,
    /// [5] brightness control on
    pub bctrl: bool,
    /// [7:6] high brightness mode
    #[bits(2)]
    pub hbm: u8,
}

impl Wrctrld {
    fn for_mode(backlight: &Backlight, mode: &DisplayMode) -> Self {
        let hbm = backlight.hbm_enabled && backlight.hbm_range != 0;
        Self::new()
            .with_bctrl(true)
            .with_hbm(if hbm { 0b11 } else { 0 })
            .with_dimming(backlight.dimming || backlight.hbm_dimming)
            .with_frame_rate_90(mode.refresh_rate() == FLASH_RATE)
    }
}

fn te2_edge_payload(edge: Te2Edge) -> [u8; 5] {
    let hi = (((edge.rising >> 8) & 0xF) << 4) | ((edge.falling >> 8) & 0xF);
    [TE2_EDGE, 0x00, hi as u8, edge.rising as u8, edge.falling as u8]
}

/// Index pair into the per-mode gamma records, one shared and one mutable.
fn split_pair(gamma: &mut [Option<GammaData>], src: usize, dst: usize) -> Option<(&GammaData, &mut GammaData)> {
    if src < dst {
        let (a, b) = gamma.split_at_mut(dst);
        Some((a[src].as_ref()?, b[0].as_mut()?))
    } else {
        let (a, b) = gamma.split_at_mut(src);
        Some((b[0].as_ref()?, a[dst].as_mut()?))
    }
}

/// S6E3HC2 switch operations.
#[derive(Debug)]
pub struct S6e3hc2 {
    gamma: [Option<GammaData>; MAX_MODES],
    native_ready: bool,
    /// Refresh rates carrying an applied calibration.
    num_calibrated: usize,
    /// Calibration received before the native tables were captured.
    pending: Option<heapless::Vec<u8, CALIBRATION_MAX>>,
    fixup: Option<GammaFixupInfo>,
}

impl S6e3hc2 {
    pub fn new(fixup: Option<GammaFixupInfo>) -> Self {
        Self {
            gamma: [const { None }; MAX_MODES],
            native_ready: false,
            num_calibrated: 0,
            pending: None,
            fixup,
        }
    }

    /// Gamma tables of `mode`, once captured.
    pub fn gamma(&self, mode: usize) -> Option<&GammaData> {
        self.gamma.get(mode)?.as_ref()
    }

    pub fn native_ready(&self) -> bool {
        self.native_ready
    }

    pub fn num_calibrated(&self) -> usize {
        self.num_calibrated
    }

    fn restore_native(&mut self) {
        for g in self.gamma.iter_mut().flatten() {
            g.restore_native();
        }
        self.num_calibrated = 0;
    }

    fn need_gamma_update(&self, panel_on: bool, mode: &DisplayMode) -> bool {
        // the 60 Hz tables are already in the panel unless calibrated
        !mode.seamless && panel_on && !(mode.refresh_rate() == OTP_RATE && self.num_calibrated == 0)
    }

    async fn switch_mode_update<B: DsiBus, D: DelayNs>(
        panel: &mut Panel<B, D>,
        mode: usize,
        last: bool,
    ) -> Result<(), Error<B::Error>> {
        let reg = Wrctrld::for_mode(&panel.backlight, panel.mode(mode)?);
        trace!("wrctrld 0x{:02x}", reg.into_bits());
        panel.write(&[WRCTRLD, reg.into_bits()], last).await
    }

    async fn gamma_update<B: DsiBus, D: DelayNs>(
        &self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>> {
        match self.gamma.get(mode) {
            Some(Some(data)) => gamma::write_gamma(panel, data).await,
            // not captured yet
            _ => Ok(()),
        }
    }

    async fn gamma_update_locked<B: DsiBus, D: DelayNs>(
        &self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>> {
        panel.cmd(&UNLOCK).await?;
        let res = self.gamma_update(panel, mode).await;
        let lock = panel.cmd(&LOCK).await;
        res.and(lock)
    }

    async fn te2_update<B: DsiBus, D: DelayNs>(panel: &mut Panel<B, D>) -> Result<(), Error<B::Error>> {
        let edge = panel.te2.current_edge();
        let res = async {
            panel.cmd(&te2_edge_payload(edge)).await?;
            panel.cmd(&TE2_GLOBAL_PARA).await?;
            panel.cmd(&TE2_TOUT_ENABLE).await
        }
        .await;
        if res.is_err() {
            error!("failed to program TE2 edges");
        } else {
            debug!("TE2 edges rising {} falling {}", edge.rising, edge.falling);
        }
        res
    }

    async fn te2_update_locked<B: DsiBus, D: DelayNs>(panel: &mut Panel<B, D>) -> Result<(), Error<B::Error>> {
        panel.cmd(&UNLOCK).await?;
        let res = Self::te2_update(panel).await;
        let lock = panel.cmd(&LOCK).await;
        res.and(lock)
    }

    /// Select the edge pair for `mode` and program it.
    async fn te2_normal_mode_update<B: DsiBus, D: DelayNs>(
        panel: &mut Panel<B, D>,
        mode: usize,
        locked: bool,
    ) -> Result<(), Error<B::Error>> {
        if !panel.te2.ready {
            return Ok(());
        }
        // edges of the mode being entered, not the last committed one
        panel.te2.current = Te2Rate::for_refresh_rate(panel.mode(mode)?.refresh_rate());
        if locked {
            Self::te2_update_locked(panel).await
        } else {
            Self::te2_update(panel).await
        }
    }

    async fn switch_sequence<B: DsiBus, D: DelayNs>(
        &self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>> {
        Self::switch_mode_update(panel, mode, false).await?;
        self.gamma_update(panel, mode).await?;
        Self::te2_normal_mode_update(panel, mode, false).await
    }

    fn mode_with_gamma<B: DsiBus, D: DelayNs>(&self, panel: &Panel<B, D>, rate: u32) -> Result<usize, Error<B::Error>> {
        panel
            .modes()
            .iter()
            .enumerate()
            .position(|(i, m)| m.refresh_rate() == rate && self.gamma[i].is_some())
            .ok_or(Error::MissingGamma { rate })
    }

    async fn read_all<B: DsiBus, D: DelayNs>(&mut self, panel: &mut Panel<B, D>) -> Result<(), Error<B::Error>> {
        for i in 0..panel.modes().len() {
            let rate = panel.modes()[i].refresh_rate();
            let data = self.gamma[i].get_or_insert_with(GammaData::new);
            match rate {
                OTP_RATE => gamma::read_otp(panel, data).await?,
                FLASH_RATE => gamma::read_flash(panel, data).await?,
                rate => {
                    error!("no gamma source for {} Hz", rate);
                    return Err(Error::UnsupportedRate { rate });
                }
            }
        }

        let otp = self.mode_with_gamma(panel, OTP_RATE)?;
        let flash = self.mode_with_gamma(panel, FLASH_RATE)?;
        if let Some((src, dst)) = split_pair(&mut self.gamma, otp, flash) {
            dst.copy_prefixes_from(src);
        }

        for g in self.gamma.iter_mut().flatten() {
            g.capture_native();
        }
        self.native_ready = true;
        Ok(())
    }

    async fn read_tables<B: DsiBus, D: DelayNs>(&mut self, panel: &mut Panel<B, D>) -> Result<(), Error<B::Error>> {
        panel.cmd(&UNLOCK).await?;
        let res = self.read_all(panel).await;
        let lock = panel.cmd(&LOCK).await;
        res.and(lock)
            .inspect(|_| info!("gamma tables captured"))
            .inspect_err(|_| error!("failed to capture gamma tables"))
    }

    async fn apply_calibration<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
        payload: &[u8],
    ) -> Result<(), Error<B::Error>> {
        let mut present = [false; MAX_MODES];
        for (p, g) in present.iter_mut().zip(self.gamma.iter()) {
            *p = g.is_some();
        }
        let modes = panel.modes();
        let find = |rate: u8| {
            modes
                .iter()
                .enumerate()
                .position(|(i, m)| m.refresh_rate() == rate as u32 && present[i])
        };
        let fixup = self.fixup.as_ref().filter(|f| f.matches(&panel.vendor_id));

        match gamma::apply_calibration(payload, find, &mut self.gamma, fixup) {
            Ok(n) => {
                self.num_calibrated = n;
                info!("gamma calibrated for {} refresh rates", n);
            }
            Err(e) => {
                warn!("gamma calibration rejected: {}", e);
                self.restore_native();
                return Err(e.into());
            }
        }
        self.gamma_update_locked(panel, cur_mode).await
    }
}

impl SwitchOps for S6e3hc2 {
    async fn perform_switch<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>> {
        panel.cmd(&UNLOCK).await?;
        let res = self.switch_sequence(panel, mode).await;
        let lock = panel.cmd(&LOCK).await;
        res.and(lock)
    }

    async fn post_enable<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
    ) -> Result<bool, Error<B::Error>> {
        let mode = *panel.mode(cur_mode)?;
        let capture = !self.native_ready;
        if !capture && self.need_gamma_update(panel.power_on, &mode) {
            if self.gamma_update_locked(panel, cur_mode).await.is_err() {
                warn!("gamma update after enable failed");
            } else {
                debug!("gamma updated after enable");
            }
        }
        if !mode.seamless {
            Self::te2_normal_mode_update(panel, cur_mode, true).await?;
        }
        Ok(capture)
    }

    async fn capture_gamma<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
    ) -> Result<(), Error<B::Error>> {
        if !self.native_ready {
            self.read_tables(panel).await?;
        }
        if let Some(payload) = self.pending.take() {
            self.apply_calibration(panel, cur_mode, &payload).await?;
        }
        Ok(())
    }

    async fn send_nolp<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
    ) -> Result<(), Error<B::Error>> {
        panel.send_cmd_set(cur_mode, CmdSet::Nolp).await?;
        self.gamma_update(panel, cur_mode).await?;
        Self::te2_normal_mode_update(panel, cur_mode, false).await?;
        panel.send_cmd_set(cur_mode, CmdSet::PostNolp).await
    }

    async fn update_hbm<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>> {
        Self::switch_mode_update(panel, mode, true).await
    }

    async fn update_te2<B: DsiBus, D: DelayNs>(&mut self, panel: &mut Panel<B, D>) -> Result<(), Error<B::Error>> {
        Self::te2_update_locked(panel).await
    }

    async fn store_gamma<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
        text: &str,
    ) -> Result<(), Error<B::Error>> {
        let text = text.trim();
        if text.starts_with("default") {
            if self.num_calibrated == 0 {
                return Ok(());
            }
            self.restore_native();
            info!("gamma restored to native");
            if panel.power_on {
                self.gamma_update_locked(panel, cur_mode).await?;
            }
            return Ok(());
        }

        let payload = gamma::parse_hex_bytes(text).inspect_err(|_| warn!("invalid gamma calibration text"))?;
        if !self.native_ready {
            info!("gamma tables not captured yet, calibration deferred");
            self.pending = Some(payload);
            return Ok(());
        }
        if !panel.power_on {
            warn!("panel is off, gamma calibration dropped");
            return Err(Error::NotReady);
        }
        self.apply_calibration(panel, cur_mode, &payload).await
    }

    fn remove_mode(&mut self, mode: usize) {
        if let Some(g) = self.gamma.get_mut(mode) {
            *g = None;
        }
    }
}
