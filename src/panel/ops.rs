use embedded_hal_async::delay::DelayNs;

use super::s6e3hc2::S6e3hc2;
use super::{CmdSet, DsiBus, Error, GammaFixupInfo, Panel};

/// Descriptor of panels that only need their timing-switch command set.
pub const PANEL_SWITCH_COMPATIBLE: &str = "google,dsi_panel_switch";
/// Descriptor of S6E3HC2 panels with gamma handling.
pub const S6E3HC2_COMPATIBLE: &str = "google,dsi_s6e3hc2_gamma";

/// Panel specific half of a mode switch.
///
/// Mode arguments are indices into [`Panel::modes`]. Operations a panel
/// lacks return [`Error::Unsupported`].
#[allow(async_fn_in_trait)]
pub trait SwitchOps {
    /// Issue the commands that move the panel into `mode`.
    async fn perform_switch<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>>;

    /// Run after the panel has been enabled in `cur_mode`.
    ///
    /// Returns `true` when gamma still has to be captured from the panel,
    /// which the caller schedules on the worker.
    async fn post_enable<B: DsiBus, D: DelayNs>(
        &mut self,
        _panel: &mut Panel<B, D>,
        _cur_mode: usize,
    ) -> Result<bool, Error<B::Error>> {
        Ok(false)
    }

    /// Read gamma from the panel and apply any pending calibration.
    async fn capture_gamma<B: DsiBus, D: DelayNs>(
        &mut self,
        _panel: &mut Panel<B, D>,
        _cur_mode: usize,
    ) -> Result<(), Error<B::Error>> {
        Err(Error::Unsupported)
    }

    /// Leave low-power mode into `cur_mode`.
    async fn send_nolp<B: DsiBus, D: DelayNs>(
        &mut self,
        _panel: &mut Panel<B, D>,
        _cur_mode: usize,
    ) -> Result<(), Error<B::Error>> {
        Err(Error::Unsupported)
    }

    /// Reprogram brightness control for `mode` after a backlight change.
    async fn update_hbm<B: DsiBus, D: DelayNs>(
        &mut self,
        _panel: &mut Panel<B, D>,
        _mode: usize,
    ) -> Result<(), Error<B::Error>> {
        Err(Error::Unsupported)
    }

    /// Program the current TE2 edges.
    async fn update_te2<B: DsiBus, D: DelayNs>(&mut self, _panel: &mut Panel<B, D>) -> Result<(), Error<B::Error>> {
        Err(Error::Unsupported)
    }

    /// Apply a gamma calibration in text form.
    async fn store_gamma<B: DsiBus, D: DelayNs>(
        &mut self,
        _panel: &mut Panel<B, D>,
        _cur_mode: usize,
        _text: &str,
    ) -> Result<(), Error<B::Error>> {
        Err(Error::Unsupported)
    }

    /// `mode` is being torn down.
    fn remove_mode(&mut self, _mode: usize) {}
}

/// Panels switched by their timing-switch command set alone.
#[derive(Debug, Default)]
pub struct DefaultSwitch;

impl SwitchOps for DefaultSwitch {
    async fn perform_switch<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>> {
        panel.send_cmd_set(mode, CmdSet::TimingSwitch).await
    }
}

/// Switch behavior chosen from the panel descriptor.
#[derive(Debug)]
pub enum PanelOps {
    Default(DefaultSwitch),
    S6e3hc2(S6e3hc2),
}

impl PanelOps {
    /// Pick the implementation for a `compatible` descriptor string.
    pub fn from_compatible(compatible: &str, fixup: Option<GammaFixupInfo>) -> Option<Self> {
        match compatible {
            S6E3HC2_COMPATIBLE => Some(PanelOps::S6e3hc2(S6e3hc2::new(fixup))),
            PANEL_SWITCH_COMPATIBLE => Some(PanelOps::Default(DefaultSwitch)),
            _ => None,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $ops:ident => $call:expr) => {
        match $self {
            PanelOps::Default($ops) => $call,
            PanelOps::S6e3hc2($ops) => $call,
        }
    };
}

impl SwitchOps for PanelOps {
    async fn perform_switch<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>> {
        dispatch!(self, ops => ops.perform_switch(panel, mode).await)
    }

    async fn post_enable<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
    ) -> Result<bool, Error<B::Error>> {
        dispatch!(self, ops => ops.post_enable(panel, cur_mode).await)
    }

    async fn capture_gamma<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
    ) -> Result<(), Error<B::Error>> {
        dispatch!(self, ops => ops.capture_gamma(panel, cur_mode).await)
    }

    async fn send_nolp<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
    ) -> Result<(), Error<B::Error>> {
        dispatch!(self, ops => ops.send_nolp(panel, cur_mode).await)
    }

    async fn update_hbm<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        mode: usize,
    ) -> Result<(), Error<B::Error>> {
        dispatch!(self, ops => ops.update_hbm(panel, mode).await)
    }

    async fn update_te2<B: DsiBus, D: DelayNs>(&mut self, panel: &mut Panel<B, D>) -> Result<(), Error<B::Error>> {
        dispatch!(self, ops => ops.update_te2(panel).await)
    }

    async fn store_gamma<B: DsiBus, D: DelayNs>(
        &mut self,
        panel: &mut Panel<B, D>,
        cur_mode: usize,
        text: &str,
    ) -> Result<(), Error<B::Error>> {
        dispatch!(self, ops => ops.store_gamma(panel, cur_mode, text).await)
    }

    fn remove_mode(&mut self, mode: usize) {
        dispatch!(self, ops => ops.remove_mode(mode))
    }
}
