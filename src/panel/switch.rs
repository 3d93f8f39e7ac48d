//! Mode switch coordination.
//!
//! Producers queue a target mode; a single worker task issues the switch and
//! optionally watches the TE pulses that follow it. Queuing waits for any
//! in-flight switch first, so the worker always sees the newest target and a
//! superseded target is never sent to the panel.

use core::cell::RefCell;
use core::fmt;

use embassy_futures::select::{select, Either};
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embedded_hal_async::delay::DelayNs;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use super::ops::SwitchOps;
use super::{DisplayMode, DisplayTiming, DsiBus, Error, ModeDescriptor, Panel, Te2Config, MAX_MODES};

/// Coordinator configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct SwitchConfig {
    /// Mode the panel is in when the coordinator is created.
    pub initial_mode: usize,
    /// TE pulses to observe after every switch, 0 to not listen.
    pub te_listen_count: u32,
    /// Bound on every TE wait and on [`PanelSwitch::prepare_for_frame`].
    pub te_timeout_ms: u32,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            initial_mode: 0,
            te_listen_count: 0,
            te_timeout_ms: 50,
        }
    }
}

/// Mode used while the display is idle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdleMode {
    None,
    Mode(DisplayTiming),
}

impl fmt::Display for IdleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleMode::None => f.write_str("none"),
            IdleMode::Mode(timing) => write!(f, "{}", timing),
        }
    }
}

struct SwitchState {
    /// Mode committed by the display framework.
    cur_mode: usize,
    /// Mode last requested from the panel.
    display_mode: usize,
    idle_mode: Option<usize>,
    pending: bool,
    capture_queued: bool,
    te_listen_count: u32,
}

struct Hw<B, D, O> {
    panel: Panel<B, D>,
    ops: O,
}

/// Refresh-rate switch coordinator for one panel.
///
/// [`run`](Self::run) must be polled on its own task for queued work to
/// make progress.
pub struct PanelSwitch<M: RawMutex, B, D, O> {
    modes: heapless::Vec<DisplayMode, MAX_MODES>,
    state: BlockingMutex<M, RefCell<SwitchState>>,
    hw: Mutex<M, Hw<B, D, O>>,
    /// Held by the worker while it processes work.
    busy: Mutex<M, ()>,
    doorbell: Signal<M, ()>,
    switch_done: Signal<M, ()>,
    te: Signal<M, ()>,
    te_listening: AtomicBool,
    te_counter: AtomicU32,
    delay: D,
    te_timeout_ms: u32,
}

impl<M, B, D, O> PanelSwitch<M, B, D, O>
where
    M: RawMutex,
    B: DsiBus,
    D: DelayNs + Clone,
    O: SwitchOps,
{
    pub fn new(panel: Panel<B, D>, ops: O, config: SwitchConfig) -> Result<Self, Error<B::Error>> {
        panel.mode(config.initial_mode)?;
        let modes = panel.modes.clone();
        let delay = panel.delay.clone();
        Ok(Self {
            modes,
            state: BlockingMutex::new(RefCell::new(SwitchState {
                cur_mode: config.initial_mode,
                display_mode: config.initial_mode,
                idle_mode: None,
                pending: false,
                capture_queued: false,
                te_listen_count: config.te_listen_count,
            })),
            hw: Mutex::new(Hw { panel, ops }),
            busy: Mutex::new(()),
            doorbell: Signal::new(),
            switch_done: Signal::new(),
            te: Signal::new(),
            te_listening: AtomicBool::new(false),
            te_counter: AtomicU32::new(0),
            delay,
            te_timeout_ms: config.te_timeout_ms,
        })
    }

    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    fn check_mode(&self, mode: usize) -> Result<(), Error<B::Error>> {
        if mode < self.modes.len() {
            Ok(())
        } else {
            Err(Error::UnknownMode)
        }
    }

    fn same_rate(&self, a: usize, b: usize) -> bool {
        self.modes[a].refresh_rate() == self.modes[b].refresh_rate()
    }

    /// A queued switch has not been issued yet.
    pub fn is_switch_pending(&self) -> bool {
        self.state.lock(|s| s.borrow().pending)
    }

    #[cfg(test)]
    pub(super) fn doorbell_rung(&self) -> bool {
        self.doorbell.signaled()
    }

    // ==============================
    // Worker

    /// Worker loop. Never returns.
    pub async fn run(&self) -> ! {
        loop {
            self.run_once().await;
        }
    }

    /// Wait for queued work and process it.
    pub async fn run_once(&self) {
        self.doorbell.wait().await;
        let _busy = self.busy.lock().await;
        self.capture_gamma().await;
        self.switch().await;
    }

    async fn capture_gamma(&self) {
        let queued = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let queued = s.capture_queued;
            s.capture_queued = false;
            queued.then_some(s.cur_mode)
        });
        let Some(cur_mode) = queued else {
            return;
        };

        let mut hw = self.hw.lock().await;
        let Hw { panel, ops } = &mut *hw;
        if ops.capture_gamma(panel, cur_mode).await.is_err() {
            warn!("gamma capture failed");
        }
    }

    async fn switch(&self) {
        let armed = self.state.lock(|s| {
            let s = s.borrow();
            if !s.pending {
                return None;
            }
            // TE after this point belongs to the new mode
            if s.te_listen_count > 0 {
                self.te.reset();
                self.te_listening.store(true, Ordering::Release);
            }
            Some((s.display_mode, s.te_listen_count))
        });
        let Some((mode, listen)) = armed else {
            return;
        };

        {
            let mut hw = self.hw.lock().await;
            let Hw { panel, ops } = &mut *hw;
            debug!("switching to {}", self.modes[mode].timing);
            if ops.perform_switch(panel, mode).await.is_err() {
                warn!("switch to {} failed", self.modes[mode].timing);
            }
        }

        self.state.lock(|s| s.borrow_mut().pending = false);
        self.switch_done.signal(());

        if listen == 0 {
            return;
        }
        let mut received = self.wait_te().await;
        if !received {
            warn!("timed out waiting for TE after switch to {}", self.modes[mode].timing);
        }
        for _ in 1..listen {
            if !received {
                break;
            }
            received = self.wait_te().await;
        }
        self.te_listening.store(false, Ordering::Release);
    }

    async fn wait_te(&self) -> bool {
        let mut delay = self.delay.clone();
        matches!(
            select(self.te.wait(), delay.delay_ms(self.te_timeout_ms)).await,
            Either::First(())
        )
    }

    /// TE interrupt hook. Never blocks.
    pub fn on_te(&self) {
        if self.te_listening.load(Ordering::Acquire) {
            self.te_counter.fetch_add(1, Ordering::Relaxed);
            self.te.signal(());
        }
    }

    /// TE pulses observed while listening.
    pub fn te_count(&self) -> u32 {
        self.te_counter.load(Ordering::Relaxed)
    }

    pub fn is_listening_te(&self) -> bool {
        self.te_listening.load(Ordering::Acquire)
    }

    pub fn set_te_listen_count(&self, count: u32) {
        self.state.lock(|s| s.borrow_mut().te_listen_count = count);
    }

    // ==============================
    // Queue

    /// Wait for the work item in flight, if any.
    async fn flush(&self) {
        drop(self.busy.lock().await);
    }

    /// Wait until every queued item has been processed.
    pub async fn flush_queue(&self) {
        loop {
            self.flush().await;
            let queued = self.state.lock(|s| {
                let s = s.borrow();
                s.pending || s.capture_queued
            });
            if !queued {
                break;
            }
            yield_now().await;
        }
    }

    /// Queue a switch to `mode`, replacing any switch not started yet.
    pub async fn queue_switch(&self, mode: usize) -> Result<(), Error<B::Error>> {
        self.check_mode(mode)?;
        self.flush().await;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.display_mode = mode;
            s.pending = true;
        });
        self.doorbell.signal(());
        Ok(())
    }

    /// The framework committed `mode`; bring the panel there.
    pub async fn mode_change_requested(&self, mode: usize) -> Result<(), Error<B::Error>> {
        self.check_mode(mode)?;
        self.state.lock(|s| s.borrow_mut().cur_mode = mode);
        self.queue_switch(mode).await
    }

    /// Wait for a pending switch before a frame goes out.
    ///
    /// Returns `false` if the switch was still pending after the timeout;
    /// the frame should go out anyway.
    pub async fn prepare_for_frame(&self) -> bool {
        self.switch_done.reset();
        if !self.is_switch_pending() {
            return true;
        }

        let done = async {
            while self.is_switch_pending() {
                self.switch_done.wait().await;
            }
        };
        let mut delay = self.delay.clone();
        match select(done, delay.delay_ms(self.te_timeout_ms)).await {
            Either::First(()) => true,
            Either::Second(()) => {
                warn!("timed out waiting for mode switch");
                false
            }
        }
    }

    // ==============================
    // Idle

    /// Switch to the idle mode right away, bypassing the worker.
    ///
    /// A switch still queued is dropped. Call before the display clocks are
    /// gated.
    pub async fn enter_idle(&self) -> Result<(), Error<B::Error>> {
        let _busy = self.busy.lock().await;
        let target = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let idle = s.idle_mode?;
            if self.same_rate(idle, s.cur_mode) {
                return None;
            }
            s.display_mode = idle;
            Some(idle)
        });
        let Some(idle) = target else {
            return Ok(());
        };

        debug!("idle switch to {}", self.modes[idle].timing);
        let res = {
            let mut hw = self.hw.lock().await;
            let Hw { panel, ops } = &mut *hw;
            ops.perform_switch(panel, idle).await
        };

        // the idle switch replaces anything still queued
        self.state.lock(|s| s.borrow_mut().pending = false);
        self.switch_done.signal(());
        res
    }

    /// Queue a switch back to the committed mode if idle moved away from it.
    pub async fn wakeup(&self) -> Result<(), Error<B::Error>> {
        let target = self.state.lock(|s| {
            let s = s.borrow();
            (!self.same_rate(s.display_mode, s.cur_mode)).then_some(s.cur_mode)
        });
        match target {
            Some(mode) => self.queue_switch(mode).await,
            None => Ok(()),
        }
    }

    pub fn set_idle_mode(&self, mode: Option<usize>) -> Result<(), Error<B::Error>> {
        if let Some(mode) = mode {
            self.check_mode(mode)?;
        }
        self.state.lock(|s| s.borrow_mut().idle_mode = mode);
        Ok(())
    }

    /// Select the idle mode by descriptor text, or `"none"`.
    pub fn set_idle_mode_text(&self, text: &str) -> Result<(), Error<B::Error>> {
        let text = text.trim();
        if text == "none" {
            return self.set_idle_mode(None);
        }
        let mode = self.find_mode(text)?;
        self.set_idle_mode(Some(mode))
    }

    pub fn idle_mode(&self) -> IdleMode {
        match self.state.lock(|s| s.borrow().idle_mode) {
            Some(mode) => IdleMode::Mode(self.modes[mode].timing),
            None => IdleMode::None,
        }
    }

    // ==============================
    // Diagnostics

    fn find_mode(&self, text: &str) -> Result<usize, Error<B::Error>> {
        let desc: ModeDescriptor = text.parse().map_err(|_| Error::InvalidDescriptor)?;
        self.modes
            .iter()
            .position(|m| desc.matches(&m.timing))
            .ok_or(Error::UnknownMode)
    }

    /// Queue a switch to the first mode matching descriptor `text`.
    pub async fn force_mode(&self, text: &str) -> Result<(), Error<B::Error>> {
        let mode = self.find_mode(text)?;
        info!("forcing {}", self.modes[mode].timing);
        self.queue_switch(mode).await
    }

    /// Mode last requested from the panel.
    pub fn display_mode(&self) -> DisplayTiming {
        self.modes[self.state.lock(|s| s.borrow().display_mode)].timing
    }

    fn cur_mode(&self) -> usize {
        self.state.lock(|s| s.borrow().cur_mode)
    }

    // ==============================
    // Panel hooks

    /// Panel has been enabled.
    pub async fn post_enable(&self) -> Result<(), Error<B::Error>> {
        self.flush().await;
        let cur_mode = self.cur_mode();
        let capture = {
            let mut hw = self.hw.lock().await;
            let Hw { panel, ops } = &mut *hw;
            ops.post_enable(panel, cur_mode).await?
        };
        if capture {
            self.state.lock(|s| s.borrow_mut().capture_queued = true);
            self.doorbell.signal(());
        }
        Ok(())
    }

    /// Leave low-power mode.
    pub async fn send_nolp(&self) -> Result<(), Error<B::Error>> {
        let cur_mode = self.cur_mode();
        let mut hw = self.hw.lock().await;
        let Hw { panel, ops } = &mut *hw;
        ops.send_nolp(panel, cur_mode).await
    }

    /// Reprogram brightness control after a backlight change.
    pub async fn update_hbm(&self) -> Result<(), Error<B::Error>> {
        let mode = self.state.lock(|s| s.borrow().display_mode);
        let mut hw = self.hw.lock().await;
        let Hw { panel, ops } = &mut *hw;
        ops.update_hbm(panel, mode).await
    }

    /// Program the current TE2 edges.
    pub async fn update_te2(&self) -> Result<(), Error<B::Error>> {
        let mut hw = self.hw.lock().await;
        let Hw { panel, ops } = &mut *hw;
        ops.update_te2(panel).await
    }

    /// Replace the TE2 edges from their `"r f r f"` text form.
    pub async fn set_te2_table(&self, text: &str) -> Result<(), Error<B::Error>> {
        let mut hw = self.hw.lock().await;
        let Hw { panel, ops } = &mut *hw;
        if !panel.te2.ready {
            return Err(Error::Unsupported);
        }
        let Some(edges) = Te2Config::parse_edges(text) else {
            warn!("invalid TE2 table");
            return Err(Error::InvalidTe2Table);
        };
        panel.te2.edges = edges;
        if panel.power_on {
            ops.update_te2(panel).await?;
        }
        Ok(())
    }

    pub async fn te2_config(&self) -> Te2Config {
        self.hw.lock().await.panel.te2
    }

    /// Apply gamma calibration text, or `"default"` to restore native gamma.
    pub async fn store_gamma(&self, text: &str) -> Result<(), Error<B::Error>> {
        let cur_mode = self.cur_mode();
        let mut hw = self.hw.lock().await;
        let Hw { panel, ops } = &mut *hw;
        ops.store_gamma(panel, cur_mode, text).await
    }

    /// `mode` is being torn down.
    pub async fn remove_mode(&self, mode: usize) {
        self.hw.lock().await.ops.remove_mode(mode);
    }

    /// Run `f` with the panel and its ops locked.
    pub async fn with_panel<R>(&self, f: impl FnOnce(&mut Panel<B, D>, &mut O) -> R) -> R {
        let mut hw = self.hw.lock().await;
        let Hw { panel, ops } = &mut *hw;
        f(panel, ops)
    }
}
