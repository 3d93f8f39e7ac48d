use embedded_hal_1::delay::DelayNs;

/// Shape of a bounded busy-poll loop.
///
/// Every hardware wait in the blocking drivers has an explicit attempt cap;
/// running out of attempts is a hard failure reported by the caller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Poll {
    /// Maximum number of condition checks.
    pub tries: u32,
    /// Delay between checks, in milliseconds.
    pub step_ms: u32,
    /// Sleep before the first check instead of after it.
    pub delay_first: bool,
}

impl Poll {
    pub(crate) const fn after(tries: u32, step_ms: u32) -> Self {
        Self { tries, step_ms, delay_first: true }
    }

    pub(crate) const fn before(tries: u32, step_ms: u32) -> Self {
        Self { tries, step_ms, delay_first: false }
    }

    /// Spin on `done` until it reports `true` or the attempts run out.
    ///
    /// Returns `Ok(false)` on exhaustion; errors from `done` are passed
    /// through immediately.
    pub(crate) fn run<E>(
        self,
        delay: &mut impl DelayNs,
        mut done: impl FnMut() -> Result<bool, E>,
    ) -> Result<bool, E> {
        for _ in 0..self.tries {
            if self.delay_first {
                delay.delay_ms(self.step_ms);
            }
            if done()? {
                return Ok(true);
            }
            if !self.delay_first && self.step_ms != 0 {
                delay.delay_ms(self.step_ms);
            }
        }
        Ok(false)
    }
}
