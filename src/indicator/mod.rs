//! Activity indicator driven by the number of live captures
//!
//! Every stream session and every snapshot holds an `IndicatorGuard` while it
//! uses the camera. The first guard lights the indicator, the last one to be
//! dropped turns it off. The count and the pin share one lock, so the pin
//! side effect is complete before any other enter/leave can observe the count.
#[cfg(feature = "gpio")]
pub mod gpio;

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Binary output device (LED, relay, ...)
///
/// Implementations must tolerate being driven to the state they are already in.
pub trait IndicatorPin: Send {
    fn set_on(&mut self);
    fn set_off(&mut self);
}

/// Indicator used when no GPIO is available: transitions are only logged
#[derive(Debug, Default)]
pub struct LogIndicator;

impl IndicatorPin for LogIndicator {
    fn set_on(&mut self) {
        info!("Indicator ON (capture active)");
    }

    fn set_off(&mut self) {
        info!("Indicator OFF (capture idle)");
    }
}

struct Inner {
    active: usize,
    lit: bool,
    pin: Box<dyn IndicatorPin>,
}

pub struct IndicatorController {
    inner: Mutex<Inner>,
}

impl IndicatorController {
    /// Wrap a pin; the pin is driven off straight away
    pub fn new(mut pin: Box<dyn IndicatorPin>) -> Self {
        pin.set_off();

        Self {
            inner: Mutex::new(Inner {
                active: 0,
                lit: false,
                pin,
            }),
        }
    }

    /// Register one active user; lights the indicator on the 0 -> 1 transition
    pub fn enter(self: &Arc<Self>) -> IndicatorGuard {
        {
            let mut inner = self.inner.lock();
            inner.active += 1;
            if inner.active == 1 && !inner.lit {
                inner.pin.set_on();
                inner.lit = true;
            }
            debug!(active = inner.active, "Indicator enter");
        }

        IndicatorGuard {
            controller: Arc::clone(self),
        }
    }

    fn leave(&self) {
        let mut inner = self.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        if inner.active == 0 && inner.lit {
            inner.pin.set_off();
            inner.lit = false;
        }
        debug!(active = inner.active, "Indicator leave");
    }

    pub fn is_on(&self) -> bool {
        self.inner.lock().lit
    }

    pub fn active(&self) -> usize {
        self.inner.lock().active
    }
}

/// Keeps the indicator lit for as long as it is alive
#[must_use = "the indicator turns off again as soon as the guard is dropped"]
pub struct IndicatorGuard {
    controller: Arc<IndicatorController>,
}

impl std::fmt::Debug for IndicatorGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorGuard").finish_non_exhaustive()
    }
}

impl Drop for IndicatorGuard {
    fn drop(&mut self) {
        self.controller.leave();
    }
}
