//! Time source for keepalive and retry scheduling.

use embassy_time::Instant;

/// Something that can tell the current time.
///
/// The engine never sleeps, it only compares instants taken from the clock
/// whenever one of its step functions runs.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Reads the embassy time driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}
