//! Lifecycle observers invoked synchronously by the engine.

use std::fmt;

use crate::error::MarketError;
use crate::sim::engine::Market;

/// Lifecycle points at which listeners are notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// State was reset by `run`.
    AfterInit,
    /// The round loop is about to start.
    BeforeStart,
    /// A round completed; the market holds its full result.
    AfterStep,
    /// The round loop ended.
    AfterDone,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AfterInit => "after-init",
            Self::BeforeStart => "before-start",
            Self::AfterStep => "after-step",
            Self::AfterDone => "after-done",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer of engine lifecycle events.
///
/// Listeners run on the engine thread, in registration order, and only see
/// the market between rounds. A listener error ends the run.
pub trait Listener {
    /// Handles `event`.
    ///
    /// # Errors
    ///
    /// Returns a [`MarketError`] to abort the run.
    fn notify(&mut self, market: &Market, event: Event) -> Result<(), MarketError>;
}

impl<F> Listener for F
where
    F: FnMut(&Market, Event),
{
    fn notify(&mut self, market: &Market, event: Event) -> Result<(), MarketError> {
        self(market, event);
        Ok(())
    }
}
