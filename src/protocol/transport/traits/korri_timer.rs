//! Clock and timer abstraction providing the timing primitives required by
//! the scheduler loop and request timeouts.
use embassy_time::Instant;

/// Monotonic clock plus an asynchronous wait.
pub trait KorriTimer {
    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Asynchronously wait until `deadline`. Returns immediately when it already passed.
    fn delay_until<'a>(
        &'a mut self,
        deadline: Instant,
    ) -> impl core::future::Future<Output = ()> + 'a;
}
