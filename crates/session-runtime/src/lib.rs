//! Single-worker execution primitives shared by the server and the client.
//!
//! - [`EventQueueWorker`]: FIFO of closures on one named thread, with a blocking `flush`.
//! - [`SessionScheduler`]: FIFO of per-client tasks on one worker thread, fire-and-forget
//!   or submit-and-wait, dropping tasks whose client is no longer registered.
//! - [`TimerWorker`]: closures run at their deadlines on one thread, cancellable as a whole.

pub mod event_worker;
pub mod scheduler;
pub mod timer;

pub use event_worker::EventQueueWorker;
pub use scheduler::{ClientId, ScheduleError, SessionScheduler};
pub use timer::TimerWorker;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
