//! Coded scheduler events, emitted to the logging sink.
//!
//! Each externally meaningful transition is recorded as a `tracing` event
//! under the `taskhive::event` target so operators can filter the event
//! stream from ordinary diagnostics.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    JobSubmit,
    JobDone,
    JobSuspend,
    JobResume,
    JobDelete,
    JobExpire,
    TaskEnqueue,
    TaskDone,
    WorkCheckout,
    WorkDone,
    WorkFail,
    WorkRequeue,
    WorkSuspend,
    ClientRegister,
    ClientUnregister,
    ClientSuspend,
    QueueSuspend,
    QueueResume,
}

impl Event {
    pub fn code(&self) -> &'static str {
        match self {
            Event::JobSubmit => "JQ",
            Event::JobDone => "JD",
            Event::JobSuspend => "JP",
            Event::JobResume => "JR",
            Event::JobDelete => "JL",
            Event::JobExpire => "JE",
            Event::TaskEnqueue => "TQ",
            Event::TaskDone => "TD",
            Event::WorkCheckout => "WC",
            Event::WorkDone => "WD",
            Event::WorkFail => "WF",
            Event::WorkRequeue => "WR",
            Event::WorkSuspend => "WP",
            Event::ClientRegister => "CR",
            Event::ClientUnregister => "CU",
            Event::ClientSuspend => "CS",
            Event::QueueSuspend => "QP",
            Event::QueueResume => "QR",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Emit one event record to the sink.
pub fn emit(event: Event, detail: &str) {
    tracing::info!(target: "taskhive::event", code = event.code(), event = ?event, detail);
}
