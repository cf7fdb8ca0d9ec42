//! Developer trace events with a thread-local sink for deterministic tests.
//! Each event is also written as one JSON line to the `flexdoc::dev` log target at TRACE.

use serde::Serialize;
use std::cell::RefCell;
use std::time::Instant;

use crate::dispatch::CursorMode;
use crate::query::CommandKind;

pub const DEV_TARGET: &str = "flexdoc::dev";

/// What the dispatcher and executor report once per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Cursor {
        mode: CursorMode,
        collection: String,
        ok: bool,
        duration_us: u64,
    },
    Execute {
        kind: CommandKind,
        collection: String,
        bound: bool,
        ok: bool,
        duration_us: u64,
    },
}

impl TraceEvent {
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Cursor { collection, .. } | Self::Execute { collection, .. } => collection,
        }
    }

    #[must_use]
    pub const fn ok(&self) -> bool {
        match self {
            Self::Cursor { ok, .. } | Self::Execute { ok, .. } => *ok,
        }
    }
}

/// Microseconds since `started`, saturated.
#[must_use]
pub fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

thread_local! {
    static TL_SINK: RefCell<Option<Vec<TraceEvent>>> = const { RefCell::new(None) };
}

/// Guard that disables the thread-local sink on drop.
pub struct DevSinkGuard;
impl Drop for DevSinkGuard {
    fn drop(&mut self) {
        TL_SINK.with(|s| *s.borrow_mut() = None);
    }
}

/// Enable the thread-local sink for the current thread. Returns a guard that will disable it on drop.
pub fn enable_thread_sink() -> DevSinkGuard {
    TL_SINK.with(|s| *s.borrow_mut() = Some(Vec::new()));
    DevSinkGuard
}

/// Records `event` in the sink (when enabled) and logs it under [`DEV_TARGET`].
pub fn emit(event: TraceEvent) {
    if log::log_enabled!(target: DEV_TARGET, log::Level::Trace) {
        match serde_json::to_string(&event) {
            Ok(line) => log::trace!(target: DEV_TARGET, "{line}"),
            Err(e) => log::warn!("unable to encode trace event: {e}"),
        }
    }
    TL_SINK.with(|s| {
        if let Some(buf) = s.borrow_mut().as_mut() {
            buf.push(event);
        }
    });
}

/// Drain and return the captured events for the current thread.
pub fn drain() -> Vec<TraceEvent> {
    TL_SINK.with(|s| s.borrow_mut().as_mut().map(std::mem::take).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_event(collection: &str) -> TraceEvent {
        TraceEvent::Cursor {
            mode: CursorMode::Find,
            collection: collection.into(),
            ok: true,
            duration_us: 3,
        }
    }

    #[test]
    fn thread_local_sink_captures_events() {
        let _g = enable_thread_sink();
        emit(cursor_event("staff"));
        emit(TraceEvent::Execute {
            kind: CommandKind::Delete,
            collection: "staff".into(),
            bound: false,
            ok: false,
            duration_us: 9,
        });
        let drained = drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], cursor_event("staff"));
        assert!(!drained[1].ok());
        assert!(drain().is_empty());
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let line = serde_json::to_value(cursor_event("staff")).unwrap();
        assert_eq!(
            line,
            serde_json::json!({
                "event": "cursor",
                "mode": "find",
                "collection": "staff",
                "ok": true,
                "duration_us": 3,
            })
        );
    }

    #[test]
    fn isolation_between_threads() {
        let _g = enable_thread_sink();
        emit(cursor_event("main"));
        let child = std::thread::spawn(|| {
            emit(cursor_event("child"));
            drain()
        })
        .join()
        .unwrap();
        assert!(child.is_empty());
        assert!(drain().iter().any(|e| e.collection() == "main"));
    }
}
