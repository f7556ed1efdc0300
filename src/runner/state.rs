//! Per-invocation host state threaded through every import call.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::shim::FsShim;

use super::values::{HostObject, JsValue, Ref, Value, ValueTable};

/// A callback invocation waiting to be delivered to the module.
///
/// Filesystem operations complete by queueing one of these; the run loop
/// turns it into a pending event and fires the module's `resume` export.
/// Queued argument references are retained until the delivered event is
/// released.
pub struct PendingCall {
    pub id: u32,
    pub func: Ref,
    pub args: Vec<JsValue>,
}

pub struct HostState {
    pub values: ValueTable,
    pub shim: Arc<Mutex<FsShim>>,
    pub pending: VecDeque<PendingCall>,
    current_event: Option<Ref>,
    pub timeouts: BTreeMap<u32, Instant>,
    next_timeout_id: u32,
    pub exit_code: Option<i32>,
    /// Base for the monotonic clock reported to the module.
    pub epoch: Instant,
}

impl HostState {
    pub fn new(shim: Arc<Mutex<FsShim>>) -> Self {
        Self {
            values: ValueTable::new(),
            shim,
            pending: VecDeque::new(),
            current_event: None,
            timeouts: BTreeMap::new(),
            next_timeout_id: 1,
            exit_code: None,
            epoch: Instant::now(),
        }
    }

    /// Queues a callback for delivery. `func` must be a module-created
    /// function wrapper; anything else is silently dropped, matching the
    /// tolerant sink behavior required of output paths.
    pub fn queue_callback(&mut self, func: JsValue, args: Vec<JsValue>) {
        let JsValue::Ref(func_ref) = func else {
            log::warn!("dropping callback delivery to a non-function value");
            return;
        };

        let id = match self.values.get(func_ref) {
            Some(Value::Object(HostObject::GoFunc { id })) => *id,
            _ => {
                log::warn!("dropping callback delivery to a non-function value");
                return;
            }
        };

        self.values.retain(func_ref);
        for arg in &args {
            if let JsValue::Ref(child) = arg {
                self.values.retain(*child);
            }
        }

        self.pending.push_back(PendingCall {
            id,
            func: func_ref,
            args,
        });
    }

    /// Promotes the next queued callback to the module-visible pending
    /// event. Returns false when the queue is empty.
    pub fn promote_next_event(&mut self) -> bool {
        let Some(call) = self.pending.pop_front() else {
            return false;
        };

        let args = self.values.alloc(Value::Object(HostObject::Array(call.args)));
        self.values.retain(args);

        let event = self.values.alloc(Value::Object(HostObject::Event {
            id: call.id,
            func: call.func,
            args,
            result: JsValue::Undefined,
        }));
        self.values.retain(event);

        self.set_current_event(Some(event));
        true
    }

    pub fn current_event(&self) -> Option<Ref> {
        self.current_event
    }

    /// Replaces the pending event, releasing the previous one. The module
    /// clears it by assigning null after it picks the event up.
    pub fn set_current_event(&mut self, event: Option<Ref>) {
        if let Some(previous) = self.current_event.take() {
            self.values.release(previous);
        }
        self.current_event = event;
    }

    pub fn schedule_timeout(&mut self, due: Instant) -> u32 {
        let id = self.next_timeout_id;
        self.next_timeout_id += 1;
        self.timeouts.insert(id, due);
        id
    }

    pub fn clear_timeout(&mut self, id: u32) {
        self.timeouts.remove(&id);
    }

    /// The earliest scheduled wakeup, if any.
    pub fn next_timeout(&self) -> Option<(u32, Instant)> {
        self.timeouts
            .iter()
            .min_by_key(|(_, due)| **due)
            .map(|(id, due)| (*id, *due))
    }
}
