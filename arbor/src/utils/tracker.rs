#![allow(unused)]

use crate::task::Id;
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Resume,
    StopLater,
    Select,
    TimerFired,
    Unhandled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Resume { id: Id },
    StopLater { id: Id },
    Select { timeout: Option<Duration> },
    TimerFired { count: usize },
    Unhandled { id: Id },
}

impl Call {
    fn method(&self) -> Method {
        match self {
            Call::Resume { .. } => Method::Resume,
            Call::StopLater { .. } => Method::StopLater,
            Call::Select { .. } => Method::Select,
            Call::TimerFired { .. } => Method::TimerFired,
            Call::Unhandled { .. } => Method::Unhandled,
        }
    }
}

/// Records what the scheduler did so tests can assert ordering.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    calls: RefCell<HashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn record(&self, call: Call) {
        self.calls
            .borrow_mut()
            .entry(call.method())
            .or_default()
            .push(call);
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .borrow()
            .get(method)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.borrow().get(method).map_or(0, |calls| calls.len())
    }

    pub(crate) fn reset(&self) {
        self.calls.borrow_mut().clear();
    }
}
