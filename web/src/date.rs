//! Low resolution date cache for the `Date` response header.
//!
//! Rendering an http date costs a syscall plus formatting; under load the
//! same second is rendered thousands of times. The cache refreshes on read
//! at a 500ms granularity instead.

use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant, SystemTime},
};

use httpdate::HttpDate;

const MAX_AGE: Duration = Duration::from_millis(500);

/// Cloneable handle to the shared date state of one event loop.
#[derive(Clone)]
pub(crate) struct DateHandle(Rc<RefCell<DateState>>);

struct DateState {
    date: String,
    renewed: Instant,
}

impl DateState {
    fn now() -> Self {
        Self {
            date: HttpDate::from(SystemTime::now()).to_string(),
            renewed: Instant::now(),
        }
    }
}

impl DateHandle {
    pub(crate) fn new() -> Self {
        Self(Rc::new(RefCell::new(DateState::now())))
    }

    pub(crate) fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        let mut state = self.0.borrow_mut();
        if state.renewed.elapsed() > MAX_AGE {
            *state = DateState::now();
        }
        f(state.date.as_bytes())
    }
}
