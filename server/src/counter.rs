use std::{cell::Cell, rc::Rc, time::Duration};

use tokio::time::{interval, Instant};

/// In flight connection counter shared between a worker and its tasks.
#[derive(Clone)]
pub struct Counter(Rc<Cell<usize>>);

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(0)))
    }

    /// Register one connection. The returned guard de-registers on drop.
    pub fn guard(&self) -> CounterGuard {
        self.0.set(self.0.get() + 1);
        CounterGuard(self.0.clone())
    }

    pub fn count(&self) -> usize {
        self.0.get()
    }

    /// Wait until the counter drains to zero or the grace period runs out.
    /// Returns the number of connections still alive afterwards.
    pub async fn wait_idle(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        let mut tick = interval(Duration::from_millis(500));
        loop {
            if self.count() == 0 {
                return 0;
            }
            if Instant::now() >= deadline {
                return self.count();
            }
            tick.tick().await;
        }
    }
}

pub struct CounterGuard(Rc<Cell<usize>>);

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}
