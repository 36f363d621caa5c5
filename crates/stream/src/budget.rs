use std::time::{Duration, Instant};

/// Per-tick work allowance: an item count and a wall-clock deadline.
///
/// Checked between items, never in the middle of one, so a single slow
/// item can overrun the deadline but nothing starts after it.
#[derive(Debug, Clone, Copy)]
pub struct TickBudget {
    deadline: Instant,
    remaining: usize,
}

impl TickBudget {
    pub fn new(deadline: Instant, max_items: usize) -> Self {
        Self {
            deadline,
            remaining: max_items,
        }
    }

    /// Whether another item may start.
    pub fn can_continue(&self) -> bool {
        self.remaining > 0 && !self.timed_out()
    }

    pub fn timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Count one item of work against the budget.
    pub fn charge(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// Region streaming statistics, accumulated between two registry ticks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    /// Observer attached to a region it was not watching.
    pub observers_added: usize,
    pub observers_removed: usize,
    /// Region contents installed (sync or async).
    pub regions_loaded: usize,
    /// First full sends.
    pub regions_sent: usize,
    pub load_failures: usize,
    pub single_cell_updates: usize,
    pub batch_updates: usize,
    pub full_resends: usize,
    /// Queue lengths and entry count when the tick finished.
    pub pending_loads: usize,
    pub pending_sends: usize,
    pub total_entries: usize,
    /// The time budget stopped a queue before it was drained.
    pub budget_exhausted: bool,
    pub tick_time: Duration,
}

/// Tick time tracker for instrumentation and adaptive view radius.
#[derive(Debug)]
pub struct TickTimer {
    history: Vec<Duration>,
    capacity: usize,
    index: usize,
    filled: bool,
}

impl TickTimer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: vec![Duration::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, dt: Duration) {
        self.history[self.index] = dt;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn samples(&self) -> &[Duration] {
        if self.filled {
            &self.history
        } else {
            &self.history[..self.index]
        }
    }

    pub fn average(&self) -> Duration {
        let samples = self.samples();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.iter().sum::<Duration>() / samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<Duration> {
        if self.count() == 0 {
            return None;
        }
        let i = (self.index + self.capacity - 1) % self.capacity;
        Some(self.history[i])
    }

    pub fn count(&self) -> usize {
        self.samples().len()
    }

    pub fn clear(&mut self) {
        self.index = 0;
        self.filled = false;
    }
}
