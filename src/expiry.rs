//! Lease expiry and housekeeping timers.
//!
//! Holds at most one [`TimerSource`] per leased address plus the periodic
//! housekeeping timer. Replacing or dropping a source cancels the timer
//! it registered.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use tracing::debug;

use crate::event::{Event, TimerSource};

#[derive(Debug, Default)]
pub struct ExpiryTimers {
    leases: HashMap<Ipv4Addr, TimerSource>,
    housekeeping: Option<TimerSource>,
}

impl ExpiryTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `on_expire` at `deadline`, replacing the address's previous timer.
    pub fn arm<F>(
        &mut self,
        event: &Event,
        priority: i64,
        address: Ipv4Addr,
        deadline: Instant,
        on_expire: F,
    ) where
        F: FnOnce(Instant) + Send + 'static,
    {
        let source = event.add_timer(deadline, priority, on_expire);
        if self.leases.insert(address, source).is_some() {
            debug!("Rescheduled expiry of {}", address);
        }
    }

    /// Cancels the address's timer. Returns true if one was pending.
    pub fn disarm(&mut self, address: Ipv4Addr) -> bool {
        self.leases
            .remove(&address)
            .is_some_and(|source| source.is_pending())
    }

    /// Forgets the source of a timer that just fired.
    pub fn fired(&mut self, address: Ipv4Addr) {
        if self
            .leases
            .get(&address)
            .is_some_and(|source| !source.is_pending())
        {
            self.leases.remove(&address);
        }
    }

    /// Schedules the next housekeeping sweep, replacing any pending one.
    pub fn schedule_housekeeping<F>(&mut self, event: &Event, priority: i64, at: Instant, sweep: F)
    where
        F: FnOnce(Instant) + Send + 'static,
    {
        self.housekeeping = Some(event.add_timer(at, priority, sweep));
    }

    /// Cancels every timer. Returns how many lease timers were dropped.
    pub fn cancel_all(&mut self) -> usize {
        self.housekeeping = None;
        let count = self.leases.len();
        self.leases.clear();
        count
    }

    pub fn is_armed(&self, address: Ipv4Addr) -> bool {
        self.leases
            .get(&address)
            .is_some_and(TimerSource::is_pending)
    }

    pub fn deadline(&self, address: Ipv4Addr) -> Option<Instant> {
        self.leases.get(&address).map(TimerSource::deadline)
    }

    /// Number of lease timers held.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn has_housekeeping(&self) -> bool {
        self.housekeeping
            .as_ref()
            .is_some_and(TimerSource::is_pending)
    }
}
