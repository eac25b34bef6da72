//! DHCP lease pool.
//!
//! The pool owns one [`Lease`] slot for every address of the configured
//! range and indexes them by address (slot offset) and by client identity.
//! It implements the server-side lease state machine:
//!
//! - `free` -> `offered` when a DISCOVER is answered ([`LeasePool::allocate_for`])
//! - `offered` -> `bound` when a REQUEST is acknowledged ([`LeasePool::confirm`])
//! - `offered`/`bound` -> `free` on RELEASE, DECLINE or expiry
//!
//! A lease whose deadline has passed but which has not been reclaimed yet
//! reports itself as [`LeaseState::Expired`]. Allocation reclaims such
//! leases first, so the pool stays correct even when no expiry timer fired.
//!
//! All operations take the current [`Instant`] from the caller and never
//! read the clock themselves.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};

/// Longest hostname kept on a lease.
const MAX_HOSTNAME_LENGTH: usize = 63;

/// Identity a lease is bound to.
///
/// Derived from DHCP Option 61 if present, otherwise from hardware type +
/// hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl From<Vec<u8>> for ClientId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for ClientId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Colon-separated hex, e.g. `01:aa:bb:cc:dd:ee:ff`.
impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Strips a client-supplied hostname down to DNS label characters.
pub fn sanitize_hostname(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LENGTH)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Free,
    Offered,
    Bound,
    /// Offered or bound, but past its deadline and not yet reclaimed.
    Expired,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Free => "free",
            Self::Offered => "offered",
            Self::Bound => "bound",
            Self::Expired => "expired",
        })
    }
}

/// One address of the pool and whoever holds it.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The address this slot manages.
    pub address: Ipv4Addr,

    /// Holder of the address while offered or bound.
    pub client_id: Option<ClientId>,

    /// Client-provided hostname (Option 12), sanitized.
    pub hostname: Option<String>,

    /// When the offer or binding runs out.
    pub expires_at: Option<Instant>,

    /// Set after a DECLINE; the address is skipped by allocation until then.
    pub quarantined_until: Option<Instant>,

    /// Stored state; never [`LeaseState::Expired`].
    state: LeaseState,
}

impl Lease {
    fn free(address: Ipv4Addr) -> Self {
        Self {
            address,
            client_id: None,
            hostname: None,
            expires_at: None,
            quarantined_until: None,
            state: LeaseState::Free,
        }
    }

    /// Returns the state of the lease as seen at `now`.
    pub fn state_at(&self, now: Instant) -> LeaseState {
        match (self.state, self.expires_at) {
            (LeaseState::Offered | LeaseState::Bound, Some(deadline)) if deadline <= now => {
                LeaseState::Expired
            }
            (state, _) => state,
        }
    }

    /// Time left until the deadline, or zero.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn is_held(&self) -> bool {
        matches!(self.state, LeaseState::Offered | LeaseState::Bound)
    }

    fn is_held_by(&self, client: &ClientId) -> bool {
        self.is_held() && self.client_id.as_ref() == Some(client)
    }

    fn is_quarantined(&self, now: Instant) -> bool {
        self.quarantined_until.is_some_and(|until| until > now)
    }

    /// Converts the lease into a wall-clock view for display or export.
    pub fn snapshot(&self, now: Instant) -> LeaseSnapshot {
        let wall_now = Utc::now();
        let expires_at = self.expires_at.map(|_| {
            wall_now + TimeDelta::from_std(self.remaining(now)).unwrap_or(TimeDelta::zero())
        });

        LeaseSnapshot {
            address: self.address,
            client_id: self.client_id.as_ref().map(ToString::to_string),
            hostname: self.hostname.clone(),
            state: self.state_at(now),
            expires_at,
        }
    }
}

/// Serializable view of a lease.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseSnapshot {
    pub address: Ipv4Addr,
    pub client_id: Option<String>,
    pub hostname: Option<String>,
    pub state: LeaseState,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LeaseSnapshot {
    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        self.expires_at
            .map(|deadline| (deadline - Utc::now()).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// The full set of leases for the configured address range.
///
/// Every address of the range has exactly one slot, so the slot states
/// always partition the range.
#[derive(Debug)]
pub struct LeasePool {
    start: u32,
    leases: Vec<Lease>,
    /// Holder index: client identity -> slot offset of its offered/bound lease.
    by_client: HashMap<ClientId, usize>,
    /// Slot offsets in state `free`, sorted for lowest-address-first allocation.
    free: BTreeSet<usize>,
    lease_duration: Duration,
    offer_timeout: Duration,
    decline_quarantine: Duration,
}

impl LeasePool {
    /// Builds a pool with every address of the configured range free.
    pub fn new(config: &Config) -> Self {
        let start = u32::from(config.pool_start);
        let leases: Vec<Lease> = (0..config.pool_size)
            .map(|offset| Lease::free(Ipv4Addr::from(start.saturating_add(offset))))
            .collect();
        let free = (0..leases.len()).collect();

        Self {
            start,
            leases,
            by_client: HashMap::new(),
            free,
            lease_duration: config.lease_duration(),
            offer_timeout: config.offer_timeout(),
            decline_quarantine: config.decline_quarantine(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.leases.len()
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.index_of(address).is_some()
    }

    fn index_of(&self, address: Ipv4Addr) -> Option<usize> {
        let offset = u32::from(address).checked_sub(self.start)? as usize;
        (offset < self.leases.len()).then_some(offset)
    }

    /// Returns the slot for an address in the pool.
    pub fn lease(&self, address: Ipv4Addr) -> Option<&Lease> {
        self.index_of(address).map(|index| &self.leases[index])
    }

    /// Returns the offered or bound lease held by a client.
    pub fn lease_for(&self, client: &ClientId) -> Option<&Lease> {
        self.by_client.get(client).map(|index| &self.leases[*index])
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.iter()
    }

    /// Offered or bound leases with their deadlines.
    pub fn held(&self) -> impl Iterator<Item = (Ipv4Addr, Instant)> + '_ {
        self.leases
            .iter()
            .filter(|lease| lease.is_held())
            .filter_map(|lease| lease.expires_at.map(|deadline| (lease.address, deadline)))
    }

    /// Number of addresses that could be offered right now.
    pub fn available(&self, now: Instant) -> usize {
        let reclaimable = self
            .leases
            .iter()
            .filter(|lease| lease.state_at(now) == LeaseState::Expired)
            .count();
        let free = self
            .free
            .iter()
            .filter(|index| !self.leases[**index].is_quarantined(now))
            .count();
        free + reclaimable
    }

    /// Picks an address to offer a client (DISCOVER handling).
    ///
    /// # Allocation Priority
    ///
    /// 1. The client's existing non-expired lease (an offer is refreshed)
    /// 2. The requested address, if it is in range and free
    /// 3. The lowest free address
    ///
    /// The chosen address is held as `offered` until the offer timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no address is available.
    pub fn allocate_for(
        &mut self,
        client: &ClientId,
        requested: Option<Ipv4Addr>,
        now: Instant,
    ) -> Result<Lease> {
        self.reclaim_expired(now);

        if let Some(&index) = self.by_client.get(client) {
            let lease = &mut self.leases[index];
            if lease.state == LeaseState::Offered {
                lease.expires_at = Some(now + self.offer_timeout);
            }
            return Ok(lease.clone());
        }

        let index = requested
            .and_then(|address| self.index_of(address))
            .filter(|index| self.is_allocatable(*index, now))
            .or_else(|| {
                self.free
                    .iter()
                    .copied()
                    .find(|index| !self.leases[*index].is_quarantined(now))
            })
            .ok_or(Error::PoolExhausted)?;

        self.occupy(index, client, LeaseState::Offered, now + self.offer_timeout);
        Ok(self.leases[index].clone())
    }

    /// Binds an address to a client (REQUEST handling).
    ///
    /// An offer or binding held by the same client becomes `bound` with
    /// its deadline pushed out to the full lease duration. A free address
    /// is bound directly, and any other lease the client held is given up.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if the address is not in the pool
    /// - [`Error::Conflict`] if another client holds the address
    /// - [`Error::AddressDeclined`] if the address is quarantined
    pub fn confirm(&mut self, client: &ClientId, address: Ipv4Addr, now: Instant) -> Result<Lease> {
        let index = self
            .index_of(address)
            .ok_or(Error::AddressOutOfRange(address))?;
        self.reclaim_expired(now);

        let lease = &self.leases[index];
        if lease.is_held() {
            if lease.client_id.as_ref() != Some(client) {
                return Err(Error::Conflict {
                    address,
                    holder: lease
                        .client_id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                });
            }
        } else {
            if lease.is_quarantined(now) {
                return Err(Error::AddressDeclined(address));
            }
            if let Some(&previous) = self.by_client.get(client) {
                self.vacate(previous);
            }
        }

        self.occupy(index, client, LeaseState::Bound, now + self.lease_duration);
        Ok(self.leases[index].clone())
    }

    /// Gives an address back (RELEASE handling).
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseNotFound`] unless the client holds the address.
    pub fn release(&mut self, client: &ClientId, address: Ipv4Addr) -> Result<()> {
        match self.index_of(address) {
            Some(index) if self.leases[index].is_held_by(client) => {
                self.vacate(index);
                Ok(())
            }
            _ => Err(Error::LeaseNotFound {
                client: client.to_string(),
                address,
            }),
        }
    }

    /// Marks an address as in use elsewhere (DECLINE handling).
    ///
    /// The address is freed and skipped by allocation for the quarantine
    /// period. Declining a free address quarantines it as well.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if the address is not in the pool
    /// - [`Error::Conflict`] if another client holds the address
    pub fn decline(&mut self, client: &ClientId, address: Ipv4Addr, now: Instant) -> Result<()> {
        let index = self
            .index_of(address)
            .ok_or(Error::AddressOutOfRange(address))?;

        let lease = &self.leases[index];
        if lease.is_held() && !lease.is_held_by(client) {
            return Err(Error::Conflict {
                address,
                holder: lease
                    .client_id
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            });
        }

        self.vacate(index);
        self.leases[index].quarantined_until = Some(now + self.decline_quarantine);
        Ok(())
    }

    /// Frees whatever offer or binding exists at `address`.
    ///
    /// Returns true if a lease was freed.
    pub fn expire(&mut self, address: Ipv4Addr) -> bool {
        self.index_of(address)
            .is_some_and(|index| self.vacate(index))
    }

    /// Drops a client's pending offer, e.g. when it selected another server.
    pub fn withdraw_offer(&mut self, client: &ClientId) -> Option<Ipv4Addr> {
        let index = *self.by_client.get(client)?;
        if self.leases[index].state != LeaseState::Offered {
            return None;
        }
        self.vacate(index);
        Some(self.leases[index].address)
    }

    /// Frees every lease whose deadline is at or before `now`.
    ///
    /// Returns the reclaimed addresses.
    pub fn reclaim_expired(&mut self, now: Instant) -> Vec<Ipv4Addr> {
        let expired: Vec<usize> = self
            .leases
            .iter()
            .enumerate()
            .filter(|(_, lease)| lease.state_at(now) == LeaseState::Expired)
            .map(|(index, _)| index)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for index in expired {
            if self.vacate(index) {
                reclaimed.push(self.leases[index].address);
            }
        }
        reclaimed
    }

    /// Records the client's hostname on a lease it holds.
    pub fn set_hostname(&mut self, address: Ipv4Addr, hostname: &str) {
        if let Some(index) = self.index_of(address)
            && self.leases[index].is_held()
        {
            self.leases[index].hostname = Some(sanitize_hostname(hostname));
        }
    }

    /// Snapshots of every lease that is not free.
    pub fn snapshots(&self, now: Instant) -> Vec<LeaseSnapshot> {
        self.leases
            .iter()
            .filter(|lease| lease.is_held())
            .map(|lease| lease.snapshot(now))
            .collect()
    }

    fn is_allocatable(&self, index: usize, now: Instant) -> bool {
        self.free.contains(&index) && !self.leases[index].is_quarantined(now)
    }

    fn occupy(&mut self, index: usize, client: &ClientId, state: LeaseState, expires_at: Instant) {
        self.free.remove(&index);
        let lease = &mut self.leases[index];
        lease.client_id = Some(client.clone());
        lease.state = state;
        lease.expires_at = Some(expires_at);
        lease.quarantined_until = None;
        self.by_client.insert(client.clone(), index);
    }

    fn vacate(&mut self, index: usize) -> bool {
        let lease = &mut self.leases[index];
        if !lease.is_held() {
            return false;
        }

        if let Some(client) = lease.client_id.take()
            && self.by_client.get(&client) == Some(&index)
        {
            self.by_client.remove(&client);
        }

        lease.state = LeaseState::Free;
        lease.expires_at = None;
        lease.hostname = None;
        self.free.insert(index);
        true
    }
}
