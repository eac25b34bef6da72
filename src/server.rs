//! DHCP server handle.
//!
//! [`DhcpServer`] is a shared handle (clone or [`acquire`](DhcpServer::acquire)
//! to add an owner, drop or [`release`](DhcpServer::release) to remove one)
//! around the protocol handler, the lease timers and the lifecycle state.
//!
//! # Lifecycle
//!
//! ```text
//! new ──► attach_event ──► start ──► stop ──► detach_event ──► drop
//!              ▲              │        ▲           │
//!              └──────────────┼────────┘───────────┘
//! ```
//!
//! Inbound datagrams go through [`handle_message`](DhcpServer::handle_message).
//! Lease timers are armed only while the server is both running and
//! attached to an [`Event`]; stopping or detaching cancels them.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::expiry::ExpiryTimers;
use crate::handler::{LeaseChange, PacketHandler};
use crate::lease::LeaseSnapshot;
use crate::packet::DhcpPacket;
use crate::transport::Transport;

/// What happened to an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Accepted and processed; a reply may or may not have been sent.
    Handled,
    /// Failed decoding or validation and was discarded.
    Dropped,
}

impl Disposition {
    /// Numeric form: 1 for handled, 0 for dropped.
    pub fn signal(self) -> i32 {
        match self {
            Self::Handled => 1,
            Self::Dropped => 0,
        }
    }

    /// Numeric form of a handler result, negative for internal faults.
    pub fn signal_of(result: &Result<Disposition>) -> i32 {
        match result {
            Ok(disposition) => disposition.signal(),
            Err(_) => -1,
        }
    }
}

struct Attachment {
    event: Event,
    priority: i64,
    generation: u64,
}

struct ServerState {
    handler: PacketHandler,
    timers: ExpiryTimers,
    attachment: Option<Attachment>,
    generation: u64,
    running: bool,
    transport: Option<Arc<dyn Transport>>,
}

struct ServerInner {
    config: Arc<Config>,
    state: Mutex<ServerState>,
}

impl ServerInner {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServerState {
    fn timers_active(&self) -> bool {
        self.running && self.attachment.is_some()
    }

    /// Mirrors lease transitions onto the timer set.
    fn apply(&mut self, server: &Weak<ServerInner>, changes: &[LeaseChange]) {
        for change in changes {
            match *change {
                LeaseChange::Armed {
                    address,
                    expires_at,
                } => self.arm(server, address, expires_at),
                LeaseChange::Cleared(address) => {
                    self.timers.disarm(address);
                }
            }
        }
    }

    fn arm(&mut self, server: &Weak<ServerInner>, address: Ipv4Addr, expires_at: Instant) {
        if !self.timers_active() {
            return;
        }
        let Some(attachment) = &self.attachment else {
            return;
        };

        let server = server.clone();
        self.timers.arm(
            &attachment.event,
            attachment.priority,
            address,
            expires_at,
            move |_| {
                let Some(inner) = server.upgrade() else {
                    return;
                };
                let mut state = inner.lock();
                state.timers.fired(address);
                if state.handler.leases_mut().expire(address) {
                    info!("Lease on {} expired", address);
                }
            },
        );
    }

    fn schedule_housekeeping(&mut self, server: &Weak<ServerInner>, at: Instant) {
        let Some(attachment) = &self.attachment else {
            return;
        };

        let server = server.clone();
        self.timers.schedule_housekeeping(
            &attachment.event,
            attachment.priority,
            at,
            move |now| {
                let Some(inner) = server.upgrade() else {
                    return;
                };
                let mut state = inner.lock();
                let reclaimed = state.handler.leases_mut().reclaim_expired(now);
                for address in &reclaimed {
                    state.timers.disarm(*address);
                }
                if !reclaimed.is_empty() {
                    debug!("Housekeeping reclaimed {} leases", reclaimed.len());
                }
                if state.timers_active() {
                    let next = now + inner.config.housekeeping_interval();
                    state.schedule_housekeeping(&Arc::downgrade(&inner), next);
                }
            },
        );
    }

    /// Arms timers for every held lease and the housekeeping sweep.
    fn arm_all(&mut self, server: &Weak<ServerInner>, interval: Duration) {
        if !self.timers_active() {
            return;
        }
        let held: Vec<(Ipv4Addr, Instant)> = self.handler.leases().held().collect();
        for (address, expires_at) in held {
            self.arm(server, address, expires_at);
        }
        self.schedule_housekeeping(server, Instant::now() + interval);
    }

    fn cancel_timers(&mut self) {
        let cancelled = self.timers.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} lease timers", cancelled);
        }
    }
}

/// Shared handle to a DHCP server.
///
/// The server is destroyed when the last handle is dropped; its timers are
/// cancelled at that point.
pub struct DhcpServer {
    inner: Arc<ServerInner>,
}

impl DhcpServer {
    /// Creates a stopped, detached server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration does not
    /// validate. No server is created in that case.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let handler = PacketHandler::new(Arc::clone(&config));

        info!(
            "DHCP server on interface {} ({})",
            config.interface_index, config.server_ip
        );
        info!(
            "IP pool: {} - {} ({} addresses)",
            config.pool_start,
            config.pool_end(),
            config.pool_size
        );

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                state: Mutex::new(ServerState {
                    handler,
                    timers: ExpiryTimers::new(),
                    attachment: None,
                    generation: 0,
                    running: false,
                    transport: None,
                }),
            }),
        })
    }

    /// Adds an owner and returns its handle.
    pub fn acquire(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Gives up this handle. Returns true if it was the last one and the
    /// server was destroyed.
    pub fn release(self) -> bool {
        Arc::into_inner(self.inner).is_some()
    }

    /// Number of live handles.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Attaches the server to `event`, or to the calling thread's default
    /// reactor when `None`.
    ///
    /// Timers registered by the server use `priority`. The attachment ends
    /// when the returned [`EventAttachment`] is dropped or
    /// [`detach_event`](Self::detach_event) is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyAttached`] if an event is already attached;
    /// the existing attachment is left untouched.
    pub fn attach_event(&self, event: Option<Event>, priority: i64) -> Result<EventAttachment> {
        let mut state = self.inner.lock();
        if state.attachment.is_some() {
            return Err(Error::AlreadyAttached);
        }

        state.generation += 1;
        let generation = state.generation;
        state.attachment = Some(Attachment {
            event: event.unwrap_or_else(Event::default_loop),
            priority,
            generation,
        });
        debug!("Attached to event loop (priority {})", priority);

        state.arm_all(
            &Arc::downgrade(&self.inner),
            self.inner.config.housekeeping_interval(),
        );

        Ok(EventAttachment {
            server: Arc::downgrade(&self.inner),
            generation,
        })
    }

    /// Detaches from the event loop and cancels all timers. Safe to call
    /// when not attached.
    pub fn detach_event(&self) {
        let mut state = self.inner.lock();
        detach(&mut state);
    }

    /// The attached event loop, if any.
    pub fn event(&self) -> Option<Event> {
        self.inner
            .lock()
            .attachment
            .as_ref()
            .map(|attachment| attachment.event.clone())
    }

    /// Starts accepting datagrams from [`receive`](Self::receive).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if the server is running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.running {
            return Err(Error::AlreadyRunning);
        }

        state.running = true;
        state.arm_all(
            &Arc::downgrade(&self.inner),
            self.inner.config.housekeeping_interval(),
        );
        info!("DHCP server started");
        Ok(())
    }

    /// Stops the server and cancels all timers. Always succeeds.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        if state.running {
            info!("DHCP server stopped");
        }
        state.running = false;
        state.cancel_timers();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Sets where replies are sent. Without a transport, replies are
    /// built and discarded.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        self.inner.lock().transport = Some(transport);
    }

    /// Decodes, validates and processes one datagram.
    ///
    /// Returns [`Disposition::Dropped`] for datagrams failing validation
    /// and [`Disposition::Handled`] otherwise, including requests answered
    /// with NAK or not answered at all. Failing to send a reply is logged
    /// and does not change the result.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal faults.
    pub fn handle_message(&self, data: &[u8]) -> Result<Disposition> {
        let packet = match DhcpPacket::decode_and_validate(data) {
            Ok(packet) => packet,
            Err(rejection) => {
                debug!("Dropping {}-byte datagram: {}", data.len(), rejection);
                return Ok(Disposition::Dropped);
            }
        };

        let (reply, transport) = {
            let mut state = self.inner.lock();
            let outcome = state.handler.handle(&packet, Instant::now())?;
            state.apply(&Arc::downgrade(&self.inner), &outcome.changes);
            (outcome.reply, state.transport.clone())
        };

        if let Some(reply) = reply {
            match transport {
                Some(transport) => {
                    if let Err(error) = transport.send(&reply.packet, reply.destination) {
                        warn!("Failed to send reply to {}: {}", reply.destination, error);
                    }
                }
                None => debug!("No transport, discarding reply to {}", reply.destination),
            }
        }

        Ok(Disposition::Handled)
    }

    /// Entry point for datagrams read from the socket; drops everything
    /// while the server is stopped.
    pub fn receive(&self, data: &[u8]) -> Result<Disposition> {
        if !self.is_running() {
            debug!("Server stopped, ignoring {}-byte datagram", data.len());
            return Ok(Disposition::Dropped);
        }
        self.handle_message(data)
    }

    /// Snapshots of all offered and bound leases.
    pub fn leases(&self) -> Vec<LeaseSnapshot> {
        self.inner.lock().handler.leases().snapshots(Instant::now())
    }

    /// Number of addresses that could be offered now.
    pub fn available_addresses(&self) -> usize {
        self.inner.lock().handler.leases().available(Instant::now())
    }

    /// Number of lease timers currently held.
    pub fn armed_timers(&self) -> usize {
        self.inner.lock().timers.len()
    }
}

impl Clone for DhcpServer {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl fmt::Debug for DhcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("DhcpServer")
            .field("server_ip", &self.inner.config.server_ip)
            .field("running", &state.running)
            .field("attached", &state.attachment.is_some())
            .field("ref_count", &Arc::strong_count(&self.inner))
            .finish()
    }
}

fn detach(state: &mut ServerState) {
    state.cancel_timers();
    if state.attachment.take().is_some() {
        debug!("Detached from event loop");
    }
}

/// Registration returned by [`DhcpServer::attach_event`].
///
/// Dropping it detaches the server, unless that attachment was already
/// ended and replaced.
#[must_use = "dropping the attachment detaches the server"]
#[derive(Debug)]
pub struct EventAttachment {
    server: Weak<ServerInner>,
    generation: u64,
}

impl EventAttachment {
    /// Ends the attachment now.
    pub fn detach(self) {}
}

impl Drop for EventAttachment {
    fn drop(&mut self) {
        let Some(inner) = self.server.upgrade() else {
            return;
        };
        let mut state = inner.lock();
        if state
            .attachment
            .as_ref()
            .is_some_and(|attachment| attachment.generation == self.generation)
        {
            detach(&mut state);
        }
    }
}
