//! DHCP protocol state machine.
//!
//! [`PacketHandler`] turns one validated request into a lease mutation and
//! an optional reply. It performs no I/O: the reply is returned with its
//! destination, and every lease transition is reported as a
//! [`LeaseChange`] so the caller can keep expiry timers in step.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{ClientId, Lease, LeasePool};
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::{DhcpPacket, Rejection};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Options kept in OFFER/ACK even when the client did not ask for them.
const MANDATORY_OPTIONS: [OptionCode; 5] = [
    OptionCode::MessageType,
    OptionCode::ServerIdentifier,
    OptionCode::LeaseTime,
    OptionCode::RenewalTime,
    OptionCode::RebindingTime,
];

/// A reply packet and where to send it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub packet: DhcpPacket,
    pub destination: SocketAddr,
}

/// A lease transition the expiry timers must follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseChange {
    /// The address is offered or bound until `expires_at`.
    Armed { address: Ipv4Addr, expires_at: Instant },
    /// The address went back to the free set.
    Cleared(Ipv4Addr),
}

/// Result of handling one request.
#[derive(Debug, Default)]
pub struct Outcome {
    pub reply: Option<Reply>,
    pub changes: Vec<LeaseChange>,
}

impl Outcome {
    fn reply(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            changes: Vec::new(),
        }
    }

    fn with_change(mut self, change: LeaseChange) -> Self {
        self.changes.push(change);
        self
    }
}

fn armed(lease: &Lease) -> Option<LeaseChange> {
    lease.expires_at.map(|expires_at| LeaseChange::Armed {
        address: lease.address,
        expires_at,
    })
}

/// Where a reply to `request` goes.
///
/// Relayed requests are answered to the relay on the server port. NAKs,
/// requests with the broadcast flag and clients without an address get a
/// broadcast; everyone else is unicast at `ciaddr`.
pub fn reply_destination(request: &DhcpPacket, message_type: MessageType) -> SocketAddr {
    if !request.giaddr.is_unspecified() {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if message_type == MessageType::Nak
        || request.is_broadcast()
        || request.ciaddr.is_unspecified()
    {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}

/// Dispatches requests by DHCP message type against a lease pool.
#[derive(Debug)]
pub struct PacketHandler {
    config: Arc<Config>,
    leases: LeasePool,
}

impl PacketHandler {
    pub fn new(config: Arc<Config>) -> Self {
        let leases = LeasePool::new(&config);
        Self { config, leases }
    }

    pub fn leases(&self) -> &LeasePool {
        &self.leases
    }

    pub fn leases_mut(&mut self) -> &mut LeasePool {
        &mut self.leases
    }

    /// Handles a validated request at time `now`.
    ///
    /// Resource failures (exhausted pool, conflicting claim) are answered
    /// in-protocol and return `Ok`. An `Err` is either a rejection of a
    /// packet that was never validated or an internal fault.
    pub fn handle(&mut self, packet: &DhcpPacket, now: Instant) -> Result<Outcome> {
        let message_type = packet
            .message_type()
            .ok_or(Error::Rejected(Rejection::MissingMessageType))?;
        let mac = packet.format_mac();
        debug!("{} from {} (xid {:#010x})", message_type, mac, packet.xid);

        match message_type {
            MessageType::Discover => self.handle_discover(packet, now),
            MessageType::Request => self.handle_request(packet, now),
            MessageType::Release => Ok(self.handle_release(packet)),
            MessageType::Decline => Ok(self.handle_decline(packet, now)),
            MessageType::Inform => Ok(self.handle_inform(packet)),
            MessageType::Offer | MessageType::Ack | MessageType::Nak => {
                debug!("Ignoring {} from {}", message_type, mac);
                Ok(Outcome::default())
            }
        }
    }

    /// Frees leases past their deadline so their timers are dropped too.
    fn reclaim_expired(&mut self, now: Instant) -> Outcome {
        let changes = self
            .leases
            .reclaim_expired(now)
            .into_iter()
            .inspect(|address| debug!("Reclaimed expired lease on {}", address))
            .map(LeaseChange::Cleared)
            .collect();
        Outcome {
            reply: None,
            changes,
        }
    }

    fn handle_discover(&mut self, packet: &DhcpPacket, now: Instant) -> Result<Outcome> {
        let mac = packet.format_mac();
        let client = ClientId::from(packet.client_id());
        let mut outcome = self.reclaim_expired(now);

        let lease = match self
            .leases
            .allocate_for(&client, packet.requested_ip(), now)
        {
            Ok(lease) => lease,
            Err(Error::PoolExhausted) => {
                warn!("Pool exhausted, cannot offer IP to {}", mac);
                return Ok(outcome);
            }
            Err(error) => return Err(error),
        };

        if let Some(hostname) = packet.hostname() {
            self.leases.set_hostname(lease.address, hostname);
        }

        let reply = self.build_reply(
            packet,
            MessageType::Offer,
            lease.address,
            self.build_offer_options(),
        );
        info!("OFFER {} to {}", lease.address, mac);

        outcome.reply = Some(reply);
        outcome.changes.extend(armed(&lease));
        Ok(outcome)
    }

    fn handle_request(&mut self, packet: &DhcpPacket, now: Instant) -> Result<Outcome> {
        let mac = packet.format_mac();
        let client = ClientId::from(packet.client_id());
        let mut outcome = self.reclaim_expired(now);

        if let Some(server_id) = packet.server_identifier()
            && server_id != self.config.server_ip
        {
            info!("REQUEST from {} is for different server {}", mac, server_id);
            if let Some(address) = self.leases.withdraw_offer(&client) {
                debug!("Withdrew offer of {} to {}", address, mac);
                outcome.changes.push(LeaseChange::Cleared(address));
            }
            return Ok(outcome);
        }

        let requested = packet
            .requested_ip()
            .or((!packet.ciaddr.is_unspecified()).then_some(packet.ciaddr));
        let Some(requested) = requested else {
            debug!("REQUEST from {} names no address", mac);
            return Ok(outcome);
        };

        let previous = self.leases.lease_for(&client).map(|lease| lease.address);

        let lease = match self.leases.confirm(&client, requested, now) {
            Ok(lease) => lease,
            Err(
                error @ (Error::Conflict { .. }
                | Error::AddressOutOfRange(_)
                | Error::AddressDeclined(_)),
            ) => {
                outcome.reply = Some(self.build_nak(packet, &error.to_string()));
                return Ok(outcome);
            }
            Err(error) => return Err(error),
        };

        if let Some(hostname) = packet.hostname() {
            self.leases.set_hostname(lease.address, hostname);
        }

        let reply = self.build_reply(
            packet,
            MessageType::Ack,
            lease.address,
            self.build_offer_options(),
        );
        info!(
            "ACK {} to {} (lease: {} seconds)",
            lease.address,
            mac,
            lease.remaining(now).as_secs()
        );

        outcome.reply = Some(reply);
        if let Some(previous) = previous
            && previous != lease.address
        {
            outcome.changes.push(LeaseChange::Cleared(previous));
        }
        outcome.changes.extend(armed(&lease));
        Ok(outcome)
    }

    fn handle_release(&mut self, packet: &DhcpPacket) -> Outcome {
        let mac = packet.format_mac();
        let client = ClientId::from(packet.client_id());

        if packet.ciaddr.is_unspecified() {
            warn!("RELEASE from {} with no ciaddr", mac);
            return Outcome::default();
        }

        match self.leases.release(&client, packet.ciaddr) {
            Ok(()) => {
                info!("RELEASE from {} for {}", mac, packet.ciaddr);
                Outcome::default().with_change(LeaseChange::Cleared(packet.ciaddr))
            }
            Err(error) => {
                debug!("Ignoring RELEASE from {}: {}", mac, error);
                Outcome::default()
            }
        }
    }

    fn handle_decline(&mut self, packet: &DhcpPacket, now: Instant) -> Outcome {
        let mac = packet.format_mac();
        let client = ClientId::from(packet.client_id());

        let Some(declined) = packet.requested_ip() else {
            warn!("DECLINE from {} names no address", mac);
            return Outcome::default();
        };

        match self.leases.decline(&client, declined, now) {
            Ok(()) => {
                warn!(
                    "DECLINE from {} for {} - marked IP as unavailable",
                    mac, declined
                );
                Outcome::default().with_change(LeaseChange::Cleared(declined))
            }
            Err(error) => {
                warn!("DECLINE from {} for {} rejected: {}", mac, declined, error);
                Outcome::default()
            }
        }
    }

    fn handle_inform(&self, packet: &DhcpPacket) -> Outcome {
        let reply = self.build_reply(
            packet,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.build_inform_options(),
        );
        info!("INFORM response to {}", packet.format_mac());
        Outcome::reply(reply)
    }

    fn build_nak(&self, packet: &DhcpPacket, reason: &str) -> Reply {
        let mut options = vec![DhcpOption::ServerIdentifier(self.config.server_ip)];
        if let Some(relay_info) = packet.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        let nak = DhcpPacket::create_reply(
            packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_ip,
            options,
        );

        warn!("NAK to {}: {}", packet.format_mac(), reason);

        Reply {
            destination: reply_destination(packet, MessageType::Nak),
            packet: nak,
        }
    }

    fn build_reply(
        &self,
        packet: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Reply {
        let mut options = filter_options_by_prl(options, packet.parameter_request_list());
        if let Some(relay_info) = packet.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        Reply {
            packet: DhcpPacket::create_reply(
                packet,
                message_type,
                your_ip,
                self.config.server_ip,
                options,
            ),
            destination: reply_destination(packet, message_type),
        }
    }

    fn build_common_options(&self, options: &mut Vec<DhcpOption>) {
        options.push(DhcpOption::SubnetMask(self.config.subnet_mask));

        if let Some(gateway) = self.config.gateway {
            options.push(DhcpOption::Router(vec![gateway]));
        }

        if !self.config.dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(self.config.dns_servers.clone()));
        }

        if let Some(ref domain) = self.config.domain_name {
            options.push(DhcpOption::DomainName(domain.clone()));
        }
    }

    fn build_offer_options(&self) -> Vec<DhcpOption> {
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.config.server_ip),
            DhcpOption::LeaseTime(self.config.lease_duration_seconds),
            DhcpOption::RenewalTime(self.config.renewal_time()),
            DhcpOption::RebindingTime(self.config.rebinding_time()),
        ];

        self.build_common_options(&mut options);

        options.push(DhcpOption::BroadcastAddress(
            self.config.calculate_broadcast(),
        ));

        options
    }

    fn build_inform_options(&self) -> Vec<DhcpOption> {
        let mut options = vec![DhcpOption::ServerIdentifier(self.config.server_ip)];

        self.build_common_options(&mut options);

        options
    }
}

fn filter_options_by_prl(
    options: Vec<DhcpOption>,
    parameter_request_list: Option<&[u8]>,
) -> Vec<DhcpOption> {
    let Some(prl) = parameter_request_list else {
        return options;
    };

    options
        .into_iter()
        .filter(|option| {
            let code = option.option_code();
            MANDATORY_OPTIONS
                .iter()
                .any(|mandatory| *mandatory as u8 == code)
                || prl.contains(&code)
        })
        .collect()
}
