use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dhcp_engine::options::OptionCode;
use dhcp_engine::{
    Config, DhcpOption, DhcpPacket, DhcpServer, Disposition, Event, LeaseState, MessageType,
    Result, Transport,
};

#[derive(Default)]
struct Capture {
    sent: Mutex<Vec<(DhcpPacket, SocketAddr)>>,
}

impl Capture {
    fn take(&self) -> Vec<(DhcpPacket, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Transport for Capture {
    fn send(&self, packet: &DhcpPacket, destination: SocketAddr) -> Result<()> {
        self.sent.lock().unwrap().push((packet.clone(), destination));
        Ok(())
    }
}

struct Client {
    mac: [u8; 6],
    xid: u32,
}

impl Client {
    fn new(last: u8) -> Self {
        Self {
            mac: [0x52, 0x54, 0x00, 0x12, 0x34, last],
            xid: u32::from(last) << 8,
        }
    }

    fn message(
        &mut self,
        message_type: MessageType,
        ciaddr: Ipv4Addr,
        options: &[DhcpOption],
    ) -> Vec<u8> {
        self.xid += 1;

        let mut data = vec![0u8; 240];
        data[0] = 1;
        data[1] = 1;
        data[2] = 6;
        data[4..8].copy_from_slice(&self.xid.to_be_bytes());
        data[12..16].copy_from_slice(&ciaddr.octets());
        data[28..34].copy_from_slice(&self.mac);
        data[236..240].copy_from_slice(&[99, 130, 83, 99]);
        data.extend_from_slice(&[OptionCode::MessageType as u8, 1, message_type as u8]);
        for option in options {
            data.extend(option.encode());
        }
        data.push(OptionCode::End as u8);
        data
    }

    fn discover(&mut self) -> Vec<u8> {
        self.message(MessageType::Discover, Ipv4Addr::UNSPECIFIED, &[])
    }

    fn request(&mut self, address: Ipv4Addr, server: Ipv4Addr) -> Vec<u8> {
        self.message(
            MessageType::Request,
            Ipv4Addr::UNSPECIFIED,
            &[
                DhcpOption::RequestedIpAddress(address),
                DhcpOption::ServerIdentifier(server),
            ],
        )
    }

    fn release(&mut self, address: Ipv4Addr, server: Ipv4Addr) -> Vec<u8> {
        self.message(
            MessageType::Release,
            address,
            &[DhcpOption::ServerIdentifier(server)],
        )
    }
}

fn single_address_config() -> Config {
    Config {
        server_ip: Ipv4Addr::new(10, 0, 0, 1),
        subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
        pool_start: Ipv4Addr::new(10, 0, 0, 10),
        pool_size: 1,
        gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
        lease_duration_seconds: 120,
        offer_timeout_seconds: 10,
        ..Default::default()
    }
}

fn setup(config: Config) -> (DhcpServer, Arc<Capture>) {
    let server = DhcpServer::new(config).unwrap();
    let capture = Arc::new(Capture::default());
    server.set_transport(capture.clone());
    (server, capture)
}

#[test]
fn test_single_address_handshake() {
    let config = single_address_config();
    let server_ip = config.server_ip;
    let address0 = config.pool_start;
    let (server, capture) = setup(config);

    let mut client_a = Client::new(0xa);
    let mut client_b = Client::new(0xb);

    assert_eq!(
        server.handle_message(&client_a.discover()).unwrap(),
        Disposition::Handled
    );
    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    let (offer, destination) = &sent[0];
    assert_eq!(offer.message_type(), Some(MessageType::Offer));
    assert_eq!(offer.yiaddr, address0);
    assert_eq!(offer.xid, client_a.xid);
    assert_eq!(offer.server_identifier(), Some(server_ip));
    assert_eq!(
        offer.option(OptionCode::LeaseTime as u8),
        Some(&DhcpOption::LeaseTime(120))
    );
    assert_eq!(destination.ip(), Ipv4Addr::BROADCAST);

    assert_eq!(
        server
            .handle_message(&client_a.request(address0, server_ip))
            .unwrap(),
        Disposition::Handled
    );
    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.message_type(), Some(MessageType::Ack));
    assert_eq!(sent[0].0.yiaddr, address0);

    let leases = server.leases();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].state, LeaseState::Bound);
    assert_eq!(leases[0].address, address0);

    assert_eq!(
        server.handle_message(&client_b.discover()).unwrap(),
        Disposition::Handled
    );
    assert!(capture.take().is_empty());

    assert_eq!(
        server
            .handle_message(&client_a.release(address0, server_ip))
            .unwrap(),
        Disposition::Handled
    );
    assert!(capture.take().is_empty());
    assert!(server.leases().is_empty());

    assert_eq!(
        server.handle_message(&client_b.discover()).unwrap(),
        Disposition::Handled
    );
    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.message_type(), Some(MessageType::Offer));
    assert_eq!(sent[0].0.yiaddr, address0);
}

#[test]
fn test_competing_request_is_nakked() {
    let config = single_address_config();
    let server_ip = config.server_ip;
    let address0 = config.pool_start;
    let (server, capture) = setup(config);

    let mut client_a = Client::new(0xa);
    let mut client_b = Client::new(0xb);

    server.handle_message(&client_a.discover()).unwrap();
    capture.take();

    server
        .handle_message(&client_b.request(address0, server_ip))
        .unwrap();
    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.message_type(), Some(MessageType::Nak));
    assert_eq!(sent[0].0.yiaddr, Ipv4Addr::UNSPECIFIED);

    server
        .handle_message(&client_a.request(address0, server_ip))
        .unwrap();
    assert_eq!(
        capture.take()[0].0.message_type(),
        Some(MessageType::Ack)
    );
}

#[test]
fn test_offer_expires_through_event_loop() {
    let config = single_address_config();
    let (server, capture) = setup(config);
    let event = Event::new();
    let _attachment = server.attach_event(Some(event.clone()), 0).unwrap();
    server.start().unwrap();

    let mut client_a = Client::new(0xa);
    let mut client_b = Client::new(0xb);

    assert_eq!(
        server.receive(&client_a.discover()).unwrap(),
        Disposition::Handled
    );
    assert_eq!(server.leases()[0].state, LeaseState::Offered);
    assert_eq!(server.armed_timers(), 1);

    server.receive(&client_b.discover()).unwrap();
    assert_eq!(capture.take().len(), 1);

    event.dispatch(Instant::now() + Duration::from_secs(11));
    assert!(server.leases().is_empty());
    assert_eq!(server.armed_timers(), 0);

    server.receive(&client_b.discover()).unwrap();
    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.yiaddr, Ipv4Addr::new(10, 0, 0, 10));
}

#[test]
fn test_stopped_server_ignores_socket_traffic() {
    let (server, capture) = setup(single_address_config());
    let mut client = Client::new(0xc);

    assert_eq!(
        server.receive(&client.discover()).unwrap(),
        Disposition::Dropped
    );
    assert!(capture.take().is_empty());
    assert!(server.leases().is_empty());
}
