//! Inbound datagram decoding and validation, outbound reply encoding.
//!
//! A message is the 236-byte BOOTP header, the 4-byte magic cookie and then
//! the option stream:
//!
//! ```text
//! offset  size  field
//!      0     1  op      1 = BOOTREQUEST, 2 = BOOTREPLY
//!      1     1  htype   1 = Ethernet
//!      2     1  hlen    6 for Ethernet
//!      3     1  hops
//!      4     4  xid
//!      8     2  secs
//!     10     2  flags   bit 15 = broadcast
//!     12     4  ciaddr
//!     16     4  yiaddr
//!     20     4  siaddr
//!     24     4  giaddr
//!     28    16  chaddr
//!     44    64  sname
//!    108   128  file
//!    236     4  cookie  99.130.83.99
//!    240     -  options
//! ```
//!
//! [`DhcpPacket::decode_and_validate`] is the only entry point for traffic
//! arriving from the network. The cookie and hop count are carried through
//! but never checked.

use std::net::Ipv4Addr;

use crate::options::{self, DecodeError, DhcpOption, MessageType, OptionCode};

pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Header plus cookie. Anything shorter is rejected outright.
pub const DHCP_FIXED_HEADER_SIZE: usize = 240;

/// Replies are padded to this size so BOOTP relays accept them.
pub const DHCP_MIN_PACKET_SIZE: usize = 300;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

const FLAG_BROADCAST: u16 = 0x8000;

mod layout {
    pub const XID: usize = 4;
    pub const SECS: usize = 8;
    pub const FLAGS: usize = 10;
    pub const CIADDR: usize = 12;
    pub const YIADDR: usize = 16;
    pub const SIADDR: usize = 20;
    pub const GIADDR: usize = 24;
    pub const CHADDR: usize = 28;
    pub const SNAME: usize = 44;
    pub const FILE: usize = 108;
    pub const COOKIE: usize = 236;
}

/// Why an inbound datagram was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("datagram of {0} bytes is shorter than the 240-byte header")]
    TooShort(usize),

    #[error("operation code {0} is not BOOTREQUEST")]
    Operation(u8),

    #[error("unsupported hardware type {0}")]
    HardwareType(u8),

    #[error("hardware address length {0} (expected 6)")]
    HardwareLength(u8),

    #[error("malformed options: {0}")]
    Options(#[from] DecodeError),

    #[error("no DHCP message type option")]
    MissingMessageType,

    /// Option 53 is present but its value is not one of 1 through 8.
    #[error("unrecognized DHCP message type {0:?}")]
    UnknownMessageType(Vec<u8>),
}

/// One DHCP message, inbound request or outbound reply.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Filled in by a client that already holds its address.
    pub ciaddr: Ipv4Addr,
    /// The address a reply hands out.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address; zero when the client is on-link.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    /// As received. Replies always carry [`DHCP_MAGIC_COOKIE`].
    pub cookie: [u8; 4],
    /// Main stream first, then `file`, then `sname` when Option 52 says so.
    pub options: Vec<DhcpOption>,
}

fn array<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[at..at + N]);
    out
}

fn ip_at(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::from(array::<4>(data, at))
}

fn check_request_header(op: u8, htype: u8, hlen: u8) -> Result<(), Rejection> {
    match (op, htype, hlen) {
        (BOOTREQUEST, HTYPE_ETHERNET, HLEN_ETHERNET) => Ok(()),
        (BOOTREQUEST, HTYPE_ETHERNET, other) => Err(Rejection::HardwareLength(other)),
        (BOOTREQUEST, other, _) => Err(Rejection::HardwareType(other)),
        (other, _, _) => Err(Rejection::Operation(other)),
    }
}

impl DhcpPacket {
    /// Decodes an inbound datagram and applies the acceptance rules.
    ///
    /// Checks run in this order and the first failure is returned: length,
    /// operation code, hardware type, hardware length, option stream,
    /// message type. An option stream that ends without an End marker is
    /// accepted.
    pub fn decode_and_validate(data: &[u8]) -> Result<Self, Rejection> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Rejection::TooShort(data.len()));
        }
        check_request_header(data[0], data[1], data[2])?;

        let packet = Self::parse(data)?;
        packet.validated_message_type()?;
        Ok(packet)
    }

    /// Structural decode only: the header must be present and every option
    /// area in use must decode. No protocol rules are applied.
    pub fn parse(data: &[u8]) -> Result<Self, Rejection> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Rejection::TooShort(data.len()));
        }

        let sname: [u8; 64] = array(data, layout::SNAME);
        let file: [u8; 128] = array(data, layout::FILE);

        let mut decoded = options::decode(&data[DHCP_FIXED_HEADER_SIZE..])?;
        let overload = decoded.iter().find_map(|option| match option {
            DhcpOption::OptionOverload(flag) => Some(*flag),
            _ => None,
        });
        if let Some(flag) = overload {
            if flag.carries_file() {
                decoded.extend(options::decode(&file)?);
            }
            if flag.carries_sname() {
                decoded.extend(options::decode(&sname)?);
            }
        }

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes(array(data, layout::XID)),
            secs: u16::from_be_bytes(array(data, layout::SECS)),
            flags: u16::from_be_bytes(array(data, layout::FLAGS)),
            ciaddr: ip_at(data, layout::CIADDR),
            yiaddr: ip_at(data, layout::YIADDR),
            siaddr: ip_at(data, layout::SIADDR),
            giaddr: ip_at(data, layout::GIADDR),
            chaddr: array(data, layout::CHADDR),
            sname,
            file,
            cookie: array(data, layout::COOKIE),
            options: decoded,
        })
    }

    /// Applies the inbound rules to an already decoded packet and returns
    /// its message type.
    pub fn validate(&self) -> Result<MessageType, Rejection> {
        check_request_header(self.op, self.htype, self.hlen)?;
        self.validated_message_type()
    }

    fn validated_message_type(&self) -> Result<MessageType, Rejection> {
        match self.option(OptionCode::MessageType as u8) {
            Some(DhcpOption::MessageType(kind)) => Ok(*kind),
            Some(DhcpOption::Unknown(_, raw)) => Err(Rejection::UnknownMessageType(raw.clone())),
            _ => Err(Rejection::MissingMessageType),
        }
    }

    /// Serializes for the wire, End-terminated and padded to
    /// [`DHCP_MIN_PACKET_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        let stream = options::encode(&self.options);
        let mut out = Vec::with_capacity((DHCP_FIXED_HEADER_SIZE + stream.len()).max(DHCP_MIN_PACKET_SIZE));

        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&address.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&self.cookie);
        out.extend_from_slice(&stream);

        if out.len() < DHCP_MIN_PACKET_SIZE {
            out.resize(DHCP_MIN_PACKET_SIZE, OptionCode::Pad as u8);
        }
        out
    }

    /// First option carrying `code`.
    pub fn option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|option| option.option_code() == code)
    }

    pub fn has_option(&self, code: u8) -> bool {
        self.option(code).is_some()
    }

    fn find<'a, T>(&'a self, pick: impl Fn(&'a DhcpOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(pick)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.find(|option| match option {
            DhcpOption::MessageType(kind) => Some(*kind),
            _ => None,
        })
    }

    /// Option 50. Present in DISCOVER as a preference and in a
    /// SELECTING or INIT-REBOOT REQUEST as the address being claimed.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find(|option| match option {
            DhcpOption::RequestedIpAddress(address) => Some(*address),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.find(|option| match option {
            DhcpOption::ServerIdentifier(address) => Some(*address),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.find(|option| match option {
            DhcpOption::ClientIdentifier(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }

    /// Option 82, which must be echoed back unchanged.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.find(|option| match option {
            DhcpOption::RelayAgentInfo(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.find(|option| match option {
            DhcpOption::Hostname(text) => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.find(|option| match option {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    /// The meaningful prefix of `chaddr`, `hlen` bytes long but never past
    /// the end of the field.
    pub fn chaddr_bytes(&self) -> &[u8] {
        &self.chaddr[..usize::from(self.hlen).min(self.chaddr.len())]
    }

    /// `aa:bb:cc:dd:ee:ff`, for log lines.
    pub fn format_mac(&self) -> String {
        self.chaddr_bytes()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Identity the lease pool keys on: Option 61 when the client sent one,
    /// otherwise `htype` followed by the hardware address.
    pub fn client_id(&self) -> Vec<u8> {
        match self.client_identifier() {
            Some(bytes) => bytes.to_vec(),
            None => std::iter::once(self.htype)
                .chain(self.chaddr_bytes().iter().copied())
                .collect(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    /// Builds a BOOTREPLY answering `request`.
    ///
    /// `xid`, `flags`, `giaddr`, `htype`, `hlen` and `chaddr` come from the
    /// request. The message type option is placed first. A NAK always
    /// carries a zero `ciaddr`.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let ciaddr = match message_type {
            MessageType::Nak => Ipv4Addr::UNSPECIFIED,
            _ => request.ciaddr,
        };

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0; 64],
            file: [0; 128],
            cookie: DHCP_MAGIC_COOKIE,
            options: std::iter::once(DhcpOption::MessageType(message_type))
                .chain(options)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const OFFERED: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);

    /// A broadcast Ethernet BOOTREQUEST with xid 0x12345678.
    struct Datagram {
        bytes: Vec<u8>,
    }

    impl Datagram {
        fn new(message_type: MessageType) -> Self {
            let mut bytes = vec![0u8; DHCP_FIXED_HEADER_SIZE];
            bytes[0] = BOOTREQUEST;
            bytes[1] = HTYPE_ETHERNET;
            bytes[2] = HLEN_ETHERNET;
            bytes[layout::XID..layout::XID + 4].copy_from_slice(&0x12345678u32.to_be_bytes());
            bytes[layout::FLAGS..layout::FLAGS + 2].copy_from_slice(&FLAG_BROADCAST.to_be_bytes());
            bytes[layout::CHADDR..layout::CHADDR + 6].copy_from_slice(&MAC);
            bytes[layout::COOKIE..layout::COOKIE + 4].copy_from_slice(&DHCP_MAGIC_COOKIE);
            Self { bytes }.option(OptionCode::MessageType as u8, &[message_type as u8])
        }

        fn option(mut self, code: u8, value: &[u8]) -> Self {
            self.bytes.push(code);
            self.bytes.push(value.len() as u8);
            self.bytes.extend_from_slice(value);
            self
        }

        fn set(mut self, at: usize, value: &[u8]) -> Self {
            self.bytes[at..at + value.len()].copy_from_slice(value);
            self
        }

        fn end(mut self) -> Vec<u8> {
            self.bytes.push(OptionCode::End as u8);
            self.bytes
        }

        fn decode(self) -> Result<DhcpPacket, Rejection> {
            DhcpPacket::decode_and_validate(&self.end())
        }
    }

    #[test]
    fn test_decode_header_fields() {
        let packet = Datagram::new(MessageType::Discover).decode().unwrap();

        assert_eq!(packet.op, BOOTREQUEST);
        assert_eq!(packet.xid, 0x12345678);
        assert!(packet.is_broadcast());
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
        assert_eq!(packet.format_mac(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(packet.cookie, DHCP_MAGIC_COOKIE);
    }

    #[test]
    fn test_encode_then_accept() {
        let packet = Datagram::new(MessageType::Discover)
            .option(OptionCode::Hostname as u8, b"laptop")
            .decode()
            .unwrap();

        let encoded = packet.encode();
        assert_eq!(encoded.len(), DHCP_MIN_PACKET_SIZE);

        let again = DhcpPacket::decode_and_validate(&encoded).unwrap();
        assert_eq!(again.xid, packet.xid);
        assert_eq!(again.hostname(), Some("laptop"));
    }

    #[test]
    fn test_option_accessors() {
        let packet = Datagram::new(MessageType::Request)
            .option(OptionCode::RequestedIpAddress as u8, &OFFERED.octets())
            .option(OptionCode::ServerIdentifier as u8, &SERVER.octets())
            .option(OptionCode::ParameterRequestList as u8, &[1, 3, 6])
            .decode()
            .unwrap();

        assert_eq!(packet.requested_ip(), Some(OFFERED));
        assert_eq!(packet.server_identifier(), Some(SERVER));
        assert_eq!(packet.parameter_request_list(), Some(&[1u8, 3, 6][..]));
        assert!(packet.has_option(OptionCode::ServerIdentifier as u8));
        assert!(!packet.has_option(OptionCode::ClientIdentifier as u8));
        assert_eq!(packet.hostname(), None);
    }

    #[test]
    fn test_short_datagrams_rejected() {
        for len in [0, 100, DHCP_FIXED_HEADER_SIZE - 1] {
            assert_eq!(
                DhcpPacket::decode_and_validate(&vec![0u8; len]).unwrap_err(),
                Rejection::TooShort(len)
            );
        }
    }

    #[test]
    fn test_header_checks_in_order() {
        let reply = Datagram::new(MessageType::Discover).set(0, &[BOOTREPLY]).set(1, &[6]);
        assert_eq!(reply.decode().unwrap_err(), Rejection::Operation(BOOTREPLY));

        let token_ring = Datagram::new(MessageType::Discover).set(1, &[6]).set(2, &[7]);
        assert_eq!(token_ring.decode().unwrap_err(), Rejection::HardwareType(6));

        let long_mac = Datagram::new(MessageType::Discover).set(2, &[7]);
        assert_eq!(long_mac.decode().unwrap_err(), Rejection::HardwareLength(7));
    }

    #[test]
    fn test_message_type_required() {
        let blanked = Datagram::new(MessageType::Discover).set(240, &[0, 0, 0]);
        assert_eq!(blanked.decode().unwrap_err(), Rejection::MissingMessageType);

        let bogus = Datagram::new(MessageType::Discover).set(242, &[42]);
        assert_eq!(
            bogus.decode().unwrap_err(),
            Rejection::UnknownMessageType(vec![42])
        );
    }

    #[test]
    fn test_truncated_option_rejected() {
        let mut bytes = Datagram::new(MessageType::Discover).bytes;
        bytes.extend_from_slice(&[OptionCode::LeaseTime as u8, 4, 0, 0]);

        assert_eq!(
            DhcpPacket::decode_and_validate(&bytes).unwrap_err(),
            Rejection::Options(DecodeError::Truncated { code: 51, offset: 3 })
        );
    }

    #[test]
    fn test_missing_end_marker_accepted() {
        let bytes = Datagram::new(MessageType::Discover).bytes;
        let packet = DhcpPacket::decode_and_validate(&bytes).unwrap();
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn test_cookie_and_hops_not_checked() {
        let packet = Datagram::new(MessageType::Discover)
            .set(layout::COOKIE, &[0, 0, 0, 0])
            .set(3, &[17])
            .decode()
            .unwrap();
        assert_eq!(packet.cookie, [0, 0, 0, 0]);
        assert_eq!(packet.hops, 17);
    }

    #[test]
    fn test_validate_rejects_own_reply() {
        let request = DhcpPacket::parse(&Datagram::new(MessageType::Discover).end()).unwrap();
        assert_eq!(request.validate(), Ok(MessageType::Discover));

        let offer = DhcpPacket::create_reply(&request, MessageType::Offer, OFFERED, SERVER, vec![]);
        assert_eq!(offer.validate(), Err(Rejection::Operation(BOOTREPLY)));
    }

    #[test]
    fn test_reply_copies_request_fields() {
        let relay = Ipv4Addr::new(192, 168, 2, 1);
        let request = Datagram::new(MessageType::Discover)
            .set(layout::GIADDR, &relay.octets())
            .decode()
            .unwrap();

        let offer = DhcpPacket::create_reply(
            &request,
            MessageType::Offer,
            OFFERED,
            SERVER,
            vec![DhcpOption::LeaseTime(3600)],
        );

        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.xid, request.xid);
        assert_eq!(offer.yiaddr, OFFERED);
        assert_eq!(offer.siaddr, SERVER);
        assert_eq!(offer.giaddr, relay);
        assert_eq!(offer.flags, FLAG_BROADCAST);
        assert_eq!(offer.chaddr, request.chaddr);
        assert_eq!(
            offer.options,
            vec![
                DhcpOption::MessageType(MessageType::Offer),
                DhcpOption::LeaseTime(3600)
            ]
        );

        let encoded = offer.encode();
        assert_eq!(&encoded[layout::COOKIE..layout::COOKIE + 4], &DHCP_MAGIC_COOKIE);
    }

    #[test]
    fn test_nak_clears_ciaddr() {
        let bound = Ipv4Addr::new(192, 168, 1, 120);
        let request = Datagram::new(MessageType::Request)
            .set(layout::CIADDR, &bound.octets())
            .decode()
            .unwrap();

        let ack = DhcpPacket::create_reply(&request, MessageType::Ack, bound, SERVER, vec![]);
        assert_eq!(ack.ciaddr, bound);

        let nak = DhcpPacket::create_reply(
            &request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            SERVER,
            vec![],
        );
        assert_eq!(nak.ciaddr, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_client_id_prefers_option_61() {
        let explicit = Datagram::new(MessageType::Discover)
            .option(OptionCode::ClientIdentifier as u8, &[0, b'h', b'o', b's', b't'])
            .decode()
            .unwrap();
        assert_eq!(explicit.client_id(), vec![0, b'h', b'o', b's', b't']);

        let implicit = Datagram::new(MessageType::Discover).decode().unwrap();
        let mut expected = vec![HTYPE_ETHERNET];
        expected.extend_from_slice(&MAC);
        assert_eq!(implicit.client_id(), expected);
    }

    #[test]
    fn test_chaddr_bytes_clamped_to_field() {
        let packet =
            DhcpPacket::parse(&Datagram::new(MessageType::Discover).set(2, &[200]).end()).unwrap();
        assert_eq!(packet.chaddr_bytes().len(), 16);
    }

    #[test]
    fn test_overloaded_areas_read_file_then_sname() {
        let packet = Datagram::new(MessageType::Discover)
            .option(OptionCode::OptionOverload as u8, &[3])
            .set(layout::SNAME, &[OptionCode::Hostname as u8, 5])
            .set(layout::SNAME + 2, b"sname")
            .set(layout::SNAME + 7, &[OptionCode::End as u8])
            .set(layout::FILE, &[OptionCode::DomainName as u8, 10])
            .set(layout::FILE + 2, b"file.local")
            .set(layout::FILE + 12, &[OptionCode::End as u8])
            .decode()
            .unwrap();

        let tail: Vec<_> = packet.options.iter().skip(2).cloned().collect();
        assert_eq!(
            tail,
            vec![
                DhcpOption::DomainName("file.local".to_string()),
                DhcpOption::Hostname("sname".to_string())
            ]
        );
    }

    #[test]
    fn test_overloaded_area_must_decode() {
        let result = Datagram::new(MessageType::Discover)
            .option(OptionCode::OptionOverload as u8, &[1])
            .set(layout::FILE + 126, &[OptionCode::Hostname as u8, 9])
            .decode();
        assert!(matches!(result, Err(Rejection::Options(_))));
    }

    #[test]
    fn test_relay_agent_info() {
        let packet = Datagram::new(MessageType::Discover)
            .option(OptionCode::RelayAgentInfo as u8, &[1, 2, 3, 4, 5])
            .decode()
            .unwrap();
        assert_eq!(packet.relay_agent_info(), Some(&[1u8, 2, 3, 4, 5][..]));
    }
}
