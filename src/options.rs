//! DHCP options as defined in RFC 2132 and the TLV codec that carries them.
//!
//! Every option is a code byte, a length byte and that many value bytes.
//! Pad (0) and End (255) are the exceptions: a lone code byte each.
//!
//! [`decode`] walks an option stream and [`encode`] writes one back, always
//! terminated by an End marker. Options whose payload does not fit the typed
//! shape of their code are kept as [`DhcpOption::Unknown`] so nothing a
//! client sends is lost.
//!
//! See RFC 2132 for the option catalogue and RFC 3046 for Option 82.

use std::net::Ipv4Addr;

/// Address lists longer than this don't fit a single length byte.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Option codes the engine interprets. Anything else decodes to
/// [`DhcpOption::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    /// `sname` and/or `file` carry more options (RFC 2132 §9.3).
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    /// T1.
    RenewalTime = 58,
    /// T2.
    RebindingTime = 59,
    ClientIdentifier = 61,
    RelayAgentInfo = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::Hostname),
            15 => Ok(Self::DomainName),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            61 => Ok(Self::ClientIdentifier),
            82 => Ok(Self::RelayAgentInfo),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// Value of Option 53. Only 1 through 8 are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    /// Sent by the server in answer to a DISCOVER.
    Offer = 2,
    Request = 3,
    /// The client found the address already in use on the link.
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    /// Configuration only, no address.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl MessageType {
    /// Upper-case name used in log lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

/// Which header fields an Option 52 hands over to the option stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl OverloadFlag {
    /// `file` is read before `sname`, per RFC 2131 §4.1.
    pub fn carries_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }

    pub fn carries_sname(self) -> bool {
        matches!(self, Self::Sname | Self::Both)
    }
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// Byte-level failure while walking an option stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// An option's length byte, or the value it declares, runs past the
    /// end of the buffer.
    #[error("option {code} at offset {offset} is truncated")]
    Truncated {
        /// Code of the offending option.
        code: u8,
        /// Offset of its code byte within the stream.
        offset: usize,
    },
}

/// One option, typed where the engine cares about its value.
///
/// A code the engine doesn't interpret, or a known code carrying a value of
/// the wrong shape, stays [`Unknown`](Self::Unknown) with its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// The first entry is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    RenewalTime(u32),
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    /// Opaque sub-options, echoed back to the relay untouched.
    RelayAgentInfo(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn ipv4(data: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = data.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

fn ipv4_list(data: &[u8]) -> Option<Vec<Ipv4Addr>> {
    if data.is_empty() || data.len() % 4 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(4)
            .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
            .collect(),
    )
}

fn seconds(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn single(data: &[u8]) -> Option<u8> {
    match data {
        [value] => Some(*value),
        _ => None,
    }
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Interprets one option from its code and value bytes.
    ///
    /// A payload that does not match the shape its code calls for (a
    /// subnet mask that isn't 4 bytes, a message type outside 1..=8) is
    /// kept verbatim as [`Unknown`](Self::Unknown).
    pub fn parse(code: u8, data: &[u8]) -> Self {
        let typed = match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => ipv4(data).map(Self::SubnetMask),
            Ok(OptionCode::Router) => ipv4_list(data).map(Self::Router),
            Ok(OptionCode::DnsServer) => ipv4_list(data).map(Self::DnsServer),
            Ok(OptionCode::Hostname) => {
                Some(Self::Hostname(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::DomainName) => {
                Some(Self::DomainName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::BroadcastAddress) => ipv4(data).map(Self::BroadcastAddress),
            Ok(OptionCode::RequestedIpAddress) => ipv4(data).map(Self::RequestedIpAddress),
            Ok(OptionCode::LeaseTime) => seconds(data).map(Self::LeaseTime),
            Ok(OptionCode::OptionOverload) => single(data)
                .and_then(|value| OverloadFlag::try_from(value).ok())
                .map(Self::OptionOverload),
            Ok(OptionCode::MessageType) => single(data)
                .and_then(|value| MessageType::try_from(value).ok())
                .map(Self::MessageType),
            Ok(OptionCode::ServerIdentifier) => ipv4(data).map(Self::ServerIdentifier),
            Ok(OptionCode::ParameterRequestList) => Some(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::RenewalTime) => seconds(data).map(Self::RenewalTime),
            Ok(OptionCode::RebindingTime) => seconds(data).map(Self::RebindingTime),
            Ok(OptionCode::ClientIdentifier) if !data.is_empty() => {
                Some(Self::ClientIdentifier(data.to_vec()))
            }
            Ok(OptionCode::RelayAgentInfo) => Some(Self::RelayAgentInfo(data.to_vec())),
            _ => None,
        };

        typed.unwrap_or_else(|| Self::Unknown(code, data.to_vec()))
    }

    /// Writes `code`, `length` and value. Values longer than 255 bytes are
    /// cut to fit the length byte.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        match self {
            Self::SubnetMask(address)
            | Self::BroadcastAddress(address)
            | Self::RequestedIpAddress(address)
            | Self::ServerIdentifier(address) => tlv(code, &address.octets()),
            Self::Router(list) | Self::DnsServer(list) => {
                let value: Vec<u8> = list
                    .iter()
                    .take(MAX_ADDRESSES_PER_OPTION)
                    .flat_map(|address| address.octets())
                    .collect();
                tlv(code, &value)
            }
            Self::Hostname(text) | Self::DomainName(text) => tlv(code, text.as_bytes()),
            Self::LeaseTime(secs) | Self::RenewalTime(secs) | Self::RebindingTime(secs) => {
                tlv(code, &secs.to_be_bytes())
            }
            Self::OptionOverload(flag) => tlv(code, &[*flag as u8]),
            Self::MessageType(kind) => tlv(code, &[*kind as u8]),
            Self::ParameterRequestList(bytes)
            | Self::ClientIdentifier(bytes)
            | Self::RelayAgentInfo(bytes)
            | Self::Unknown(_, bytes) => tlv(code, bytes),
        }
    }
}

fn tlv(code: u8, value: &[u8]) -> Vec<u8> {
    let length = value.len().min(u8::MAX as usize);
    let mut out = Vec::with_capacity(length + 2);
    out.push(code);
    out.push(length as u8);
    out.extend_from_slice(&value[..length]);
    out
}

/// Decodes a TLV option stream.
///
/// Pad bytes are skipped. Decoding stops at the End marker, or when the
/// buffer runs out; a stream without an End marker is accepted.
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] if an option's length byte is missing
/// or its declared length reads past the end of `data`.
pub fn decode(data: &[u8]) -> std::result::Result<Vec<DhcpOption>, DecodeError> {
    let mut options = Vec::new();
    let mut index = 0;

    while index < data.len() {
        let code = data[index];

        if code == OptionCode::Pad as u8 {
            index += 1;
            continue;
        }

        if code == OptionCode::End as u8 {
            break;
        }

        let truncated = DecodeError::Truncated {
            code,
            offset: index,
        };

        let Some(&length) = data.get(index + 1) else {
            return Err(truncated);
        };

        let start = index + 2;
        let end = start + length as usize;
        let Some(value) = data.get(start..end) else {
            return Err(truncated);
        };

        options.push(DhcpOption::parse(code, value));
        index = end;
    }

    Ok(options)
}

/// Encodes options back into a TLV stream terminated by the End marker.
pub fn encode(options: &[DhcpOption]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for option in options {
        buffer.extend_from_slice(&option.encode());
    }
    buffer.push(OptionCode::End as u8);
    buffer
}
