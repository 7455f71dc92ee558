//! Message options and the options-region codec.
//!
//! Options convey everything the fixed header cannot: the message type,
//! the requested address, the lease duration and so on. Each option is
//! encoded as TLV: a code byte, a length byte, then `length` content bytes.
//!
//! The options region of a message is exactly [`OPTIONS_REGION_SIZE`] bytes.
//! Encoding writes options back to back and zero-fills the rest; decoding
//! skips zero bytes as padding and reads entries until the region ends.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Size of the options region (576-byte message minus the 240-byte header).
pub const OPTIONS_REGION_SIZE: usize = 336;

/// Largest content an option can carry (the length field is one byte).
pub const MAX_OPTION_CONTENT: usize = 255;

/// Option codes understood by the client and server.
///
/// Other codes are carried through as raw [`DhcpOption`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding, skipped by the decoder.
    Pad = 0,
    /// Address the client asks for.
    RequestedIpAddress = 50,
    /// Lease duration in seconds.
    LeaseTime = 51,
    /// Message kind, see [`MessageType`].
    MessageType = 53,
    /// Address of the server that produced an offer.
    ServerIdentifier = 54,
    /// Option codes the client wants back.
    ParameterRequestList = 55,
    /// Largest message the sender accepts.
    MaximumMessageSize = 57,
    /// End of meaningful content.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            57 => Ok(Self::MaximumMessageSize),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// Message kinds carried in option 53.
///
/// A RELEASE normally travels without option 53 at all (see
/// [`Message::is_release`](crate::Message::is_release)); the explicit
/// [`Release`](Self::Release) value is accepted from peers that send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with an address offer.
    Offer = 2,
    /// Client request for the offered (or currently held) address.
    Request = 3,
    /// Server acknowledgement carrying the lease duration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client gives its address back.
    Release = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
        }
    }
}

/// A single option: a code and up to 255 content bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    code: u8,
    content: Vec<u8>,
}

impl DhcpOption {
    /// Creates an option from a raw code and content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOption`] for the pad code, for an end marker
    /// with content, or for content longer than 255 bytes.
    pub fn new(code: u8, content: impl Into<Vec<u8>>) -> Result<Self> {
        let content = content.into();

        if code == OptionCode::Pad as u8 {
            return Err(Error::InvalidOption(
                "code 0 is reserved for padding".to_string(),
            ));
        }

        if code == OptionCode::End as u8 && !content.is_empty() {
            return Err(Error::InvalidOption(
                "end marker must have empty content".to_string(),
            ));
        }

        if content.len() > MAX_OPTION_CONTENT {
            return Err(Error::InvalidOption(format!(
                "option {} content is {} bytes (maximum {})",
                code,
                content.len(),
                MAX_OPTION_CONTENT
            )));
        }

        Ok(Self { code, content })
    }

    pub fn message_type(message_type: MessageType) -> Self {
        Self {
            code: OptionCode::MessageType as u8,
            content: vec![message_type as u8],
        }
    }

    pub fn requested_address(address: Ipv4Addr) -> Self {
        Self {
            code: OptionCode::RequestedIpAddress as u8,
            content: address.octets().to_vec(),
        }
    }

    pub fn lease_time(seconds: u32) -> Self {
        Self {
            code: OptionCode::LeaseTime as u8,
            content: seconds.to_be_bytes().to_vec(),
        }
    }

    pub fn server_identifier(address: Ipv4Addr) -> Self {
        Self {
            code: OptionCode::ServerIdentifier as u8,
            content: address.octets().to_vec(),
        }
    }

    pub fn maximum_message_size(size: u16) -> Self {
        Self {
            code: OptionCode::MaximumMessageSize as u8,
            content: size.to_be_bytes().to_vec(),
        }
    }

    pub fn parameter_request_list(codes: &[u8]) -> Result<Self> {
        Self::new(OptionCode::ParameterRequestList as u8, codes)
    }

    /// The end marker (code 255, empty content).
    pub fn end() -> Self {
        Self {
            code: OptionCode::End as u8,
            content: Vec::new(),
        }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Number of bytes this option occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        2 + self.content.len()
    }

    /// Interprets the content as a 4-byte network address.
    pub fn as_address(&self) -> Result<Ipv4Addr> {
        let octets: [u8; 4] = self.content.as_slice().try_into().map_err(|_| {
            Error::malformed(
                "options",
                format!(
                    "option {} must be 4 bytes, got {}",
                    self.code,
                    self.content.len()
                ),
            )
        })?;
        Ok(Ipv4Addr::from(octets))
    }

    /// Interprets the content as a big-endian 32-bit integer.
    pub fn as_u32(&self) -> Result<u32> {
        let bytes: [u8; 4] = self.content.as_slice().try_into().map_err(|_| {
            Error::malformed(
                "options",
                format!(
                    "option {} must be 4 bytes, got {}",
                    self.code,
                    self.content.len()
                ),
            )
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Interprets the content as a single message-type byte.
    pub fn as_message_type(&self) -> Result<MessageType> {
        match self.content.as_slice() {
            [value] => MessageType::try_from(*value).map_err(|value| {
                Error::malformed("options", format!("unknown message type {}", value))
            }),
            other => Err(Error::malformed(
                "options",
                format!("message type must be 1 byte, got {}", other.len()),
            )),
        }
    }

    fn encode_into(&self, out: &mut [u8]) {
        out[0] = self.code;
        out[1] = self.content.len() as u8;
        out[2..2 + self.content.len()].copy_from_slice(&self.content);
    }
}

/// An ordered collection of options with unique codes.
///
/// Insertion order is preserved for wire output. Inserting an option whose
/// code is already present replaces the existing entry in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionsList {
    options: Vec<DhcpOption>,
}

impl OptionsList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `option` and returns the list, for building lists inline.
    pub fn with(mut self, option: DhcpOption) -> Self {
        self.insert(option);
        self
    }

    /// Adds `option`, returning the entry it replaced if the code was present.
    pub fn insert(&mut self, option: DhcpOption) -> Option<DhcpOption> {
        match self.options.iter_mut().find(|o| o.code == option.code) {
            Some(existing) => Some(std::mem::replace(existing, option)),
            None => {
                self.options.push(option);
                None
            }
        }
    }

    pub fn get(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }

    /// Like [`get`](Self::get), but absence is an [`Error::OptionNotFound`].
    pub fn require(&self, code: u8) -> Result<&DhcpOption> {
        self.get(code).ok_or(Error::OptionNotFound(code))
    }

    pub fn contains(&self, code: u8) -> bool {
        self.get(code).is_some()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhcpOption> {
        self.options.iter()
    }

    /// Total bytes the options occupy when encoded.
    pub fn encoded_len(&self) -> usize {
        self.options.iter().map(DhcpOption::encoded_len).sum()
    }

    /// Returns the message type (option 53), `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if the option is present but its
    /// content is not a single known message-type byte.
    pub fn message_type(&self) -> Result<Option<MessageType>> {
        self.get(OptionCode::MessageType as u8)
            .map(DhcpOption::as_message_type)
            .transpose()
    }

    /// Returns the requested address (option 50), `None` when absent.
    pub fn requested_address(&self) -> Result<Option<Ipv4Addr>> {
        self.get(OptionCode::RequestedIpAddress as u8)
            .map(DhcpOption::as_address)
            .transpose()
    }

    /// Returns the server identifier (option 54), `None` when absent.
    pub fn server_identifier(&self) -> Result<Option<Ipv4Addr>> {
        self.get(OptionCode::ServerIdentifier as u8)
            .map(DhcpOption::as_address)
            .transpose()
    }

    /// Returns the lease duration in seconds (option 51), `None` when absent.
    pub fn lease_time(&self) -> Result<Option<u32>> {
        self.get(OptionCode::LeaseTime as u8)
            .map(DhcpOption::as_u32)
            .transpose()
    }

    /// Encodes the options into a zero-filled options region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OptionsOverflow`] if the options need more than
    /// [`OPTIONS_REGION_SIZE`] bytes.
    pub fn encode(&self) -> Result<[u8; OPTIONS_REGION_SIZE]> {
        let size = self.encoded_len();
        if size > OPTIONS_REGION_SIZE {
            return Err(Error::OptionsOverflow {
                size,
                capacity: OPTIONS_REGION_SIZE,
            });
        }

        let mut region = [0u8; OPTIONS_REGION_SIZE];
        let mut index = 0;
        for option in &self.options {
            option.encode_into(&mut region[index..]);
            index += option.encoded_len();
        }

        Ok(region)
    }

    /// Decodes an options region.
    ///
    /// Zero bytes are padding. The end marker is decoded like any other
    /// option; scanning continues until the input is exhausted. A repeated
    /// code keeps its first occurrence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if an option's length byte or
    /// content runs past the end of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut list = Self::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            let Some(&length) = data.get(index + 1) else {
                if code == OptionCode::End as u8 {
                    list.insert(DhcpOption::end());
                    break;
                }
                return Err(Error::malformed(
                    "options",
                    format!("option {} at offset {} has no length byte", code, index),
                ));
            };

            let start = index + 2;
            let end = start + length as usize;
            if end > data.len() {
                return Err(Error::malformed(
                    "options",
                    format!(
                        "option {} at offset {} needs {} bytes, {} remain",
                        code,
                        index,
                        length,
                        data.len() - start
                    ),
                ));
            }

            if list.contains(code) {
                tracing::debug!("Ignoring repeated option {}", code);
            } else {
                list.options.push(DhcpOption {
                    code,
                    content: data[start..end].to_vec(),
                });
            }

            index = end;
        }

        Ok(list)
    }
}

impl FromIterator<DhcpOption> for OptionsList {
    fn from_iter<I: IntoIterator<Item = DhcpOption>>(iter: I) -> Self {
        let mut list = Self::new();
        for option in iter {
            list.insert(option);
        }
        list
    }
}

impl<'a> IntoIterator for &'a OptionsList {
    type Item = &'a DhcpOption;
    type IntoIter = std::slice::Iter<'a, DhcpOption>;

    fn into_iter(self) -> Self::IntoIter {
        self.options.iter()
    }
}
