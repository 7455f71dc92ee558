//! The fixed-size message envelope and its codec.
//!
//! Every message is exactly [`MESSAGE_SIZE`] bytes on the wire: a 236-byte
//! header, a 4-byte magic cookie, and a 336-byte options region.
//!
//! # Message Layout
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                          sname (64)                           |
//! +---------------------------------------------------------------+
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |                 magic cookie (4) = 63 82 53 63                |
//! +---------------------------------------------------------------+
//! |                 options (336, TLV, zero-padded)               |
//! +---------------------------------------------------------------+
//! ```
//!
//! [`Message`] is an immutable value. Build one with [`MessageBuilder`] or
//! with the per-kind constructors ([`Message::discover`], [`Message::offer`],
//! and so on); derive a variant with [`Message::to_builder`].

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OPTIONS_REGION_SIZE, OptionCode, OptionsList};

/// Total encoded size of every message.
pub const MESSAGE_SIZE: usize = 576;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const XID_OFFSET: usize = 4;
const SECS_OFFSET: usize = XID_OFFSET + 4;
const FLAGS_OFFSET: usize = SECS_OFFSET + 2;
const CIADDR_OFFSET: usize = FLAGS_OFFSET + 2;
const YIADDR_OFFSET: usize = CIADDR_OFFSET + 4;
const SIADDR_OFFSET: usize = YIADDR_OFFSET + 4;
const GIADDR_OFFSET: usize = SIADDR_OFFSET + 4;
const CHADDR_OFFSET: usize = GIADDR_OFFSET + 4;
const CHADDR_SIZE: usize = 16;
const SNAME_OFFSET: usize = CHADDR_OFFSET + CHADDR_SIZE;
const SNAME_SIZE: usize = 64;
const FILE_OFFSET: usize = SNAME_OFFSET + SNAME_SIZE;
const FILE_SIZE: usize = 128;
const COOKIE_OFFSET: usize = FILE_OFFSET + FILE_SIZE;
const OPTIONS_OFFSET: usize = COOKIE_OFFSET + MAGIC_COOKIE.len();

/// Bit 15 of `flags`: the sender wants the reply broadcast.
pub const BROADCAST_FLAG: u16 = 0x8000;

/// Hardware type for Ethernet.
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet.
pub const HLEN_ETHERNET: u8 = 6;

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Client to server.
    BootRequest = 1,
    /// Server to client.
    BootReply = 2,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::BootRequest),
            2 => Ok(Self::BootReply),
            other => Err(other),
        }
    }
}

/// Hardware type codes accepted in the `htype` field.
pub fn is_allowed_htype(htype: u8) -> bool {
    matches!(htype, 1 | 6 | 7 | 11 | 12 | 14..=20)
}

/// A client hardware identifier, always 16 bytes on the wire.
///
/// Shorter link-layer addresses are stored zero-padded. All 16 bytes are
/// kept as received; [`trimmed`](Self::trimmed) drops trailing NUL bytes
/// for display and comparison by humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HardwareAddress([u8; CHADDR_SIZE]);

impl HardwareAddress {
    /// The all-zero identifier, used for records with no owner.
    pub const EMPTY: Self = Self([0; CHADDR_SIZE]);

    pub fn new(bytes: [u8; CHADDR_SIZE]) -> Self {
        Self(bytes)
    }

    /// Pads a 6-byte Ethernet address to the 16-byte field.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut bytes = [0u8; CHADDR_SIZE];
        bytes[..6].copy_from_slice(&mac);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHADDR_SIZE] {
        &self.0
    }

    /// The identifier without trailing NUL bytes.
    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|&byte| byte != 0)
            .map_or(0, |position| position + 1);
        &self.0[..end]
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }
}

impl TryFrom<&[u8]> for HardwareAddress {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; CHADDR_SIZE] = bytes.try_into().map_err(|_| {
            Error::malformed(
                "chaddr",
                format!("must be {} bytes, got {}", CHADDR_SIZE, bytes.len()),
            )
        })?;
        Ok(Self(bytes))
    }
}

impl FromStr for HardwareAddress {
    type Err = Error;

    /// Accepts either a colon- or dash-separated Ethernet address
    /// (`aa:bb:cc:dd:ee:ff`) or a 16-byte text identifier.
    fn from_str(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split([':', '-']).collect();
        if parts.len() == 6 {
            let mut mac = [0u8; 6];
            let parsed = parts
                .iter()
                .zip(mac.iter_mut())
                .all(|(part, byte)| match u8::from_str_radix(part, 16) {
                    Ok(value) if part.len() == 2 => {
                        *byte = value;
                        true
                    }
                    _ => false,
                });
            if parsed {
                return Ok(Self::from_mac(mac));
            }
        }

        Self::try_from(value.as_bytes())
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trimmed = self.trimmed();
        if !trimmed.is_empty() && trimmed.iter().all(u8::is_ascii_graphic) {
            return f.write_str(&String::from_utf8_lossy(trimmed));
        }

        let shown = &self.0[..trimmed.len().max(HLEN_ETHERNET as usize)];
        for (index, byte) in shown.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A protocol message.
///
/// Fields are read through accessors; there are no setters. Use
/// [`to_builder`](Self::to_builder) to derive a modified copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    op: OpCode,
    htype: u8,
    hlen: u8,
    hops: u8,
    xid: u32,
    secs: u16,
    flags: u16,
    ciaddr: Ipv4Addr,
    yiaddr: Ipv4Addr,
    siaddr: Ipv4Addr,
    giaddr: Ipv4Addr,
    chaddr: HardwareAddress,
    sname: String,
    file: String,
    options: OptionsList,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Starts a builder pre-filled with this message's fields.
    pub fn to_builder(&self) -> MessageBuilder {
        MessageBuilder {
            message: self.clone(),
        }
    }

    /// A DISCOVER asking any server for an address.
    ///
    /// Carries the message type, the zero address as requested-address
    /// placeholder, the largest message size the client accepts, and the
    /// end marker.
    pub fn discover(chaddr: HardwareAddress, xid: u32, max_message_size: u16) -> Self {
        let options = OptionsList::new()
            .with(DhcpOption::message_type(MessageType::Discover))
            .with(DhcpOption::requested_address(Ipv4Addr::UNSPECIFIED))
            .with(DhcpOption::maximum_message_size(max_message_size))
            .with(DhcpOption::end());

        Self::client_message(chaddr, xid, BROADCAST_FLAG, Ipv4Addr::UNSPECIFIED, options)
    }

    /// A REQUEST for `requested` from the server at `server`.
    ///
    /// `ciaddr` is the address the client currently holds (zero while
    /// acquiring, the bound address while renewing).
    pub fn request(
        chaddr: HardwareAddress,
        xid: u32,
        requested: Ipv4Addr,
        server: Ipv4Addr,
        ciaddr: Ipv4Addr,
    ) -> Self {
        let options = OptionsList::new()
            .with(DhcpOption::message_type(MessageType::Request))
            .with(DhcpOption::requested_address(requested))
            .with(DhcpOption::server_identifier(server))
            .with(DhcpOption::end());

        Self::client_message(chaddr, xid, BROADCAST_FLAG, ciaddr, options)
    }

    /// A RELEASE giving back `ciaddr`.
    ///
    /// It carries no message-type option and a zero `yiaddr`; that pair is
    /// what the server recognizes (see [`is_release`](Self::is_release)).
    pub fn release(chaddr: HardwareAddress, xid: u32, ciaddr: Ipv4Addr) -> Self {
        let options = OptionsList::new().with(DhcpOption::end());
        Self::client_message(chaddr, xid, 0, ciaddr, options)
    }

    /// An OFFER of `offered` in reply to `request`.
    pub fn offer(
        request: &Message,
        offered: Ipv4Addr,
        server: Ipv4Addr,
        lease_seconds: u32,
    ) -> Self {
        Self::reply(
            request,
            MessageType::Offer,
            offered,
            server,
            Some(lease_seconds),
        )
    }

    /// An ACK granting `assigned` for `lease_seconds`.
    pub fn ack(request: &Message, assigned: Ipv4Addr, server: Ipv4Addr, lease_seconds: u32) -> Self {
        Self::reply(
            request,
            MessageType::Ack,
            assigned,
            server,
            Some(lease_seconds),
        )
    }

    /// A NAK refusing `request`.
    pub fn nak(request: &Message, server: Ipv4Addr) -> Self {
        Self::reply(request, MessageType::Nak, Ipv4Addr::UNSPECIFIED, server, None)
    }

    fn client_message(
        chaddr: HardwareAddress,
        xid: u32,
        flags: u16,
        ciaddr: Ipv4Addr,
        options: OptionsList,
    ) -> Self {
        Self {
            op: OpCode::BootRequest,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags,
            ciaddr,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: String::new(),
            file: String::new(),
            options,
        }
    }

    /// Builds a server reply that echoes the request's correlation fields
    /// (`xid`, `htype`, `hlen`, `flags`, `giaddr`, `chaddr`).
    fn reply(
        request: &Message,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server: Ipv4Addr,
        lease_seconds: Option<u32>,
    ) -> Self {
        let mut options = OptionsList::new()
            .with(DhcpOption::message_type(message_type))
            .with(DhcpOption::server_identifier(server));
        if let Some(seconds) = lease_seconds {
            options.insert(DhcpOption::lease_time(seconds));
        }
        options.insert(DhcpOption::end());

        Self {
            op: OpCode::BootReply,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: String::new(),
            file: String::new(),
            options,
        }
    }

    pub fn op(&self) -> OpCode {
        self.op
    }

    pub fn htype(&self) -> u8 {
        self.htype
    }

    pub fn hlen(&self) -> u8 {
        self.hlen
    }

    pub fn hops(&self) -> u8 {
        self.hops
    }

    /// Transaction ID chosen by the client, echoed in replies.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn secs(&self) -> u16 {
        self.secs
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn ciaddr(&self) -> Ipv4Addr {
        self.ciaddr
    }

    pub fn yiaddr(&self) -> Ipv4Addr {
        self.yiaddr
    }

    pub fn siaddr(&self) -> Ipv4Addr {
        self.siaddr
    }

    pub fn giaddr(&self) -> Ipv4Addr {
        self.giaddr
    }

    pub fn chaddr(&self) -> &HardwareAddress {
        &self.chaddr
    }

    pub fn sname(&self) -> &str {
        &self.sname
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn options(&self) -> &OptionsList {
        &self.options
    }

    /// Returns the message type (option 53), `None` when absent.
    pub fn message_type(&self) -> Result<Option<MessageType>> {
        self.options.message_type()
    }

    /// Returns true if this is a client RELEASE.
    ///
    /// A RELEASE is a request-direction message that either has no
    /// message-type option and a zero `yiaddr`, or names
    /// [`MessageType::Release`] explicitly.
    pub fn is_release(&self) -> bool {
        if self.op != OpCode::BootRequest {
            return false;
        }
        if !self.options.contains(OptionCode::MessageType as u8) {
            return self.yiaddr.is_unspecified();
        }
        matches!(self.message_type(), Ok(Some(MessageType::Release)))
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }

    /// Encodes the message into its fixed 576-byte form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if `sname` or `file` do not fit
    /// their fields, or [`Error::OptionsOverflow`] if the options do not fit
    /// the options region.
    pub fn encode(&self) -> Result<[u8; MESSAGE_SIZE]> {
        let mut buffer = [0u8; MESSAGE_SIZE];

        buffer[0] = self.op as u8;
        buffer[1] = self.htype;
        buffer[2] = self.hlen;
        buffer[3] = self.hops;

        buffer[XID_OFFSET..SECS_OFFSET].copy_from_slice(&self.xid.to_be_bytes());
        buffer[SECS_OFFSET..FLAGS_OFFSET].copy_from_slice(&self.secs.to_be_bytes());
        buffer[FLAGS_OFFSET..CIADDR_OFFSET].copy_from_slice(&self.flags.to_be_bytes());

        buffer[CIADDR_OFFSET..YIADDR_OFFSET].copy_from_slice(&self.ciaddr.octets());
        buffer[YIADDR_OFFSET..SIADDR_OFFSET].copy_from_slice(&self.yiaddr.octets());
        buffer[SIADDR_OFFSET..GIADDR_OFFSET].copy_from_slice(&self.siaddr.octets());
        buffer[GIADDR_OFFSET..CHADDR_OFFSET].copy_from_slice(&self.giaddr.octets());

        buffer[CHADDR_OFFSET..SNAME_OFFSET].copy_from_slice(self.chaddr.as_bytes());
        write_text(&mut buffer[SNAME_OFFSET..FILE_OFFSET], "sname", &self.sname)?;
        write_text(&mut buffer[FILE_OFFSET..COOKIE_OFFSET], "file", &self.file)?;

        buffer[COOKIE_OFFSET..OPTIONS_OFFSET].copy_from_slice(&MAGIC_COOKIE);
        buffer[OPTIONS_OFFSET..].copy_from_slice(&self.options.encode()?);

        Ok(buffer)
    }

    /// Decodes a message.
    ///
    /// The options region is read from offset 240 up to 576 bytes or the end
    /// of `data`, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if:
    /// - `data` is shorter than the 240-byte header and cookie
    /// - the cookie is not `63 82 53 63`
    /// - `op` is not 1 or 2, or `htype` is not an allowed hardware type
    /// - the options region is truncated
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < OPTIONS_OFFSET {
            return Err(Error::malformed(
                "length",
                format!(
                    "{} bytes is shorter than the {}-byte header",
                    data.len(),
                    OPTIONS_OFFSET
                ),
            ));
        }

        if data[COOKIE_OFFSET..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(Error::malformed("cookie", "invalid magic cookie"));
        }

        let op = OpCode::try_from(data[0])
            .map_err(|value| Error::malformed("op", format!("{} is not 1 or 2", value)))?;

        let htype = data[1];
        if !is_allowed_htype(htype) {
            return Err(Error::malformed(
                "htype",
                format!("{} is not an allowed hardware type", htype),
            ));
        }

        let xid = u32::from_be_bytes(read_array(data, XID_OFFSET));
        let secs = u16::from_be_bytes(read_array(data, SECS_OFFSET));
        let flags = u16::from_be_bytes(read_array(data, FLAGS_OFFSET));

        let ciaddr = Ipv4Addr::from(read_array::<4>(data, CIADDR_OFFSET));
        let yiaddr = Ipv4Addr::from(read_array::<4>(data, YIADDR_OFFSET));
        let siaddr = Ipv4Addr::from(read_array::<4>(data, SIADDR_OFFSET));
        let giaddr = Ipv4Addr::from(read_array::<4>(data, GIADDR_OFFSET));

        let chaddr = HardwareAddress::try_from(&data[CHADDR_OFFSET..SNAME_OFFSET])?;
        let sname = read_text(&data[SNAME_OFFSET..FILE_OFFSET], "sname")?;
        let file = read_text(&data[FILE_OFFSET..COOKIE_OFFSET], "file")?;

        let options_end = data.len().min(MESSAGE_SIZE);
        let options = OptionsList::decode(&data[OPTIONS_OFFSET..options_end])?;

        Ok(Self {
            op,
            htype,
            hlen: data[2],
            hops: data[3],
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&data[offset..offset + N]);
    bytes
}

/// Reads a NUL-padded text field. Invalid UTF-8 is rejected rather than
/// replaced, so a decoded field always re-encodes to the same bytes.
fn read_text(field: &[u8], name: &'static str) -> Result<String> {
    let end = field
        .iter()
        .rposition(|&byte| byte != 0)
        .map_or(0, |position| position + 1);
    String::from_utf8(field[..end].to_vec())
        .map_err(|error| Error::malformed(name, format!("not valid UTF-8: {}", error)))
}

fn write_text(field: &mut [u8], name: &'static str, text: &str) -> Result<()> {
    let bytes = text.as_bytes();
    if bytes.len() > field.len() {
        return Err(Error::malformed(
            name,
            format!("{} bytes exceeds the {}-byte field", bytes.len(), field.len()),
        ));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Builds a [`Message`] field by field, validating on [`build`](Self::build).
///
/// Defaults describe an Ethernet client request with zero addresses, an
/// empty hardware address and no options.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self {
            message: Message {
                op: OpCode::BootRequest,
                htype: HTYPE_ETHERNET,
                hlen: HLEN_ETHERNET,
                hops: 0,
                xid: 0,
                secs: 0,
                flags: 0,
                ciaddr: Ipv4Addr::UNSPECIFIED,
                yiaddr: Ipv4Addr::UNSPECIFIED,
                siaddr: Ipv4Addr::UNSPECIFIED,
                giaddr: Ipv4Addr::UNSPECIFIED,
                chaddr: HardwareAddress::EMPTY,
                sname: String::new(),
                file: String::new(),
                options: OptionsList::new(),
            },
        }
    }
}

impl MessageBuilder {
    pub fn op(mut self, op: OpCode) -> Self {
        self.message.op = op;
        self
    }

    pub fn htype(mut self, htype: u8) -> Self {
        self.message.htype = htype;
        self
    }

    pub fn hlen(mut self, hlen: u8) -> Self {
        self.message.hlen = hlen;
        self
    }

    pub fn hops(mut self, hops: u8) -> Self {
        self.message.hops = hops;
        self
    }

    pub fn xid(mut self, xid: u32) -> Self {
        self.message.xid = xid;
        self
    }

    pub fn secs(mut self, secs: u16) -> Self {
        self.message.secs = secs;
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.message.flags = flags;
        self
    }

    pub fn ciaddr(mut self, address: Ipv4Addr) -> Self {
        self.message.ciaddr = address;
        self
    }

    pub fn yiaddr(mut self, address: Ipv4Addr) -> Self {
        self.message.yiaddr = address;
        self
    }

    pub fn siaddr(mut self, address: Ipv4Addr) -> Self {
        self.message.siaddr = address;
        self
    }

    pub fn giaddr(mut self, address: Ipv4Addr) -> Self {
        self.message.giaddr = address;
        self
    }

    pub fn chaddr(mut self, chaddr: HardwareAddress) -> Self {
        self.message.chaddr = chaddr;
        self
    }

    pub fn sname(mut self, sname: impl Into<String>) -> Self {
        self.message.sname = sname.into();
        self
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.message.file = file.into();
        self
    }

    pub fn options(mut self, options: OptionsList) -> Self {
        self.message.options = options;
        self
    }

    /// Validates and returns the message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if `htype` is not allowed, if
    /// `sname` or `file` contain NUL bytes or exceed their field, and
    /// [`Error::OptionsOverflow`] if the options do not fit.
    pub fn build(self) -> Result<Message> {
        let message = self.message;

        if !is_allowed_htype(message.htype) {
            return Err(Error::malformed(
                "htype",
                format!("{} is not an allowed hardware type", message.htype),
            ));
        }

        for (name, text, size) in [
            ("sname", &message.sname, SNAME_SIZE),
            ("file", &message.file, FILE_SIZE),
        ] {
            if text.contains('\0') {
                return Err(Error::malformed(name, "must not contain NUL bytes"));
            }
            if text.len() > size {
                return Err(Error::malformed(
                    name,
                    format!("{} bytes exceeds the {}-byte field", text.len(), size),
                ));
            }
        }

        let size = message.options.encoded_len();
        if size > OPTIONS_REGION_SIZE {
            return Err(Error::OptionsOverflow {
                size,
                capacity: OPTIONS_REGION_SIZE,
            });
        }

        Ok(message)
    }
}
