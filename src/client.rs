//! Client side of the leasing protocol.
//!
//! ```text
//! Init --DISCOVER--> Selecting --OFFER/REQUEST--> Requesting --ACK--> Bound
//!   ^                                                 |                 |
//!   +---------------------- NAK / timeout ------------+                 |
//!   +------------------------------------ RELEASE <-- Releasing <-------+
//! ```
//!
//! Every wait is bounded: each exchange step is sent up to
//! `max_retries + 1` times, each send followed by one reply deadline. A
//! failed acquisition starts over from DISCOVER at most `max_restarts` times.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::{HardwareAddress, Message, OpCode};
use crate::options::{MessageType, OptionCode};
use crate::transport::{Transport, UdpTransport};

/// Where the client is in the acquisition sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Selecting,
    Requesting,
    Bound,
    Releasing,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Init => "INIT",
            ClientState::Selecting => "SELECTING",
            ClientState::Requesting => "REQUESTING",
            ClientState::Bound => "BOUND",
            ClientState::Releasing => "RELEASING",
        };
        write!(f, "{}", name)
    }
}

/// A lease granted by an ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLease {
    pub address: Ipv4Addr,
    /// Server identifier of the granting server.
    pub server: Ipv4Addr,
    pub lease_duration_seconds: u32,
    pub acquired_at: DateTime<Utc>,
}

impl ClientLease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + TimeDelta::seconds(i64::from(self.lease_duration_seconds))
    }

    /// When the lease should be renewed: halfway through.
    pub fn renew_at(&self) -> DateTime<Utc> {
        self.acquired_at + TimeDelta::milliseconds(i64::from(self.lease_duration_seconds) * 500)
    }
}

/// A protocol client holding at most one lease.
pub struct DhcpClient<T: Transport = UdpTransport> {
    transport: T,
    hardware_address: HardwareAddress,
    server_address: SocketAddr,
    reply_timeout: Duration,
    max_retries: u32,
    max_restarts: u32,
    max_message_size: u16,
    state: ClientState,
    lease: Option<ClientLease>,
}

impl DhcpClient<UdpTransport> {
    /// Binds a UDP socket at `config.bind_address` and builds a client on it.
    pub fn bind(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind_address)?;
        Self::new(transport, config)
    }
}

impl<T: Transport> DhcpClient<T> {
    pub fn new(transport: T, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            hardware_address: config.hardware_address()?,
            server_address: config.server_address,
            reply_timeout: config.reply_timeout(),
            max_retries: config.max_retries,
            max_restarts: config.max_restarts,
            max_message_size: config.max_message_size,
            state: ClientState::Init,
            lease: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn lease(&self) -> Option<&ClientLease> {
        self.lease.as_ref()
    }

    pub fn hardware_address(&self) -> &HardwareAddress {
        &self.hardware_address
    }

    /// Runs DISCOVER, OFFER, REQUEST, ACK until bound.
    ///
    /// A NAK, a timeout or a transport error restarts the sequence from
    /// DISCOVER with a fresh xid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AcquisitionFailed`] once the restart budget is spent.
    pub async fn acquire(&mut self) -> Result<ClientLease> {
        let attempts = self.max_restarts.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_acquire().await {
                Ok(lease) => return Ok(lease),
                Err(error) => {
                    warn!(attempt, %error, "Acquisition attempt failed");
                    last_error = Some(error);
                }
            }
        }

        self.state = ClientState::Init;
        Err(Error::AcquisitionFailed {
            attempts,
            reason: last_error.map(|error| error.to_string()).unwrap_or_default(),
        })
    }

    async fn try_acquire(&mut self) -> Result<ClientLease> {
        self.state = ClientState::Init;
        self.lease = None;

        let xid = rand::random::<u32>();
        let discover = Message::discover(self.hardware_address, xid, self.max_message_size);

        self.state = ClientState::Selecting;
        info!(xid, client = %self.hardware_address, "Sending DISCOVER");
        let offer = self
            .exchange(&discover, |message_type| message_type == MessageType::Offer)
            .await?;

        let offered = offer.yiaddr();
        let server = offer
            .options()
            .server_identifier()?
            .unwrap_or(offer.siaddr());
        info!(%offered, %server, "Received OFFER");

        let request = Message::request(
            self.hardware_address,
            xid,
            offered,
            server,
            Ipv4Addr::UNSPECIFIED,
        );

        self.state = ClientState::Requesting;
        let reply = self.exchange(&request, is_ack_or_nak).await?;
        self.bind_from_reply(&reply, server, offered)
    }

    /// Extends the current lease with the server at `server`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBound`] without a lease, [`Error::Nak`] if the
    /// server refuses (the lease is dropped), or [`Error::Timeout`]. On any
    /// error other than a NAK the client stays bound to its current lease.
    pub async fn renew(&mut self, server: Ipv4Addr) -> Result<ClientLease> {
        let address = self.lease.as_ref().ok_or(Error::NotBound)?.address;

        let xid = rand::random::<u32>();
        let request = Message::request(self.hardware_address, xid, address, server, address);
        let destination = self.destination_for(server);

        info!(%address, %server, "Renewing lease");
        self.state = ClientState::Requesting;
        let result = match self
            .exchange_with(&request, destination, is_ack_or_nak)
            .await
        {
            Ok(reply) => self.bind_from_reply(&reply, server, address),
            Err(error) => Err(error),
        };

        // Only a NAK ends the lease; anything else leaves it in place.
        if let Err(error) = &result
            && !matches!(error, Error::Nak { .. })
        {
            self.state = ClientState::Bound;
        }
        result
    }

    /// Gives the lease back. Does not wait for a reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBound`] without a lease. The lease is forgotten
    /// even if sending fails.
    pub async fn release(&mut self) -> Result<()> {
        let lease = self.lease.take().ok_or(Error::NotBound)?;
        self.state = ClientState::Releasing;

        let release = Message::release(self.hardware_address, rand::random(), lease.address);
        let destination = self.destination_for(lease.server);
        let sent = match release.encode() {
            Ok(bytes) => self.transport.send(&bytes, destination).await,
            Err(error) => Err(error),
        };

        self.state = ClientState::Init;
        sent?;
        info!(address = %lease.address, server = %lease.server, "Released lease");
        Ok(())
    }

    fn bind_from_reply(
        &mut self,
        reply: &Message,
        server: Ipv4Addr,
        requested: Ipv4Addr,
    ) -> Result<ClientLease> {
        if reply.message_type()? == Some(MessageType::Nak) {
            warn!(%server, address = %requested, "Received NAK");
            self.lease = None;
            self.state = ClientState::Init;
            return Err(Error::Nak {
                server,
                address: requested,
            });
        }

        let lease_duration_seconds = reply
            .options()
            .require(OptionCode::LeaseTime as u8)?
            .as_u32()?;

        let lease = ClientLease {
            address: reply.yiaddr(),
            server,
            lease_duration_seconds,
            acquired_at: Utc::now(),
        };

        info!(
            address = %lease.address,
            server = %lease.server,
            "Bound (lease: {} seconds)",
            lease.lease_duration_seconds
        );

        self.lease = Some(lease.clone());
        self.state = ClientState::Bound;
        Ok(lease)
    }

    fn destination_for(&self, server: Ipv4Addr) -> SocketAddr {
        if server.is_unspecified() {
            self.server_address
        } else {
            SocketAddr::new(server.into(), self.server_address.port())
        }
    }

    async fn exchange(
        &self,
        message: &Message,
        accept: impl Fn(MessageType) -> bool,
    ) -> Result<Message> {
        self.exchange_with(message, self.server_address, accept).await
    }

    /// Sends `message` and waits for a correlated reply, resending after
    /// each deadline up to `max_retries` times.
    async fn exchange_with(
        &self,
        message: &Message,
        destination: SocketAddr,
        accept: impl Fn(MessageType) -> bool,
    ) -> Result<Message> {
        let bytes = message.encode()?;

        for attempt in 0..=self.max_retries {
            self.transport.send(&bytes, destination).await?;

            let deadline = Instant::now() + self.reply_timeout;
            if let Some(reply) = self.wait_for_reply(message.xid(), deadline, &accept).await? {
                return Ok(reply);
            }
            debug!(xid = message.xid(), attempt, "No reply before deadline");
        }

        Err(Error::Timeout(self.reply_timeout))
    }

    /// Returns the first reply carrying `xid`, our hardware address and an
    /// accepted message type. Anything else is discarded. `None` means the
    /// deadline passed.
    async fn wait_for_reply(
        &self,
        xid: u32,
        deadline: Instant,
        accept: &impl Fn(MessageType) -> bool,
    ) -> Result<Option<Message>> {
        loop {
            let Ok(received) = tokio::time::timeout_at(deadline, self.transport.receive()).await
            else {
                return Ok(None);
            };
            let (bytes, source) = received?;

            let reply = match Message::decode(&bytes) {
                Ok(reply) => reply,
                Err(error) => {
                    debug!(%source, %error, "Discarding undecodable datagram");
                    continue;
                }
            };

            if reply.op() != OpCode::BootReply
                || reply.xid() != xid
                || *reply.chaddr() != self.hardware_address
            {
                debug!(%source, xid = reply.xid(), "Discarding uncorrelated reply");
                continue;
            }

            match reply.message_type() {
                Ok(Some(message_type)) if accept(message_type) => return Ok(Some(reply)),
                other => debug!(%source, ?other, "Discarding reply of unexpected type"),
            }
        }
    }
}

fn is_ack_or_nak(message_type: MessageType) -> bool {
    matches!(message_type, MessageType::Ack | MessageType::Nak)
}
