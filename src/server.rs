use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::Leases;
use crate::message::{HardwareAddress, Message, OpCode};
use crate::options::MessageType;
use crate::transport::{Transport, UdpTransport};

/// The leasing server.
///
/// Datagrams are handled strictly one at a time by [`operate`](Self::operate);
/// the only other task touching the pool is the expiry sweeper started with
/// [`spawn_sweeper`](Self::spawn_sweeper).
pub struct DhcpServer<T: Transport = UdpTransport> {
    config: Arc<Config>,
    leases: Leases,
    transport: T,
}

impl DhcpServer<UdpTransport> {
    /// Validates `config` and binds a UDP socket at its server address and
    /// port.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind_address())?;
        Self::with_transport(config, transport)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }
}

impl<T: Transport> DhcpServer<T> {
    pub fn with_transport(config: Config, transport: T) -> Result<Self> {
        config.validate()?;
        let leases = Leases::from_config(&config)?;

        info!(
            "Lease server starting on {}:{}",
            config.server_ip, config.server_port
        );
        info!(
            "Address pool: {} - {} ({} addresses, lease {} seconds)",
            config.pool_start,
            config.pool_end,
            config.pool_size(),
            config.lease_duration_seconds
        );

        Ok(Self {
            config: Arc::new(config),
            leases,
            transport,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn leases(&self) -> &Leases {
        &self.leases
    }

    /// Receives and handles datagrams forever.
    ///
    /// Failures while handling a datagram are logged and the loop moves on
    /// to the next one.
    pub async fn operate(&self) -> Result<()> {
        info!("Lease server ready and listening");

        loop {
            match self.transport.receive().await {
                Ok((data, source)) => {
                    if let Err(error) = self.handle_datagram(&data, source).await {
                        warn!("Error handling datagram from {}: {}", source, error);
                    }
                }
                Err(error) => {
                    error!("Error receiving datagram: {}", error);
                }
            }
        }
    }

    /// Starts the periodic expiry sweep on its own task.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let leases = self.leases.clone();
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let freed = leases.sweep_expired().await;
                if freed > 0 {
                    info!("Expired {} lease(s)", freed);
                }
            }
        })
    }

    /// Decodes one datagram, handles it and sends the reply, if any.
    pub async fn handle_datagram(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let message = Message::decode(data)?;

        let Some(reply) = self.handle_message(&message).await? else {
            return Ok(());
        };

        let destination = self.reply_destination(source);
        self.transport.send(&reply.encode()?, destination).await?;
        debug!(%destination, xid = reply.xid(), "Reply sent");
        Ok(())
    }

    /// Applies one message to the pool and returns the reply to send.
    ///
    /// `Ok(None)` means the message is deliberately left unanswered.
    pub async fn handle_message(&self, message: &Message) -> Result<Option<Message>> {
        let owner = *message.chaddr();

        if message.op() != OpCode::BootRequest {
            debug!("Ignoring reply-direction message from {}", owner);
            return Ok(None);
        }

        if owner.is_empty() {
            warn!("Ignoring message xid {:#010x} without a hardware address", message.xid());
            return Ok(None);
        }

        if message.is_release() {
            info!("RELEASE from {}", owner);
            self.handle_release(&owner).await;
            return Ok(None);
        }

        match message.message_type()? {
            Some(MessageType::Discover) => {
                info!("DISCOVER from {} (xid {:#010x})", owner, message.xid());
                self.handle_discover(message).await
            }
            Some(MessageType::Request) => {
                info!("REQUEST from {} (xid {:#010x})", owner, message.xid());
                self.handle_request(message).await
            }
            Some(message_type) => {
                warn!("Ignoring {} message from {}", message_type, owner);
                Ok(None)
            }
            None => {
                warn!("Ignoring message without a type from {}", owner);
                Ok(None)
            }
        }
    }

    async fn handle_discover(&self, message: &Message) -> Result<Option<Message>> {
        let owner = *message.chaddr();

        if let Some(record) = self.leases.active_lease_for(&owner).await {
            info!(
                "DISCOVER from {} ignored: still holds {}",
                owner, record.address
            );
            return Ok(None);
        }

        let requested = message
            .options()
            .requested_address()?
            .filter(|address| !address.is_unspecified());

        let offered = match self.offer_address(&owner, requested).await {
            Ok(address) => address,
            Err(Error::PoolExhausted) => {
                warn!("Pool exhausted, cannot offer an address to {}", owner);
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        info!("OFFER {} to {}", offered, owner);
        Ok(Some(Message::offer(
            message,
            offered,
            self.config.server_ip,
            self.config.lease_duration_seconds,
        )))
    }

    /// Chooses an address to offer `owner`, waiting for one to free up.
    ///
    /// While the pool is full the lookup is retried every
    /// `offer_retry_interval_millis` until half the lease duration has
    /// passed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when the wait budget runs out.
    pub async fn offer_address(
        &self,
        owner: &HardwareAddress,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let retry_interval = self.config.offer_retry_interval();
        let deadline = Instant::now() + self.config.offer_wait_budget();

        loop {
            if let Some(address) = self.leases.select_offer(owner, requested).await {
                return Ok(address);
            }

            if Instant::now() + retry_interval > deadline {
                return Err(Error::PoolExhausted);
            }

            debug!("No free address for {}, retrying in {:?}", owner, retry_interval);
            tokio::time::sleep(retry_interval).await;
        }
    }

    async fn handle_request(&self, message: &Message) -> Result<Option<Message>> {
        let owner = *message.chaddr();

        if let Some(server_id) = message.options().server_identifier()?
            && server_id != self.config.server_ip
        {
            info!("REQUEST from {} is for different server {}", owner, server_id);
            return Ok(None);
        }

        let requested = message
            .options()
            .requested_address()?
            .filter(|address| !address.is_unspecified())
            .or_else(|| Some(message.ciaddr()).filter(|address| !address.is_unspecified()));

        let Some(requested) = requested else {
            warn!("NAK to {}: no address requested", owner);
            return Ok(Some(Message::nak(message, self.config.server_ip)));
        };

        match self.leases.commit(&owner, requested).await {
            Ok(record) => {
                info!(
                    "ACK {} to {} (lease: {} seconds)",
                    record.address, owner, self.config.lease_duration_seconds
                );
                Ok(Some(Message::ack(
                    message,
                    record.address,
                    self.config.server_ip,
                    self.config.lease_duration_seconds,
                )))
            }
            Err(
                error @ (Error::OwnershipConflict { .. }
                | Error::AddressOutOfRange(_)
                | Error::MissingOwner { .. }),
            ) => {
                warn!("NAK to {}: {}", owner, error);
                Ok(Some(Message::nak(message, self.config.server_ip)))
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_release(&self, owner: &HardwareAddress) {
        match self.leases.release(owner).await {
            Some(address) => info!("Released {} from {}", address, owner),
            None => debug!("RELEASE from {} without a lease, ignoring", owner),
        }
    }

    /// Replies go back to the sender, or are broadcast to the client port
    /// when the sender has no address yet.
    fn reply_destination(&self, source: SocketAddr) -> SocketAddr {
        if source.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.config.client_port)
        } else {
            source
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DhcpOption, OptionsList};
    use crate::transport::testing::MemoryTransport;
    use std::time::Duration;

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    fn mac(last: u8) -> HardwareAddress {
        HardwareAddress::from_mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn test_config() -> Config {
        Config {
            server_ip: SERVER_IP,
            pool_start: addr(100),
            pool_end: addr(102),
            lease_duration_seconds: 10,
            offer_retry_interval_millis: 20,
            ..Default::default()
        }
    }

    fn create_server(config: Config) -> (DhcpServer<MemoryTransport>, MemoryTransport) {
        let (server_end, client_end) = MemoryTransport::pair(
            "192.168.1.1:67".parse().unwrap(),
            "192.168.1.50:68".parse().unwrap(),
        );
        (DhcpServer::with_transport(config, server_end).unwrap(), client_end)
    }

    fn discover(client: u8, xid: u32) -> Message {
        Message::discover(mac(client), xid, 576)
    }

    fn request(client: u8, xid: u32, address: Ipv4Addr) -> Message {
        Message::request(mac(client), xid, address, SERVER_IP, Ipv4Addr::UNSPECIFIED)
    }

    async fn lease_address(server: &DhcpServer<MemoryTransport>, client: u8) -> Ipv4Addr {
        let offer = server
            .handle_message(&discover(client, u32::from(client)))
            .await
            .unwrap()
            .expect("offer");
        let ack = server
            .handle_message(&request(client, u32::from(client), offer.yiaddr()))
            .await
            .unwrap()
            .expect("ack");
        assert_eq!(ack.message_type().unwrap(), Some(MessageType::Ack));
        ack.yiaddr()
    }

    #[tokio::test]
    async fn test_discover_offers_first_available() {
        let (server, _client) = create_server(test_config());
        let offer = server
            .handle_message(&discover(1, 0x1234))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(offer.message_type().unwrap(), Some(MessageType::Offer));
        assert_eq!(offer.op(), OpCode::BootReply);
        assert_eq!(offer.xid(), 0x1234);
        assert_eq!(offer.yiaddr(), addr(100));
        assert_eq!(offer.chaddr(), &mac(1));
        assert_eq!(offer.options().server_identifier().unwrap(), Some(SERVER_IP));
        assert_eq!(offer.options().lease_time().unwrap(), Some(10));

        assert_eq!(server.leases().leased_count().await, 0);
    }

    #[tokio::test]
    async fn test_discover_with_requested_address() {
        let (server, _client) = create_server(test_config());
        let message = discover(1, 1)
            .to_builder()
            .options(
                OptionsList::new()
                    .with(DhcpOption::message_type(MessageType::Discover))
                    .with(DhcpOption::requested_address(addr(102)))
                    .with(DhcpOption::end()),
            )
            .build()
            .unwrap();

        let offer = server.handle_message(&message).await.unwrap().unwrap();
        assert_eq!(offer.yiaddr(), addr(102));
    }

    #[tokio::test]
    async fn test_discover_ignored_while_lease_active() {
        let (server, _client) = create_server(test_config());
        lease_address(&server, 1).await;

        let reply = server.handle_message(&discover(1, 99)).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let config = Config {
            lease_duration_seconds: 1,
            ..test_config()
        };
        let (server, _client) = create_server(config);

        let mut leased = Vec::new();
        for client in 1..=3 {
            leased.push(lease_address(&server, client).await);
        }
        assert_eq!(leased, vec![addr(100), addr(101), addr(102)]);

        let started = Instant::now();
        let result = server.offer_address(&mac(4), None).await;
        assert!(matches!(result, Err(Error::PoolExhausted)));
        assert!(started.elapsed() >= Duration::from_millis(400));

        let reply = server.handle_message(&discover(4, 4)).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_offer_waits_for_free_address() {
        let config = Config {
            pool_end: addr(100),
            ..test_config()
        };
        let (server, _client) = create_server(config);
        lease_address(&server, 1).await;

        let leases = server.leases().clone();
        let freer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            leases.release(&mac(1)).await
        });

        assert_eq!(server.offer_address(&mac(2), None).await.unwrap(), addr(100));
        assert_eq!(freer.await.unwrap(), Some(addr(100)));
    }

    #[tokio::test]
    async fn test_request_grants_and_renews() {
        let (server, _client) = create_server(test_config());
        let address = lease_address(&server, 1).await;

        let record = server.leases().record_for(address).await.unwrap();
        assert!(record.leased);
        assert_eq!(record.owner, mac(1));

        let renewal = Message::request(mac(1), 77, address, SERVER_IP, address);
        let ack = server.handle_message(&renewal).await.unwrap().unwrap();
        assert_eq!(ack.message_type().unwrap(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr(), address);
        assert_eq!(ack.xid(), 77);
    }

    #[tokio::test]
    async fn test_request_conflict_naks() {
        let (server, _client) = create_server(test_config());
        assert_eq!(lease_address(&server, 1).await, addr(100));

        let nak = server
            .handle_message(&request(2, 5, addr(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nak.message_type().unwrap(), Some(MessageType::Nak));
        assert_eq!(nak.yiaddr(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(nak.options().server_identifier().unwrap(), Some(SERVER_IP));
        assert_eq!(
            server.leases().record_for(addr(100)).await.unwrap().owner,
            mac(1)
        );
    }

    #[tokio::test]
    async fn test_request_out_of_range_naks() {
        let (server, _client) = create_server(test_config());
        let nak = server
            .handle_message(&request(1, 5, addr(50)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nak.message_type().unwrap(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn test_empty_hardware_address_ignored() {
        let (server, _client) = create_server(test_config());
        let request = Message::request(
            HardwareAddress::EMPTY,
            1,
            addr(100),
            SERVER_IP,
            Ipv4Addr::UNSPECIFIED,
        );
        assert!(server.handle_message(&request).await.unwrap().is_none());
        assert_eq!(server.leases().leased_count().await, 0);

        let discover = Message::discover(HardwareAddress::EMPTY, 2, 576);
        assert!(server.handle_message(&discover).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_for_other_server_ignored() {
        let (server, _client) = create_server(test_config());
        let message = Message::request(
            mac(1),
            5,
            addr(100),
            Ipv4Addr::new(192, 168, 1, 2),
            Ipv4Addr::UNSPECIFIED,
        );
        assert!(server.handle_message(&message).await.unwrap().is_none());
        assert_eq!(server.leases().leased_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_falls_back_to_ciaddr() {
        let (server, _client) = create_server(test_config());
        let message = Message::builder()
            .xid(5)
            .chaddr(mac(1))
            .ciaddr(addr(101))
            .options(
                OptionsList::new()
                    .with(DhcpOption::message_type(MessageType::Request))
                    .with(DhcpOption::end()),
            )
            .build()
            .unwrap();

        let ack = server.handle_message(&message).await.unwrap().unwrap();
        assert_eq!(ack.message_type().unwrap(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr(), addr(101));
    }

    #[tokio::test]
    async fn test_release_then_other_client_gets_address() {
        let (server, _client) = create_server(test_config());
        assert_eq!(lease_address(&server, 1).await, addr(100));

        let release = Message::release(mac(1), 9, addr(100));
        assert!(server.handle_message(&release).await.unwrap().is_none());

        let record = server.leases().record_for(addr(100)).await.unwrap();
        assert!(!record.leased);
        assert_eq!(record.owner, mac(1));

        let message = Message::builder()
            .xid(10)
            .chaddr(mac(2))
            .flags(crate::message::BROADCAST_FLAG)
            .options(
                OptionsList::new()
                    .with(DhcpOption::message_type(MessageType::Discover))
                    .with(DhcpOption::requested_address(addr(100)))
                    .with(DhcpOption::end()),
            )
            .build()
            .unwrap();
        let offer = server.handle_message(&message).await.unwrap().unwrap();
        assert_eq!(offer.yiaddr(), addr(100));
    }

    #[tokio::test]
    async fn test_release_without_lease_is_ignored() {
        let (server, _client) = create_server(test_config());
        let release = Message::release(mac(7), 1, addr(100));
        assert!(server.handle_message(&release).await.unwrap().is_none());
        assert_eq!(server.leases().leased_count().await, 0);
    }

    #[tokio::test]
    async fn test_returning_client_gets_previous_address() {
        let (server, _client) = create_server(test_config());
        assert_eq!(lease_address(&server, 1).await, addr(100));
        assert_eq!(lease_address(&server, 2).await, addr(101));

        server
            .handle_message(&Message::release(mac(2), 3, addr(101)))
            .await
            .unwrap();

        let offer = server.handle_message(&discover(2, 4)).await.unwrap().unwrap();
        assert_eq!(offer.yiaddr(), addr(101));
    }

    #[tokio::test]
    async fn test_unhandled_messages_ignored() {
        let (server, _client) = create_server(test_config());

        let ack = Message::ack(&discover(1, 1), addr(100), SERVER_IP, 10);
        assert!(server.handle_message(&ack).await.unwrap().is_none());

        let nak_request = Message::builder()
            .options(OptionsList::new().with(DhcpOption::message_type(MessageType::Nak)))
            .build()
            .unwrap();
        assert!(server.handle_message(&nak_request).await.unwrap().is_none());

        let untyped = Message::builder().yiaddr(addr(100)).build().unwrap();
        assert!(server.handle_message(&untyped).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_datagram_replies_to_source() {
        let (server, client) = create_server(test_config());
        let source: SocketAddr = "192.168.1.50:68".parse().unwrap();

        let bytes = discover(1, 42).encode().unwrap();
        server.handle_datagram(&bytes, source).await.unwrap();

        let (reply, _) = client.receive().await.unwrap();
        let offer = Message::decode(&reply).unwrap();
        assert_eq!(offer.xid(), 42);
        assert_eq!(offer.message_type().unwrap(), Some(MessageType::Offer));
        assert_eq!(server.transport.destinations(), vec![source]);
    }

    #[tokio::test]
    async fn test_handle_datagram_broadcasts_for_unspecified_source() {
        let (server, _client) = create_server(test_config());
        let bytes = discover(1, 42).encode().unwrap();
        server
            .handle_datagram(&bytes, "0.0.0.0:68".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(
            server.transport.destinations(),
            vec!["255.255.255.255:68".parse::<SocketAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_handle_datagram_rejects_garbage() {
        let (server, _client) = create_server(test_config());
        let source: SocketAddr = "192.168.1.50:68".parse().unwrap();

        assert!(matches!(
            server.handle_datagram(&[0u8; 100], source).await,
            Err(Error::MalformedMessage { .. })
        ));
        assert!(server.transport.destinations().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_swept_and_reoffered() {
        let config = Config {
            pool_end: addr(100),
            lease_duration_seconds: 1,
            ..test_config()
        };
        let (server, _client) = create_server(config);
        assert_eq!(lease_address(&server, 1).await, addr(100));
        assert_eq!(server.leases().find_available().await, None);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(server.leases().sweep_expired().await, 1);
        assert_eq!(server.leases().find_available().await, Some(addr(100)));
    }

    #[tokio::test]
    async fn test_sweeper_task_frees_expired_leases() {
        let config = Config {
            pool_end: addr(100),
            lease_duration_seconds: 1,
            sweep_interval_seconds: 1,
            ..test_config()
        };
        let (server, _client) = create_server(config);
        lease_address(&server, 1).await;

        let sweeper = server.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(2200)).await;
        sweeper.abort();

        assert_eq!(server.leases().leased_count().await, 0);
    }
}
