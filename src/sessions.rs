//! Session adapters: the four ways channels come into being.
//!
//! Sessions consume only the coordinator's admission contract plus the
//! channel, registry, and address-book APIs. The protocol conversation
//! on an admitted channel belongs to whoever subscribed to connection
//! events.
//!
//! | Session | Role |
//! |---------|------|
//! | manual | dial a specific `host:port` on request, with a retry cap |
//! | inbound | accept incoming connections up to the configured cap |
//! | outbound | keep the configured number of dialed channels alive |
//! | seed | resolve DNS seeds into the address book at startup |
//!
//! Sessions hold weak back-references to the coordinator; a session task
//! outliving its coordinator simply winds down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::NetError;
use crate::messages::{PeerAddress, Services};
use crate::p2p::Network;
use crate::settings::Settings;

/// Pause between manual dial attempts.
const MANUAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How often the outbound maintainer checks its target count.
const OUTBOUND_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Backoff after a failed accept, so a hot error cannot spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

async fn dial(settings: &Settings, authority: SocketAddr) -> Result<TcpStream, NetError> {
    match timeout(settings.connect_timeout(), TcpStream::connect(authority)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(NetError::from_io(&err)),
        Err(_) => Err(NetError::ChannelTimeout),
    }
}

fn start_channel(channel: &Arc<Channel>, direction: &'static str) {
    channel.start(|result| {
        if let Err(code) = result {
            warn!(error = %code, direction, "channel start failed");
        }
    });
}

/// Frees the channel's registry slot once it stops, so the authority can
/// reconnect. The handler drains on stop, which also breaks its owning
/// reference back to the channel.
fn unregister_on_stop(network: &Arc<Network>, channel: &Arc<Channel>) {
    let weak = Arc::downgrade(network);
    let slot = Arc::clone(channel);
    channel.subscribe_stop(move |_| {
        if let Some(network) = weak.upgrade() {
            let _ = network.remove_channel(&slot);
        }
    });
}

// ----------------------------------------------------------------------------
// Manual session
// ----------------------------------------------------------------------------

/// Dials specific peers on external request.
pub struct ManualSession {
    network: Weak<Network>,
    settings: Settings,
}

impl ManualSession {
    pub(crate) fn new(network: &Arc<Network>) -> Arc<ManualSession> {
        Arc::new(ManualSession {
            network: Arc::downgrade(network),
            settings: network.settings().clone(),
        })
    }

    pub async fn start(&self) -> Result<(), NetError> {
        Ok(())
    }

    /// Dials `hostname:port`, retrying up to the configured attempt
    /// limit (0 retries until the coordinator stops). The admitted
    /// channel is announced to connection subscribers before its read
    /// pump starts, so subscriptions made in the announcement handler
    /// cannot miss a message.
    pub async fn connect(&self, hostname: &str, port: u16) -> Result<Arc<Channel>, NetError> {
        let limit = self.settings.manual_attempt_limit;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_connect(hostname, port).await {
                Ok(channel) => return Ok(channel),
                Err(NetError::ServiceStopped) => return Err(NetError::ServiceStopped),
                Err(code) => {
                    debug!(
                        host = hostname,
                        port,
                        attempt,
                        error = %code,
                        "manual connect failed"
                    );
                    if limit != 0 && attempt >= limit {
                        return Err(code);
                    }
                    tokio::time::sleep(MANUAL_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn try_connect(&self, hostname: &str, port: u16) -> Result<Arc<Channel>, NetError> {
        let network = self.network.upgrade().ok_or(NetError::ServiceStopped)?;
        if network.stopped() {
            return Err(NetError::ServiceStopped);
        }

        let connect = TcpStream::connect((hostname, port));
        let stream = match timeout(self.settings.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(NetError::from_io(&err)),
            Err(_) => return Err(NetError::ChannelTimeout),
        };

        let channel = Channel::new(stream, network.channel_options(true));
        network.store_channel(Arc::clone(&channel))?;
        unregister_on_stop(&network, &channel);
        start_channel(&channel, "manual");
        Ok(channel)
    }
}

// ----------------------------------------------------------------------------
// Inbound session
// ----------------------------------------------------------------------------

/// Accepts incoming connections on the configured port.
pub struct InboundSession {
    network: Weak<Network>,
    settings: Settings,
}

impl InboundSession {
    pub(crate) fn new(network: &Arc<Network>) -> InboundSession {
        InboundSession {
            network: Arc::downgrade(network),
            settings: network.settings().clone(),
        }
    }

    pub async fn start(&self) -> Result<(), NetError> {
        if self.settings.inbound_port == 0 || self.settings.inbound_connections == 0 {
            info!("inbound session disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.settings.inbound_port))
            .await
            .map_err(|err| {
                warn!(port = self.settings.inbound_port, error = %err, "listener bind failed");
                NetError::from_io(&err)
            })?;
        info!(port = self.settings.inbound_port, "listening for inbound channels");

        let network = self.network.upgrade().ok_or(NetError::ServiceStopped)?;
        let weak = self.network.clone();
        let settings = self.settings.clone();
        network.spawn_task(async move {
            InboundSession::accept_loop(weak, listener, settings).await;
        });
        Ok(())
    }

    async fn accept_loop(weak: Weak<Network>, listener: TcpListener, settings: Settings) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    debug!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let Some(network) = weak.upgrade() else {
                break;
            };
            if network.stopped() {
                break;
            }
            if network.connected_count() >= settings.inbound_connections as usize {
                debug!(peer = %peer, "inbound cap reached, dropping connection");
                continue;
            }

            let channel = Channel::new(stream, network.channel_options(true));
            match network.store_channel(Arc::clone(&channel)) {
                Ok(()) => {
                    unregister_on_stop(&network, &channel);
                    start_channel(&channel, "inbound");
                    debug!(peer = %peer, "inbound channel up");
                }
                Err(code) => debug!(peer = %peer, error = %code, "inbound channel rejected"),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Outbound session
// ----------------------------------------------------------------------------

/// Keeps the configured number of dialed channels alive, fed by the
/// address book. Unreachable addresses are evicted from the book.
pub struct OutboundSession {
    network: Weak<Network>,
    settings: Settings,
}

impl OutboundSession {
    pub(crate) fn new(network: &Arc<Network>) -> OutboundSession {
        OutboundSession {
            network: Arc::downgrade(network),
            settings: network.settings().clone(),
        }
    }

    pub async fn start(&self) -> Result<(), NetError> {
        if self.settings.outbound_connections == 0 {
            info!("outbound session disabled");
            return Ok(());
        }

        let network = self.network.upgrade().ok_or(NetError::ServiceStopped)?;
        let weak = self.network.clone();
        let settings = self.settings.clone();
        network.spawn_task(async move {
            OutboundSession::maintain_loop(weak, settings).await;
        });
        Ok(())
    }

    async fn maintain_loop(weak: Weak<Network>, settings: Settings) {
        let live = Arc::new(AtomicUsize::new(0));
        let target = settings.outbound_connections as usize;
        let mut ticker = interval(OUTBOUND_POLL_INTERVAL);

        loop {
            ticker.tick().await;
            let Some(network) = weak.upgrade() else {
                break;
            };
            if network.stopped() {
                break;
            }

            let mut attempts = 0;
            while live.load(Ordering::SeqCst) < target && attempts < target {
                attempts += 1;
                let address = match network.fetch_address() {
                    Ok(address) => address,
                    Err(_) => {
                        debug!("address pool exhausted");
                        break;
                    }
                };
                let authority = address.authority();
                if network.connected(&authority) {
                    continue;
                }

                match dial(&settings, authority).await {
                    Ok(stream) => {
                        let channel = Channel::new(stream, network.channel_options(true));
                        if let Err(code) = network.store_channel(Arc::clone(&channel)) {
                            debug!(peer = %authority, error = %code, "outbound channel rejected");
                            continue;
                        }
                        unregister_on_stop(&network, &channel);
                        live.fetch_add(1, Ordering::SeqCst);
                        let live_slot = Arc::clone(&live);
                        channel.subscribe_stop(move |_| {
                            live_slot.fetch_sub(1, Ordering::SeqCst);
                        });
                        start_channel(&channel, "outbound");
                        debug!(peer = %authority, "outbound channel up");
                    }
                    Err(code) => {
                        debug!(peer = %authority, error = %code, "outbound dial failed, evicting");
                        network.remove_address(&authority);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Seed session
// ----------------------------------------------------------------------------

/// Fills the address book from the configured DNS seeds.
pub struct SeedSession {
    network: Weak<Network>,
    settings: Settings,
}

impl SeedSession {
    pub(crate) fn new(network: &Arc<Network>) -> SeedSession {
        SeedSession {
            network: Arc::downgrade(network),
            settings: network.settings().clone(),
        }
    }

    /// Resolves each seed once. Succeeds when the book ends up
    /// non-empty; a book that is already populated skips resolution.
    pub async fn start(&self) -> Result<(), NetError> {
        let network = self.network.upgrade().ok_or(NetError::ServiceStopped)?;

        let target = self.settings.outbound_connections as usize;
        if target > 0 && network.address_count() >= target {
            debug!(count = network.address_count(), "address pool already populated");
            return Ok(());
        }
        if self.settings.seeds.is_empty() {
            if network.address_count() == 0 {
                warn!("no seeds configured and the address pool is empty");
            }
            return Ok(());
        }

        let mut added = 0;
        for seed in &self.settings.seeds {
            if network.stopped() {
                return Err(NetError::ServiceStopped);
            }
            let lookup = timeout(
                self.settings.connect_timeout(),
                tokio::net::lookup_host(seed.as_str()),
            )
            .await;
            match lookup {
                Ok(Ok(resolved)) => {
                    let addresses = resolved
                        .map(|addr| PeerAddress::from_socket(addr, Services::NODE_NETWORK));
                    let new = network.store_addresses(addresses);
                    debug!(seed = %seed, new, "seed resolved");
                    added += new;
                }
                Ok(Err(err)) => warn!(seed = %seed, error = %err, "seed resolution failed"),
                Err(_) => warn!(seed = %seed, "seed resolution timed out"),
            }
        }

        info!(added, total = network.address_count(), "seeding complete");
        if network.address_count() == 0 {
            return Err(NetError::OperationFailed);
        }
        Ok(())
    }
}
