//! The P2P coordinator: session orchestration, channel admission, and
//! the address book facade.
//!
//! A [`Network`] ties the runtime together:
//!
//! - **start** brings up the manual session, loads the address book and
//!   seeds it from DNS;
//! - **run** brings up the inbound listener and the outbound dialer;
//! - **stop** tears everything down idempotently and persists the book.
//!
//! Channels reach the registry through [`Network::store_channel`];
//! successful admissions of announceable channels fan out to connection
//! subscribers. The worker pool is the tokio runtime itself: the binary
//! provisions it from `settings.threads`, and the coordinator owns only
//! its session tasks.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::channel::{Channel, ChannelOptions};
use crate::connections::Connections;
use crate::error::NetError;
use crate::hosts::Hosts;
use crate::messages::PeerAddress;
use crate::sessions::{InboundSession, ManualSession, OutboundSession, SeedSession};
use crate::settings::Settings;
use crate::subscriber::Subscriber;

pub struct Network {
    settings: Settings,
    stopped: AtomicBool,
    height: AtomicU64,
    hosts: Hosts,
    connections: Connections,
    subscriber: Subscriber<Arc<Channel>>,
    manual: Mutex<Option<Arc<ManualSession>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Network {
    pub fn new(settings: Settings) -> Arc<Network> {
        let hosts = Hosts::new(Some(settings.hosts_file.clone()));
        Arc::new(Network {
            settings,
            stopped: AtomicBool::new(true),
            height: AtomicU64::new(0),
            hosts,
            connections: Connections::new(),
            subscriber: Subscriber::new(),
            manual: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    // Properties.
    // ------------------------------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Blockchain height, read by the version handshake. Stale reads
    /// are acceptable.
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
    }

    pub(crate) fn channel_options(&self, notify: bool) -> ChannelOptions {
        ChannelOptions {
            magic: self.settings.magic,
            notify,
            inactivity: self.settings.channel_inactivity(),
            expiration: self.settings.channel_expiration(),
        }
    }

    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(task);
    }

    // Start sequence.
    // ------------------------------------------------------------------------

    /// Brings the coordinator up: manual session, address book, seeds.
    ///
    /// A failing stage surfaces its error and leaves the partially
    /// started coordinator for [`Network::stop`] to clean up.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetError> {
        if !self.stopped() {
            return Err(NetError::OperationFailed);
        }
        self.stopped.store(false, Ordering::SeqCst);
        self.subscriber.start();

        // Dropping the previous set reaps any tasks a prior run left.
        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = JoinSet::new();

        let manual = ManualSession::new(self);
        manual.start().await.map_err(|code| {
            error!(error = %code, "error starting manual session");
            code
        })?;
        *self.manual.lock().unwrap_or_else(PoisonError::into_inner) = Some(manual);

        if self.stopped() {
            return Err(NetError::ServiceStopped);
        }
        self.hosts.load().map_err(|code| {
            error!(error = %code, "error loading host addresses");
            code
        })?;

        if self.stopped() {
            return Err(NetError::ServiceStopped);
        }
        SeedSession::new(self).start().await.map_err(|code| {
            error!(error = %code, "error seeding host addresses");
            code
        })?;

        Ok(())
    }

    // Run sequence.
    // ------------------------------------------------------------------------

    /// Brings up the inbound listener and the outbound dialer.
    pub async fn run(self: &Arc<Self>) -> Result<(), NetError> {
        InboundSession::new(self).start().await.map_err(|code| {
            error!(error = %code, "error starting inbound session");
            code
        })?;

        OutboundSession::new(self).start().await.map_err(|code| {
            error!(error = %code, "error starting outbound session");
            code
        })?;

        Ok(())
    }

    // Stop sequence.
    // ------------------------------------------------------------------------

    /// Stops the coordinator. Thread safe and idempotent: every call
    /// reports the result of the (at most one) address book save.
    pub async fn stop(&self) -> Result<(), NetError> {
        // Subscribers first, so nobody re-registers against a dying set.
        self.subscriber.stop(NetError::ServiceStopped);

        self.connections.stop_all(NetError::ServiceStopped).await;
        *self.manual.lock().unwrap_or_else(PoisonError::into_inner) = None;

        // The save is expensive, one per lifetime is enough.
        let save = if self.stopped.swap(true, Ordering::SeqCst) {
            Ok(())
        } else {
            self.hosts.save()
        };
        if let Err(code) = save {
            error!(error = %code, "error saving hosts file");
        }

        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = JoinSet::new();
        save
    }

    /// Destruct-path stop: the result is logged, not returned.
    pub async fn close(&self) {
        let _ = self.stop().await;
    }

    // Channel registry and admission.
    // ------------------------------------------------------------------------

    /// Admits a channel into the registry. Duplicate authorities fail
    /// with `AddressInUse` and are never announced; announceable
    /// admissions relay the channel to connection subscribers.
    pub fn store_channel(&self, channel: Arc<Channel>) -> Result<(), NetError> {
        self.connections.store(Arc::clone(&channel))?;
        if channel.notify() {
            self.subscriber.relay(channel);
        }
        Ok(())
    }

    pub fn remove_channel(&self, channel: &Channel) -> Result<(), NetError> {
        self.connections.remove(channel)
    }

    pub fn connected(&self, authority: &SocketAddr) -> bool {
        self.connections.exists(authority)
    }

    pub fn connected_count(&self) -> usize {
        self.connections.count()
    }

    /// Registers a handler for admitted channels. Each announceable
    /// admission arrives exactly once; a stop delivers one terminal
    /// `ServiceStopped`.
    pub fn subscribe_connections<F>(&self, handler: F) -> Result<(), NetError>
    where
        F: FnMut(Result<Arc<Channel>, NetError>) + Send + 'static,
    {
        self.subscriber.subscribe(handler)
    }

    // Manual connections.
    // ------------------------------------------------------------------------

    /// Dials a specific peer through the manual session.
    pub async fn connect(&self, hostname: &str, port: u16) -> Result<Arc<Channel>, NetError> {
        if self.stopped() {
            return Err(NetError::ServiceStopped);
        }
        let manual = self
            .manual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match manual {
            Some(session) => session.connect(hostname, port).await,
            None => Err(NetError::ServiceStopped),
        }
    }

    // Address book facade.
    // ------------------------------------------------------------------------

    pub fn fetch_address(&self) -> Result<PeerAddress, NetError> {
        self.hosts.fetch()
    }

    pub fn store_address(&self, address: PeerAddress) {
        self.hosts.store(address);
    }

    pub fn store_addresses<I>(&self, addresses: I) -> usize
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        self.hosts.store_many(addresses)
    }

    pub fn remove_address(&self, authority: &SocketAddr) {
        self.hosts.remove(authority);
    }

    pub fn address_count(&self) -> usize {
        self.hosts.count()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        // Async teardown cannot run here; callers stop explicitly.
        // Aborting the session tasks is the safety net.
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.abort_all();
        }
        debug!("network dropped");
    }
}
