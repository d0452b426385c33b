//! One live P2P connection: a socket, its read pump, and its subscribers.
//!
//! A channel owns exactly one TCP socket. After [`Channel::start`], a
//! spawned pump task reads framed messages forever:
//!
//! ```text
//! READ_HEADING -> VALIDATE_HEADING -> READ_PAYLOAD -> VALIDATE_PAYLOAD
//!      ^                                                    |
//!      +----------------------------------------------------+
//! ```
//!
//! Any framing violation, checksum mismatch, payload parse failure, or
//! socket error stops the channel; stopping is terminal and fans out one
//! notification to every message and stop subscriber. Writes are
//! serialized on an internal lock, so concurrent `send` calls interleave
//! whole envelopes, never bytes.
//!
//! The pump task holds an `Arc<Channel>`, which keeps the channel alive
//! while I/O is pending even if the registry evicts it concurrently.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::messages::{self, Payload};
use crate::subscriber::{MessageSubscriber, StopSubscriber};
use crate::wire::{self, Heading, HEADING_SIZE, MAX_PAYLOAD};

/// Construction-time knobs for a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Network magic every incoming heading must carry.
    pub magic: u32,
    /// Whether admission of this channel is announced to connection
    /// subscribers. Seed channels are not announced.
    pub notify: bool,
    /// Stop the channel when no message completes within this window.
    pub inactivity: Option<Duration>,
    /// Stop the channel outright after this lifetime.
    pub expiration: Option<Duration>,
}

impl ChannelOptions {
    pub fn new(magic: u32) -> ChannelOptions {
        ChannelOptions {
            magic,
            notify: true,
            inactivity: None,
            expiration: None,
        }
    }
}

/// A live connection to one peer.
pub struct Channel {
    authority: SocketAddr,
    options: ChannelOptions,
    started: AtomicBool,
    stopped: AtomicBool,
    reader: StdMutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    messages: MessageSubscriber,
    stops: StopSubscriber,
    stop_tx: watch::Sender<bool>,
    activity_tx: watch::Sender<Instant>,
}

impl Channel {
    /// Wraps an established socket. The remote authority is cached here
    /// because it is unavailable once the socket closes.
    pub fn new(socket: TcpStream, options: ChannelOptions) -> Arc<Channel> {
        let authority = socket
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let (read_half, write_half) = socket.into_split();
        let (stop_tx, _) = watch::channel(false);
        let (activity_tx, _) = watch::channel(Instant::now());

        Arc::new(Channel {
            authority,
            options,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            reader: StdMutex::new(Some(read_half)),
            writer: AsyncMutex::new(Some(write_half)),
            messages: MessageSubscriber::new(),
            stops: StopSubscriber::new(),
            stop_tx,
            activity_tx,
        })
    }

    /// The remote `(host, port)` this channel talks to.
    pub fn authority(&self) -> SocketAddr {
        self.authority
    }

    /// Whether admission should be announced to connection subscribers.
    pub fn notify(&self) -> bool {
        self.options.notify
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Registers a handler for messages of tag `P::COMMAND`.
    pub fn subscribe<P, F>(&self, handler: F) -> Result<(), NetError>
    where
        P: Payload,
        F: FnMut(Result<&P, NetError>) + Send + 'static,
    {
        self.messages.subscribe::<P, F>(handler)
    }

    /// Registers a one-shot handler for the channel's stop code.
    pub fn subscribe_stop<F>(&self, handler: F)
    where
        F: FnOnce(NetError) + Send + 'static,
    {
        self.stops.subscribe(handler, NetError::ChannelStopped);
    }

    /// Observable timestamp of the last completed heading or payload.
    /// Watchdogs outside the channel reset their deadlines on changes.
    pub fn activity(&self) -> watch::Receiver<Instant> {
        self.activity_tx.subscribe()
    }

    /// Starts the read pump. The handler runs with `Ok(())` *before* the
    /// first read is issued, so subscriptions made inside it can never
    /// miss a message. A second start reports `OperationFailed`.
    pub fn start<H>(self: &Arc<Self>, handler: H)
    where
        H: FnOnce(Result<(), NetError>),
    {
        if self.started.swap(true, Ordering::SeqCst) {
            handler(Err(NetError::OperationFailed));
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);
        self.messages.start();

        handler(Ok(()));

        if let Some(idle) = self.options.inactivity {
            let channel = Arc::clone(self);
            tokio::spawn(channel.inactivity_watchdog(idle));
        }
        if let Some(lifetime) = self.options.expiration {
            let channel = Arc::clone(self);
            tokio::spawn(channel.expiration_watchdog(lifetime));
        }

        let channel = Arc::clone(self);
        tokio::spawn(channel.read_pump());
    }

    /// Serializes `message` into an envelope and writes it whole.
    ///
    /// Concurrent sends queue on the write lock; wire order is lock
    /// acquisition order.
    pub async fn send<P: Payload>(&self, message: &P) -> Result<(), NetError> {
        if self.stopped() {
            return Err(NetError::ChannelStopped);
        }
        let frame = messages::seal(self.options.magic, message);
        debug!(
            command = P::COMMAND.name(),
            peer = %self.authority,
            bytes = frame.len(),
            "sending"
        );

        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return Err(NetError::ChannelStopped),
        };
        writer.write_all(&frame).await.map_err(|err| {
            debug!(peer = %self.authority, error = %err, "send failed");
            NetError::from_io(&err)
        })
    }

    /// Stops the channel. Idempotent; `code` is the reason delivered to
    /// stop subscribers and must be an error, never success.
    ///
    /// Handlers currently receiving a delivery must not call this
    /// directly; they spawn it onto the runtime instead.
    pub async fn stop(&self, code: NetError) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // No resubscription once the stop has been relayed.
        self.messages.stop();
        self.messages.broadcast(NetError::ChannelStopped);
        self.stops.stop();
        self.stops.relay(code);

        // Wakes the pump and any watchdog so no further I/O is issued.
        let _ = self.stop_tx.send(true);

        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn touch(&self) {
        let _ = self.activity_tx.send(Instant::now());
    }

    async fn read_pump(self: Arc<Self>) {
        let taken = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut reader = match taken {
            Some(reader) => reader,
            None => return,
        };
        let mut stop_rx = self.stop_tx.subscribe();
        let mut heading_buf = [0u8; HEADING_SIZE];
        let mut payload_buf: Vec<u8> = Vec::new();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            // READ_HEADING
            let read = tokio::select! {
                read = reader.read_exact(&mut heading_buf) => read,
                _ = stop_rx.changed() => break,
            };
            if let Err(err) = read {
                if !self.stopped() {
                    debug!(peer = %self.authority, error = %err, "heading read failed");
                    self.stop(NetError::from_io(&err)).await;
                }
                break;
            }

            // VALIDATE_HEADING
            let heading = match Heading::parse(&heading_buf) {
                Ok(heading) => heading,
                Err(code) => {
                    warn!(peer = %self.authority, "invalid heading");
                    self.stop(code).await;
                    break;
                }
            };
            if heading.magic != self.options.magic {
                warn!(peer = %self.authority, magic = heading.magic, "magic mismatch");
                self.stop(NetError::BadStream).await;
                break;
            }
            if heading.payload_size as usize > MAX_PAYLOAD {
                warn!(
                    peer = %self.authority,
                    command = %heading.command,
                    bytes = heading.payload_size,
                    "oversized payload indicated"
                );
                self.stop(NetError::BadStream).await;
                break;
            }
            self.touch();

            // READ_PAYLOAD
            payload_buf.resize(heading.payload_size as usize, 0);
            let read = tokio::select! {
                read = reader.read_exact(&mut payload_buf) => read,
                _ = stop_rx.changed() => break,
            };
            if let Err(err) = read {
                if !self.stopped() {
                    warn!(peer = %self.authority, error = %err, "payload read failed");
                    self.stop(NetError::from_io(&err)).await;
                }
                break;
            }

            // VALIDATE_PAYLOAD
            if heading.checksum != wire::checksum(&payload_buf) {
                warn!(peer = %self.authority, command = %heading.command, "invalid checksum");
                self.stop(NetError::BadStream).await;
                break;
            }
            match self.messages.load(heading.kind(), &payload_buf) {
                Ok(consumed) => {
                    if consumed < payload_buf.len() {
                        warn!(
                            peer = %self.authority,
                            command = %heading.command,
                            unused = payload_buf.len() - consumed,
                            "valid payload, unused bytes remain"
                        );
                    } else {
                        debug!(
                            peer = %self.authority,
                            command = %heading.command,
                            bytes = payload_buf.len(),
                            "valid payload"
                        );
                    }
                }
                Err(code) => {
                    warn!(peer = %self.authority, command = %heading.command, "invalid payload stream");
                    self.stop(code).await;
                    break;
                }
            }
            if self.stopped() {
                break;
            }
            self.touch();
        }
    }

    async fn inactivity_watchdog(self: Arc<Self>, idle: Duration) {
        let mut activity = self.activity_tx.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let deadline = *activity.borrow_and_update() + idle;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(peer = %self.authority, "channel inactive, stopping");
                    self.stop(NetError::ChannelTimeout).await;
                    break;
                }
                changed = activity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }
    }

    async fn expiration_watchdog(self: Arc<Self>, lifetime: Duration) {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(lifetime) => {
                debug!(peer = %self.authority, "channel lifetime expired, stopping");
                self.stop(NetError::ChannelTimeout).await;
            }
            _ = stop_rx.changed() => {}
        }
    }
}
