//! Subscription primitives: typed message dispatch, one-shot stop
//! notification, and the persistent relay used for connection events.
//!
//! All three share the same delivery discipline:
//!
//! - handlers are invoked synchronously, in subscription order, with no
//!   internal lock held (a handler may subscribe re-entrantly);
//! - a handler registered while a delivery is in flight does not receive
//!   that delivery, only subsequent ones;
//! - every handler slot sees exactly one terminal error once the
//!   subscriber stops, and nothing after that.

use std::any::Any;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::NetError;
use crate::messages::{
    Addr, Block, FeeFilter, GetAddr, GetBlocks, GetData, GetHeaders, Headers, Inv, Mempool,
    NotFound, Payload, Ping, Pong, Reject, SendHeaders, Tx, Verack, Version,
};
use crate::wire::Command;

enum Dispatch<'a> {
    Message(&'a dyn Any),
    Stopped(NetError),
}

type ErasedHandler = Box<dyn for<'a> FnMut(Dispatch<'a>) + Send>;

struct MessageState {
    stopped: bool,
    terminal: Option<NetError>,
    handlers: HashMap<Command, Vec<ErasedHandler>>,
}

/// Typed pub/sub keyed by message tag.
///
/// `load` decodes the payload for its tag and fans it out; decode
/// failures surface as `BadStream` without reaching any handler.
pub struct MessageSubscriber {
    inner: Mutex<MessageState>,
}

impl MessageSubscriber {
    pub fn new() -> MessageSubscriber {
        MessageSubscriber {
            inner: Mutex::new(MessageState {
                stopped: false,
                terminal: None,
                handlers: HashMap::new(),
            }),
        }
    }

    pub fn start(&self) {
        self.lock().stopped = false;
    }

    pub fn stop(&self) {
        self.lock().stopped = true;
    }

    /// Registers a handler for messages of tag `P::COMMAND`.
    pub fn subscribe<P, F>(&self, mut handler: F) -> Result<(), NetError>
    where
        P: Payload,
        F: FnMut(Result<&P, NetError>) + Send + 'static,
    {
        let mut state = self.lock();
        if state.stopped {
            return Err(NetError::ServiceStopped);
        }
        let erased: ErasedHandler = Box::new(move |dispatch| match dispatch {
            Dispatch::Message(message) => {
                if let Some(typed) = message.downcast_ref::<P>() {
                    handler(Ok(typed));
                }
            }
            Dispatch::Stopped(code) => handler(Err(code)),
        });
        state.handlers.entry(P::COMMAND).or_default().push(erased);
        Ok(())
    }

    /// Decodes a payload of the given tag and delivers it to the tag's
    /// current handlers. Returns the number of payload bytes consumed so
    /// the caller can report trailing garbage.
    pub fn load(&self, command: Command, payload: &[u8]) -> Result<usize, NetError> {
        match command {
            Command::Version => self.dispatch::<Version>(payload),
            Command::Verack => self.dispatch::<Verack>(payload),
            Command::Ping => self.dispatch::<Ping>(payload),
            Command::Pong => self.dispatch::<Pong>(payload),
            Command::Addr => self.dispatch::<Addr>(payload),
            Command::GetAddr => self.dispatch::<GetAddr>(payload),
            Command::Inv => self.dispatch::<Inv>(payload),
            Command::GetData => self.dispatch::<GetData>(payload),
            Command::NotFound => self.dispatch::<NotFound>(payload),
            Command::GetBlocks => self.dispatch::<GetBlocks>(payload),
            Command::GetHeaders => self.dispatch::<GetHeaders>(payload),
            Command::Headers => self.dispatch::<Headers>(payload),
            Command::Block => self.dispatch::<Block>(payload),
            Command::Tx => self.dispatch::<Tx>(payload),
            Command::Reject => self.dispatch::<Reject>(payload),
            Command::SendHeaders => self.dispatch::<SendHeaders>(payload),
            Command::FeeFilter => self.dispatch::<FeeFilter>(payload),
            Command::Mempool => self.dispatch::<Mempool>(payload),
            Command::Unknown => {
                // Forward compatibility: tolerate commands we do not speak.
                debug!(bytes = payload.len(), "ignoring unknown command");
                Ok(payload.len())
            }
        }
    }

    /// Delivers a terminal error to every handler of every tag, exactly
    /// once each, and clears all handler lists.
    pub fn broadcast(&self, code: NetError) {
        let drained = {
            let mut state = self.lock();
            state.terminal = Some(code);
            std::mem::take(&mut state.handlers)
        };
        for (_, handlers) in drained {
            for mut handler in handlers {
                handler(Dispatch::Stopped(code));
            }
        }
    }

    fn dispatch<P: Payload>(&self, payload: &[u8]) -> Result<usize, NetError> {
        let mut cursor = Cursor::new(payload);
        let message = P::decode(&mut cursor).map_err(|err| {
            warn!(command = P::COMMAND.name(), error = %err, "payload does not parse");
            NetError::BadStream
        })?;
        let consumed = cursor.position() as usize;

        // Snapshot the tag's handlers so re-entrant subscriptions miss
        // the current delivery.
        let mut snapshot = {
            let mut state = self.lock();
            if state.stopped {
                return Ok(consumed);
            }
            state.handlers.remove(&P::COMMAND).unwrap_or_default()
        };

        for handler in snapshot.iter_mut() {
            handler(Dispatch::Message(&message));
        }

        let mut state = self.lock();
        if state.stopped {
            // A handler stopped us mid-delivery; the snapshot missed the
            // broadcast, so it gets its terminal here.
            let code = state.terminal.unwrap_or(NetError::ChannelStopped);
            drop(state);
            for mut handler in snapshot {
                handler(Dispatch::Stopped(code));
            }
        } else {
            let fresh = state.handlers.remove(&P::COMMAND).unwrap_or_default();
            snapshot.extend(fresh);
            state.handlers.insert(P::COMMAND, snapshot);
        }
        Ok(consumed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MessageState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MessageSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

type StopHandler = Box<dyn FnOnce(NetError) + Send>;

struct StopState {
    stopped: bool,
    handlers: Vec<StopHandler>,
}

/// One-shot broadcast of a terminal status code.
///
/// Each subscription fires exactly once: with the relayed code, or with
/// its own `stopped_code` immediately when subscribing after the fact.
pub struct StopSubscriber {
    inner: Mutex<StopState>,
}

impl StopSubscriber {
    pub fn new() -> StopSubscriber {
        StopSubscriber {
            inner: Mutex::new(StopState {
                stopped: false,
                handlers: Vec::new(),
            }),
        }
    }

    pub fn subscribe<F>(&self, handler: F, stopped_code: NetError)
    where
        F: FnOnce(NetError) + Send + 'static,
    {
        {
            let mut state = self.lock();
            if !state.stopped {
                state.handlers.push(Box::new(handler));
                return;
            }
        }
        handler(stopped_code);
    }

    /// Bars further pending subscriptions; the pending ones still fire
    /// through [`StopSubscriber::relay`].
    pub fn stop(&self) {
        self.lock().stopped = true;
    }

    /// Fires every pending subscription with `code`.
    pub fn relay(&self, code: NetError) {
        let drained = {
            let mut state = self.lock();
            state.stopped = true;
            std::mem::take(&mut state.handlers)
        };
        for handler in drained {
            handler(code);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StopState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StopSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

type RelayHandler<T> = Box<dyn FnMut(Result<T, NetError>) + Send>;

struct RelayState<T> {
    stopped: bool,
    terminal: Option<NetError>,
    handlers: Vec<RelayHandler<T>>,
}

/// Persistent pub/sub over a single event type: every relayed value goes
/// to every live handler, and `stop` delivers one terminal error each.
///
/// The coordinator uses `Subscriber<Arc<Channel>>` for connection events.
pub struct Subscriber<T> {
    inner: Mutex<RelayState<T>>,
}

impl<T: Clone + Send + 'static> Subscriber<T> {
    pub fn new() -> Subscriber<T> {
        Subscriber {
            inner: Mutex::new(RelayState {
                stopped: false,
                terminal: None,
                handlers: Vec::new(),
            }),
        }
    }

    pub fn start(&self) {
        self.lock().stopped = false;
    }

    pub fn subscribe<F>(&self, handler: F) -> Result<(), NetError>
    where
        F: FnMut(Result<T, NetError>) + Send + 'static,
    {
        let mut state = self.lock();
        if state.stopped {
            return Err(NetError::ServiceStopped);
        }
        state.handlers.push(Box::new(handler));
        Ok(())
    }

    /// Delivers `value` to every current handler.
    pub fn relay(&self, value: T) {
        let mut snapshot = {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            std::mem::take(&mut state.handlers)
        };

        for handler in snapshot.iter_mut() {
            handler(Ok(value.clone()));
        }

        let mut state = self.lock();
        if state.stopped {
            let code = state.terminal.unwrap_or(NetError::ServiceStopped);
            drop(state);
            for mut handler in snapshot {
                handler(Err(code));
            }
        } else {
            let fresh = std::mem::take(&mut state.handlers);
            snapshot.extend(fresh);
            state.handlers = snapshot;
        }
    }

    /// Stops the subscriber and delivers `code` to every handler once.
    pub fn stop(&self, code: NetError) {
        let drained = {
            let mut state = self.lock();
            state.stopped = true;
            state.terminal = Some(code);
            std::mem::take(&mut state.handlers)
        };
        for mut handler in drained {
            handler(Err(code));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Default for Subscriber<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Ping;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ping_payload(nonce: u64) -> Vec<u8> {
        Ping { nonce }.encode()
    }

    #[test]
    fn message_handlers_fire_once_per_matching_load() {
        let subscriber = MessageSubscriber::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        subscriber
            .subscribe::<Ping, _>(move |delivery| {
                if let Ok(ping) = delivery {
                    sink.lock().unwrap().push(ping.nonce);
                }
            })
            .expect("subscribe");

        subscriber
            .load(Command::Ping, &ping_payload(1))
            .expect("load");
        subscriber
            .load(Command::Ping, &ping_payload(2))
            .expect("load");
        // A pong load must not reach the ping handler.
        subscriber
            .load(Command::Pong, &ping_payload(9))
            .expect("load");

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn load_reports_consumed_bytes() {
        let subscriber = MessageSubscriber::new();
        let mut payload = ping_payload(7);
        payload.extend_from_slice(&[0xDE, 0xAD]);
        let consumed = subscriber.load(Command::Ping, &payload).expect("load");
        assert_eq!(consumed, 8);
        assert_eq!(payload.len(), 10);
    }

    #[test]
    fn load_surfaces_parse_failures() {
        let subscriber = MessageSubscriber::new();
        // Five bytes cannot hold a ping nonce.
        let result = subscriber.load(Command::Ping, &[1, 2, 3, 4, 5]);
        assert_eq!(result, Err(NetError::BadStream));
    }

    #[test]
    fn unknown_commands_consume_everything_silently() {
        let subscriber = MessageSubscriber::new();
        let consumed = subscriber
            .load(Command::Unknown, &[1, 2, 3])
            .expect("load");
        assert_eq!(consumed, 3);
    }

    #[test]
    fn broadcast_delivers_one_terminal_per_handler() {
        let subscriber = MessageSubscriber::new();
        let terminals = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&terminals);
            subscriber
                .subscribe::<Ping, _>(move |delivery| {
                    if delivery.is_err() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .expect("subscribe");
        }

        subscriber.stop();
        subscriber.broadcast(NetError::ChannelStopped);
        assert_eq!(terminals.load(Ordering::SeqCst), 3);

        // Cleared: a second broadcast reaches nobody.
        subscriber.broadcast(NetError::ChannelStopped);
        assert_eq!(terminals.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn subscribe_fails_after_stop() {
        let subscriber = MessageSubscriber::new();
        subscriber.stop();
        let result = subscriber.subscribe::<Ping, _>(|_| {});
        assert_eq!(result, Err(NetError::ServiceStopped));
    }

    #[test]
    fn reentrant_subscribe_misses_current_delivery() {
        let subscriber = Arc::new(MessageSubscriber::new());
        let nested_hits = Arc::new(AtomicUsize::new(0));

        let reentrant = Arc::clone(&subscriber);
        let nested_counter = Arc::clone(&nested_hits);
        let armed = Arc::new(AtomicUsize::new(0));
        let armed_flag = Arc::clone(&armed);
        subscriber
            .subscribe::<Ping, _>(move |delivery| {
                if delivery.is_ok() && armed_flag.fetch_add(1, Ordering::SeqCst) == 0 {
                    let counter = Arc::clone(&nested_counter);
                    reentrant
                        .subscribe::<Ping, _>(move |inner| {
                            if inner.is_ok() {
                                counter.fetch_add(1, Ordering::SeqCst);
                            }
                        })
                        .expect("nested subscribe");
                }
            })
            .expect("subscribe");

        subscriber
            .load(Command::Ping, &ping_payload(1))
            .expect("load");
        assert_eq!(nested_hits.load(Ordering::SeqCst), 0);

        subscriber
            .load(Command::Ping, &ping_payload(2))
            .expect("load");
        assert_eq!(nested_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_subscriber_relays_each_pending_handler_once() {
        let subscriber = StopSubscriber::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let sink = Arc::clone(&seen);
            subscriber.subscribe(
                move |code| sink.lock().unwrap().push(code),
                NetError::ChannelStopped,
            );
        }

        subscriber.stop();
        subscriber.relay(NetError::BadStream);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![NetError::BadStream, NetError::BadStream]
        );

        // Late subscriptions fire immediately with their own code.
        let sink = Arc::clone(&seen);
        subscriber.subscribe(
            move |code| sink.lock().unwrap().push(code),
            NetError::ChannelStopped,
        );
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(seen.lock().unwrap()[2], NetError::ChannelStopped);
    }

    #[test]
    fn relay_subscriber_delivers_values_then_terminal() {
        let subscriber: Subscriber<u32> = Subscriber::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        subscriber
            .subscribe(move |event| sink.lock().unwrap().push(event))
            .expect("subscribe");

        subscriber.relay(5);
        subscriber.relay(6);
        subscriber.stop(NetError::ServiceStopped);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ok(5), Ok(6), Err(NetError::ServiceStopped)]
        );
        assert_eq!(
            subscriber.subscribe(|_| {}),
            Err(NetError::ServiceStopped)
        );
    }
}
