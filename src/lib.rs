//! # Bitwire - Bitcoin P2P Networking Runtime
//!
//! Bitwire frames Bitcoin wire-protocol messages over TCP and runs the
//! sessions that keep a node connected:
//!
//! - **Wire codec**: the 24-byte heading and double-SHA-256 checksum
//! - **Channels**: one socket each, a read pump that dispatches typed
//!   messages, serialized writes, terminal stop fan-out
//! - **Coordinator**: inbound/outbound/manual/seed sessions, a channel
//!   registry keyed by remote authority, a persisted address book
//!
//! ## Architecture
//!
//! Each channel runs its read pump as a spawned task holding an owning
//! handle to itself, so pending I/O keeps the channel alive even when
//! the registry evicts it. Message delivery is a typed pub/sub: handlers
//! subscribe per command tag and receive either parsed payloads or one
//! terminal error when the channel stops. The coordinator's start, run
//! and stop sequences are strictly staged; stop is idempotent and safe
//! to call from anywhere.
//!
//! ## Quick Start
//!
//! ```ignore
//! let network = Network::new(Settings::default());
//! network.start().await?;
//! network.subscribe_connections(|event| {
//!     if let Ok(channel) = event {
//!         println!("peer {}", channel.authority());
//!     }
//! })?;
//! network.run().await?;
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `wire` | Heading codec, checksum, command tags, network magic |
//! | `messages` | Typed payloads and their byte-exact codecs |
//! | `subscriber` | Message/stop/connection subscription primitives |
//! | `channel` | One live connection: read pump, sends, stop fan-out |
//! | `connections` | Registry of live channels by remote authority |
//! | `hosts` | Persisted address book |
//! | `sessions` | Inbound, outbound, manual and seed adapters |
//! | `p2p` | The coordinator tying it all together |
//! | `settings` | Configuration with mainnet defaults |

pub mod channel;
pub mod connections;
pub mod error;
pub mod hosts;
pub mod messages;
pub mod p2p;
pub mod sessions;
pub mod settings;
pub mod subscriber;
pub mod wire;

pub use channel::{Channel, ChannelOptions};
pub use error::NetError;
pub use messages::{Payload, PeerAddress, Services};
pub use p2p::Network;
pub use settings::Settings;
pub use wire::{checksum, Command, Heading, MAX_PAYLOAD};
