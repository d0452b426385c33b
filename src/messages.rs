//! Typed Bitcoin P2P payloads and their wire codecs.
//!
//! Each message the dispatcher understands is a struct implementing
//! [`Payload`]: a command tag plus `decode`/`encode` over the raw payload
//! bytes that follow the heading. Decoding is cursor-based so the caller
//! can tell how many bytes a parse consumed; messages carrying trailing
//! bytes beyond what the parser understands are tolerated upstream.
//!
//! | Message | Payload |
//! |---------|---------|
//! | `version` | protocol version, services, addresses, nonce, user agent |
//! | `verack`, `getaddr`, `sendheaders`, `mempool` | empty |
//! | `ping`, `pong` | 8-byte nonce |
//! | `addr` | up to 1000 timestamped network addresses |
//! | `inv`, `getdata`, `notfound` | inventory vectors |
//! | `getblocks`, `getheaders` | block locator + stop hash |
//! | `headers` | up to 2000 block headers |
//! | `block`, `tx` | header + raw body / raw transaction |
//! | `reject` | rejected command, code, reason |
//! | `feefilter` | minimum fee rate |
//!
//! Reference:
//! https://developer.bitcoin.org/reference/p2p_networking.html

use std::io::{self, Cursor, Read};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::wire::{self, Command, Heading};

/// Protocol version this runtime speaks.
/// https://developer.bitcoin.org/reference/p2p_networking.html#protocol-versions
pub const PROTOCOL_VERSION: i32 = 70016;

/// User agent advertised in the version handshake.
pub const USER_AGENT: &str = "/bitwire:0.1.0/";

/// Entry caps carried over from the protocol's own limits. Messages
/// claiming more entries than this are rejected before any allocation.
pub const MAX_ADDR_ENTRIES: usize = 1000;
pub const MAX_HEADER_ENTRIES: usize = 2000;
pub const MAX_INVENTORY_ENTRIES: usize = 50_000;
pub const MAX_LOCATOR_ENTRIES: usize = 2000;

/// Upper bound on a decoded var-string (user agents, reject reasons).
const MAX_VAR_STRING: usize = 1024;

/// A payload that can travel inside a message envelope.
///
/// Decode errors are plain [`io::Error`]s; the subscriber boundary maps
/// them to `BadStream` so the channel read pump treats a malformed
/// payload like any other framing violation.
pub trait Payload: Sized + Send + Sync + 'static {
    const COMMAND: Command;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Self>;

    fn encode(&self) -> Vec<u8>;
}

/// Serializes a full envelope (heading + payload) ready for the socket.
pub fn seal<P: Payload>(magic: u32, message: &P) -> Vec<u8> {
    let payload = message.encode();
    let heading = Heading::for_payload(magic, P::COMMAND, &payload);
    let mut frame = Vec::with_capacity(wire::HEADING_SIZE + payload.len());
    frame.extend_from_slice(&heading.encode());
    frame.extend_from_slice(&payload);
    frame
}

/// Seconds since the Unix epoch, truncated the way `addr` carries it.
pub(crate) fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

fn eof(context: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, context)
}

fn invalid(context: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, context)
}

// ----------------------------------------------------------------------------
// Primitive codecs
// ----------------------------------------------------------------------------

/// Reads a CompactSize varint.
pub fn read_varint(cursor: &mut Cursor<&[u8]>) -> io::Result<u64> {
    match cursor.read_u8()? {
        0xFD => cursor.read_u16::<LittleEndian>().map(u64::from),
        0xFE => cursor.read_u32::<LittleEndian>().map(u64::from),
        0xFF => cursor.read_u64::<LittleEndian>(),
        small => Ok(u64::from(small)),
    }
}

/// Appends a CompactSize varint.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn read_var_string(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = read_varint(cursor)? as usize;
    if len > MAX_VAR_STRING {
        return Err(invalid("var string exceeds length limit"));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| invalid("var string is not utf-8"))
}

fn write_var_string(out: &mut Vec<u8>, text: &str) {
    write_varint(out, text.len() as u64);
    out.extend_from_slice(text.as_bytes());
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> io::Result<[u8; N]> {
    let mut bytes = [0u8; N];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize)
}

// ----------------------------------------------------------------------------
// Service flags and network addresses
// ----------------------------------------------------------------------------

/// Service bits advertised in `version` and `addr` messages.
///
/// A forward-compatible bitfield: unknown bits are preserved.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Services(u64);

impl Services {
    pub const NONE: Services = Services(0x00);
    /// Full node, can be asked for complete blocks.
    pub const NODE_NETWORK: Services = Services(0x01);
    /// Supports bloom-filtered connections (BIP111).
    pub const NODE_BLOOM: Services = Services(0x04);
    /// Serves witness data (BIP144).
    pub const NODE_WITNESS: Services = Services(0x08);
    /// Full node limited to the last 288 blocks (BIP159).
    pub const NODE_NETWORK_LIMITED: Services = Services(0x0400);

    pub const fn new(bits: u64) -> Services {
        Services(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Services) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Services {
    fn from(bits: u64) -> Services {
        Services(bits)
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Services(0x{:x})", self.0)
    }
}

/// The 26-byte network address field used inside `version` payloads:
/// services, IPv6-mapped address, big-endian port. No timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: Services,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn unspecified() -> NetAddress {
        NetAddress {
            services: Services::NONE,
            ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn from_socket(addr: SocketAddr, services: Services) -> NetAddress {
        NetAddress {
            services,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<NetAddress> {
        let services = Services::from(cursor.read_u64::<LittleEndian>()?);
        let octets: [u8; 16] = read_array(cursor)?;
        let port = cursor.read_u16::<BigEndian>()?;
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        Ok(NetAddress { services, ip, port })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.services.bits().to_le_bytes());
        let v6 = match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        out.extend_from_slice(&v6.octets());
        out.extend_from_slice(&self.port.to_be_bytes());
    }
}

/// One known peer: the record gossiped by `addr` messages and persisted
/// by the address book. Identity is the `(ip, port)` authority; the
/// services and timestamp ride along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub services: Services,
    pub timestamp: u32,
}

impl PeerAddress {
    pub fn from_socket(addr: SocketAddr, services: Services) -> PeerAddress {
        PeerAddress {
            ip: addr.ip(),
            port: addr.port(),
            services,
            timestamp: unix_time(),
        }
    }

    pub fn authority(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<PeerAddress> {
        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let address = NetAddress::decode(cursor)?;
        Ok(PeerAddress {
            ip: address.ip,
            port: address.port,
            services: address.services,
            timestamp,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        NetAddress {
            services: self.services,
            ip: self.ip,
            port: self.port,
        }
        .encode_into(out);
    }
}

// ----------------------------------------------------------------------------
// Handshake and liveness messages
// ----------------------------------------------------------------------------

/// The `version` handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub version: i32,
    pub services: Services,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// Absent on peers older than BIP37.
    pub relay: Option<bool>,
}

impl Version {
    /// A version message for this runtime, ready for the handshake.
    pub fn template(receiver: NetAddress, sender: NetAddress, start_height: i32) -> Version {
        Version {
            version: PROTOCOL_VERSION,
            services: sender.services,
            timestamp: unix_time() as i64,
            receiver,
            sender,
            nonce: rand::random(),
            user_agent: USER_AGENT.to_string(),
            start_height,
            relay: Some(false),
        }
    }
}

impl Payload for Version {
    const COMMAND: Command = Command::Version;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Version> {
        let version = cursor.read_i32::<LittleEndian>()?;
        let services = Services::from(cursor.read_u64::<LittleEndian>()?);
        let timestamp = cursor.read_i64::<LittleEndian>()?;
        let receiver = NetAddress::decode(cursor)?;
        let sender = NetAddress::decode(cursor)?;
        let nonce = cursor.read_u64::<LittleEndian>()?;
        let user_agent = read_var_string(cursor)?;
        let start_height = cursor.read_i32::<LittleEndian>()?;
        let relay = if remaining(cursor) > 0 {
            Some(cursor.read_u8()? != 0)
        } else {
            None
        };

        Ok(Version {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(86 + self.user_agent.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.services.bits().to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        self.receiver.encode_into(&mut out);
        self.sender.encode_into(&mut out);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        write_var_string(&mut out, &self.user_agent);
        out.extend_from_slice(&self.start_height.to_le_bytes());
        if let Some(relay) = self.relay {
            out.push(u8::from(relay));
        }
        out
    }
}

macro_rules! empty_payload {
    ($name:ident, $command:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl Payload for $name {
            const COMMAND: Command = $command;

            fn decode(_cursor: &mut Cursor<&[u8]>) -> io::Result<$name> {
                Ok($name)
            }

            fn encode(&self) -> Vec<u8> {
                Vec::new()
            }
        }
    };
}

empty_payload!(Verack, Command::Verack);
empty_payload!(GetAddr, Command::GetAddr);
empty_payload!(SendHeaders, Command::SendHeaders);
empty_payload!(Mempool, Command::Mempool);

/// `ping` carries a nonce the peer echoes back in `pong` (BIP31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

impl Ping {
    pub fn random() -> Ping {
        Ping {
            nonce: rand::random(),
        }
    }
}

impl Payload for Ping {
    const COMMAND: Command = Command::Ping;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Ping> {
        Ok(Ping {
            nonce: cursor.read_u64::<LittleEndian>()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        self.nonce.to_le_bytes().to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

impl Payload for Pong {
    const COMMAND: Command = Command::Pong;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Pong> {
        Ok(Pong {
            nonce: cursor.read_u64::<LittleEndian>()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        self.nonce.to_le_bytes().to_vec()
    }
}

// ----------------------------------------------------------------------------
// Address gossip
// ----------------------------------------------------------------------------

/// `addr`: up to [`MAX_ADDR_ENTRIES`] known peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub addresses: Vec<PeerAddress>,
}

impl Payload for Addr {
    const COMMAND: Command = Command::Addr;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Addr> {
        let count = read_varint(cursor)? as usize;
        if count > MAX_ADDR_ENTRIES {
            return Err(invalid("addr exceeds entry limit"));
        }
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            addresses.push(PeerAddress::decode(cursor)?);
        }
        Ok(Addr { addresses })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 30 * self.addresses.len());
        write_varint(&mut out, self.addresses.len() as u64);
        for address in &self.addresses {
            address.encode_into(&mut out);
        }
        out
    }
}

// ----------------------------------------------------------------------------
// Inventory messages
// ----------------------------------------------------------------------------

/// Inventory object types for `inv`, `getdata` and `notfound`.
/// Unrecognized values survive round-trips via `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryKind {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CompactBlock,
    WitnessTx,
    WitnessBlock,
    WitnessFilteredBlock,
    Other(u32),
}

impl InventoryKind {
    pub fn from_wire(value: u32) -> InventoryKind {
        match value {
            0 => InventoryKind::Error,
            1 => InventoryKind::Tx,
            2 => InventoryKind::Block,
            3 => InventoryKind::FilteredBlock,
            4 => InventoryKind::CompactBlock,
            0x4000_0001 => InventoryKind::WitnessTx,
            0x4000_0002 => InventoryKind::WitnessBlock,
            0x4000_0003 => InventoryKind::WitnessFilteredBlock,
            other => InventoryKind::Other(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            InventoryKind::Error => 0,
            InventoryKind::Tx => 1,
            InventoryKind::Block => 2,
            InventoryKind::FilteredBlock => 3,
            InventoryKind::CompactBlock => 4,
            InventoryKind::WitnessTx => 0x4000_0001,
            InventoryKind::WitnessBlock => 0x4000_0002,
            InventoryKind::WitnessFilteredBlock => 0x4000_0003,
            InventoryKind::Other(other) => other,
        }
    }
}

/// One inventory vector: an object type and its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InventoryKind,
    pub hash: [u8; 32],
}

fn decode_inventory_list(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<Inventory>> {
    let count = read_varint(cursor)? as usize;
    if count > MAX_INVENTORY_ENTRIES {
        return Err(invalid("inventory exceeds entry limit"));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = InventoryKind::from_wire(cursor.read_u32::<LittleEndian>()?);
        let hash = read_array(cursor)?;
        entries.push(Inventory { kind, hash });
    }
    Ok(entries)
}

fn encode_inventory_list(entries: &[Inventory]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 36 * entries.len());
    write_varint(&mut out, entries.len() as u64);
    for entry in entries {
        out.extend_from_slice(&entry.kind.to_wire().to_le_bytes());
        out.extend_from_slice(&entry.hash);
    }
    out
}

macro_rules! inventory_payload {
    ($name:ident, $command:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub inventory: Vec<Inventory>,
        }

        impl Payload for $name {
            const COMMAND: Command = $command;

            fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<$name> {
                Ok($name {
                    inventory: decode_inventory_list(cursor)?,
                })
            }

            fn encode(&self) -> Vec<u8> {
                encode_inventory_list(&self.inventory)
            }
        }
    };
}

inventory_payload!(Inv, Command::Inv);
inventory_payload!(GetData, Command::GetData);
inventory_payload!(NotFound, Command::NotFound);

// ----------------------------------------------------------------------------
// Block locator messages
// ----------------------------------------------------------------------------

fn decode_locator(cursor: &mut Cursor<&[u8]>) -> io::Result<(u32, Vec<[u8; 32]>, [u8; 32])> {
    let version = cursor.read_u32::<LittleEndian>()?;
    let count = read_varint(cursor)? as usize;
    if count > MAX_LOCATOR_ENTRIES {
        return Err(invalid("locator exceeds entry limit"));
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(read_array(cursor)?);
    }
    let stop_hash = read_array(cursor)?;
    Ok((version, locator, stop_hash))
}

fn encode_locator(version: u32, locator: &[[u8; 32]], stop_hash: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + 32 * (locator.len() + 1));
    out.extend_from_slice(&version.to_le_bytes());
    write_varint(&mut out, locator.len() as u64);
    for hash in locator {
        out.extend_from_slice(hash);
    }
    out.extend_from_slice(stop_hash);
    out
}

macro_rules! locator_payload {
    ($name:ident, $command:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub version: u32,
            pub locator: Vec<[u8; 32]>,
            pub stop_hash: [u8; 32],
        }

        impl Payload for $name {
            const COMMAND: Command = $command;

            fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<$name> {
                let (version, locator, stop_hash) = decode_locator(cursor)?;
                Ok($name {
                    version,
                    locator,
                    stop_hash,
                })
            }

            fn encode(&self) -> Vec<u8> {
                encode_locator(self.version, &self.locator, &self.stop_hash)
            }
        }
    };
}

locator_payload!(GetBlocks, Command::GetBlocks);
locator_payload!(GetHeaders, Command::GetHeaders);

// ----------------------------------------------------------------------------
// Blocks and transactions
// ----------------------------------------------------------------------------

/// A block header, exactly 80 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<BlockHeader> {
        Ok(BlockHeader {
            version: cursor.read_i32::<LittleEndian>()?,
            prev_blockhash: read_array(cursor)?,
            merkle_root: read_array(cursor)?,
            time: cursor.read_u32::<LittleEndian>()?,
            bits: cursor.read_u32::<LittleEndian>()?,
            nonce: cursor.read_u32::<LittleEndian>()?,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_blockhash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }

    /// The block id: double SHA-256 of the 80 header bytes, in wire
    /// (little-endian) order. Reverse for display.
    pub fn hash(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(80);
        self.encode_into(&mut bytes);
        let digest = Sha256::digest(Sha256::digest(&bytes));
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        hash
    }
}

/// `headers`: block headers, each followed on the wire by a CompactSize
/// transaction count that is always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub headers: Vec<BlockHeader>,
}

impl Payload for Headers {
    const COMMAND: Command = Command::Headers;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Headers> {
        let count = read_varint(cursor)? as usize;
        if count > MAX_HEADER_ENTRIES {
            return Err(invalid("headers exceeds entry limit"));
        }
        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            headers.push(BlockHeader::decode(cursor)?);
            // txn_count, always zero in a headers message
            let _ = read_varint(cursor)?;
        }
        Ok(Headers { headers })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 81 * self.headers.len());
        write_varint(&mut out, self.headers.len() as u64);
        for header in &self.headers {
            header.encode_into(&mut out);
            write_varint(&mut out, 0);
        }
        out
    }
}

/// `block`: the 80-byte header, the transaction count, and the raw
/// serialized transactions (not interpreted by this runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub tx_count: u64,
    pub body: Vec<u8>,
}

impl Payload for Block {
    const COMMAND: Command = Command::Block;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Block> {
        let header = BlockHeader::decode(cursor)?;
        let tx_count = read_varint(cursor)?;
        let mut body = Vec::new();
        cursor.read_to_end(&mut body)?;
        Ok(Block {
            header,
            tx_count,
            body,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(81 + self.body.len());
        self.header.encode_into(&mut out);
        write_varint(&mut out, self.tx_count);
        out.extend_from_slice(&self.body);
        out
    }
}

/// `tx`: a raw serialized transaction, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub raw: Vec<u8>,
}

impl Payload for Tx {
    const COMMAND: Command = Command::Tx;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Tx> {
        let mut raw = Vec::new();
        cursor.read_to_end(&mut raw)?;
        if raw.is_empty() {
            return Err(eof("tx payload is empty"));
        }
        Ok(Tx { raw })
    }

    fn encode(&self) -> Vec<u8> {
        self.raw.clone()
    }
}

// ----------------------------------------------------------------------------
// Reject and fee filter
// ----------------------------------------------------------------------------

/// `reject` (BIP61): the command being rejected, a code, and a reason.
/// Some codes append extra data (e.g. a block hash) kept raw here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Vec<u8>,
}

impl Payload for Reject {
    const COMMAND: Command = Command::Reject;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Reject> {
        let message = read_var_string(cursor)?;
        let code = cursor.read_u8()?;
        let reason = read_var_string(cursor)?;
        let mut data = Vec::new();
        cursor.read_to_end(&mut data)?;
        Ok(Reject {
            message,
            code,
            reason,
            data,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.message.len() + self.reason.len());
        write_var_string(&mut out, &self.message);
        out.push(self.code);
        write_var_string(&mut out, &self.reason);
        out.extend_from_slice(&self.data);
        out
    }
}

/// `feefilter` (BIP133): minimum fee rate, satoshis per kilobyte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeFilter {
    pub fee_rate: u64,
}

impl Payload for FeeFilter {
    const COMMAND: Command = Command::FeeFilter;

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<FeeFilter> {
        Ok(FeeFilter {
            fee_rate: cursor.read_u64::<LittleEndian>()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        self.fee_rate.to_le_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn decode_all<P: Payload>(payload: &[u8]) -> (P, usize) {
        let mut cursor = Cursor::new(payload);
        let message = P::decode(&mut cursor).expect("decode");
        (message, cursor.position() as usize)
    }

    #[test]
    fn varint_boundaries_round_trip() {
        for value in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            let mut cursor = Cursor::new(out.as_slice());
            assert_eq!(read_varint(&mut cursor).expect("varint"), value);
            assert_eq!(cursor.position() as usize, out.len());
        }
    }

    #[test]
    fn ping_round_trips_nonce() {
        let ping = Ping {
            nonce: 0x0102_0304_0506_0708,
        };
        let bytes = ping.encode();
        assert_eq!(bytes, 0x0102_0304_0506_0708u64.to_le_bytes());
        let (decoded, consumed) = decode_all::<Ping>(&bytes);
        assert_eq!(decoded, ping);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn version_round_trips() {
        let version = Version {
            version: PROTOCOL_VERSION,
            services: Services::NODE_NETWORK,
            timestamp: 1_700_000_000,
            receiver: NetAddress {
                services: Services::NODE_NETWORK,
                ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
                port: 8333,
            },
            sender: NetAddress {
                services: Services::NODE_NETWORK,
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                port: 8333,
            },
            nonce: 0x1234_5678_90AB_CDEF,
            user_agent: "/Satoshi:25.0.0/".to_string(),
            start_height: 820_000,
            relay: Some(true),
        };
        let bytes = version.encode();
        let (decoded, consumed) = decode_all::<Version>(&bytes);
        assert_eq!(decoded, version);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn version_without_relay_flag_decodes() {
        let mut version =
            Version::template(NetAddress::unspecified(), NetAddress::unspecified(), 0);
        version.relay = None;
        let bytes = version.encode();
        let (decoded, _) = decode_all::<Version>(&bytes);
        assert_eq!(decoded.relay, None);
    }

    #[test]
    fn addr_round_trips_and_caps_entries() {
        let addr = Addr {
            addresses: vec![
                PeerAddress {
                    ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                    port: 8333,
                    services: Services::NODE_NETWORK,
                    timestamp: 1_700_000_100,
                },
                PeerAddress {
                    ip: IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)),
                    port: 8334,
                    services: Services::NONE,
                    timestamp: 1_700_000_200,
                },
            ],
        };
        let bytes = addr.encode();
        let (decoded, consumed) = decode_all::<Addr>(&bytes);
        assert_eq!(decoded, addr);
        assert_eq!(consumed, bytes.len());

        let mut oversized = Vec::new();
        write_varint(&mut oversized, (MAX_ADDR_ENTRIES + 1) as u64);
        let mut cursor = Cursor::new(oversized.as_slice());
        assert!(Addr::decode(&mut cursor).is_err());
    }

    #[test]
    fn inventory_round_trips_unknown_kinds() {
        let inv = Inv {
            inventory: vec![
                Inventory {
                    kind: InventoryKind::Block,
                    hash: [0xAB; 32],
                },
                Inventory {
                    kind: InventoryKind::Other(0x7FFF_0001),
                    hash: [0x01; 32],
                },
            ],
        };
        let bytes = inv.encode();
        let (decoded, _) = decode_all::<Inv>(&bytes);
        assert_eq!(decoded, inv);
    }

    #[test]
    fn getheaders_round_trips() {
        let message = GetHeaders {
            version: PROTOCOL_VERSION as u32,
            locator: vec![[0x11; 32], [0x22; 32]],
            stop_hash: [0u8; 32],
        };
        let bytes = message.encode();
        let (decoded, consumed) = decode_all::<GetHeaders>(&bytes);
        assert_eq!(decoded, message);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn headers_round_trip_with_txn_count_padding() {
        let header = BlockHeader {
            version: 4,
            prev_blockhash: [0x55; 32],
            merkle_root: [0x66; 32],
            time: 1_700_000_000,
            bits: 0x1D00_FFFF,
            nonce: 42,
        };
        let message = Headers {
            headers: vec![header, header],
        };
        let bytes = message.encode();
        // 80-byte header + 1 txn_count byte each
        assert_eq!(bytes.len(), 1 + 2 * 81);
        let (decoded, _) = decode_all::<Headers>(&bytes);
        assert_eq!(decoded, message);
    }

    #[test]
    fn block_header_hash_is_double_sha() {
        let header = BlockHeader {
            version: 1,
            prev_blockhash: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
        };
        let mut bytes = Vec::new();
        header.encode_into(&mut bytes);
        let expected = Sha256::digest(Sha256::digest(&bytes));
        assert_eq!(header.hash()[..], expected[..]);
    }

    #[test]
    fn reject_round_trips() {
        let reject = Reject {
            message: "tx".to_string(),
            code: 0x10,
            reason: "bad-txns-inputs-spent".to_string(),
            data: vec![0xAA; 32],
        };
        let bytes = reject.encode();
        let (decoded, _) = decode_all::<Reject>(&bytes);
        assert_eq!(decoded, reject);
    }

    #[test]
    fn net_address_maps_ipv4_through_ipv6() {
        let address = NetAddress {
            services: Services::NODE_NETWORK,
            ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 18444,
        };
        let mut out = Vec::new();
        address.encode_into(&mut out);
        assert_eq!(out.len(), 26);
        let mut cursor = Cursor::new(out.as_slice());
        let decoded = NetAddress::decode(&mut cursor).expect("decode");
        assert_eq!(decoded, address);
    }

    #[test]
    fn seal_produces_a_parseable_envelope() {
        let frame = seal(wire::REGTEST_MAGIC, &Ping { nonce: 7 });
        assert_eq!(frame.len(), wire::HEADING_SIZE + 8);
        let heading_bytes: [u8; wire::HEADING_SIZE] =
            frame[..wire::HEADING_SIZE].try_into().expect("heading");
        let heading = Heading::parse(&heading_bytes).expect("parse");
        assert_eq!(heading.kind(), Command::Ping);
        assert_eq!(heading.payload_size, 8);
        assert_eq!(
            heading.checksum,
            wire::checksum(&frame[wire::HEADING_SIZE..])
        );
    }
}
