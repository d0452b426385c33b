//! Bitcoin wire framing: the 24-byte message heading and payload checksum.
//!
//! Every message on a Bitcoin P2P connection is framed as:
//!
//! ```text
//! +-----------+--------------+-------------------+--------------+
//! | magic (4) | command (12) | payload_size (4)  | checksum (4) |
//! +-----------+--------------+-------------------+--------------+
//! | payload (payload_size bytes)                           ...  |
//! +--------------------------------------------------------------
//! ```
//!
//! Magic and payload size are little-endian; the command is ASCII padded
//! with NUL bytes; the checksum is the first four bytes of a double
//! SHA-256 over the payload. This module is pure: it performs no I/O and
//! holds no state.
//!
//! Protocol reference:
//! https://developer.bitcoin.org/reference/p2p_networking.html#message-headers

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::error::NetError;

/// Size of the fixed message heading.
pub const HEADING_SIZE: usize = 24;

/// Width of the NUL-padded command field inside the heading.
pub const COMMAND_SIZE: usize = 12;

/// Upper bound on a single payload (10 MiB).
/// Headings indicating more than this are rejected before any payload
/// read is issued, bounding per-channel memory.
pub const MAX_PAYLOAD: usize = 10 * 1024 * 1024;

/// Network magic values. The first 4 bytes of every message identify the
/// network and act as a boundary marker in the TCP stream.
///
/// Bitcoin Core's mapping lives in `GetNetworkForMagic`:
/// https://github.com/bitcoin/bitcoin/blob/master/src/kernel/chainparams.cpp
pub const MAINNET_MAGIC: u32 = 0xD9B4_BEF9;
pub const TESTNET_MAGIC: u32 = 0x0709_110B;
pub const REGTEST_MAGIC: u32 = 0xDAB5_BFFA;
pub const SIGNET_MAGIC: u32 = 0x40CF_030A;

/// Checksum of an empty payload, as carried by `verack` and friends.
pub const EMPTY_CHECKSUM: u32 = 0x5DF6_E0E2;

/// First four bytes of SHA256(SHA256(payload)), read big-endian so the
/// empty payload yields the canonical [`EMPTY_CHECKSUM`] value.
pub fn checksum(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(Sha256::digest(payload));
    BigEndian::read_u32(&digest[..4])
}

/// The decoded 24-byte message heading.
///
/// `command` keeps the exact wire text (trailing NULs stripped) so that
/// unknown commands still log under their own name; [`Heading::kind`]
/// maps it onto the typed [`Command`] tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub magic: u32,
    pub command: String,
    pub payload_size: u32,
    pub checksum: u32,
}

impl Heading {
    /// Builds the heading for a payload about to be sent.
    pub fn for_payload(magic: u32, command: Command, payload: &[u8]) -> Heading {
        Heading {
            magic,
            command: command.name().to_string(),
            payload_size: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    /// Parses a heading from exactly [`HEADING_SIZE`] bytes.
    ///
    /// Fails with [`NetError::BadStream`] when the command field holds an
    /// interior NUL or any byte outside printable ASCII. The payload size
    /// is not range-checked here; the channel enforces [`MAX_PAYLOAD`].
    pub fn parse(bytes: &[u8; HEADING_SIZE]) -> Result<Heading, NetError> {
        let magic = LittleEndian::read_u32(&bytes[0..4]);
        let raw_command = &bytes[4..4 + COMMAND_SIZE];

        let text_end = raw_command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_SIZE);
        let (text, padding) = raw_command.split_at(text_end);
        if !padding.iter().all(|&b| b == 0) {
            return Err(NetError::BadStream);
        }
        if !text.iter().all(|b| b.is_ascii_graphic()) {
            return Err(NetError::BadStream);
        }
        let command = match std::str::from_utf8(text) {
            Ok(name) => name.to_string(),
            Err(_) => return Err(NetError::BadStream),
        };

        Ok(Heading {
            magic,
            command,
            payload_size: LittleEndian::read_u32(&bytes[16..20]),
            checksum: BigEndian::read_u32(&bytes[20..24]),
        })
    }

    /// Exact inverse of [`Heading::parse`].
    pub fn encode(&self) -> [u8; HEADING_SIZE] {
        let mut bytes = [0u8; HEADING_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.magic);
        let name = self.command.as_bytes();
        let len = name.len().min(COMMAND_SIZE);
        bytes[4..4 + len].copy_from_slice(&name[..len]);
        LittleEndian::write_u32(&mut bytes[16..20], self.payload_size);
        BigEndian::write_u32(&mut bytes[20..24], self.checksum);
        bytes
    }

    /// The typed message tag this heading names.
    pub fn kind(&self) -> Command {
        Command::from_name(&self.command)
    }
}

/// Typed message tag, one per Bitcoin command this runtime dispatches.
///
/// Commands outside this set map to [`Command::Unknown`] and are ignored
/// by the dispatcher (forward compatibility).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    Addr,
    GetAddr,
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Headers,
    Block,
    Tx,
    Reject,
    SendHeaders,
    FeeFilter,
    Mempool,
    Unknown,
}

impl Command {
    pub fn from_name(name: &str) -> Command {
        match name {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            "addr" => Command::Addr,
            "getaddr" => Command::GetAddr,
            "inv" => Command::Inv,
            "getdata" => Command::GetData,
            "notfound" => Command::NotFound,
            "getblocks" => Command::GetBlocks,
            "getheaders" => Command::GetHeaders,
            "headers" => Command::Headers,
            "block" => Command::Block,
            "tx" => Command::Tx,
            "reject" => Command::Reject,
            "sendheaders" => Command::SendHeaders,
            "feefilter" => Command::FeeFilter,
            "mempool" => Command::Mempool,
            _ => Command::Unknown,
        }
    }

    /// The wire name, without padding. Empty for [`Command::Unknown`].
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Addr => "addr",
            Command::GetAddr => "getaddr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::NotFound => "notfound",
            Command::GetBlocks => "getblocks",
            Command::GetHeaders => "getheaders",
            Command::Headers => "headers",
            Command::Block => "block",
            Command::Tx => "tx",
            Command::Reject => "reject",
            Command::SendHeaders => "sendheaders",
            Command::FeeFilter => "feefilter",
            Command::Mempool => "mempool",
            Command::Unknown => "",
        }
    }
}
