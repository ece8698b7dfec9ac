// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages, with associated serialization.
//!
//! Everything here is bit-exact against the peer protocol: big-endian integers, length-prefixed
//! arrays where the protocol requires them, and `excess_data` capture so that a message which
//! carries fields from the future round-trips (and signature-checks) unchanged.
//!
//! The short-channel-id list encoding used by the gossip queries lives here too: a one-byte tag
//! (`0x00` uncompressed, `0x01` zlib) followed by the concatenated 8-byte ids. Encoding prefers
//! zlib but falls back whenever compression does not actually shrink the payload.

use std::convert::TryInto;
use std::cmp;
use std::fmt;
use std::io::{self, Read, Write};

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::hash_types::BlockHash;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::routing::gossip::NodeId;
use crate::util::logger::Level;
use crate::util::ser::{Readable, Writeable, Writer};

/// `channel_flags` bit indicating the direction the update applies to.
pub const CHANNEL_FLAG_DIRECTION: u8 = 1 << 0;
/// `channel_flags` bit indicating the channel is disabled in that direction.
pub const CHANNEL_FLAG_DISABLED: u8 = 1 << 1;
/// `message_flags` bit indicating the `htlc_maximum_msat` field is present.
pub const MESSAGE_FLAG_OPT_HTLC_MAX: u8 = 1 << 0;

/// An error in decoding a message or struct.
#[derive(Debug, PartialEq)]
pub enum DecodeError {
	/// A length descriptor in the packet didn't describe the later data correctly
	BadLengthDescriptor,
	/// Buffer too short
	ShortRead,
	/// A value was invalid
	InvalidValue,
	/// A node_announcement carried more than one address of a given type
	ExtraAddressesPerType,
	/// A short-channel-id list used an encoding tag we don't know
	UnsupportedCompression,
	/// Error from std::io
	Io(io::ErrorKind),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::BadLengthDescriptor => f.write_str("A length descriptor in the packet didn't describe the later data correctly"),
			DecodeError::ShortRead => f.write_str("Packet extended beyond the provided bytes"),
			DecodeError::InvalidValue => f.write_str("Nonsense bytes didn't map to the type they were interpreted as"),
			DecodeError::ExtraAddressesPerType => f.write_str("More than one address of a single type"),
			DecodeError::UnsupportedCompression => f.write_str("Unknown short-channel-id encoding tag"),
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

/// An error message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMessage {
	/// The channel id involved in the error; all-zeros refers to the whole connection.
	pub channel_id: [u8; 32],
	/// A possibly printable error description.
	pub data: String,
}

/// Used to put an error message in a [`GossipError`].
#[derive(Clone, Debug)]
pub enum ErrorAction {
	/// The peer took some action which made us think they were useless. Disconnect them.
	DisconnectPeer {
		/// An error message which we should make an effort to send before we disconnect.
		msg: Option<ErrorMessage>,
	},
	/// The peer did something harmless that we weren't able to process, just log and ignore
	IgnoreError,
	/// The peer did something harmless that we weren't able to process, just log at the given
	/// level and ignore
	IgnoreAndLog(Level),
	/// The peer provided us with a gossip message which we'd already seen. In most cases this
	/// should be ignored.
	IgnoreDuplicateGossip,
	/// The peer did something incorrect. Tell them without closing the connection.
	SendErrorMessage {
		/// The message to send.
		msg: ErrorMessage,
	},
}

/// An Err type for failure to process gossip.
#[derive(Clone, Debug)]
pub struct GossipError {
	/// A human-readable message describing the error
	pub err: String,
	/// The action which should be taken against the offending peer.
	pub action: ErrorAction,
}

/// A ping message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
	/// The desired response length
	pub ponglen: u16,
	/// The ping packet size.
	/// This field is not sent on the wire. byteslen zeros are sent.
	pub byteslen: u16,
}

/// A pong message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct Pong {
	/// The pong packet size.
	/// This field is not sent on the wire. byteslen zeros are sent.
	pub byteslen: u16,
}

/// An address which can be used to connect to a remote peer
#[derive(Clone, Debug, PartialEq)]
pub enum NetAddress {
	/// An IPv4 address/port on which the peer is listening.
	IPv4 {
		/// The 4-byte IPv4 address
		addr: [u8; 4],
		/// The port on which the node is listening
		port: u16,
	},
	/// An IPv6 address/port on which the peer is listening.
	IPv6 {
		/// The 16-byte IPv6 address
		addr: [u8; 16],
		/// The port on which the node is listening
		port: u16,
	},
	/// An old-style Tor onion address/port on which the peer is listening.
	OnionV2 {
		/// The bytes (usually encoded in base32 with ".onion" appended)
		addr: [u8; 10],
		/// The port on which the node is listening
		port: u16,
	},
	/// A new-style Tor onion address/port on which the peer is listening.
	OnionV3 {
		/// The ed25519 long-term public key of the peer
		ed25519_pubkey: [u8; 32],
		/// The checksum of the pubkey and version, as included in the onion address
		checksum: u16,
		/// The version byte, as defined by the Tor Onion v3 spec.
		version: u8,
		/// The port on which the node is listening
		port: u16,
	},
}

impl NetAddress {
	fn get_id(&self) -> u8 {
		match self {
			&NetAddress::IPv4 { .. } => 1,
			&NetAddress::IPv6 { .. } => 2,
			&NetAddress::OnionV2 { .. } => 3,
			&NetAddress::OnionV3 { .. } => 4,
		}
	}

	/// Strict byte-length of address descriptor, 1-byte type not recorded
	fn len(&self) -> u16 {
		match self {
			&NetAddress::IPv4 { .. } => 6,
			&NetAddress::IPv6 { .. } => 18,
			&NetAddress::OnionV2 { .. } => 12,
			&NetAddress::OnionV3 { .. } => 37,
		}
	}
}

impl Writeable for NetAddress {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		match self {
			&NetAddress::IPv4 { ref addr, ref port } => {
				1u8.write(writer)?;
				addr.write(writer)?;
				port.write(writer)?;
			}
			&NetAddress::IPv6 { ref addr, ref port } => {
				2u8.write(writer)?;
				addr.write(writer)?;
				port.write(writer)?;
			}
			&NetAddress::OnionV2 { ref addr, ref port } => {
				3u8.write(writer)?;
				addr.write(writer)?;
				port.write(writer)?;
			}
			&NetAddress::OnionV3 { ref ed25519_pubkey, ref checksum, ref version, ref port } => {
				4u8.write(writer)?;
				ed25519_pubkey.write(writer)?;
				checksum.write(writer)?;
				version.write(writer)?;
				port.write(writer)?;
			}
		}
		Ok(())
	}
}

impl Readable for Result<NetAddress, u8> {
	fn read<R: Read>(reader: &mut R) -> Result<Result<NetAddress, u8>, DecodeError> {
		let byte = <u8 as Readable>::read(reader)?;
		match byte {
			1 => Ok(Ok(NetAddress::IPv4 {
				addr: Readable::read(reader)?,
				port: Readable::read(reader)?,
			})),
			2 => Ok(Ok(NetAddress::IPv6 {
				addr: Readable::read(reader)?,
				port: Readable::read(reader)?,
			})),
			3 => Ok(Ok(NetAddress::OnionV2 {
				addr: Readable::read(reader)?,
				port: Readable::read(reader)?,
			})),
			4 => Ok(Ok(NetAddress::OnionV3 {
				ed25519_pubkey: Readable::read(reader)?,
				checksum: Readable::read(reader)?,
				version: Readable::read(reader)?,
				port: Readable::read(reader)?,
			})),
			_ => Ok(Err(byte)),
		}
	}
}

/// The unsigned part of a node_announcement
#[derive(Clone, Debug, PartialEq)]
pub struct UnsignedNodeAnnouncement {
	/// The advertised global features, as opaque bytes.
	pub features: Vec<u8>,
	/// A strictly monotonic announcement counter, with gaps allowed
	pub timestamp: u32,
	/// The node_id this announcement originated from
	pub node_id: NodeId,
	/// An RGB color for UI purposes
	pub rgb: [u8; 3],
	/// An alias, for UI purposes. This should be sanitized before use. There is no guarantee
	/// of uniqueness.
	pub alias: [u8; 32],
	/// List of addresses on which this node is reachable
	pub addresses: Vec<NetAddress>,
	pub(crate) excess_address_data: Vec<u8>,
	pub(crate) excess_data: Vec<u8>,
}

/// A node_announcement message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct NodeAnnouncement {
	/// The signature by the node key
	pub signature: Signature,
	/// The actual content of the announcement
	pub contents: UnsignedNodeAnnouncement,
}

/// The unsigned part of a channel_announcement
#[derive(Clone, Debug, PartialEq)]
pub struct UnsignedChannelAnnouncement {
	/// The advertised channel features, as opaque bytes.
	pub features: Vec<u8>,
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// The short channel ID
	pub short_channel_id: u64,
	/// One of the two node_ids which are endpoints of this channel
	pub node_id_1: NodeId,
	/// The other of the two node_ids which are endpoints of this channel
	pub node_id_2: NodeId,
	/// The funding key for the first node
	pub bitcoin_key_1: NodeId,
	/// The funding key for the second node
	pub bitcoin_key_2: NodeId,
	pub(crate) excess_data: Vec<u8>,
}

/// A channel_announcement message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelAnnouncement {
	/// Authentication of the announcement by the first public node
	pub node_signature_1: Signature,
	/// Authentication of the announcement by the second public node
	pub node_signature_2: Signature,
	/// Proof of funding UTXO ownership by the first public node
	pub bitcoin_signature_1: Signature,
	/// Proof of funding UTXO ownership by the second public node
	pub bitcoin_signature_2: Signature,
	/// The actual announcement
	pub contents: UnsignedChannelAnnouncement,
}

/// The unsigned part of a channel_update
#[derive(Clone, Debug, PartialEq)]
pub struct UnsignedChannelUpdate {
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// The short channel ID
	pub short_channel_id: u64,
	/// A strictly monotonic announcement counter, with gaps allowed, specific to this channel
	pub timestamp: u32,
	/// Message flags; bit 0 must match the presence of `htlc_maximum_msat`. Unknown bits are
	/// carried through verbatim so the signature still covers them.
	pub message_flags: u8,
	/// Channel flags: bit 0 is the direction, bit 1 disables the channel in that direction.
	pub channel_flags: u8,
	/// The number of blocks such that if:
	/// `incoming_cltv_expiry < outgoing_cltv_expiry + cltv_expiry_delta`
	/// then we need to fail the HTLC backwards.
	pub cltv_expiry_delta: u16,
	/// The minimum HTLC size incoming to sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The base HTLC fee charged by sender, in milli-satoshi
	pub fee_base_msat: u32,
	/// The amount to fee multiplier, in micro-satoshi
	pub fee_proportional_millionths: u32,
	/// The maximum HTLC value incoming to sender, in milli-satoshi. Present iff
	/// `message_flags` has [`MESSAGE_FLAG_OPT_HTLC_MAX`] set.
	pub htlc_maximum_msat: Option<u64>,
	pub(crate) excess_data: Vec<u8>,
}

/// A channel_update message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelUpdate {
	/// A signature of the channel update
	pub signature: Signature,
	/// The actual channel update
	pub contents: UnsignedChannelUpdate,
}

impl UnsignedChannelUpdate {
	/// The direction this update applies to: 0 if it describes the half from `node_id_1`,
	/// 1 for the half from `node_id_2`.
	pub fn direction(&self) -> u8 {
		self.channel_flags & CHANNEL_FLAG_DIRECTION
	}

	/// Whether the update disables its half of the channel.
	pub fn disabled(&self) -> bool {
		self.channel_flags & CHANNEL_FLAG_DISABLED == CHANNEL_FLAG_DISABLED
	}
}

/// A query_short_channel_ids message, used to request gossip messages for specific channels.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryShortChannelIds {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// The short_channel_ids that are being queried
	pub short_channel_ids: Vec<u64>,
}

/// A reply_short_channel_ids_end message, sent after all gossip for a
/// query_short_channel_ids has been streamed.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplyShortChannelIdsEnd {
	/// The genesis hash of the blockchain that was queried
	pub chain_hash: BlockHash,
	/// Indicates if the query recipient maintains up-to-date channel
	/// information for the chain_hash
	pub full_information: bool,
}

/// A query_channel_range message, used to request a list of channels within a block range.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryChannelRange {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// The height of the first block for the channel UTXOs being queried
	pub first_blocknum: u32,
	/// The number of blocks to include in the query results
	pub number_of_blocks: u32,
}

impl QueryChannelRange {
	/// The first block after the queried range, saturating at the u32 boundary.
	pub fn end_blocknum(&self) -> u32 {
		match self.first_blocknum.checked_add(self.number_of_blocks) {
			Some(block) => block,
			None => u32::max_value(),
		}
	}
}

/// A reply_channel_range message: one chunk of the response to a query_channel_range.
/// Multiple reply messages together cover the queried block range exactly.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplyChannelRange {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// The height of the first block in the range of the reply
	pub first_blocknum: u32,
	/// The number of blocks included in the range of the reply
	pub number_of_blocks: u32,
	/// True when this is the final reply for a query, or the responder has up-to-date
	/// information for the queried chain
	pub full_information: bool,
	/// The short_channel_ids in the channel range
	pub short_channel_ids: Vec<u64>,
}

/// A gossip_timestamp_filter message: tells the peer which gossip timestamps we care about.
#[derive(Clone, Debug, PartialEq)]
pub struct GossipTimestampFilter {
	/// The genesis hash of the blockchain for channel and node information
	pub chain_hash: BlockHash,
	/// The starting unix timestamp
	pub first_timestamp: u32,
	/// The range of information in seconds
	pub timestamp_range: u32,
}

impl Writeable for Ping {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.size_hint(self.byteslen as usize + 4);
		self.ponglen.write(w)?;
		vec![0u8; self.byteslen as usize].write(w)?; // size-unchecked write
		Ok(())
	}
}

impl Readable for Ping {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Ping {
			ponglen: Readable::read(r)?,
			byteslen: {
				let byteslen = Readable::read(r)?;
				r.read_exact(&mut vec![0u8; byteslen as usize][..])?;
				byteslen
			},
		})
	}
}

impl Writeable for Pong {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.size_hint(self.byteslen as usize + 2);
		vec![0u8; self.byteslen as usize].write(w)?; // size-unchecked write
		Ok(())
	}
}

impl Readable for Pong {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Pong {
			byteslen: {
				let byteslen = Readable::read(r)?;
				r.read_exact(&mut vec![0u8; byteslen as usize][..])?;
				byteslen
			},
		})
	}
}

impl Writeable for ErrorMessage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.size_hint(32 + 2 + self.data.len());
		self.channel_id.write(w)?;
		(self.data.len() as u16).write(w)?;
		w.write_all(self.data.as_bytes())?;
		Ok(())
	}
}

impl Readable for ErrorMessage {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			channel_id: Readable::read(r)?,
			data: {
				let mut sz: usize = <u16 as Readable>::read(r)? as usize;
				let mut data = vec![];
				let data_len = r.read_to_end(&mut data)?;
				sz = cmp::min(data_len, sz);
				match String::from_utf8(data[..sz].to_vec()) {
					Ok(s) => s,
					Err(_) => return Err(DecodeError::InvalidValue),
				}
			},
		})
	}
}

impl Writeable for UnsignedChannelAnnouncement {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.size_hint(2 + 32 + 8 + 4 * 33 + self.features.len() + self.excess_data.len());
		self.features.write(w)?;
		self.chain_hash.write(w)?;
		self.short_channel_id.write(w)?;
		self.node_id_1.write(w)?;
		self.node_id_2.write(w)?;
		self.bitcoin_key_1.write(w)?;
		self.bitcoin_key_2.write(w)?;
		w.write_all(&self.excess_data[..])?;
		Ok(())
	}
}

impl Readable for UnsignedChannelAnnouncement {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			features: Readable::read(r)?,
			chain_hash: Readable::read(r)?,
			short_channel_id: Readable::read(r)?,
			node_id_1: Readable::read(r)?,
			node_id_2: Readable::read(r)?,
			bitcoin_key_1: Readable::read(r)?,
			bitcoin_key_2: Readable::read(r)?,
			excess_data: {
				let mut excess_data = vec![];
				r.read_to_end(&mut excess_data)?;
				excess_data
			},
		})
	}
}

impl Writeable for ChannelAnnouncement {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.node_signature_1.write(w)?;
		self.node_signature_2.write(w)?;
		self.bitcoin_signature_1.write(w)?;
		self.bitcoin_signature_2.write(w)?;
		self.contents.write(w)?;
		Ok(())
	}
}

impl Readable for ChannelAnnouncement {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			node_signature_1: Readable::read(r)?,
			node_signature_2: Readable::read(r)?,
			bitcoin_signature_1: Readable::read(r)?,
			bitcoin_signature_2: Readable::read(r)?,
			contents: Readable::read(r)?,
		})
	}
}

impl Writeable for UnsignedChannelUpdate {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		debug_assert_eq!(self.message_flags & MESSAGE_FLAG_OPT_HTLC_MAX != 0,
			self.htlc_maximum_msat.is_some());
		w.size_hint(64 + self.excess_data.len());
		self.chain_hash.write(w)?;
		self.short_channel_id.write(w)?;
		self.timestamp.write(w)?;
		self.message_flags.write(w)?;
		self.channel_flags.write(w)?;
		self.cltv_expiry_delta.write(w)?;
		self.htlc_minimum_msat.write(w)?;
		self.fee_base_msat.write(w)?;
		self.fee_proportional_millionths.write(w)?;
		if let Some(htlc_maximum_msat) = self.htlc_maximum_msat {
			htlc_maximum_msat.write(w)?;
		}
		w.write_all(&self.excess_data[..])?;
		Ok(())
	}
}

impl Readable for UnsignedChannelUpdate {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let chain_hash = Readable::read(r)?;
		let short_channel_id = Readable::read(r)?;
		let timestamp = Readable::read(r)?;
		let message_flags: u8 = Readable::read(r)?;
		let channel_flags = Readable::read(r)?;
		let cltv_expiry_delta = Readable::read(r)?;
		let htlc_minimum_msat = Readable::read(r)?;
		let fee_base_msat = Readable::read(r)?;
		let fee_proportional_millionths = Readable::read(r)?;
		let htlc_maximum_msat = if message_flags & MESSAGE_FLAG_OPT_HTLC_MAX != 0 {
			Some(Readable::read(r)?)
		} else {
			None
		};
		let mut excess_data = vec![];
		r.read_to_end(&mut excess_data)?;
		Ok(Self {
			chain_hash,
			short_channel_id,
			timestamp,
			message_flags,
			channel_flags,
			cltv_expiry_delta,
			htlc_minimum_msat,
			fee_base_msat,
			fee_proportional_millionths,
			htlc_maximum_msat,
			excess_data,
		})
	}
}

impl Writeable for ChannelUpdate {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.signature.write(w)?;
		self.contents.write(w)?;
		Ok(())
	}
}

impl Readable for ChannelUpdate {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			signature: Readable::read(r)?,
			contents: Readable::read(r)?,
		})
	}
}

impl Writeable for UnsignedNodeAnnouncement {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.size_hint(76 + self.features.len() + self.addresses.len() * 38
			+ self.excess_address_data.len() + self.excess_data.len());
		self.features.write(w)?;
		self.timestamp.write(w)?;
		self.node_id.write(w)?;
		w.write_all(&self.rgb)?;
		self.alias.write(w)?;

		let mut addr_len = 0;
		for addr in self.addresses.iter() {
			addr_len += 1 + addr.len();
		}
		(addr_len + self.excess_address_data.len() as u16).write(w)?;
		for addr in self.addresses.iter() {
			addr.write(w)?;
		}
		w.write_all(&self.excess_address_data[..])?;
		w.write_all(&self.excess_data[..])?;
		Ok(())
	}
}

impl Readable for UnsignedNodeAnnouncement {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let features: Vec<u8> = Readable::read(r)?;
		let timestamp: u32 = Readable::read(r)?;
		let node_id: NodeId = Readable::read(r)?;
		let mut rgb = [0; 3];
		r.read_exact(&mut rgb)?;
		let alias: [u8; 32] = Readable::read(r)?;

		let addr_len: u16 = Readable::read(r)?;
		let mut addresses: Vec<NetAddress> = Vec::with_capacity(4);
		let mut addr_readpos = 0;
		let mut excess = false;
		let mut excess_byte = 0;
		loop {
			if addr_len <= addr_readpos {
				break;
			}
			match Readable::read(r) {
				Ok(Ok(addr)) => {
					// Addresses must be sorted by type with at most one of each; anything else is
					// a framing error we cannot reconcile with the length descriptor.
					match addr {
						NetAddress::IPv4 { .. } => {
							if addresses.len() > 0 {
								return Err(DecodeError::ExtraAddressesPerType);
							}
						}
						NetAddress::IPv6 { .. } => {
							if addresses.len() > 1 || (addresses.len() == 1 && addresses[0].get_id() != 1) {
								return Err(DecodeError::ExtraAddressesPerType);
							}
						}
						NetAddress::OnionV2 { .. } => {
							if addresses.len() > 2 || (addresses.len() > 0 && addresses.last().unwrap().get_id() > 2) {
								return Err(DecodeError::ExtraAddressesPerType);
							}
						}
						NetAddress::OnionV3 { .. } => {
							if addresses.len() > 3 || (addresses.len() > 0 && addresses.last().unwrap().get_id() > 3) {
								return Err(DecodeError::ExtraAddressesPerType);
							}
						}
					}
					if addr_len < addr_readpos + 1 + addr.len() {
						return Err(DecodeError::BadLengthDescriptor);
					}
					addr_readpos += (1 + addr.len()) as u16;
					addresses.push(addr);
				}
				Ok(Err(unknown_descriptor)) => {
					excess = true;
					excess_byte = unknown_descriptor;
					break;
				}
				Err(DecodeError::ShortRead) => return Err(DecodeError::BadLengthDescriptor),
				Err(e) => return Err(e),
			}
		}

		let mut excess_data = vec![];
		let excess_address_data = if addr_readpos < addr_len {
			let mut excess_address_data = vec![0; (addr_len - addr_readpos) as usize];
			r.read_exact(&mut excess_address_data[if excess { 1 } else { 0 }..])?;
			if excess {
				excess_address_data[0] = excess_byte;
			}
			excess_address_data
		} else {
			if excess {
				excess_data.push(excess_byte);
			}
			Vec::new()
		};
		r.read_to_end(&mut excess_data)?;
		Ok(UnsignedNodeAnnouncement {
			features,
			timestamp,
			node_id,
			rgb,
			alias,
			addresses,
			excess_address_data,
			excess_data,
		})
	}
}

impl Writeable for NodeAnnouncement {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.signature.write(w)?;
		self.contents.write(w)?;
		Ok(())
	}
}

impl Readable for NodeAnnouncement {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			signature: Readable::read(r)?,
			contents: Readable::read(r)?,
		})
	}
}

impl Writeable for QueryShortChannelIds {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(w)?;
		let encoded = encode_short_channel_ids(&self.short_channel_ids);
		(encoded.len() as u16).write(w)?;
		w.write_all(&encoded)?;
		Ok(())
	}
}

impl Readable for QueryShortChannelIds {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let chain_hash = Readable::read(r)?;
		let encoded: Vec<u8> = Readable::read(r)?;
		Ok(Self {
			chain_hash,
			short_channel_ids: decode_short_channel_ids(&encoded)?,
		})
	}
}

impl Writeable for ReplyShortChannelIdsEnd {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(w)?;
		self.full_information.write(w)?;
		Ok(())
	}
}

impl Readable for ReplyShortChannelIdsEnd {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			chain_hash: Readable::read(r)?,
			full_information: Readable::read(r)?,
		})
	}
}

impl Writeable for QueryChannelRange {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(w)?;
		self.first_blocknum.write(w)?;
		self.number_of_blocks.write(w)?;
		Ok(())
	}
}

impl Readable for QueryChannelRange {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			chain_hash: Readable::read(r)?,
			first_blocknum: Readable::read(r)?,
			number_of_blocks: Readable::read(r)?,
		})
	}
}

impl Writeable for ReplyChannelRange {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(w)?;
		self.first_blocknum.write(w)?;
		self.number_of_blocks.write(w)?;
		self.full_information.write(w)?;
		let encoded = encode_short_channel_ids(&self.short_channel_ids);
		(encoded.len() as u16).write(w)?;
		w.write_all(&encoded)?;
		Ok(())
	}
}

impl Readable for ReplyChannelRange {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let chain_hash = Readable::read(r)?;
		let first_blocknum = Readable::read(r)?;
		let number_of_blocks = Readable::read(r)?;
		let full_information = Readable::read(r)?;
		let encoded: Vec<u8> = Readable::read(r)?;
		Ok(Self {
			chain_hash,
			first_blocknum,
			number_of_blocks,
			full_information,
			short_channel_ids: decode_short_channel_ids(&encoded)?,
		})
	}
}

impl Writeable for GossipTimestampFilter {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(w)?;
		self.first_timestamp.write(w)?;
		self.timestamp_range.write(w)?;
		Ok(())
	}
}

impl Readable for GossipTimestampFilter {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			chain_hash: Readable::read(r)?,
			first_timestamp: Readable::read(r)?,
			timestamp_range: Readable::read(r)?,
		})
	}
}

/// Tag byte for the uncompressed short-channel-id list encoding.
pub const SHORTIDS_UNCOMPRESSED: u8 = 0x00;
/// Tag byte for the zlib short-channel-id list encoding.
pub const SHORTIDS_ZLIB: u8 = 0x01;

// Zlib-bomb guard: no legitimate query or reply can carry more ids than this.
const MAX_SCIDS_DECODE_BYTES: usize = 8 * 0x1_0000;

/// Encodes a short-channel-id list as a one-byte tag plus payload. Compression is attempted
/// first; whenever zlib fails to actually shrink the ids the uncompressed form is used.
pub fn encode_short_channel_ids(short_channel_ids: &[u64]) -> Vec<u8> {
	let mut raw = Vec::with_capacity(short_channel_ids.len() * 8);
	for scid in short_channel_ids {
		raw.extend_from_slice(&scid.to_be_bytes());
	}

	if let Some(z) = zencode_scids(&raw) {
		let mut encoded = Vec::with_capacity(1 + z.len());
		encoded.push(SHORTIDS_ZLIB);
		encoded.extend_from_slice(&z);
		return encoded;
	}

	let mut encoded = Vec::with_capacity(1 + raw.len());
	encoded.push(SHORTIDS_UNCOMPRESSED);
	encoded.extend_from_slice(&raw);
	encoded
}

fn zencode_scids(raw: &[u8]) -> Option<Vec<u8>> {
	let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
	if Write::write_all(&mut encoder, raw).is_err() {
		return None;
	}
	match encoder.finish() {
		// Prefer to fail if zlib makes it larger
		Ok(z) if z.len() < raw.len() => Some(z),
		_ => None,
	}
}

/// Decodes a tagged short-channel-id list. Accepts both the uncompressed and the zlib tags and
/// rejects anything else.
pub fn decode_short_channel_ids(encoded: &[u8]) -> Result<Vec<u64>, DecodeError> {
	if encoded.is_empty() {
		return Err(DecodeError::ShortRead);
	}
	let raw = match encoded[0] {
		SHORTIDS_UNCOMPRESSED => encoded[1..].to_vec(),
		SHORTIDS_ZLIB => {
			let mut decoder = ZlibDecoder::new(&encoded[1..]).take(MAX_SCIDS_DECODE_BYTES as u64 + 1);
			let mut raw = Vec::new();
			decoder.read_to_end(&mut raw).map_err(|_| DecodeError::InvalidValue)?;
			if raw.len() > MAX_SCIDS_DECODE_BYTES {
				return Err(DecodeError::BadLengthDescriptor);
			}
			raw
		}
		_ => return Err(DecodeError::UnsupportedCompression),
	};
	if raw.len() % 8 != 0 {
		return Err(DecodeError::BadLengthDescriptor);
	}
	Ok(raw.chunks(8).map(|id| u64::from_be_bytes(id.try_into().unwrap())).collect())
}
