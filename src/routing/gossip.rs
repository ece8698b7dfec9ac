// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The [`NetworkGraph`] stores validated network gossip: channels, nodes and the per-direction
//! channel parameters, together with the broadcast log used to fan accepted messages out to
//! peers and the append-only store they are replayed from on startup.
//!
//! The graph is single-owner. Peer sessions only ever read it; every mutation flows through the
//! typed ingestion entry points here, which validate signatures and timestamp monotonicity and
//! return a wire-formatted rejection for the offending peer when validation fails.

use std::collections::hash_map::Entry as HashMapEntry;
use std::collections::btree_map::Entry as BTreeMapEntry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{Cursor, Read};
use std::ops::Deref;

use bitcoin::secp256k1::constants::PUBLIC_KEY_SIZE;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{self, PublicKey, Secp256k1};

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Script};
use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::sha256d::Hash as Sha256dHash;
use bitcoin::hashes::Hash;

use crate::ln::msgs::{self, ChannelAnnouncement, ChannelUpdate, ErrorAction, ErrorMessage,
	GossipError, NetAddress, NodeAnnouncement, DecodeError, CHANNEL_FLAG_DIRECTION};
use crate::ln::wire;
use crate::routing::broadcast::{BroadcastLog, BroadcastTag};
use crate::routing::store::{GossipStore, StoreRecord};
use crate::util::logger::{Level, Logger};
use crate::util::scid_utils;
use crate::util::ser::{Readable, Writeable, Writer};

/// The maximum number of millisatoshis that exist: 21 million bitcoin.
pub const MAX_VALUE_MSAT: u64 = 21_000_000_0000_0000_000;

/// Represents the compressed public key of a node
#[derive(Clone, Copy)]
pub struct NodeId([u8; PUBLIC_KEY_SIZE]);

impl NodeId {
	/// Create a new NodeId from a public key
	pub fn from_pubkey(pubkey: &PublicKey) -> Self {
		NodeId(pubkey.serialize())
	}

	/// Get the public key slice from this NodeId
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}

	/// Parse the NodeId back into a full public key, failing on invalid curve points.
	pub fn as_pubkey(&self) -> Result<PublicKey, secp256k1::Error> {
		PublicKey::from_slice(&self.0)
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "NodeId({})", log_bytes!(self.0))
	}
}
impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", log_bytes!(self.0))
	}
}

impl core::hash::Hash for NodeId {
	fn hash<H: core::hash::Hasher>(&self, hasher: &mut H) {
		self.0.hash(hasher);
	}
}

impl Eq for NodeId {}

impl PartialEq for NodeId {
	fn eq(&self, other: &Self) -> bool {
		self.0[..] == other.0[..]
	}
}

impl PartialOrd for NodeId {
	fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for NodeId {
	fn cmp(&self, other: &Self) -> core::cmp::Ordering {
		self.0[..].cmp(&other.0[..])
	}
}

impl Writeable for NodeId {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		writer.write_all(&self.0)?;
		Ok(())
	}
}

impl Readable for NodeId {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; PUBLIC_KEY_SIZE];
		reader.read_exact(&mut buf)?;
		Ok(Self(buf))
	}
}

/// Fees for routing via a given channel or a node
#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash)]
pub struct RoutingFees {
	/// Flat routing fee in millisatoshis.
	pub base_msat: u32,
	/// Liquidity-based routing fee in millionths of a routed amount.
	/// In other words, 10000 is 1%.
	pub proportional_millionths: u32,
}

/// Details about one direction of a channel as received within a channel_update. A half-channel
/// is *defined* once such an entry exists; the cached signed update is present iff the entry is.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelUpdateInfo {
	/// When the last update to the channel direction was issued.
	/// Value is opaque, as set in the announcement.
	pub last_update: u32,
	/// Whether the channel can be currently used for payments (in this one direction).
	pub enabled: bool,
	/// The message flags as signed, bit 0 tracking the htlc_maximum_msat presence.
	pub message_flags: u8,
	/// The channel flags as signed, bit 0 the direction and bit 1 the disable bit.
	pub channel_flags: u8,
	/// The difference in CLTV values that you must have when routing through this channel.
	pub cltv_expiry_delta: u16,
	/// The minimum value, which must be relayed to the next hop via the channel
	pub htlc_minimum_msat: u64,
	/// The maximum value which may be relayed to the next hop via the channel, when advertised.
	pub htlc_maximum_msat: Option<u64>,
	/// Fees charged when the channel is used for routing
	pub fees: RoutingFees,
	/// The latest signed channel_update for this half, exactly as it appears on the wire.
	pub last_update_message: Vec<u8>,
}

impl fmt::Display for ChannelUpdateInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
		write!(f, "last_update {}, enabled {}, cltv_expiry_delta {}, htlc_minimum_msat {}, fees {:?}",
			self.last_update, self.enabled, self.cltv_expiry_delta, self.htlc_minimum_msat, self.fees)?;
		Ok(())
	}
}

/// Details about a channel (both directions).
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelInfo {
	/// Source node of the first direction of a channel
	pub node_one: NodeId,
	/// Details about the first direction of a channel
	pub one_to_two: Option<ChannelUpdateInfo>,
	/// Source node of the second direction of a channel
	pub node_two: NodeId,
	/// Details about the second direction of a channel
	pub two_to_one: Option<ChannelUpdateInfo>,
	/// The channel capacity as seen on-chain
	pub capacity_sats: u64,
	/// The signed channel_announcement as it appears on the wire, or `None` while the channel is
	/// not publicly announced (a local channel added before its announcement reaches depth).
	pub announcement_message: Option<Vec<u8>>,
	/// Disabled from our side (peer disconnected or closing); not gossiped directly, but folded
	/// into the next update we sign for this channel.
	pub local_disabled: bool,
}

impl ChannelInfo {
	/// Whether the channel has a validated, on-chain-confirmed public announcement.
	pub fn is_public(&self) -> bool {
		self.announcement_message.is_some()
	}

	/// The half going out of `node_one` is direction 0, out of `node_two` direction 1.
	pub fn half(&self, direction: u8) -> &Option<ChannelUpdateInfo> {
		if direction & CHANNEL_FLAG_DIRECTION == 0 { &self.one_to_two } else { &self.two_to_one }
	}

	pub(crate) fn half_mut(&mut self, direction: u8) -> &mut Option<ChannelUpdateInfo> {
		if direction & CHANNEL_FLAG_DIRECTION == 0 { &mut self.one_to_two } else { &mut self.two_to_one }
	}

	/// The node id owning the given direction.
	pub fn node(&self, direction: u8) -> &NodeId {
		if direction & CHANNEL_FLAG_DIRECTION == 0 { &self.node_one } else { &self.node_two }
	}

	/// The direction originating from `id`, if `id` is one of the endpoints.
	pub fn direction_from(&self, id: &NodeId) -> Option<u8> {
		if *id == self.node_one {
			Some(0)
		} else if *id == self.node_two {
			Some(1)
		} else {
			None
		}
	}
}

/// Information received in the latest node_announcement from this node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeAnnouncementInfo {
	/// When the last known update to the node state was issued.
	/// Value is opaque, as set in the announcement.
	pub last_update: u32,
	/// Color assigned to the node
	pub rgb: [u8; 3],
	/// Moniker assigned to the node.
	/// May be invalid or malicious (eg control chars),
	/// should not be exposed to the user.
	pub alias: [u8; 32],
	/// The advertised global features, as opaque bytes
	pub features: Vec<u8>,
	/// Internet-level addresses via which one can connect to the node
	pub addresses: Vec<NetAddress>,
	/// The signed node_announcement as it appears on the wire
	pub announcement_message: Vec<u8>,
}

/// Details about a node in the network, known from the network announcement.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
	/// All valid channels a node has announced
	pub channels: Vec<u64>,
	/// More information about a node from node_announcement.
	/// Optional because we store a Node entry after learning about it from
	/// a channel announcement, but before receiving a node announcement.
	pub announcement_info: Option<NodeAnnouncementInfo>,
}

struct PendingChannel {
	announcement: ChannelAnnouncement,
	raw_announcement: Vec<u8>,
	/// Updates which raced the txout lookup, newest per direction; applied on promotion.
	updates: [Option<ChannelUpdate>; 2],
}

macro_rules! secp_verify_sig {
	( $secp_ctx: expr, $msg: expr, $sig: expr, $pubkey: expr, $msg_type: expr ) => {
		match $secp_ctx.verify_ecdsa($msg, $sig, $pubkey) {
			Ok(_) => {},
			Err(_) => {
				let err = format!("Invalid signature on {} message", $msg_type);
				return Err(GossipError {
					err: err.clone(),
					action: ErrorAction::SendErrorMessage {
						msg: ErrorMessage { channel_id: [0; 32], data: err },
					},
				});
			},
		}
	};
}

macro_rules! get_pubkey_from_node_id {
	( $node_id: expr, $msg_type: expr ) => {
		match $node_id.as_pubkey() {
			Ok(pk) => pk,
			Err(_) => {
				let err = format!("Invalid public key on {} message", $msg_type);
				return Err(GossipError {
					err: err.clone(),
					action: ErrorAction::SendErrorMessage {
						msg: ErrorMessage { channel_id: [0; 32], data: err },
					},
				});
			}
		}
	};
}

/// The BOLT #3 2-of-2 funding output script for the two announced funding keys, as it must
/// appear in the funding transaction output claimed by a channel_announcement.
pub(crate) fn funding_output_script(bitcoin_key_1: &NodeId, bitcoin_key_2: &NodeId) -> Script {
	// The lexicographically lesser key comes first.
	let (key_a, key_b) = if bitcoin_key_1.as_slice() < bitcoin_key_2.as_slice() {
		(bitcoin_key_1, bitcoin_key_2)
	} else {
		(bitcoin_key_2, bitcoin_key_1)
	};
	Builder::new()
		.push_opcode(opcodes::all::OP_PUSHNUM_2)
		.push_slice(key_a.as_slice())
		.push_slice(key_b.as_slice())
		.push_opcode(opcodes::all::OP_PUSHNUM_2)
		.push_opcode(opcodes::all::OP_CHECKMULTISIG)
		.into_script()
		.to_v0_p2wsh()
}

/// Represents the network as nodes and channels between them, plus the broadcast log of accepted
/// messages and the append-only store backing both across restarts.
pub struct NetworkGraph<L: Deref> where L::Target: Logger {
	secp_ctx: Secp256k1<secp256k1::VerifyOnly>,
	chain_hash: BlockHash,
	local_id: NodeId,
	prune_timeout: u32,
	channels: BTreeMap<u64, ChannelInfo>,
	nodes: BTreeMap<NodeId, NodeInfo>,
	pending_channels: HashMap<u64, PendingChannel>,
	pub(crate) broadcasts: BroadcastLog,
	store: Option<GossipStore>,
	/// Set when a channel with our node becomes publicly announced; the daemon consumes it to
	/// decide whether an own node_announcement is due.
	pub(crate) local_channel_announced: bool,
	logger: L,
}

impl<L: Deref> NetworkGraph<L> where L::Target: Logger {
	pub fn new(chain_hash: BlockHash, local_id: NodeId, prune_timeout: u32, logger: L) -> Self {
		NetworkGraph {
			secp_ctx: Secp256k1::verification_only(),
			chain_hash,
			local_id,
			prune_timeout,
			channels: BTreeMap::new(),
			nodes: BTreeMap::new(),
			pending_channels: HashMap::new(),
			broadcasts: BroadcastLog::new(),
			store: None,
			local_channel_announced: false,
			logger,
		}
	}

	/// The chain every gossip message must commit to.
	pub fn chain_hash(&self) -> BlockHash {
		self.chain_hash
	}

	/// Our own node id.
	pub fn local_id(&self) -> NodeId {
		self.local_id
	}

	pub fn prune_timeout(&self) -> u32 {
		self.prune_timeout
	}

	/// Attaches the append-only store and replays its records into the graph. Replayed messages
	/// were validated before they were written, so signature checks are skipped; everything else
	/// (ordering, adjacency, broadcast-log population) runs exactly as live ingestion.
	pub fn load_store(&mut self, store: GossipStore, records: Vec<StoreRecord>) {
		debug_assert!(self.store.is_none());
		let mut count = 0;
		for record in records {
			count += 1;
			match record {
				StoreRecord::ChannelAnnouncement { satoshis, timestamp, msg } => {
					let decoded = wire::read(&mut Cursor::new(&msg));
					match decoded {
						Ok(wire::Message::ChannelAnnouncement(ann)) => {
							self.restore_channel(&ann, msg, satoshis, timestamp);
						}
						_ => log_error!(self.logger, "Corrupt channel_announcement in gossip store"),
					}
				}
				StoreRecord::ChannelUpdate { msg } => {
					match wire::read(&mut Cursor::new(&msg)) {
						Ok(wire::Message::ChannelUpdate(upd)) => {
							if let Err(e) = self.update_channel_intern(&upd, None, true) {
								log_gossip!(self.logger, "Stale channel_update in gossip store: {}", e.err);
							}
						}
						_ => log_error!(self.logger, "Corrupt channel_update in gossip store"),
					}
				}
				StoreRecord::NodeAnnouncement { msg } => {
					match wire::read(&mut Cursor::new(&msg)) {
						Ok(wire::Message::NodeAnnouncement(ann)) => {
							if let Err(e) = self.update_node_intern(&ann, true) {
								log_gossip!(self.logger, "Stale node_announcement in gossip store: {}", e.err);
							}
						}
						_ => log_error!(self.logger, "Corrupt node_announcement in gossip store"),
					}
				}
				StoreRecord::LocalAddChannel { short_channel_id, remote, satoshis } => {
					self.local_add_channel_intern(short_channel_id, &remote, satoshis, true);
				}
				StoreRecord::ChannelDelete { short_channel_id } => {
					self.remove_channel(short_channel_id);
				}
			}
		}
		log_info!(self.logger, "Loaded {} records from gossip store: {} channels, {} nodes",
			count, self.channels.len(), self.nodes.len());
		self.store = Some(store);
	}

	fn store_append(&mut self, record: &StoreRecord) {
		if let Some(store) = self.store.as_mut() {
			if let Err(e) = store.append(record) {
				log_error!(self.logger, "Failed to append to gossip store: {}", e);
			}
		}
	}

	/// Validates a channel_announcement. On `Ok(Some(scid))` the announcement is parked and the
	/// caller must look the funding output up on-chain and come back through
	/// [`NetworkGraph::resolve_pending_announcement`].
	pub fn handle_channel_announcement(&mut self, msg: &ChannelAnnouncement)
		-> Result<Option<u64>, GossipError>
	{
		if msg.contents.chain_hash != self.chain_hash {
			log_gossip!(self.logger, "Ignoring channel_announcement for other chain, scid {}",
				scid_utils::scid_to_string(msg.contents.short_channel_id));
			return Ok(None);
		}

		if msg.contents.node_id_1 == msg.contents.node_id_2
			|| msg.contents.bitcoin_key_1 == msg.contents.bitcoin_key_2
		{
			return Err(GossipError {
				err: "Channel announcement node had a channel with itself".to_owned(),
				action: ErrorAction::IgnoreError,
			});
		}

		let msg_hash = hash_to_message!(&Sha256dHash::hash(&msg.contents.encode()[..])[..]);
		secp_verify_sig!(self.secp_ctx, &msg_hash, &msg.node_signature_1,
			&get_pubkey_from_node_id!(msg.contents.node_id_1, "channel_announcement"), "channel_announcement");
		secp_verify_sig!(self.secp_ctx, &msg_hash, &msg.node_signature_2,
			&get_pubkey_from_node_id!(msg.contents.node_id_2, "channel_announcement"), "channel_announcement");
		secp_verify_sig!(self.secp_ctx, &msg_hash, &msg.bitcoin_signature_1,
			&get_pubkey_from_node_id!(msg.contents.bitcoin_key_1, "channel_announcement"), "channel_announcement");
		secp_verify_sig!(self.secp_ctx, &msg_hash, &msg.bitcoin_signature_2,
			&get_pubkey_from_node_id!(msg.contents.bitcoin_key_2, "channel_announcement"), "channel_announcement");

		let scid = msg.contents.short_channel_id;
		if let Some(chan) = self.channels.get(&scid) {
			if chan.is_public() {
				return Err(GossipError {
					err: "Already have knowledge of channel".to_owned(),
					action: ErrorAction::IgnoreDuplicateGossip,
				});
			}
		}
		match self.pending_channels.entry(scid) {
			HashMapEntry::Occupied(_) => Err(GossipError {
				err: "Already have announcement pending txout check".to_owned(),
				action: ErrorAction::IgnoreDuplicateGossip,
			}),
			HashMapEntry::Vacant(entry) => {
				entry.insert(PendingChannel {
					raw_announcement: wire::encode_msg(msg),
					announcement: msg.clone(),
					updates: [None, None],
				});
				Ok(Some(scid))
			}
		}
	}

	/// Completes channel ingestion once the funding output has been looked up on-chain. Checks
	/// the output script is the P2WSH over the announced funding keys, then creates the channel,
	/// queues the announcement for broadcast and applies any updates which raced the lookup.
	///
	/// Returns whether a channel was added to the graph.
	pub fn resolve_pending_announcement(&mut self, short_channel_id: u64, satoshis: u64,
		outscript: &Script, now: u32) -> bool
	{
		let pending = match self.pending_channels.remove(&short_channel_id) {
			Some(pending) => pending,
			None => {
				log_debug!(self.logger, "Ignoring txout reply for unknown scid {}",
					scid_utils::scid_to_string(short_channel_id));
				return false;
			}
		};

		let expected = funding_output_script(&pending.announcement.contents.bitcoin_key_1,
			&pending.announcement.contents.bitcoin_key_2);
		if *outscript != expected {
			log_debug!(self.logger,
				"Ignoring channel_announcement for {}: output script mismatch (expected {})",
				scid_utils::scid_to_string(short_channel_id), expected);
			return false;
		}

		if !self.restore_channel(&pending.announcement, pending.raw_announcement.clone(), satoshis, now) {
			return false;
		}
		self.store_append(&StoreRecord::ChannelAnnouncement {
			satoshis,
			timestamp: now,
			msg: pending.raw_announcement,
		});

		for update in pending.updates.iter() {
			if let Some(update) = update {
				if let Err(e) = self.handle_channel_update(update) {
					log_gossip!(self.logger, "Buffered channel_update rejected: {}", e.err);
				}
			}
		}
		true
	}

	/// Inserts an announced channel, wiring the endpoint nodes' adjacency lists. Shared between
	/// live promotion and store replay.
	fn restore_channel(&mut self, msg: &ChannelAnnouncement, raw: Vec<u8>, satoshis: u64,
		broadcast_timestamp: u32) -> bool
	{
		let scid = msg.contents.short_channel_id;
		let chan_info = ChannelInfo {
			node_one: msg.contents.node_id_1,
			one_to_two: None,
			node_two: msg.contents.node_id_2,
			two_to_one: None,
			capacity_sats: satoshis,
			announcement_message: Some(raw.clone()),
			local_disabled: false,
		};

		match self.channels.entry(scid) {
			BTreeMapEntry::Occupied(mut entry) => {
				if entry.get().is_public() {
					log_gossip!(self.logger, "Ignoring duplicate channel_announcement for {}",
						scid_utils::scid_to_string(scid));
					return false;
				}
				// A locally-added private channel being announced: keep the halves, attach the
				// announcement.
				let chan = entry.get_mut();
				chan.announcement_message = Some(raw.clone());
				chan.capacity_sats = satoshis;
			}
			BTreeMapEntry::Vacant(entry) => {
				entry.insert(chan_info);
				for node_id in [msg.contents.node_id_1, msg.contents.node_id_2].iter() {
					match self.nodes.entry(*node_id) {
						BTreeMapEntry::Occupied(node_entry) => {
							node_entry.into_mut().channels.push(scid);
						}
						BTreeMapEntry::Vacant(node_entry) => {
							node_entry.insert(NodeInfo { channels: vec![scid], announcement_info: None });
						}
					}
				}
			}
		}

		self.broadcasts.queue(BroadcastTag::ChannelAnnouncement(scid), broadcast_timestamp, raw);
		if msg.contents.node_id_1 == self.local_id || msg.contents.node_id_2 == self.local_id {
			self.local_channel_announced = true;
		}
		log_gossip!(self.logger, "Added channel_announcement for {}", scid_utils::scid_to_string(scid));
		true
	}

	/// Validates and ingests a node_announcement, replacing the cached one if newer.
	pub fn handle_node_announcement(&mut self, msg: &NodeAnnouncement) -> Result<(), GossipError> {
		let msg_hash = hash_to_message!(&Sha256dHash::hash(&msg.contents.encode()[..])[..]);
		secp_verify_sig!(self.secp_ctx, &msg_hash, &msg.signature,
			&get_pubkey_from_node_id!(msg.contents.node_id, "node_announcement"), "node_announcement");
		self.update_node_intern(msg, false)
	}

	fn update_node_intern(&mut self, msg: &NodeAnnouncement, from_store: bool) -> Result<(), GossipError> {
		let contents = &msg.contents;
		let has_public_channel = {
			let node = match self.nodes.get(&contents.node_id) {
				None => {
					return Err(GossipError {
						err: "No existing channels for node_announcement".to_owned(),
						action: ErrorAction::IgnoreError,
					});
				}
				Some(node) => node,
			};
			if let Some(info) = node.announcement_info.as_ref() {
				// The timestamp field is used to order announcements; reusing one is as invalid
				// as going backwards.
				if info.last_update > contents.timestamp {
					return Err(GossipError {
						err: "Update older than last processed update".to_owned(),
						action: ErrorAction::IgnoreDuplicateGossip,
					});
				} else if info.last_update == contents.timestamp {
					return Err(GossipError {
						err: "Update had the same timestamp as last processed update".to_owned(),
						action: ErrorAction::IgnoreDuplicateGossip,
					});
				}
			}
			node.channels.iter().any(|scid| {
				self.channels.get(scid).map(|c| c.is_public()).unwrap_or(false)
			})
		};

		let raw = wire::encode_msg(msg);
		let node = self.nodes.get_mut(&contents.node_id).unwrap();
		node.announcement_info = Some(NodeAnnouncementInfo {
			last_update: contents.timestamp,
			rgb: contents.rgb,
			alias: contents.alias,
			features: contents.features.clone(),
			addresses: contents.addresses.clone(),
			announcement_message: raw.clone(),
		});

		// Only nodes with a publicly announced channel are relayed onwards.
		if has_public_channel {
			self.broadcasts.queue(BroadcastTag::NodeAnnouncement(contents.node_id),
				contents.timestamp, raw.clone());
		}
		if !from_store {
			self.store_append(&StoreRecord::NodeAnnouncement { msg: raw });
		}
		log_gossip!(self.logger, "Added node_announcement for {}", contents.node_id);
		Ok(())
	}

	/// Validates and ingests a channel_update for one half of a known channel.
	pub fn handle_channel_update(&mut self, msg: &ChannelUpdate) -> Result<(), GossipError> {
		self.update_channel_intern(msg, Some(&msg.signature), false)
	}

	fn update_channel_intern(&mut self, msg: &ChannelUpdate, sig: Option<&Signature>,
		from_store: bool) -> Result<(), GossipError>
	{
		let contents = &msg.contents;
		if contents.chain_hash != self.chain_hash {
			return Err(GossipError {
				err: "Ignoring channel_update for other chain".to_owned(),
				action: ErrorAction::IgnoreAndLog(Level::Gossip),
			});
		}

		if let Some(htlc_maximum_msat) = contents.htlc_maximum_msat {
			if htlc_maximum_msat > MAX_VALUE_MSAT {
				return Err(GossipError {
					err: "htlc_maximum_msat is larger than maximum possible msats".to_owned(),
					action: ErrorAction::IgnoreError,
				});
			}
		}

		let scid = contents.short_channel_id;
		let direction = contents.direction();

		if !self.channels.contains_key(&scid) {
			if let Some(pending) = self.pending_channels.get_mut(&scid) {
				// Raced our txout lookup; park the newest update per direction.
				let slot = &mut pending.updates[direction as usize];
				let stale = match slot {
					Some(prior) => prior.contents.timestamp < contents.timestamp,
					None => true,
				};
				if stale {
					*slot = Some(msg.clone());
				}
				return Ok(());
			}
			return Err(GossipError {
				err: "Couldn't find channel for update".to_owned(),
				action: ErrorAction::IgnoreAndLog(Level::Gossip),
			});
		}

		{
			let chan = self.channels.get(&scid).unwrap();
			if let Some(htlc_maximum_msat) = contents.htlc_maximum_msat {
				if chan.capacity_sats > MAX_VALUE_MSAT / 1000
					|| htlc_maximum_msat > chan.capacity_sats * 1000
				{
					return Err(GossipError {
						err: "htlc_maximum_msat is larger than channel capacity or capacity is bogus".to_owned(),
						action: ErrorAction::IgnoreError,
					});
				}
			}

			if let Some(existing) = chan.half(direction) {
				if existing.last_update > contents.timestamp {
					return Err(GossipError {
						err: "Update older than last processed update".to_owned(),
						action: ErrorAction::IgnoreDuplicateGossip,
					});
				} else if existing.last_update == contents.timestamp {
					return Err(GossipError {
						err: "Update had same timestamp as last processed update".to_owned(),
						action: ErrorAction::IgnoreDuplicateGossip,
					});
				}
			}

			if let Some(sig) = sig {
				let msg_hash = hash_to_message!(&Sha256dHash::hash(&contents.encode()[..])[..]);
				secp_verify_sig!(self.secp_ctx, &msg_hash, sig,
					&get_pubkey_from_node_id!(chan.node(direction), "channel_update"), "channel_update");
			}
		}

		let raw = wire::encode_msg(msg);
		let chan = self.channels.get_mut(&scid).unwrap();
		*chan.half_mut(direction) = Some(ChannelUpdateInfo {
			last_update: contents.timestamp,
			enabled: !contents.disabled(),
			message_flags: contents.message_flags,
			channel_flags: contents.channel_flags,
			cltv_expiry_delta: contents.cltv_expiry_delta,
			htlc_minimum_msat: contents.htlc_minimum_msat,
			htlc_maximum_msat: contents.htlc_maximum_msat,
			fees: RoutingFees {
				base_msat: contents.fee_base_msat,
				proportional_millionths: contents.fee_proportional_millionths,
			},
			last_update_message: raw.clone(),
		});

		// Updates for unannounced (local, private) channels are stored but never relayed.
		if chan.is_public() {
			self.broadcasts.queue(BroadcastTag::ChannelUpdate(scid, direction),
				contents.timestamp, raw.clone());
		}
		if !from_store {
			self.store_append(&StoreRecord::ChannelUpdate { msg: raw });
		}
		log_gossip!(self.logger, "Applied channel_update for {} direction {}",
			scid_utils::scid_to_string(scid), direction);
		Ok(())
	}

	/// Registers a confirmed-but-unannounced channel with our own node, so updates for it can be
	/// tracked and handed to the channel peer before the announcement reaches depth.
	pub fn local_add_channel(&mut self, short_channel_id: u64, remote: &NodeId, satoshis: u64) {
		self.local_add_channel_intern(short_channel_id, remote, satoshis, false)
	}

	fn local_add_channel_intern(&mut self, short_channel_id: u64, remote: &NodeId, satoshis: u64,
		from_store: bool)
	{
		if self.channels.contains_key(&short_channel_id) {
			log_debug!(self.logger, "Attempted to local_add duplicate channel {}",
				scid_utils::scid_to_string(short_channel_id));
			return;
		}
		let local = self.local_id;
		let (node_one, node_two) = if local < *remote { (local, *remote) } else { (*remote, local) };
		self.channels.insert(short_channel_id, ChannelInfo {
			node_one,
			one_to_two: None,
			node_two,
			two_to_one: None,
			capacity_sats: satoshis,
			announcement_message: None,
			local_disabled: false,
		});
		for node_id in [node_one, node_two].iter() {
			match self.nodes.entry(*node_id) {
				BTreeMapEntry::Occupied(entry) => entry.into_mut().channels.push(short_channel_id),
				BTreeMapEntry::Vacant(entry) => {
					entry.insert(NodeInfo { channels: vec![short_channel_id], announcement_info: None });
				}
			}
		}
		if !from_store {
			self.store_append(&StoreRecord::LocalAddChannel {
				short_channel_id,
				remote: *remote,
				satoshis,
			});
		}
		log_debug!(self.logger, "Added local channel {}", scid_utils::scid_to_string(short_channel_id));
	}

	/// Removes a channel whose funding output was spent on-chain, along with its broadcast-log
	/// entries, recording a deletion marker in the store.
	pub fn channel_spent(&mut self, short_channel_id: u64) {
		if self.remove_channel(short_channel_id) {
			self.store_append(&StoreRecord::ChannelDelete { short_channel_id });
		}
	}

	fn remove_channel(&mut self, short_channel_id: u64) -> bool {
		let chan = match self.channels.remove(&short_channel_id) {
			Some(chan) => chan,
			None => return false,
		};
		Self::remove_channel_in_nodes(&mut self.nodes, &chan, short_channel_id);
		self.broadcasts.remove_where(|tag| match tag {
			BroadcastTag::ChannelAnnouncement(scid) | BroadcastTag::ChannelUpdate(scid, _) => {
				*scid == short_channel_id
			}
			_ => false,
		});
		log_debug!(self.logger, "Removed channel {}", scid_utils::scid_to_string(short_channel_id));
		true
	}

	fn remove_channel_in_nodes(nodes: &mut BTreeMap<NodeId, NodeInfo>, chan: &ChannelInfo,
		short_channel_id: u64)
	{
		macro_rules! remove_from_node {
			($node_id: expr) => {
				if let BTreeMapEntry::Occupied(mut entry) = nodes.entry($node_id) {
					entry.get_mut().channels.retain(|chan_id| short_channel_id != *chan_id);
					if entry.get().channels.is_empty() {
						entry.remove_entry();
					}
				} else {
					panic!("Had channel that pointed to unknown node (ie inconsistent network map)!");
				}
			};
		}

		remove_from_node!(chan.node_one);
		remove_from_node!(chan.node_two);
	}

	/// Disables (or, if `is_permanent`, removes) a channel a payment failed through.
	pub fn channel_failed(&mut self, short_channel_id: u64, is_permanent: bool) {
		if is_permanent {
			self.remove_channel(short_channel_id);
		} else if let Some(chan) = self.channels.get_mut(&short_channel_id) {
			if let Some(one_to_two) = chan.one_to_two.as_mut() {
				one_to_two.enabled = false;
			}
			if let Some(two_to_one) = chan.two_to_one.as_mut() {
				two_to_one.enabled = false;
			}
		}
	}

	/// Disables (or, if `is_permanent`, removes) every channel of a node which failed to route.
	pub fn node_failed(&mut self, node_id: &NodeId, is_permanent: bool) {
		if is_permanent {
			let scids = match self.nodes.get(node_id) {
				Some(node) => node.channels.clone(),
				None => return,
			};
			for scid in scids {
				self.remove_channel(scid);
			}
		} else {
			let scids = match self.nodes.get(node_id) {
				Some(node) => node.channels.clone(),
				None => return,
			};
			for scid in scids {
				if let Some(chan) = self.channels.get_mut(&scid) {
					if let Some(direction) = chan.direction_from(node_id) {
						if let Some(half) = chan.half_mut(direction).as_mut() {
							half.enabled = false;
						}
					}
				}
			}
		}
	}

	/// Removes announced channels with a half-channel which has not been refreshed within the
	/// prune timeout. Their broadcast entries go too; a deletion marker is written so the channel
	/// does not resurrect from the store.
	pub fn prune(&mut self, now: u32) {
		let cutoff = now.saturating_sub(self.prune_timeout);
		let mut doomed = Vec::new();
		for (scid, chan) in self.channels.iter() {
			if !chan.is_public() {
				continue;
			}
			let stale = |half: &Option<ChannelUpdateInfo>| match half {
				Some(info) => info.last_update < cutoff,
				None => false,
			};
			if stale(&chan.one_to_two) || stale(&chan.two_to_one) {
				doomed.push(*scid);
			}
		}
		for scid in doomed {
			log_debug!(self.logger, "Pruning channel {} (no recent channel_update)",
				scid_utils::scid_to_string(scid));
			if self.remove_channel(scid) {
				self.store_append(&StoreRecord::ChannelDelete { short_channel_id: scid });
			}
		}
	}

	/// Flags every local channel as disabled-from-our-side. Run at startup, before any peer has
	/// reconnected.
	pub fn disable_local_channels(&mut self) {
		let local = self.local_id;
		let scids = match self.nodes.get(&local) {
			Some(node) => node.channels.clone(),
			None => return,
		};
		for scid in scids {
			if let Some(chan) = self.channels.get_mut(&scid) {
				chan.local_disabled = true;
			}
		}
	}

	pub fn get_channel(&self, short_channel_id: u64) -> Option<&ChannelInfo> {
		self.channels.get(&short_channel_id)
	}

	pub(crate) fn get_channel_mut(&mut self, short_channel_id: u64) -> Option<&mut ChannelInfo> {
		self.channels.get_mut(&short_channel_id)
	}

	pub fn get_node(&self, node_id: &NodeId) -> Option<&NodeInfo> {
		self.nodes.get(node_id)
	}

	pub fn channels(&self) -> &BTreeMap<u64, ChannelInfo> {
		&self.channels
	}

	pub fn nodes(&self) -> &BTreeMap<NodeId, NodeInfo> {
		&self.nodes
	}

	/// The scids of publicly announced channels within `[first_block, end_block)`, in order.
	pub fn announced_scids_in_block_range(&self, first_block: u32, end_block: u64) -> Vec<u64> {
		let start = (first_block as u64) << 40;
		let end = if end_block > scid_utils::MAX_SCID_BLOCK {
			u64::max_value()
		} else {
			end_block << 40
		};
		self.channels.range(start..end)
			.filter(|(_, chan)| chan.is_public())
			.map(|(scid, _)| *scid)
			.collect()
	}

	/// Addresses a node last announced, if we have its announcement.
	pub fn get_addresses(&self, node_id: &NodeId) -> Option<Vec<NetAddress>> {
		self.nodes.get(node_id)
			.and_then(|node| node.announcement_info.as_ref())
			.map(|info| info.addresses.clone())
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::ln::msgs::CHANNEL_FLAG_DISABLED;
	use crate::util::test_utils::TestLogger;

	use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};

	use std::sync::Arc;

	pub(crate) fn chain_hash() -> BlockHash {
		BlockHash::from_slice(&[43; 32]).unwrap()
	}

	pub(crate) fn node_key(fill: u8) -> SecretKey {
		SecretKey::from_slice(&[fill; 32]).unwrap()
	}

	pub(crate) fn node_id(secp_ctx: &Secp256k1<All>, key: &SecretKey) -> NodeId {
		NodeId::from_pubkey(&PublicKey::from_secret_key(secp_ctx, key))
	}

	pub(crate) fn get_signed_channel_announcement<F: Fn(&mut msgs::UnsignedChannelAnnouncement)>(
		f: F, node_1_key: &SecretKey, node_2_key: &SecretKey, secp_ctx: &Secp256k1<All>,
	) -> ChannelAnnouncement {
		let node_1_btckey = node_key(40);
		let node_2_btckey = node_key(39);
		let mut unsigned_announcement = msgs::UnsignedChannelAnnouncement {
			features: Vec::new(),
			chain_hash: chain_hash(),
			short_channel_id: 0,
			node_id_1: node_id(secp_ctx, node_1_key),
			node_id_2: node_id(secp_ctx, node_2_key),
			bitcoin_key_1: node_id(secp_ctx, &node_1_btckey),
			bitcoin_key_2: node_id(secp_ctx, &node_2_btckey),
			excess_data: Vec::new(),
		};
		f(&mut unsigned_announcement);
		let msghash = hash_to_message!(&Sha256dHash::hash(&unsigned_announcement.encode()[..])[..]);
		ChannelAnnouncement {
			node_signature_1: secp_ctx.sign_ecdsa(&msghash, node_1_key),
			node_signature_2: secp_ctx.sign_ecdsa(&msghash, node_2_key),
			bitcoin_signature_1: secp_ctx.sign_ecdsa(&msghash, &node_1_btckey),
			bitcoin_signature_2: secp_ctx.sign_ecdsa(&msghash, &node_2_btckey),
			contents: unsigned_announcement,
		}
	}

	pub(crate) fn get_channel_script(secp_ctx: &Secp256k1<All>) -> Script {
		funding_output_script(&node_id(secp_ctx, &node_key(40)), &node_id(secp_ctx, &node_key(39)))
	}

	pub(crate) fn get_signed_channel_update<F: Fn(&mut msgs::UnsignedChannelUpdate)>(
		f: F, node_key_arg: &SecretKey, secp_ctx: &Secp256k1<All>,
	) -> ChannelUpdate {
		let mut unsigned_channel_update = msgs::UnsignedChannelUpdate {
			chain_hash: chain_hash(),
			short_channel_id: 0,
			timestamp: 100,
			message_flags: msgs::MESSAGE_FLAG_OPT_HTLC_MAX,
			channel_flags: 0,
			cltv_expiry_delta: 144,
			htlc_minimum_msat: 1_000_000,
			fee_base_msat: 10_000,
			fee_proportional_millionths: 20,
			htlc_maximum_msat: Some(1_000_000),
			excess_data: Vec::new(),
		};
		f(&mut unsigned_channel_update);
		let msghash = hash_to_message!(&Sha256dHash::hash(&unsigned_channel_update.encode()[..])[..]);
		ChannelUpdate {
			signature: secp_ctx.sign_ecdsa(&msghash, node_key_arg),
			contents: unsigned_channel_update,
		}
	}

	pub(crate) fn get_signed_node_announcement<F: Fn(&mut msgs::UnsignedNodeAnnouncement)>(
		f: F, node_key_arg: &SecretKey, secp_ctx: &Secp256k1<All>,
	) -> NodeAnnouncement {
		let mut unsigned_announcement = msgs::UnsignedNodeAnnouncement {
			features: Vec::new(),
			timestamp: 100,
			node_id: node_id(secp_ctx, node_key_arg),
			rgb: [0; 3],
			alias: [0; 32],
			addresses: Vec::new(),
			excess_address_data: Vec::new(),
			excess_data: Vec::new(),
		};
		f(&mut unsigned_announcement);
		let msghash = hash_to_message!(&Sha256dHash::hash(&unsigned_announcement.encode()[..])[..]);
		NodeAnnouncement {
			signature: secp_ctx.sign_ecdsa(&msghash, node_key_arg),
			contents: unsigned_announcement,
		}
	}

	pub(crate) fn create_graph() -> (Secp256k1<All>, NetworkGraph<Arc<TestLogger>>) {
		let secp_ctx = Secp256k1::new();
		let logger = Arc::new(TestLogger::new());
		// Local node key 99 keeps us out of the way of test nodes 1/2.
		let local = node_id(&secp_ctx, &node_key(99));
		let graph = NetworkGraph::new(chain_hash(), local, 1209600, logger);
		(secp_ctx, graph)
	}

	/// Announce + resolve a channel between nodes 1 and 2 at the given scid.
	pub(crate) fn announce_channel(secp_ctx: &Secp256k1<All>, graph: &mut NetworkGraph<Arc<TestLogger>>,
		scid: u64) {
		let ann = get_signed_channel_announcement(|msg| msg.short_channel_id = scid,
			&node_key(1), &node_key(2), secp_ctx);
		assert_eq!(graph.handle_channel_announcement(&ann).unwrap(), Some(scid));
		assert!(graph.resolve_pending_announcement(scid, 100_000, &get_channel_script(secp_ctx), 100));
	}

	#[test]
	fn channel_announcement_requires_txout_resolution() {
		let (secp_ctx, mut graph) = create_graph();
		let ann = get_signed_channel_announcement(|msg| msg.short_channel_id = 42,
			&node_key(1), &node_key(2), &secp_ctx);

		assert_eq!(graph.handle_channel_announcement(&ann).unwrap(), Some(42));
		assert!(graph.get_channel(42).is_none());

		// Second copy while pending is a duplicate.
		match graph.handle_channel_announcement(&ann) {
			Err(e) => assert_eq!(e.err, "Already have announcement pending txout check"),
			Ok(_) => panic!(),
		}

		assert!(graph.resolve_pending_announcement(42, 100_000, &get_channel_script(&secp_ctx), 500));
		let chan = graph.get_channel(42).unwrap();
		assert!(chan.is_public());
		assert_eq!(chan.capacity_sats, 100_000);
		assert!(chan.one_to_two.is_none() && chan.two_to_one.is_none());

		// Both endpoints appear with adjacency.
		assert_eq!(graph.get_node(&node_id(&secp_ctx, &node_key(1))).unwrap().channels, vec![42]);
		assert_eq!(graph.get_node(&node_id(&secp_ctx, &node_key(2))).unwrap().channels, vec![42]);

		// And the announcement is queued for broadcast.
		assert_eq!(graph.broadcasts.len(), 1);

		// Re-announcing a resolved channel is a duplicate.
		match graph.handle_channel_announcement(&ann) {
			Err(e) => assert_eq!(e.err, "Already have knowledge of channel"),
			Ok(_) => panic!(),
		}
	}

	#[test]
	fn channel_announcement_script_mismatch_is_dropped() {
		let (secp_ctx, mut graph) = create_graph();
		let ann = get_signed_channel_announcement(|msg| msg.short_channel_id = 42,
			&node_key(1), &node_key(2), &secp_ctx);
		graph.handle_channel_announcement(&ann).unwrap();

		let bogus = Builder::new().into_script().to_v0_p2wsh();
		assert!(!graph.resolve_pending_announcement(42, 100_000, &bogus, 500));
		assert!(graph.get_channel(42).is_none());
		assert_eq!(graph.broadcasts.len(), 0);
	}

	#[test]
	fn channel_announcement_bad_signature_rejected() {
		let (secp_ctx, mut graph) = create_graph();
		let mut ann = get_signed_channel_announcement(|msg| msg.short_channel_id = 42,
			&node_key(1), &node_key(2), &secp_ctx);
		let fake_hash = Message::from_slice(&[9; 32]).unwrap();
		ann.node_signature_1 = secp_ctx.sign_ecdsa(&fake_hash, &node_key(1));
		match graph.handle_channel_announcement(&ann) {
			Err(e) => assert_eq!(e.err, "Invalid signature on channel_announcement message"),
			Ok(_) => panic!(),
		}
	}

	#[test]
	fn channel_announcement_self_channel_rejected() {
		let (secp_ctx, mut graph) = create_graph();
		let ann = get_signed_channel_announcement(|msg| msg.short_channel_id = 42,
			&node_key(1), &node_key(1), &secp_ctx);
		match graph.handle_channel_announcement(&ann) {
			Err(e) => assert_eq!(e.err, "Channel announcement node had a channel with itself"),
			Ok(_) => panic!(),
		}
	}

	#[test]
	fn channel_announcement_wrong_chain_soft_dropped() {
		let (secp_ctx, mut graph) = create_graph();
		let ann = get_signed_channel_announcement(|msg| {
			msg.short_channel_id = 42;
			msg.chain_hash = BlockHash::from_slice(&[99; 32]).unwrap();
		}, &node_key(1), &node_key(2), &secp_ctx);
		assert_eq!(graph.handle_channel_announcement(&ann).unwrap(), None);
	}

	#[test]
	fn channel_update_ordering_and_content() {
		let (secp_ctx, mut graph) = create_graph();
		announce_channel(&secp_ctx, &mut graph, 42);

		let update = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = 100;
		}, &node_key(1), &secp_ctx);
		graph.handle_channel_update(&update).unwrap();

		{
			let chan = graph.get_channel(42).unwrap();
			let info = chan.one_to_two.as_ref().unwrap();
			assert_eq!(info.last_update, 100);
			assert!(info.enabled);
			assert_eq!(info.cltv_expiry_delta, 144);
			assert_eq!(info.fees, RoutingFees { base_msat: 10_000, proportional_millionths: 20 });
			assert_eq!(info.last_update_message, wire::encode_msg(&update));
			assert!(chan.two_to_one.is_none());
		}

		// Same timestamp is rejected.
		match graph.handle_channel_update(&update) {
			Err(e) => assert_eq!(e.err, "Update had same timestamp as last processed update"),
			Ok(_) => panic!(),
		}

		// Older is rejected.
		let older = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = 99;
		}, &node_key(1), &secp_ctx);
		match graph.handle_channel_update(&older) {
			Err(e) => assert_eq!(e.err, "Update older than last processed update"),
			Ok(_) => panic!(),
		}

		// Newer, disabling, from the other side.
		let disable = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = 101;
			msg.channel_flags = CHANNEL_FLAG_DIRECTION | CHANNEL_FLAG_DISABLED;
		}, &node_key(2), &secp_ctx);
		graph.handle_channel_update(&disable).unwrap();
		let chan = graph.get_channel(42).unwrap();
		assert!(!chan.two_to_one.as_ref().unwrap().enabled);
	}

	#[test]
	fn channel_update_unknown_channel_ignored() {
		let (secp_ctx, mut graph) = create_graph();
		let update = get_signed_channel_update(|msg| msg.short_channel_id = 42,
			&node_key(1), &secp_ctx);
		match graph.handle_channel_update(&update) {
			Err(e) => assert_eq!(e.err, "Couldn't find channel for update"),
			Ok(_) => panic!(),
		}
	}

	#[test]
	fn channel_update_wrong_key_rejected() {
		let (secp_ctx, mut graph) = create_graph();
		announce_channel(&secp_ctx, &mut graph, 42);
		// Direction 0 belongs to node 1; sign with node 2's key.
		let update = get_signed_channel_update(|msg| msg.short_channel_id = 42,
			&node_key(2), &secp_ctx);
		match graph.handle_channel_update(&update) {
			Err(e) => assert_eq!(e.err, "Invalid signature on channel_update message"),
			Ok(_) => panic!(),
		}
	}

	#[test]
	fn channel_update_htlc_max_capped_by_capacity() {
		let (secp_ctx, mut graph) = create_graph();
		announce_channel(&secp_ctx, &mut graph, 42); // 100_000 sats
		let update = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.htlc_maximum_msat = Some(100_000_001 * 1000);
		}, &node_key(1), &secp_ctx);
		match graph.handle_channel_update(&update) {
			Err(e) => assert_eq!(e.err, "htlc_maximum_msat is larger than channel capacity or capacity is bogus"),
			Ok(_) => panic!(),
		}
	}

	#[test]
	fn channel_update_buffered_while_pending() {
		let (secp_ctx, mut graph) = create_graph();
		let ann = get_signed_channel_announcement(|msg| msg.short_channel_id = 42,
			&node_key(1), &node_key(2), &secp_ctx);
		graph.handle_channel_announcement(&ann).unwrap();

		let update = get_signed_channel_update(|msg| msg.short_channel_id = 42,
			&node_key(1), &secp_ctx);
		// Buffered, not rejected.
		graph.handle_channel_update(&update).unwrap();
		assert!(graph.get_channel(42).is_none());

		assert!(graph.resolve_pending_announcement(42, 100_000, &get_channel_script(&secp_ctx), 100));
		let chan = graph.get_channel(42).unwrap();
		assert_eq!(chan.one_to_two.as_ref().unwrap().last_update, 100);
	}

	#[test]
	fn node_announcement_needs_channel_first() {
		let (secp_ctx, mut graph) = create_graph();
		let ann = get_signed_node_announcement(|_| {}, &node_key(1), &secp_ctx);
		match graph.handle_node_announcement(&ann) {
			Err(e) => assert_eq!(e.err, "No existing channels for node_announcement"),
			Ok(_) => panic!(),
		}

		announce_channel(&secp_ctx, &mut graph, 42);
		graph.handle_node_announcement(&ann).unwrap();
		let node = graph.get_node(&node_id(&secp_ctx, &node_key(1))).unwrap();
		assert_eq!(node.announcement_info.as_ref().unwrap().last_update, 100);

		// Equal timestamp rejected, older rejected.
		match graph.handle_node_announcement(&ann) {
			Err(e) => assert_eq!(e.err, "Update had the same timestamp as last processed update"),
			Ok(_) => panic!(),
		}
		let older = get_signed_node_announcement(|msg| msg.timestamp = 50, &node_key(1), &secp_ctx);
		match graph.handle_node_announcement(&older) {
			Err(e) => assert_eq!(e.err, "Update older than last processed update"),
			Ok(_) => panic!(),
		}
	}

	#[test]
	fn private_channel_updates_not_broadcast() {
		let (secp_ctx, mut graph) = create_graph();
		let local = graph.local_id();
		let remote = node_id(&secp_ctx, &node_key(1));
		graph.local_add_channel(13, &remote, 50_000);
		assert!(!graph.get_channel(13).unwrap().is_public());

		// Figure out which direction is node 1's.
		let dir = graph.get_channel(13).unwrap().direction_from(&remote).unwrap();
		let update = get_signed_channel_update(|msg| {
			msg.short_channel_id = 13;
			msg.channel_flags = dir;
			msg.htlc_maximum_msat = Some(50_000 * 1000);
		}, &node_key(1), &secp_ctx);
		graph.handle_channel_update(&update).unwrap();

		let chan = graph.get_channel(13).unwrap();
		assert!(chan.half(dir).is_some());
		assert_eq!(graph.broadcasts.len(), 0);
		assert!(chan.direction_from(&local).is_some());
	}

	#[test]
	fn channel_spent_removes_everything() {
		let (secp_ctx, mut graph) = create_graph();
		announce_channel(&secp_ctx, &mut graph, 42);
		let update = get_signed_channel_update(|msg| msg.short_channel_id = 42,
			&node_key(1), &secp_ctx);
		graph.handle_channel_update(&update).unwrap();
		assert_eq!(graph.broadcasts.len(), 2);

		graph.channel_spent(42);
		assert!(graph.get_channel(42).is_none());
		assert!(graph.get_node(&node_id(&secp_ctx, &node_key(1))).is_none());
		assert_eq!(graph.broadcasts.len(), 0);
	}

	#[test]
	fn prune_drops_stale_channels() {
		let (secp_ctx, mut graph) = create_graph();
		announce_channel(&secp_ctx, &mut graph, 42);
		let update = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = 1000;
		}, &node_key(1), &secp_ctx);
		graph.handle_channel_update(&update).unwrap();

		// Not yet past the prune timeout.
		graph.prune(1000 + graph.prune_timeout() - 1);
		assert!(graph.get_channel(42).is_some());

		graph.prune(1001 + graph.prune_timeout());
		assert!(graph.get_channel(42).is_none());
		assert_eq!(graph.broadcasts.len(), 0);
	}

	#[test]
	fn half_channel_raw_update_iff_defined() {
		// The data-model invariant: a half-channel entry exists exactly when we hold its raw
		// update, because the entry owns the bytes.
		let (secp_ctx, mut graph) = create_graph();
		announce_channel(&secp_ctx, &mut graph, 42);
		let chan = graph.get_channel(42).unwrap();
		assert!(chan.one_to_two.is_none());
		let update = get_signed_channel_update(|msg| msg.short_channel_id = 42,
			&node_key(1), &secp_ctx);
		graph.handle_channel_update(&update).unwrap();
		assert!(!graph.get_channel(42).unwrap().one_to_two.as_ref().unwrap()
			.last_update_message.is_empty());
	}

	#[test]
	fn announced_scid_range_is_filtered_and_ordered() {
		let (secp_ctx, mut graph) = create_graph();
		let scid_a = scid_utils::scid_from_parts(100, 0, 0).unwrap();
		let scid_b = scid_utils::scid_from_parts(100, 5, 0).unwrap();
		let scid_c = scid_utils::scid_from_parts(200, 0, 0).unwrap();
		for scid in [scid_b, scid_a, scid_c].iter() {
			announce_channel(&secp_ctx, &mut graph, *scid);
		}
		// A private channel in-range must not leak into query replies.
		graph.local_add_channel(scid_utils::scid_from_parts(100, 9, 9).unwrap(),
			&node_id(&secp_ctx, &node_key(1)), 1);

		assert_eq!(graph.announced_scids_in_block_range(100, 101), vec![scid_a, scid_b]);
		assert_eq!(graph.announced_scids_in_block_range(0, 1000), vec![scid_a, scid_b, scid_c]);
		assert_eq!(graph.announced_scids_in_block_range(101, 200), Vec::<u64>::new());
	}

	#[test]
	fn local_channel_announced_latch() {
		let (secp_ctx, mut graph) = create_graph();
		announce_channel(&secp_ctx, &mut graph, 42);
		assert!(!graph.local_channel_announced);

		// Announce a channel which includes us.
		let ann = get_signed_channel_announcement(|msg| msg.short_channel_id = 43,
			&node_key(2), &node_key(99), &secp_ctx);
		graph.handle_channel_announcement(&ann).unwrap();
		assert!(graph.resolve_pending_announcement(43, 100_000, &get_channel_script(&secp_ctx), 100));
		assert!(graph.local_channel_announced);
	}
}
