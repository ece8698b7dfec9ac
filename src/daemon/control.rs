// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Typed messages for the two control endpoints: the parent process (graph queries, txout
//! replies, routing failures, channel lifecycle) and the connection daemon (peer admission,
//! address lookups). Framing is a big-endian u16 length followed by a u16 message type, the
//! same shape as the peer wire protocol so one reader loop serves all three channels.

use std::io::{self, Read, Write};

use crate::daemon::Config;
use crate::ln::msgs::{DecodeError, NetAddress};
use crate::routing::gossip::NodeId;
use crate::util::ser::{Readable, Writeable, Writer};

/// One hop of a computed route, as returned to the parent.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteHop {
	/// The node the hop forwards to.
	pub node_id: NodeId,
	/// The channel to forward over.
	pub short_channel_id: u64,
	/// Which half of the channel carries the payment.
	pub direction: u8,
	/// The amount entering the hop.
	pub amount_msat: u64,
	/// CLTV delay budgeted for the hop.
	pub delay: u32,
}

/// One node of the graph, as returned by `getnodes`.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeEntry {
	pub node_id: NodeId,
	/// Timestamp of the node's announcement, if one was received.
	pub last_timestamp: Option<u32>,
	pub globalfeatures: Vec<u8>,
	pub addresses: Vec<NetAddress>,
	pub alias: [u8; 32],
	pub rgb: [u8; 3],
}

/// One direction of one channel, as returned by `getchannels`.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelEntry {
	pub source: NodeId,
	pub destination: NodeId,
	pub satoshis: u64,
	pub message_flags: u8,
	pub channel_flags: u8,
	pub local_disabled: bool,
	pub public: bool,
	pub short_channel_id: u64,
	pub last_update_timestamp: u32,
	pub base_fee_msat: u32,
	pub fee_per_millionth: u32,
	pub delay: u16,
}

/// An incoming public channel usable as a routehint, as returned by `get_incoming_channels`.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingChannel {
	pub node_id: NodeId,
	pub short_channel_id: u64,
	pub fee_base_msat: u32,
	pub fee_proportional_millionths: u32,
	pub cltv_expiry_delta: u16,
}

/// A local channel parameter change handed down from the subdaemon owning the channel.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalChannelUpdate {
	pub short_channel_id: u64,
	pub disable: bool,
	pub cltv_expiry_delta: u16,
	pub htlc_minimum_msat: u64,
	pub fee_base_msat: u32,
	pub fee_proportional_millionths: u32,
	pub htlc_maximum_msat: u64,
}

/// Requests arriving from the parent process.
#[derive(Clone, Debug, PartialEq)]
pub enum MasterRequest {
	/// Daemon configuration; first message on the control channel.
	Init(Config),
	/// Dump one node, or all of them.
	GetNodes { node_id: Option<NodeId> },
	/// Run the external route finder.
	GetRoute {
		source: NodeId,
		destination: NodeId,
		msatoshi: u64,
		riskfactor: u16,
		final_cltv: u32,
		fuzz: f64,
		seed: [u8; 16],
	},
	/// Dump one channel, or all of them.
	GetChannels { short_channel_id: Option<u64> },
	/// Who is on the other end of this local channel?
	GetChannelPeer { short_channel_id: u64 },
	/// Public, enabled channels pointing at us, for invoice routehints.
	GetIncomingChannels,
	/// Send a ping to the given peer.
	Ping { node_id: NodeId, num_pong_bytes: u16, len: u16 },
	/// The funding output lookup a channel_announcement was parked on.
	GetTxoutReply { short_channel_id: u64, satoshis: u64, outscript: Vec<u8> },
	/// A payment failed; adjust the graph per the onion failure code.
	RoutingFailure {
		erring_node: NodeId,
		erring_channel: u64,
		failcode: u16,
		channel_update: Vec<u8>,
	},
	/// Temporarily keep a channel out of routes.
	MarkChannelUnroutable { short_channel_id: u64 },
	/// A channel's funding output was spent on-chain.
	OutpointSpent { short_channel_id: u64 },
	/// One of our channels is closing; disable it without removing it.
	LocalChannelClose { short_channel_id: u64 },
	/// Issue a query_short_channel_ids to a peer.
	QueryScids { node_id: NodeId, short_channel_ids: Vec<u64> },
	/// Issue a gossip_timestamp_filter to a peer.
	SendTimestampFilter { node_id: NodeId, first_timestamp: u32, timestamp_range: u32 },
	/// Issue a query_channel_range to a peer.
	QueryChannelRange { node_id: NodeId, first_blocknum: u32, number_of_blocks: u32 },
	/// Developer: clamp the scid-list encoding size to force chunked range replies.
	DevSetMaxScidsEncodeSize { max: u32 },
	/// Developer: stop the broadcast pump entirely.
	DevSuppressGossip,
}

/// Replies and notifications flowing back to the parent process.
#[derive(Clone, Debug, PartialEq)]
pub enum MasterReply {
	GetNodesReply { nodes: Vec<NodeEntry> },
	GetRouteReply { hops: Vec<RouteHop> },
	GetChannelsReply { channels: Vec<ChannelEntry> },
	GetChannelPeerReply { node_id: Option<NodeId> },
	GetIncomingChannelsReply { channels: Vec<IncomingChannel> },
	/// `sent` is false when the peer was unknown; `totlen` carries the pong size once one
	/// arrives (or zero when none is expected).
	PingReply { node_id: NodeId, sent: bool, totlen: u16 },
	/// Acknowledges (or fails) a QueryScids request; completion of the query itself.
	ScidsReply { ok: bool, complete: bool },
	/// Delivered when a channel-range query completes (or immediately on failure).
	QueryChannelRangeReply {
		final_first_block: u32,
		final_num_blocks: u32,
		complete: bool,
		short_channel_ids: Vec<u64>,
	},
	/// Ask the parent to look up a funding output for a parked channel_announcement.
	GetTxout { short_channel_id: u64 },
}

/// Requests arriving from the connection daemon.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectdRequest {
	/// A freshly handshaked peer; evicts any previous peer with the same id.
	NewPeer { node_id: NodeId, gossip_queries_feature: bool, initial_routing_sync_feature: bool },
	/// The announced addresses of a node, for outbound connections.
	GetAddrs { node_id: NodeId },
}

/// Replies to the connection daemon.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectdReply {
	/// Admission result; on success the driver wires the peer's message stream up.
	NewPeerReply { success: bool },
	GetAddrsReply { addresses: Option<Vec<NetAddress>> },
}

const MASTER_INIT: u16 = 1;
const MASTER_GETNODES: u16 = 2;
const MASTER_GETROUTE: u16 = 3;
const MASTER_GETCHANNELS: u16 = 4;
const MASTER_GET_CHANNEL_PEER: u16 = 5;
const MASTER_GET_INCOMING_CHANNELS: u16 = 6;
const MASTER_PING: u16 = 7;
const MASTER_GET_TXOUT_REPLY: u16 = 8;
const MASTER_ROUTING_FAILURE: u16 = 9;
const MASTER_MARK_CHANNEL_UNROUTABLE: u16 = 10;
const MASTER_OUTPOINT_SPENT: u16 = 11;
const MASTER_LOCAL_CHANNEL_CLOSE: u16 = 12;
const MASTER_QUERY_SCIDS: u16 = 13;
const MASTER_SEND_TIMESTAMP_FILTER: u16 = 14;
const MASTER_QUERY_CHANNEL_RANGE: u16 = 15;
const MASTER_DEV_SET_MAX_SCIDS_ENCODE_SIZE: u16 = 16;
const MASTER_DEV_SUPPRESS_GOSSIP: u16 = 17;

const REPLY_GETNODES: u16 = 101;
const REPLY_GETROUTE: u16 = 102;
const REPLY_GETCHANNELS: u16 = 103;
const REPLY_GET_CHANNEL_PEER: u16 = 104;
const REPLY_GET_INCOMING_CHANNELS: u16 = 105;
const REPLY_PING: u16 = 106;
const REPLY_SCIDS: u16 = 107;
const REPLY_QUERY_CHANNEL_RANGE: u16 = 108;
const REPLY_GET_TXOUT: u16 = 109;

const CONNECTD_NEW_PEER: u16 = 1;
const CONNECTD_GET_ADDRS: u16 = 2;
const CONNECTD_REPLY_NEW_PEER: u16 = 101;
const CONNECTD_REPLY_GET_ADDRS: u16 = 102;

fn write_addresses<W: Writer>(addresses: &Vec<NetAddress>, w: &mut W) -> Result<(), io::Error> {
	(addresses.len() as u16).write(w)?;
	for addr in addresses.iter() {
		addr.write(w)?;
	}
	Ok(())
}

fn read_addresses<R: Read>(r: &mut R) -> Result<Vec<NetAddress>, DecodeError> {
	let count: u16 = Readable::read(r)?;
	let mut addresses = Vec::with_capacity(count as usize);
	for _ in 0..count {
		// The control channel is trusted; an unknown descriptor here is corruption.
		match Readable::read(r)? {
			Ok(addr) => addresses.push(addr),
			Err(_) => return Err(DecodeError::InvalidValue),
		}
	}
	Ok(addresses)
}

macro_rules! impl_vec_rw {
	($ty: ty) => {
		impl Writeable for Vec<$ty> {
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
				(self.len() as u16).write(w)?;
				for e in self.iter() {
					e.write(w)?;
				}
				Ok(())
			}
		}
		impl Readable for Vec<$ty> {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let count: u16 = Readable::read(r)?;
				let mut entries = Vec::with_capacity(::std::cmp::min(count as usize, 1024));
				for _ in 0..count {
					entries.push(Readable::read(r)?);
				}
				Ok(entries)
			}
		}
	};
}

impl Writeable for RouteHop {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.node_id.write(w)?;
		self.short_channel_id.write(w)?;
		self.direction.write(w)?;
		self.amount_msat.write(w)?;
		self.delay.write(w)
	}
}
impl Readable for RouteHop {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			node_id: Readable::read(r)?,
			short_channel_id: Readable::read(r)?,
			direction: Readable::read(r)?,
			amount_msat: Readable::read(r)?,
			delay: Readable::read(r)?,
		})
	}
}
impl_vec_rw!(RouteHop);

impl Writeable for NodeEntry {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.node_id.write(w)?;
		self.last_timestamp.write(w)?;
		self.globalfeatures.write(w)?;
		write_addresses(&self.addresses, w)?;
		self.alias.write(w)?;
		self.rgb.write(w)
	}
}
impl Readable for NodeEntry {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			node_id: Readable::read(r)?,
			last_timestamp: Readable::read(r)?,
			globalfeatures: Readable::read(r)?,
			addresses: read_addresses(r)?,
			alias: Readable::read(r)?,
			rgb: Readable::read(r)?,
		})
	}
}
impl_vec_rw!(NodeEntry);

impl Writeable for ChannelEntry {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.source.write(w)?;
		self.destination.write(w)?;
		self.satoshis.write(w)?;
		self.message_flags.write(w)?;
		self.channel_flags.write(w)?;
		self.local_disabled.write(w)?;
		self.public.write(w)?;
		self.short_channel_id.write(w)?;
		self.last_update_timestamp.write(w)?;
		self.base_fee_msat.write(w)?;
		self.fee_per_millionth.write(w)?;
		self.delay.write(w)
	}
}
impl Readable for ChannelEntry {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			source: Readable::read(r)?,
			destination: Readable::read(r)?,
			satoshis: Readable::read(r)?,
			message_flags: Readable::read(r)?,
			channel_flags: Readable::read(r)?,
			local_disabled: Readable::read(r)?,
			public: Readable::read(r)?,
			short_channel_id: Readable::read(r)?,
			last_update_timestamp: Readable::read(r)?,
			base_fee_msat: Readable::read(r)?,
			fee_per_millionth: Readable::read(r)?,
			delay: Readable::read(r)?,
		})
	}
}
impl_vec_rw!(ChannelEntry);

impl Writeable for IncomingChannel {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.node_id.write(w)?;
		self.short_channel_id.write(w)?;
		self.fee_base_msat.write(w)?;
		self.fee_proportional_millionths.write(w)?;
		self.cltv_expiry_delta.write(w)
	}
}
impl Readable for IncomingChannel {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			node_id: Readable::read(r)?,
			short_channel_id: Readable::read(r)?,
			fee_base_msat: Readable::read(r)?,
			fee_proportional_millionths: Readable::read(r)?,
			cltv_expiry_delta: Readable::read(r)?,
		})
	}
}
impl_vec_rw!(IncomingChannel);

impl Writeable for Config {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.broadcast_interval_msec.write(w)?;
		self.chain_hash.write(w)?;
		self.local_id.write(w)?;
		self.globalfeatures.write(w)?;
		self.rgb.write(w)?;
		self.alias.write(w)?;
		self.update_channel_interval.write(w)?;
		write_addresses(&self.announcable, w)
	}
}
impl Readable for Config {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			broadcast_interval_msec: Readable::read(r)?,
			chain_hash: Readable::read(r)?,
			local_id: Readable::read(r)?,
			globalfeatures: Readable::read(r)?,
			rgb: Readable::read(r)?,
			alias: Readable::read(r)?,
			update_channel_interval: Readable::read(r)?,
			announcable: read_addresses(r)?,
		})
	}
}

impl Writeable for LocalChannelUpdate {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.short_channel_id.write(w)?;
		self.disable.write(w)?;
		self.cltv_expiry_delta.write(w)?;
		self.htlc_minimum_msat.write(w)?;
		self.fee_base_msat.write(w)?;
		self.fee_proportional_millionths.write(w)?;
		self.htlc_maximum_msat.write(w)
	}
}
impl Readable for LocalChannelUpdate {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			short_channel_id: Readable::read(r)?,
			disable: Readable::read(r)?,
			cltv_expiry_delta: Readable::read(r)?,
			htlc_minimum_msat: Readable::read(r)?,
			fee_base_msat: Readable::read(r)?,
			fee_proportional_millionths: Readable::read(r)?,
			htlc_maximum_msat: Readable::read(r)?,
		})
	}
}

impl Writeable for MasterRequest {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			MasterRequest::Init(config) => {
				MASTER_INIT.write(w)?;
				config.write(w)
			}
			MasterRequest::GetNodes { node_id } => {
				MASTER_GETNODES.write(w)?;
				node_id.write(w)
			}
			MasterRequest::GetRoute { source, destination, msatoshi, riskfactor, final_cltv, fuzz, seed } => {
				MASTER_GETROUTE.write(w)?;
				source.write(w)?;
				destination.write(w)?;
				msatoshi.write(w)?;
				riskfactor.write(w)?;
				final_cltv.write(w)?;
				fuzz.to_bits().write(w)?;
				seed.write(w)
			}
			MasterRequest::GetChannels { short_channel_id } => {
				MASTER_GETCHANNELS.write(w)?;
				short_channel_id.write(w)
			}
			MasterRequest::GetChannelPeer { short_channel_id } => {
				MASTER_GET_CHANNEL_PEER.write(w)?;
				short_channel_id.write(w)
			}
			MasterRequest::GetIncomingChannels => MASTER_GET_INCOMING_CHANNELS.write(w),
			MasterRequest::Ping { node_id, num_pong_bytes, len } => {
				MASTER_PING.write(w)?;
				node_id.write(w)?;
				num_pong_bytes.write(w)?;
				len.write(w)
			}
			MasterRequest::GetTxoutReply { short_channel_id, satoshis, outscript } => {
				MASTER_GET_TXOUT_REPLY.write(w)?;
				short_channel_id.write(w)?;
				satoshis.write(w)?;
				outscript.write(w)
			}
			MasterRequest::RoutingFailure { erring_node, erring_channel, failcode, channel_update } => {
				MASTER_ROUTING_FAILURE.write(w)?;
				erring_node.write(w)?;
				erring_channel.write(w)?;
				failcode.write(w)?;
				channel_update.write(w)
			}
			MasterRequest::MarkChannelUnroutable { short_channel_id } => {
				MASTER_MARK_CHANNEL_UNROUTABLE.write(w)?;
				short_channel_id.write(w)
			}
			MasterRequest::OutpointSpent { short_channel_id } => {
				MASTER_OUTPOINT_SPENT.write(w)?;
				short_channel_id.write(w)
			}
			MasterRequest::LocalChannelClose { short_channel_id } => {
				MASTER_LOCAL_CHANNEL_CLOSE.write(w)?;
				short_channel_id.write(w)
			}
			MasterRequest::QueryScids { node_id, short_channel_ids } => {
				MASTER_QUERY_SCIDS.write(w)?;
				node_id.write(w)?;
				short_channel_ids.write(w)
			}
			MasterRequest::SendTimestampFilter { node_id, first_timestamp, timestamp_range } => {
				MASTER_SEND_TIMESTAMP_FILTER.write(w)?;
				node_id.write(w)?;
				first_timestamp.write(w)?;
				timestamp_range.write(w)
			}
			MasterRequest::QueryChannelRange { node_id, first_blocknum, number_of_blocks } => {
				MASTER_QUERY_CHANNEL_RANGE.write(w)?;
				node_id.write(w)?;
				first_blocknum.write(w)?;
				number_of_blocks.write(w)
			}
			MasterRequest::DevSetMaxScidsEncodeSize { max } => {
				MASTER_DEV_SET_MAX_SCIDS_ENCODE_SIZE.write(w)?;
				max.write(w)
			}
			MasterRequest::DevSuppressGossip => MASTER_DEV_SUPPRESS_GOSSIP.write(w),
		}
	}
}

impl Readable for MasterRequest {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let msg_type: u16 = Readable::read(r)?;
		match msg_type {
			MASTER_INIT => Ok(MasterRequest::Init(Readable::read(r)?)),
			MASTER_GETNODES => Ok(MasterRequest::GetNodes { node_id: Readable::read(r)? }),
			MASTER_GETROUTE => Ok(MasterRequest::GetRoute {
				source: Readable::read(r)?,
				destination: Readable::read(r)?,
				msatoshi: Readable::read(r)?,
				riskfactor: Readable::read(r)?,
				final_cltv: Readable::read(r)?,
				fuzz: f64::from_bits(Readable::read(r)?),
				seed: Readable::read(r)?,
			}),
			MASTER_GETCHANNELS => Ok(MasterRequest::GetChannels { short_channel_id: Readable::read(r)? }),
			MASTER_GET_CHANNEL_PEER => Ok(MasterRequest::GetChannelPeer { short_channel_id: Readable::read(r)? }),
			MASTER_GET_INCOMING_CHANNELS => Ok(MasterRequest::GetIncomingChannels),
			MASTER_PING => Ok(MasterRequest::Ping {
				node_id: Readable::read(r)?,
				num_pong_bytes: Readable::read(r)?,
				len: Readable::read(r)?,
			}),
			MASTER_GET_TXOUT_REPLY => Ok(MasterRequest::GetTxoutReply {
				short_channel_id: Readable::read(r)?,
				satoshis: Readable::read(r)?,
				outscript: Readable::read(r)?,
			}),
			MASTER_ROUTING_FAILURE => Ok(MasterRequest::RoutingFailure {
				erring_node: Readable::read(r)?,
				erring_channel: Readable::read(r)?,
				failcode: Readable::read(r)?,
				channel_update: Readable::read(r)?,
			}),
			MASTER_MARK_CHANNEL_UNROUTABLE => Ok(MasterRequest::MarkChannelUnroutable {
				short_channel_id: Readable::read(r)?,
			}),
			MASTER_OUTPOINT_SPENT => Ok(MasterRequest::OutpointSpent { short_channel_id: Readable::read(r)? }),
			MASTER_LOCAL_CHANNEL_CLOSE => Ok(MasterRequest::LocalChannelClose { short_channel_id: Readable::read(r)? }),
			MASTER_QUERY_SCIDS => Ok(MasterRequest::QueryScids {
				node_id: Readable::read(r)?,
				short_channel_ids: Readable::read(r)?,
			}),
			MASTER_SEND_TIMESTAMP_FILTER => Ok(MasterRequest::SendTimestampFilter {
				node_id: Readable::read(r)?,
				first_timestamp: Readable::read(r)?,
				timestamp_range: Readable::read(r)?,
			}),
			MASTER_QUERY_CHANNEL_RANGE => Ok(MasterRequest::QueryChannelRange {
				node_id: Readable::read(r)?,
				first_blocknum: Readable::read(r)?,
				number_of_blocks: Readable::read(r)?,
			}),
			MASTER_DEV_SET_MAX_SCIDS_ENCODE_SIZE => Ok(MasterRequest::DevSetMaxScidsEncodeSize {
				max: Readable::read(r)?,
			}),
			MASTER_DEV_SUPPRESS_GOSSIP => Ok(MasterRequest::DevSuppressGossip),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for MasterReply {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			MasterReply::GetNodesReply { nodes } => {
				REPLY_GETNODES.write(w)?;
				nodes.write(w)
			}
			MasterReply::GetRouteReply { hops } => {
				REPLY_GETROUTE.write(w)?;
				hops.write(w)
			}
			MasterReply::GetChannelsReply { channels } => {
				REPLY_GETCHANNELS.write(w)?;
				channels.write(w)
			}
			MasterReply::GetChannelPeerReply { node_id } => {
				REPLY_GET_CHANNEL_PEER.write(w)?;
				node_id.write(w)
			}
			MasterReply::GetIncomingChannelsReply { channels } => {
				REPLY_GET_INCOMING_CHANNELS.write(w)?;
				channels.write(w)
			}
			MasterReply::PingReply { node_id, sent, totlen } => {
				REPLY_PING.write(w)?;
				node_id.write(w)?;
				sent.write(w)?;
				totlen.write(w)
			}
			MasterReply::ScidsReply { ok, complete } => {
				REPLY_SCIDS.write(w)?;
				ok.write(w)?;
				complete.write(w)
			}
			MasterReply::QueryChannelRangeReply { final_first_block, final_num_blocks, complete, short_channel_ids } => {
				REPLY_QUERY_CHANNEL_RANGE.write(w)?;
				final_first_block.write(w)?;
				final_num_blocks.write(w)?;
				complete.write(w)?;
				short_channel_ids.write(w)
			}
			MasterReply::GetTxout { short_channel_id } => {
				REPLY_GET_TXOUT.write(w)?;
				short_channel_id.write(w)
			}
		}
	}
}

impl Readable for MasterReply {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let msg_type: u16 = Readable::read(r)?;
		match msg_type {
			REPLY_GETNODES => Ok(MasterReply::GetNodesReply { nodes: Readable::read(r)? }),
			REPLY_GETROUTE => Ok(MasterReply::GetRouteReply { hops: Readable::read(r)? }),
			REPLY_GETCHANNELS => Ok(MasterReply::GetChannelsReply { channels: Readable::read(r)? }),
			REPLY_GET_CHANNEL_PEER => Ok(MasterReply::GetChannelPeerReply { node_id: Readable::read(r)? }),
			REPLY_GET_INCOMING_CHANNELS => Ok(MasterReply::GetIncomingChannelsReply {
				channels: Readable::read(r)?,
			}),
			REPLY_PING => Ok(MasterReply::PingReply {
				node_id: Readable::read(r)?,
				sent: Readable::read(r)?,
				totlen: Readable::read(r)?,
			}),
			REPLY_SCIDS => Ok(MasterReply::ScidsReply {
				ok: Readable::read(r)?,
				complete: Readable::read(r)?,
			}),
			REPLY_QUERY_CHANNEL_RANGE => Ok(MasterReply::QueryChannelRangeReply {
				final_first_block: Readable::read(r)?,
				final_num_blocks: Readable::read(r)?,
				complete: Readable::read(r)?,
				short_channel_ids: Readable::read(r)?,
			}),
			REPLY_GET_TXOUT => Ok(MasterReply::GetTxout { short_channel_id: Readable::read(r)? }),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for ConnectdRequest {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			ConnectdRequest::NewPeer { node_id, gossip_queries_feature, initial_routing_sync_feature } => {
				CONNECTD_NEW_PEER.write(w)?;
				node_id.write(w)?;
				gossip_queries_feature.write(w)?;
				initial_routing_sync_feature.write(w)
			}
			ConnectdRequest::GetAddrs { node_id } => {
				CONNECTD_GET_ADDRS.write(w)?;
				node_id.write(w)
			}
		}
	}
}

impl Readable for ConnectdRequest {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let msg_type: u16 = Readable::read(r)?;
		match msg_type {
			CONNECTD_NEW_PEER => Ok(ConnectdRequest::NewPeer {
				node_id: Readable::read(r)?,
				gossip_queries_feature: Readable::read(r)?,
				initial_routing_sync_feature: Readable::read(r)?,
			}),
			CONNECTD_GET_ADDRS => Ok(ConnectdRequest::GetAddrs { node_id: Readable::read(r)? }),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for ConnectdReply {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			ConnectdReply::NewPeerReply { success } => {
				CONNECTD_REPLY_NEW_PEER.write(w)?;
				success.write(w)
			}
			ConnectdReply::GetAddrsReply { addresses } => {
				CONNECTD_REPLY_GET_ADDRS.write(w)?;
				match addresses {
					None => 0u8.write(w),
					Some(addresses) => {
						1u8.write(w)?;
						write_addresses(addresses, w)
					}
				}
			}
		}
	}
}

impl Readable for ConnectdReply {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let msg_type: u16 = Readable::read(r)?;
		match msg_type {
			CONNECTD_REPLY_NEW_PEER => Ok(ConnectdReply::NewPeerReply { success: Readable::read(r)? }),
			CONNECTD_REPLY_GET_ADDRS => {
				let present: u8 = Readable::read(r)?;
				let addresses = match present {
					0 => None,
					1 => Some(read_addresses(r)?),
					_ => return Err(DecodeError::InvalidValue),
				};
				Ok(ConnectdReply::GetAddrsReply { addresses })
			}
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

/// Reads one length-prefixed frame from a control channel.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
	let mut len_buf = [0u8; 2];
	r.read_exact(&mut len_buf)?;
	let mut frame = vec![0u8; u16::from_be_bytes(len_buf) as usize];
	r.read_exact(&mut frame)?;
	Ok(frame)
}

/// Writes one message as a length-prefixed frame.
pub fn write_frame<M: Writeable, W: Write>(msg: &M, w: &mut W) -> io::Result<()> {
	Write::write_all(w, &msg.encode_with_len())?;
	w.flush()
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::hashes::Hash;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
	use std::io::Cursor;

	fn a_node_id() -> NodeId {
		let secp_ctx = Secp256k1::new();
		NodeId::from_pubkey(&PublicKey::from_secret_key(&secp_ctx,
			&SecretKey::from_slice(&[5; 32]).unwrap()))
	}

	fn round_trip_request(req: MasterRequest) {
		let decoded: MasterRequest = Readable::read(&mut Cursor::new(req.encode())).unwrap();
		assert_eq!(decoded, req);
	}

	#[test]
	fn master_requests_round_trip() {
		round_trip_request(MasterRequest::Init(Config {
			broadcast_interval_msec: 60_000,
			chain_hash: Hash::from_slice(&[1; 32]).unwrap(),
			local_id: a_node_id(),
			globalfeatures: vec![0xaa],
			rgb: [1, 2, 3],
			alias: [7; 32],
			update_channel_interval: 1209600 / 2,
			announcable: vec![NetAddress::IPv4 { addr: [127, 0, 0, 1], port: 9735 }],
		}));
		round_trip_request(MasterRequest::GetNodes { node_id: Some(a_node_id()) });
		round_trip_request(MasterRequest::GetRoute {
			source: a_node_id(),
			destination: a_node_id(),
			msatoshi: 12345,
			riskfactor: 10,
			final_cltv: 9,
			fuzz: 0.75,
			seed: [9; 16],
		});
		round_trip_request(MasterRequest::GetTxoutReply {
			short_channel_id: 42,
			satoshis: 100_000,
			outscript: vec![0, 32, 1, 2],
		});
		round_trip_request(MasterRequest::QueryScids { node_id: a_node_id(), short_channel_ids: vec![1, 2, 3] });
		round_trip_request(MasterRequest::DevSuppressGossip);
	}

	#[test]
	fn master_replies_round_trip() {
		let reply = MasterReply::QueryChannelRangeReply {
			final_first_block: 700_000,
			final_num_blocks: 100,
			complete: true,
			short_channel_ids: vec![10, 20],
		};
		let decoded: MasterReply = Readable::read(&mut Cursor::new(reply.encode())).unwrap();
		assert_eq!(decoded, reply);

		let reply = MasterReply::GetIncomingChannelsReply {
			channels: vec![IncomingChannel {
				node_id: a_node_id(),
				short_channel_id: 42,
				fee_base_msat: 1000,
				fee_proportional_millionths: 10,
				cltv_expiry_delta: 144,
			}],
		};
		let decoded: MasterReply = Readable::read(&mut Cursor::new(reply.encode())).unwrap();
		assert_eq!(decoded, reply);
	}

	#[test]
	fn connectd_messages_round_trip() {
		let req = ConnectdRequest::NewPeer {
			node_id: a_node_id(),
			gossip_queries_feature: true,
			initial_routing_sync_feature: false,
		};
		let decoded: ConnectdRequest = Readable::read(&mut Cursor::new(req.encode())).unwrap();
		assert_eq!(decoded, req);

		let reply = ConnectdReply::GetAddrsReply {
			addresses: Some(vec![NetAddress::IPv6 { addr: [9; 16], port: 1 }]),
		};
		let decoded: ConnectdReply = Readable::read(&mut Cursor::new(reply.encode())).unwrap();
		assert_eq!(decoded, reply);
	}

	#[test]
	fn frame_round_trip() {
		let req = MasterRequest::OutpointSpent { short_channel_id: 99 };
		let mut buf = Vec::new();
		write_frame(&req, &mut buf).unwrap();
		let frame = read_frame(&mut Cursor::new(buf)).unwrap();
		let decoded: MasterRequest = Readable::read(&mut Cursor::new(frame)).unwrap();
		assert_eq!(decoded, req);
	}
}
