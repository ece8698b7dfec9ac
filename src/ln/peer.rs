// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Per-peer session state.
//!
//! Each connected peer owns a broadcast cursor, a timestamp filter, the reply sub-state for an
//! inbound `query_short_channel_ids`, the accumulator for an outbound `query_channel_range`, the
//! ping/pong bookkeeping and the outbound message queue. The controller drives these; everything
//! here only reads the graph.

use std::collections::VecDeque;
use std::ops::Deref;

use crate::ln::msgs::{self, ErrorAction, ErrorMessage, GossipError, ReplyChannelRange};
use crate::ln::wire;
use crate::routing::gossip::{NetworkGraph, NodeId};
use crate::util::logger::Logger;

/// A peer's view of a finished outbound channel-range query: the accumulated ids and whether
/// the remote claimed complete knowledge.
#[derive(Debug, PartialEq)]
pub struct RangeQueryComplete {
	/// `first_blocknum` of the final reply, echoed upstream.
	pub final_first_blocknum: u32,
	/// `number_of_blocks` of the final reply, echoed upstream.
	pub final_number_of_blocks: u32,
	/// Whether the remote maintains up-to-date information for the chain.
	pub full_information: bool,
	/// Every short channel id the replies carried.
	pub short_channel_ids: Vec<u64>,
}

/// State for one connected peer.
pub struct Peer {
	/// The id of the peer (not necessarily unique while a replacement connection is in transit).
	pub id: NodeId,
	pub gossip_queries_feature: bool,
	pub initial_routing_sync_feature: bool,

	/// High water mark for the staggered broadcast: the log index of the last entry this peer
	/// received, or `u64::MAX` while gossip is gated on an initial timestamp filter.
	pub broadcast_index: u64,

	/// Timestamp range to filter gossip by; min > max means "send nothing".
	pub gossip_timestamp_min: u32,
	pub gossip_timestamp_max: u32,

	/// An unanswered query_short_channel_ids from this peer, and how far we got through it.
	pub(crate) scid_queries: Option<Vec<u64>>,
	pub(crate) scid_query_idx: usize,
	/// Endpoint nodes of the channels already sent, pending their node_announcements.
	pub(crate) scid_query_nodes: Vec<NodeId>,
	pub(crate) scid_query_nodes_idx: usize,

	/// How many of our own query_short_channel_ids are unacknowledged (at most one by contract).
	pub(crate) num_scid_queries_outstanding: usize,
	/// How many pongs are we expecting?
	pub(crate) num_pings_outstanding: usize,

	/// Block-coverage bitmap of our outstanding query_channel_range, if any.
	pub(crate) query_channel_blocks: Option<Vec<u8>>,
	pub(crate) first_channel_range: u32,
	pub(crate) query_channel_scids: Vec<u64>,

	/// Set while we are waiting out the broadcast interval before pumping more gossip.
	pub(crate) gossip_timer_armed: bool,

	pub(crate) pending_outbound: VecDeque<Vec<u8>>,
}

impl Peer {
	/// Admits a peer with the initial cursor/filter its features call for: `gossip_queries`
	/// peers get nothing until they send a filter, `initial_routing_sync` peers get a full
	/// replay, everyone else gets only what arrives from now on.
	pub fn new(id: NodeId, gossip_queries_feature: bool, initial_routing_sync_feature: bool,
		log_next_index: u64) -> Self
	{
		let (broadcast_index, gossip_timestamp_min, gossip_timestamp_max) =
			if gossip_queries_feature {
				// Relay nothing until the peer explicitly asks via a timestamp filter.
				(u64::max_value(), u32::max_value(), 0)
			} else if initial_routing_sync_feature {
				(0, 0, u32::max_value())
			} else {
				(log_next_index, 0, u32::max_value())
			};
		Peer {
			id,
			gossip_queries_feature,
			initial_routing_sync_feature,
			broadcast_index,
			gossip_timestamp_min,
			gossip_timestamp_max,
			scid_queries: None,
			scid_query_idx: 0,
			scid_query_nodes: Vec::new(),
			scid_query_nodes_idx: 0,
			num_scid_queries_outstanding: 0,
			num_pings_outstanding: 0,
			query_channel_blocks: None,
			first_channel_range: 0,
			query_channel_scids: Vec::new(),
			gossip_timer_armed: false,
			pending_outbound: VecDeque::new(),
		}
	}

	/// Queues an already-encoded wire message for delivery.
	pub fn queue_message(&mut self, msg: Vec<u8>) {
		self.pending_outbound.push_back(msg);
	}

	pub(crate) fn pop_outbound(&mut self) -> Option<Vec<u8>> {
		self.pending_outbound.pop_front()
	}

	/// Applies a gossip_timestamp_filter, resetting the broadcast cursor so the whole log is
	/// rescanned under the new range. Returns true if this was the peer's first filter, in which
	/// case the pump should run immediately rather than waiting out a flush timer.
	pub fn apply_gossip_timestamp_filter(&mut self, first_timestamp: u32, timestamp_range: u32) -> bool {
		let first_filter = self.gossip_timestamp_min > self.gossip_timestamp_max;

		self.gossip_timestamp_min = first_timestamp;
		self.gossip_timestamp_max = first_timestamp.wrapping_add(timestamp_range).wrapping_sub(1);
		if self.gossip_timestamp_max < self.gossip_timestamp_min {
			self.gossip_timestamp_max = u32::max_value();
		}
		self.broadcast_index = 0;
		first_filter
	}

	/// Accepts an inbound query_short_channel_ids, arming the reply sub-state the pump drains.
	/// A query while a previous one is still being answered breaks the peer contract.
	pub fn start_scid_query_reply(&mut self, short_channel_ids: Vec<u64>) -> Result<(), GossipError> {
		if self.scid_queries.is_some() || !self.scid_query_nodes.is_empty() {
			let err = "Bad concurrent query_short_channel_ids".to_owned();
			return Err(GossipError {
				err: err.clone(),
				action: ErrorAction::DisconnectPeer {
					msg: Some(ErrorMessage { channel_id: [0; 32], data: err }),
				},
			});
		}
		self.scid_queries = Some(short_channel_ids);
		self.scid_query_idx = 0;
		self.scid_query_nodes = Vec::new();
		self.scid_query_nodes_idx = 0;
		Ok(())
	}

	/// Emits the next batch of an in-progress scid-query reply: one channel (announcement plus
	/// both defined updates), or one node_announcement, or the final
	/// reply_short_channel_ids_end. Returns whether anything was queued, leaving the remainder
	/// for the next pump call so other work interleaves.
	pub fn create_next_scid_reply<L: Deref>(&mut self, graph: &NetworkGraph<L>) -> bool
		where L::Target: Logger
	{
		let mut sent = false;

		let num = self.scid_queries.as_ref().map(|queries| queries.len()).unwrap_or(0);
		let mut i = self.scid_query_idx;
		while !sent && i < num {
			let scid = self.scid_queries.as_ref().unwrap()[i];
			i += 1;

			let chan = match graph.get_channel(scid) {
				Some(chan) if chan.is_public() => chan,
				_ => continue,
			};

			self.pending_outbound.push_back(chan.announcement_message.clone().unwrap());
			if let Some(ref half) = chan.one_to_two {
				self.pending_outbound.push_back(half.last_update_message.clone());
			}
			if let Some(ref half) = chan.two_to_one {
				self.pending_outbound.push_back(half.last_update_message.clone());
			}

			// Record node ids for later transmission of node_announcements.
			self.scid_query_nodes.push(chan.node_one);
			self.scid_query_nodes.push(chan.node_two);
			sent = true;
		}

		// Just finished channels? Remove duplicate nodes.
		if self.scid_query_idx != num && i == num {
			self.scid_query_nodes.sort_unstable();
			self.scid_query_nodes.dedup();
		}
		self.scid_query_idx = i;

		let num_nodes = self.scid_query_nodes.len();
		let mut i = self.scid_query_nodes_idx;
		while !sent && i < num_nodes {
			let node_id = self.scid_query_nodes[i];
			i += 1;

			let announcement = graph.get_node(&node_id)
				.and_then(|node| node.announcement_info.as_ref())
				.map(|info| info.announcement_message.clone());
			if let Some(announcement) = announcement {
				self.pending_outbound.push_back(announcement);
				sent = true;
			}
		}
		self.scid_query_nodes_idx = i;

		// All channels and nodes sent; close out the query.
		if self.scid_queries.is_some() && self.scid_query_nodes_idx == self.scid_query_nodes.len()
			&& self.scid_query_idx == num
		{
			self.pending_outbound.push_back(wire::encode_msg(&msgs::ReplyShortChannelIdsEnd {
				chain_hash: graph.chain_hash(),
				full_information: true,
			}));
			sent = true;
			self.scid_queries = None;
			self.scid_query_idx = 0;
			self.scid_query_nodes = Vec::new();
			self.scid_query_nodes_idx = 0;
		}

		sent
	}

	/// Whether an inbound scid query still has batches to emit.
	pub(crate) fn scid_reply_active(&self) -> bool {
		self.scid_queries.is_some() || !self.scid_query_nodes.is_empty()
	}

	/// Arms the accumulator for a channel-range query we are about to send. Only one may be
	/// outstanding per peer.
	pub fn start_channel_range_query(&mut self, first_blocknum: u32, number_of_blocks: u32) -> bool {
		if self.query_channel_blocks.is_some() {
			return false;
		}
		self.first_channel_range = first_blocknum;
		self.query_channel_blocks = Some(vec![0; number_of_blocks as usize]);
		self.query_channel_scids = Vec::new();
		true
	}

	/// Folds one reply_channel_range into the accumulator. Replies must stay inside the queried
	/// range and must not overlap blocks already covered; when the bitmap fills up the collected
	/// ids are handed back and the sub-state cleared.
	pub fn handle_reply_channel_range(&mut self, msg: &ReplyChannelRange)
		-> Result<Option<RangeQueryComplete>, String>
	{
		let blocks_len = match self.query_channel_blocks.as_ref() {
			Some(blocks) => blocks.len() as u64,
			None => return Err(format!("reply_channel_range without query")),
		};

		if msg.first_blocknum.checked_add(msg.number_of_blocks).is_none() {
			return Err(format!("reply_channel_range invalid {}+{}",
				msg.first_blocknum, msg.number_of_blocks));
		}

		if msg.first_blocknum < self.first_channel_range {
			return Err(format!("reply_channel_range invalid {}+{} for query {}+{}",
				msg.first_blocknum, msg.number_of_blocks, self.first_channel_range, blocks_len));
		}
		let n = (msg.first_blocknum - self.first_channel_range) as u64;
		if n + msg.number_of_blocks as u64 > blocks_len {
			return Err(format!("reply_channel_range invalid {}+{} for query {}+{}",
				msg.first_blocknum, msg.number_of_blocks, self.first_channel_range, blocks_len));
		}

		let blocks = self.query_channel_blocks.as_mut().unwrap();
		let slice = &mut blocks[n as usize..(n + msg.number_of_blocks as u64) as usize];
		if let Some(covered) = slice.iter().position(|b| *b == 1) {
			return Err(format!("reply_channel_range {}+{} already have block {}",
				msg.first_blocknum, msg.number_of_blocks,
				self.first_channel_range as u64 + n + covered as u64));
		}
		for b in slice.iter_mut() {
			*b = 1;
		}

		self.query_channel_scids.extend_from_slice(&msg.short_channel_ids);

		// Still more to go?
		if self.query_channel_blocks.as_ref().unwrap().iter().any(|b| *b == 0) {
			return Ok(None);
		}

		let short_channel_ids = std::mem::replace(&mut self.query_channel_scids, Vec::new());
		self.query_channel_blocks = None;
		Ok(Some(RangeQueryComplete {
			final_first_blocknum: msg.first_blocknum,
			final_number_of_blocks: msg.number_of_blocks,
			full_information: msg.full_information,
			short_channel_ids,
		}))
	}

	/// Notes an incoming pong against the outstanding count; an unexpected pong is a protocol
	/// violation the caller turns into an error.
	pub fn received_pong(&mut self) -> bool {
		if self.num_pings_outstanding == 0 {
			return false;
		}
		self.num_pings_outstanding -= 1;
		true
	}
}
