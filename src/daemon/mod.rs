// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The daemon controller: owns the peer table, the timer queue, both control endpoints and the
//! local-channel update path that talks to the signer.
//!
//! [`GossipDaemon`] is sans-io. The embedding event loop feeds it decrypted peer messages
//! ([`GossipDaemon::handle_peer_message`]), drains per-peer output
//! ([`GossipDaemon::next_outbound`]) whenever a peer socket is writable, dispatches control
//! frames and fires timers ([`GossipDaemon::process_expired_timers`]). Wall-clock seconds and
//! monotonic milliseconds are always passed in, never read, so every behaviour pins down under
//! test. Between any two calls the graph is consistent; there are no locks anywhere.

pub mod control;

use std::collections::HashMap;
use std::io::Cursor;
use std::ops::Deref;

use bitcoin::blockdata::script::Script;
use bitcoin::hash_types::BlockHash;
use bitcoin::secp256k1::ecdsa::Signature;

use crate::ln::msgs::{self, ErrorAction, ErrorMessage, GossipError, NetAddress,
	CHANNEL_FLAG_DISABLED, MESSAGE_FLAG_OPT_HTLC_MAX};
use crate::ln::peer::Peer;
use crate::ln::wire::{self, Encode, Message};
use crate::routing::gossip::{ChannelUpdateInfo, NetworkGraph, NodeId};
use crate::routing::store::{GossipStore, StoreRecord};
use crate::sign::Signer;
use crate::util::logger::Logger;
use crate::util::scid_utils;
use crate::util::ser::Writeable;
use crate::util::timer::Timers;

use self::control::{ChannelEntry, ConnectdReply, ConnectdRequest, IncomingChannel,
	LocalChannelUpdate, MasterReply, MasterRequest, NodeEntry, RouteHop};

/// Onion failure code bit: the failing element is a node, not a channel.
const FAILCODE_NODE: u16 = 0x2000;
/// Onion failure code bit: the failure is permanent.
const FAILCODE_PERM: u16 = 0x4000;

/// Daemon configuration, as supplied by the parent at init.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
	/// Cadence of the staggered per-peer gossip fan-out.
	pub broadcast_interval_msec: u32,
	/// The chain all gossip must commit to.
	pub chain_hash: BlockHash,
	/// Our own node id.
	pub local_id: NodeId,
	/// Global features to list in our node_announcement.
	pub globalfeatures: Vec<u8>,
	/// Color for our node_announcement.
	pub rgb: [u8; 3],
	/// Alias for our node_announcement.
	pub alias: [u8; 32],
	/// How often we re-sign updates for our own channels; channels with no update in twice this
	/// long are pruned.
	pub update_channel_interval: u32,
	/// What we can actually announce.
	pub announcable: Vec<NetAddress>,
}

impl Config {
	/// Prune time is twice update time.
	pub fn prune_timeout(&self) -> u32 {
		self.update_channel_interval * 2
	}
}

/// Developer-mode toggles.
pub struct DevConfig {
	/// Clamp on the encoded scid-list size, to force chunked range replies under test.
	pub max_scids_encode_bytes: u32,
	/// Stalls the broadcast pump entirely.
	pub suppress_gossip: bool,
}

impl Default for DevConfig {
	fn default() -> Self {
		DevConfig { max_scids_encode_bytes: u32::max_value(), suppress_gossip: false }
	}
}

/// Tokens carried by the daemon's timers.
#[derive(Clone, Debug, PartialEq)]
pub enum TimerToken {
	/// Per-peer broadcast pacing: on expiry the peer may pull its next log entry.
	BroadcastFlush(NodeId),
	/// The keepalive/prune tick, every quarter prune timeout.
	RefreshNetwork,
}

/// Returned when a peer did something requiring its connection be closed. The wire `error` (if
/// any) has already been queued; the driver should flush the peer's outbound queue and drop the
/// connection, then call [`GossipDaemon::peer_disconnected`].
#[derive(Clone, Debug)]
pub struct PeerHandleError {}

impl std::fmt::Display for PeerHandleError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str("Peer sent invalid data; disconnecting")
	}
}

/// The external route-computation collaborator.
pub trait Router {
	/// Computes a route over the given graph. An empty vec means no route was found.
	fn find_route<L: Deref>(&self, graph: &NetworkGraph<L>, source: &NodeId, destination: &NodeId,
		msatoshi: u64, riskfactor: u16, final_cltv: u32, fuzz: f64, seed: &[u8; 16])
		-> Vec<RouteHop> where L::Target: Logger;
}

/// The gossip daemon: peer table, timers, control endpoints and the local-update path.
pub struct GossipDaemon<S: Deref, R: Deref, L: Deref + Clone>
	where S::Target: Signer, R::Target: Router, L::Target: Logger
{
	config: Config,
	rstate: NetworkGraph<L>,
	peers: HashMap<NodeId, Peer>,
	timers: Timers<TimerToken>,
	pub(crate) dev: DevConfig,
	master_replies: Vec<MasterReply>,
	connectd_replies: Vec<ConnectdReply>,
	/// Single-block range replies we had to drop because they exceeded the message limit.
	pub range_reply_overflows: u64,
	signer: S,
	router: R,
	logger: L,
}

impl<S: Deref, R: Deref, L: Deref + Clone> GossipDaemon<S, R, L>
	where S::Target: Signer, R::Target: Router, L::Target: Logger
{
	/// Builds the daemon from its init configuration, replaying the gossip store if one is
	/// given. Local channels start disabled (no peer is connected yet), an own-node
	/// announcement is attempted in case addresses or options changed across the restart, and
	/// the refresh timer is armed.
	pub fn new(config: Config, store: Option<(GossipStore, Vec<StoreRecord>)>, signer: S,
		router: R, logger: L, now: u32, now_ms: u64) -> Self
	{
		let mut rstate = NetworkGraph::new(config.chain_hash, config.local_id,
			config.prune_timeout(), logger.clone());
		if let Some((store, records)) = store {
			rstate.load_store(store, records);
		}
		rstate.disable_local_channels();

		let mut daemon = GossipDaemon {
			rstate,
			peers: HashMap::new(),
			timers: Timers::new(),
			dev: DevConfig::default(),
			master_replies: Vec::new(),
			connectd_replies: Vec::new(),
			range_reply_overflows: 0,
			signer,
			router,
			logger,
			config,
		};
		// The store may have announced our channels, in which case options or addresses might
		// have changed since we last told anyone.
		daemon.maybe_send_own_node_announce(now);
		daemon.timers.arm(now_ms + daemon.refresh_interval_ms(), TimerToken::RefreshNetwork);
		daemon
	}

	fn refresh_interval_ms(&self) -> u64 {
		self.config.prune_timeout() as u64 / 4 * 1000
	}

	/// Read-only view of the routing state.
	pub fn graph(&self) -> &NetworkGraph<L> {
		&self.rstate
	}

	/// The deadline of the soonest pending timer, for the embedding loop to sleep until.
	pub fn next_wakeup_ms(&self) -> Option<u64> {
		self.timers.next_expiry()
	}

	/// Fires every timer due at `now_ms`. Returns the peers whose flush gate opened; the driver
	/// should pump each via [`GossipDaemon::next_outbound`].
	pub fn process_expired_timers(&mut self, now: u32, now_ms: u64) -> Vec<NodeId> {
		let mut woken = Vec::new();
		while let Some(token) = self.timers.pop_expired(now_ms) {
			match token {
				TimerToken::BroadcastFlush(node_id) => {
					if let Some(peer) = self.peers.get_mut(&node_id) {
						peer.gossip_timer_armed = false;
						woken.push(node_id);
					}
				}
				TimerToken::RefreshNetwork => self.gossip_refresh_network(now, now_ms),
			}
		}
		woken
	}

	/// Admits a peer handed over by the connection daemon. An existing peer with the same id is
	/// replaced (its local channels are disabled until the new session says otherwise). The
	/// driver should pump the new peer immediately.
	pub fn new_peer(&mut self, node_id: NodeId, gossip_queries_feature: bool,
		initial_routing_sync_feature: bool)
	{
		// We might not have noticed the old peer is dead; kill it now.
		self.destroy_peer(&node_id);

		let mut peer = Peer::new(node_id, gossip_queries_feature, initial_routing_sync_feature,
			self.rstate.broadcasts.next_index());

		// Tell it to start gossip! (And give us everything!)
		if peer.gossip_queries_feature {
			peer.queue_message(wire::encode_msg(&msgs::GossipTimestampFilter {
				chain_hash: self.config.chain_hash,
				first_timestamp: 0,
				timestamp_range: u32::max_value(),
			}));
		}

		self.peers.insert(node_id, peer);
		log_debug!(self.logger, "Peer {} connected (gossip_queries {}, initial_routing_sync {})",
			node_id, gossip_queries_feature, initial_routing_sync_feature);
	}

	/// Tears a peer down: cancels its timers and disables every local channel to it. The graph
	/// entries themselves stay.
	pub fn peer_disconnected(&mut self, node_id: &NodeId) {
		self.destroy_peer(node_id);
	}

	fn destroy_peer(&mut self, node_id: &NodeId) {
		if self.peers.remove(node_id).is_none() {
			return;
		}
		self.timers.cancel(&TimerToken::BroadcastFlush(*node_id));
		self.peer_disable_channels(node_id);
		log_debug!(self.logger, "Peer {} destroyed", node_id);
	}

	/// If we have channels with this peer, disable them until it comes back.
	fn peer_disable_channels(&mut self, node_id: &NodeId) {
		let scids = match self.rstate.get_node(node_id) {
			Some(node) => node.channels.clone(),
			None => return,
		};
		let local = self.config.local_id;
		for scid in scids {
			if let Some(chan) = self.rstate.get_channel_mut(scid) {
				let other_is_us = (chan.node_one == *node_id && chan.node_two == local)
					|| (chan.node_two == *node_id && chan.node_one == local);
				if other_is_us {
					chan.local_disabled = true;
				}
			}
		}
	}

	/// Whether the peer is currently connected.
	pub fn is_peer_connected(&self, node_id: &NodeId) -> bool {
		self.peers.contains_key(node_id)
	}

	fn peer_error(&mut self, node_id: &NodeId, err: String) -> PeerHandleError {
		log_trace!(self.logger, "peer {}: {}", node_id, err);
		if let Some(peer) = self.peers.get_mut(node_id) {
			peer.queue_message(wire::encode_msg(&ErrorMessage { channel_id: [0; 32], data: err }));
		}
		PeerHandleError {}
	}

	fn act_on_gossip_error(&mut self, node_id: &NodeId, e: GossipError) -> Result<(), PeerHandleError> {
		match e.action {
			ErrorAction::DisconnectPeer { msg } => {
				log_trace!(self.logger, "peer {}: {}", node_id, e.err);
				if let Some(msg) = msg {
					if let Some(peer) = self.peers.get_mut(node_id) {
						peer.queue_message(wire::encode_msg(&msg));
					}
				}
				Err(PeerHandleError {})
			}
			ErrorAction::SendErrorMessage { msg } => {
				log_trace!(self.logger, "peer {}: {}", node_id, e.err);
				if let Some(peer) = self.peers.get_mut(node_id) {
					peer.queue_message(wire::encode_msg(&msg));
				}
				Ok(())
			}
			ErrorAction::IgnoreError => {
				log_trace!(self.logger, "peer {}: ignoring: {}", node_id, e.err);
				Ok(())
			}
			ErrorAction::IgnoreAndLog(level) => {
				log_internal!(self.logger, level, "peer {}: ignoring: {}", node_id, e.err);
				Ok(())
			}
			ErrorAction::IgnoreDuplicateGossip => {
				log_gossip!(self.logger, "peer {}: duplicate gossip: {}", node_id, e.err);
				Ok(())
			}
		}
	}

	/// Dispatches one decrypted wire message from a peer. `now` is the current unix time, used
	/// when ingestion triggers locally signed messages. On `Err` the connection must be closed
	/// (a wire `error` has been queued where one is owed).
	pub fn handle_peer_message(&mut self, node_id: &NodeId, bytes: &[u8], now: u32)
		-> Result<(), PeerHandleError>
	{
		if !self.peers.contains_key(node_id) {
			return Err(PeerHandleError {});
		}

		let message = match wire::read(&mut Cursor::new(bytes)) {
			Ok(message) => message,
			Err(e) => {
				return Err(self.peer_error(node_id, format!("Bad message: {:?}", e)));
			}
		};

		match message {
			Message::ChannelAnnouncement(ann) => {
				match self.rstate.handle_channel_announcement(&ann) {
					// Tells us the short_channel_id to look up on-chain.
					Ok(Some(scid)) => {
						self.master_replies.push(MasterReply::GetTxout { short_channel_id: scid });
					}
					Ok(None) => {}
					Err(e) => self.act_on_gossip_error(node_id, e)?,
				}
				Ok(())
			}
			Message::NodeAnnouncement(ann) => {
				if let Err(e) = self.rstate.handle_node_announcement(&ann) {
					self.act_on_gossip_error(node_id, e)?;
				}
				Ok(())
			}
			Message::ChannelUpdate(update) => {
				match self.rstate.handle_channel_update(&update) {
					// In case we just announced a new local channel.
					Ok(()) => self.maybe_send_own_node_announce(now),
					Err(e) => self.act_on_gossip_error(node_id, e)?,
				}
				Ok(())
			}
			Message::QueryShortChannelIds(query) => {
				if query.chain_hash != self.config.chain_hash {
					log_trace!(self.logger, "{} sent query_short_channel_ids for different chain",
						node_id);
					return Ok(());
				}
				let peer = self.peers.get_mut(node_id).unwrap();
				if let Err(e) = peer.start_scid_query_reply(query.short_channel_ids) {
					self.act_on_gossip_error(node_id, e)?;
				}
				Ok(())
			}
			Message::ReplyShortChannelIdsEnd(end) => {
				if end.chain_hash != self.config.chain_hash {
					return Err(self.peer_error(node_id,
						"reply_short_channel_ids_end for bad chain".to_owned()));
				}
				let peer = self.peers.get_mut(node_id).unwrap();
				if peer.num_scid_queries_outstanding == 0 {
					return Err(self.peer_error(node_id,
						"unexpected reply_short_channel_ids_end".to_owned()));
				}
				peer.num_scid_queries_outstanding -= 1;
				self.master_replies.push(MasterReply::ScidsReply {
					ok: true,
					complete: end.full_information,
				});
				Ok(())
			}
			Message::GossipTimestampFilter(filter) => {
				if filter.chain_hash != self.config.chain_hash {
					log_trace!(self.logger, "{} sent gossip_timestamp_filter for different chain",
						node_id);
					return Ok(());
				}
				let peer = self.peers.get_mut(node_id).unwrap();
				// The first filter starts gossip sync immediately; later ones wait out any
				// running flush timer.
				if peer.apply_gossip_timestamp_filter(filter.first_timestamp, filter.timestamp_range) {
					peer.gossip_timer_armed = false;
					self.timers.cancel(&TimerToken::BroadcastFlush(*node_id));
				}
				Ok(())
			}
			Message::QueryChannelRange(query) => {
				if query.chain_hash != self.config.chain_hash {
					log_trace!(self.logger, "{} sent query_channel_range for different chain", node_id);
					return Ok(());
				}
				if query.first_blocknum.checked_add(query.number_of_blocks).is_none() {
					return Err(self.peer_error(node_id, format!("query_channel_range overflow {}+{}",
						query.first_blocknum, query.number_of_blocks)));
				}
				self.queue_channel_ranges(node_id, query.first_blocknum, query.number_of_blocks);
				Ok(())
			}
			Message::ReplyChannelRange(reply) => {
				if reply.chain_hash != self.config.chain_hash {
					return Err(self.peer_error(node_id, "reply_channel_range for bad chain".to_owned()));
				}
				let peer = self.peers.get_mut(node_id).unwrap();
				match peer.handle_reply_channel_range(&reply) {
					Ok(Some(complete)) => {
						self.master_replies.push(MasterReply::QueryChannelRangeReply {
							final_first_block: complete.final_first_blocknum,
							final_num_blocks: complete.final_number_of_blocks,
							complete: complete.full_information,
							short_channel_ids: complete.short_channel_ids,
						});
						Ok(())
					}
					Ok(None) => Ok(()),
					Err(err) => Err(self.peer_error(node_id, err)),
				}
			}
			Message::Ping(ping) => {
				// A ping demanding an oversize pong must be ignored outright.
				if ping.ponglen < 65532 {
					let peer = self.peers.get_mut(node_id).unwrap();
					peer.queue_message(wire::encode_msg(&msgs::Pong { byteslen: ping.ponglen }));
				}
				Ok(())
			}
			Message::Pong(pong) => {
				let peer = self.peers.get_mut(node_id).unwrap();
				if !peer.received_pong() {
					return Err(self.peer_error(node_id, "Unexpected pong".to_owned()));
				}
				self.master_replies.push(MasterReply::PingReply {
					node_id: *node_id,
					sent: true,
					totlen: pong.byteslen,
				});
				Ok(())
			}
			Message::Error(err) => {
				log_debug!(self.logger, "peer {} sent error: {}", node_id, err.data);
				Err(PeerHandleError {})
			}
			Message::Unknown(msg_type) => {
				Err(self.peer_error(node_id, format!("Peer sent unknown message type {}", msg_type)))
			}
		}
	}

	/// Pulls the next message owed to a peer: queued replies first, then in-progress scid-query
	/// batches, then - once any flush timer has expired - the next broadcast-log entry matching
	/// the peer's timestamp filter. Returns `None` when the peer is idle; if the broadcast
	/// cursor drained the log a flush timer has been armed and the peer will be handed back by
	/// [`GossipDaemon::process_expired_timers`].
	pub fn next_outbound(&mut self, node_id: &NodeId, now_ms: u64) -> Option<Vec<u8>> {
		let peer = self.peers.get_mut(node_id)?;

		if let Some(msg) = peer.pop_outbound() {
			return Some(msg);
		}

		// Do we have scid query replies to send?
		if peer.scid_reply_active() && peer.create_next_scid_reply(&self.rstate) {
			return peer.pop_outbound();
		}

		// Waiting out the broadcast interval?
		if peer.gossip_timer_armed {
			return None;
		}
		if self.dev.suppress_gossip {
			return None;
		}

		match self.rstate.broadcasts.next_after(peer.broadcast_index, peer.gossip_timestamp_min,
			peer.gossip_timestamp_max)
		{
			Some((payload, index)) => {
				peer.broadcast_index = index;
				Some(payload.to_vec())
			}
			None => {
				// Gossip is drained. Wait for the next interval.
				peer.gossip_timer_armed = true;
				self.timers.arm(now_ms + self.config.broadcast_interval_msec as u64,
					TimerToken::BroadcastFlush(*node_id));
				None
			}
		}
	}

	/// Streams one or more reply_channel_range messages whose union covers exactly the
	/// requested range, splitting in half whenever the encoded ids exceed the message limit. A
	/// single block which still does not fit is logged and skipped.
	fn queue_channel_ranges(&mut self, node_id: &NodeId, first_blocknum: u32, number_of_blocks: u32) {
		// chain_hash (32) + first_blocknum (4) + number_of_blocks (4) + complete (1) + len (2)
		const REPLY_OVERHEAD: usize = 32 + 4 + 4 + 1 + 2;
		let max_encoded_bytes = std::cmp::min(65535 - 2 - REPLY_OVERHEAD,
			self.dev.max_scids_encode_bytes as usize);

		let short_channel_ids = self.rstate.announced_scids_in_block_range(first_blocknum,
			first_blocknum as u64 + number_of_blocks as u64);
		let encoded = msgs::encode_short_channel_ids(&short_channel_ids);
		if encoded.len() <= max_encoded_bytes {
			let msg = wire::encode_msg(&msgs::ReplyChannelRange {
				chain_hash: self.config.chain_hash,
				first_blocknum,
				number_of_blocks,
				full_information: true,
				short_channel_ids,
			});
			if let Some(peer) = self.peers.get_mut(node_id) {
				peer.queue_message(msg);
			}
			return;
		}

		// It wouldn't all fit: divide in half. We assume we can always send one block!
		if number_of_blocks <= 1 {
			self.range_reply_overflows += 1;
			log_error!(self.logger, "Could not fit scids for single block {}", first_blocknum);
			return;
		}
		log_debug!(self.logger, "queue_channel_ranges full: splitting {}+{} and {}+{}",
			first_blocknum, number_of_blocks / 2,
			first_blocknum + number_of_blocks / 2, number_of_blocks - number_of_blocks / 2);
		self.queue_channel_ranges(node_id, first_blocknum, number_of_blocks / 2);
		self.queue_channel_ranges(node_id, first_blocknum + number_of_blocks / 2,
			number_of_blocks - number_of_blocks / 2);
	}

	/// Builds, signs and distributes a channel_update for one of our own channels. Unannounced
	/// channels additionally hand the update straight to the channel peer, since nobody else
	/// may learn of them. Local updates failing ingestion is unrecoverable.
	fn update_local_channel(&mut self, short_channel_id: u64, direction: u8, disable: bool,
		cltv_expiry_delta: u16, htlc_minimum_msat: u64, fee_base_msat: u32,
		fee_proportional_millionths: u32, htlc_maximum_msat: u64, now: u32)
	{
		let (is_public, other_node, prior_timestamp) = {
			let chan = match self.rstate.get_channel(short_channel_id) {
				Some(chan) => chan,
				None => return,
			};
			let other = *chan.node(direction ^ 1);
			(chan.is_public(), other, chan.half(direction).as_ref().map(|half| half.last_update))
		};

		// Timestamps must move forward for the same half, or the update is ignored everywhere.
		let mut timestamp = now;
		if let Some(prior) = prior_timestamp {
			if timestamp <= prior {
				timestamp = prior + 1;
			}
		}

		let mut channel_flags = direction;
		if disable {
			channel_flags |= CHANNEL_FLAG_DISABLED;
		}

		let contents = msgs::UnsignedChannelUpdate {
			chain_hash: self.config.chain_hash,
			short_channel_id,
			timestamp,
			message_flags: MESSAGE_FLAG_OPT_HTLC_MAX,
			channel_flags,
			cltv_expiry_delta,
			htlc_minimum_msat,
			fee_base_msat,
			fee_proportional_millionths,
			htlc_maximum_msat: Some(htlc_maximum_msat),
			excess_data: Vec::new(),
		};

		// Provisional message with a zero signature for the signer to fill in.
		let mut unsigned = Vec::new();
		unsigned.extend_from_slice(&<msgs::ChannelUpdate as Encode>::TYPE.to_be_bytes());
		unsigned.extend_from_slice(&[0u8; 64]);
		unsigned.extend_from_slice(&contents.encode());

		let signed = match self.signer.sign_channel_update(&unsigned) {
			Ok(signed) => signed,
			Err(e) => panic!("Could not sign channel_update: {}", e),
		};
		let update = match wire::read(&mut Cursor::new(&signed)) {
			Ok(Message::ChannelUpdate(update)) => update,
			_ => panic!("Signer returned an invalid channel_update"),
		};

		// We always tell the channel peer directly when nobody else will relay it.
		if !is_public {
			if let Some(peer) = self.peers.get_mut(&other_node) {
				peer.queue_message(signed);
			}
		}

		if let Err(e) = self.rstate.handle_channel_update(&update) {
			panic!("Rejected local channel update for {}: {}",
				scid_utils::scid_to_string(short_channel_id), e.err);
		}
	}

	/// Re-signs a half-channel whose stored disable bit disagrees with `local_disabled`. Called
	/// lazily whenever someone asks for the channel's latest update, so answers are always
	/// current without a re-sign on every flap.
	fn maybe_update_local_channel(&mut self, short_channel_id: u64, direction: u8, now: u32) {
		let params = {
			let chan = match self.rstate.get_channel(short_channel_id) {
				Some(chan) => chan,
				None => return,
			};
			// Don't generate a channel_update for an uninitialized channel.
			let half = match chan.half(direction) {
				Some(half) => half,
				None => return,
			};
			// Nothing to update?
			let half_disabled = half.channel_flags & CHANNEL_FLAG_DISABLED != 0;
			if chan.local_disabled == half_disabled {
				return;
			}
			(chan.local_disabled, half.cltv_expiry_delta, half.htlc_minimum_msat,
				half.fees.base_msat, half.fees.proportional_millionths,
				half.htlc_maximum_msat.unwrap_or(0))
		};
		self.update_local_channel(short_channel_id, direction, params.0, params.1, params.2,
			params.3, params.4, params.5, now);
	}

	/// Handles a parameter change for one of our channels from the subdaemon owning it.
	pub fn handle_local_channel_update(&mut self, node_id: &NodeId, update: &LocalChannelUpdate,
		now: u32)
	{
		// Can theoretically happen if the channel just closed.
		let info = {
			let chan = match self.rstate.get_channel(update.short_channel_id) {
				Some(chan) => chan,
				None => {
					log_trace!(self.logger, "peer {} local_channel_update for unknown {}",
						node_id, scid_utils::scid_to_string(update.short_channel_id));
					return;
				}
			};
			match chan.direction_from(&self.config.local_id) {
				Some(direction) => {
					let half = chan.half(direction);
					let new_info = match half {
						None => true,
						Some(half) => {
							half.cltv_expiry_delta != update.cltv_expiry_delta
								|| half.htlc_minimum_msat != update.htlc_minimum_msat
								|| half.fees.base_msat != update.fee_base_msat
								|| half.fees.proportional_millionths != update.fee_proportional_millionths
								|| half.htlc_maximum_msat != Some(update.htlc_maximum_msat)
						}
					};
					let announced_disabled = half.as_ref()
						.map(|half| half.channel_flags & CHANNEL_FLAG_DISABLED != 0)
						.unwrap_or(false);
					Some((direction, new_info, announced_disabled, chan.is_public()))
				}
				None => {
					log_error!(self.logger, "peer {} bad local_channel_update for non-local {}",
						node_id, scid_utils::scid_to_string(update.short_channel_id));
					return;
				}
			}
		};
		let (direction, new_info, announced_disabled, is_public) = info.unwrap();

		// Changed configuration, re-enabling an announced-disabled channel, and unannounced
		// channels (only the peer hears those) all warrant an immediate signed update. The
		// normal case just toggles local_disabled and lets maybe_update_local_channel catch it
		// when someone asks.
		if new_info || (announced_disabled && !update.disable) || !is_public {
			self.update_local_channel(update.short_channel_id, direction, update.disable,
				update.cltv_expiry_delta, update.htlc_minimum_msat, update.fee_base_msat,
				update.fee_proportional_millionths, update.htlc_maximum_msat, now);
		}

		if let Some(chan) = self.rstate.get_channel_mut(update.short_channel_id) {
			chan.local_disabled = update.disable;
		}
	}

	/// Registers a confirmed local channel which has no public announcement (yet).
	pub fn handle_local_add_channel(&mut self, remote: &NodeId, short_channel_id: u64, satoshis: u64) {
		self.rstate.local_add_channel(short_channel_id, remote, satoshis);
	}

	/// Returns the latest update for our half of the given channel, freshening it first if the
	/// stored disable bit went stale. Unknown scids are a soft no.
	pub fn handle_get_update(&mut self, node_id: &NodeId, short_channel_id: u64, now: u32)
		-> Option<Vec<u8>>
	{
		let direction = match self.rstate.get_channel(short_channel_id) {
			None => {
				log_info!(self.logger, "peer {} scid {}: unknown channel",
					node_id, scid_utils::scid_to_string(short_channel_id));
				return None;
			}
			Some(chan) => match chan.direction_from(&self.config.local_id) {
				// We want the update that comes from our end.
				Some(direction) => direction,
				None => {
					log_info!(self.logger, "peer {} scid {}: not our channel?",
						node_id, scid_utils::scid_to_string(short_channel_id));
					return None;
				}
			},
		};

		// Since we're going to send it out, make sure it's up-to-date.
		self.maybe_update_local_channel(short_channel_id, direction, now);

		self.rstate.get_channel(short_channel_id)
			.and_then(|chan| chan.half(direction).as_ref())
			.map(|half| half.last_update_message.clone())
	}

	fn create_node_announcement_contents(&self, timestamp: u32) -> msgs::UnsignedNodeAnnouncement {
		msgs::UnsignedNodeAnnouncement {
			features: self.config.globalfeatures.clone(),
			timestamp,
			node_id: self.config.local_id,
			rgb: self.config.rgb,
			alias: self.config.alias,
			addresses: self.config.announcable.clone(),
			excess_address_data: Vec::new(),
			excess_data: Vec::new(),
		}
	}

	fn send_node_announcement(&mut self, now: u32) {
		let last_timestamp = self.rstate.get_node(&self.config.local_id)
			.and_then(|node| node.announcement_info.as_ref())
			.map(|info| info.last_update);

		// Timestamps must move forward, or the announcement will be ignored!
		let mut timestamp = now;
		if let Some(last) = last_timestamp {
			if timestamp <= last {
				timestamp = last + 1;
			}
		}

		let contents = self.create_node_announcement_contents(timestamp);
		let mut unsigned = Vec::new();
		unsigned.extend_from_slice(&<msgs::NodeAnnouncement as Encode>::TYPE.to_be_bytes());
		unsigned.extend_from_slice(&[0u8; 64]);
		unsigned.extend_from_slice(&contents.encode());

		let signature: Signature = match self.signer.sign_node_announcement(&unsigned) {
			Ok(signature) => signature,
			Err(e) => panic!("Could not sign node_announcement: {}", e),
		};
		let announcement = msgs::NodeAnnouncement { signature, contents };
		if let Err(e) = self.rstate.handle_node_announcement(&announcement) {
			panic!("Rejected own node announcement: {}", e.err);
		}
	}

	/// Return true if the only change in a fresh announcement would be the timestamp.
	fn node_announcement_redundant(&self) -> bool {
		let info = match self.rstate.get_node(&self.config.local_id)
			.and_then(|node| node.announcement_info.as_ref())
		{
			Some(info) => info,
			None => return false,
		};

		// Addresses are compared in announced order on purpose: a node which reorders them is
		// asking for a re-announce.
		info.addresses == self.config.announcable
			&& info.alias == self.config.alias
			&& info.rgb == self.config.rgb
			&& info.features == self.config.globalfeatures
	}

	/// Announces our own node iff one of our channels is publicly announced and something
	/// actually changed since the last announcement.
	pub fn maybe_send_own_node_announce(&mut self, now: u32) {
		if !self.rstate.local_channel_announced {
			return;
		}
		if self.node_announcement_redundant() {
			return;
		}
		self.send_node_announcement(now);
		self.rstate.local_channel_announced = false;
	}

	/// The keepalive/prune tick: re-signs updates for local half-channels about to go stale,
	/// then prunes channels nobody refreshed.
	fn gossip_refresh_network(&mut self, now: u32, now_ms: u64) {
		// Schedule the next run now.
		self.timers.arm(now_ms + self.refresh_interval_ms(), TimerToken::RefreshNetwork);

		// Anything below this highwater mark could be pruned if not refreshed.
		let highwater = now.saturating_sub(self.config.prune_timeout() / 2);

		let mut keepalives = Vec::new();
		if let Some(node) = self.rstate.get_node(&self.config.local_id) {
			for scid in node.channels.iter() {
				let chan = match self.rstate.get_channel(*scid) {
					Some(chan) => chan,
					None => continue,
				};
				let direction = match chan.direction_from(&self.config.local_id) {
					Some(direction) => direction,
					None => continue,
				};
				let half = match chan.half(direction) {
					// Not announced yet, so don't try to re-announce it.
					None => continue,
					Some(half) => half,
				};
				if half.last_update > highwater {
					// No need for a keepalive update message yet.
					continue;
				}
				if !half.enabled {
					// Only send keepalives for active connections.
					continue;
				}
				keepalives.push((*scid, direction, chan.local_disabled, half.cltv_expiry_delta,
					half.htlc_minimum_msat, half.fees.base_msat, half.fees.proportional_millionths,
					half.htlc_maximum_msat.unwrap_or(0)));
			}
		}

		for (scid, direction, disable, cltv, htlc_min, base, proportional, htlc_max) in keepalives {
			log_trace!(self.logger, "Sending keepalive channel_update for {}",
				scid_utils::scid_to_string(scid));
			self.update_local_channel(scid, direction, disable, cltv, htlc_min, base,
				proportional, htlc_max, now);
		}

		self.rstate.prune(now);
	}

	/// Dispatches one request from the parent process. Replies land in the master outbox.
	pub fn handle_master_request(&mut self, request: MasterRequest, now: u32) {
		match request {
			MasterRequest::Init(_) => {
				// Configuration is fixed at construction; a second init is a parent bug.
				log_error!(self.logger, "Duplicate init from master, ignoring");
			}
			MasterRequest::GetNodes { node_id } => {
				let mut nodes = Vec::new();
				match node_id {
					Some(node_id) => {
						if let Some(node) = self.rstate.get_node(&node_id) {
							nodes.push(Self::node_entry(node_id, node));
						}
					}
					None => {
						for (node_id, node) in self.rstate.nodes().iter() {
							nodes.push(Self::node_entry(*node_id, node));
						}
					}
				}
				self.master_replies.push(MasterReply::GetNodesReply { nodes });
			}
			MasterRequest::GetRoute { source, destination, msatoshi, riskfactor, final_cltv, fuzz, seed } => {
				log_trace!(self.logger, "Trying to find a route from {} to {} for {} msatoshi",
					source, destination, msatoshi);
				let hops = self.router.find_route(&self.rstate, &source, &destination, msatoshi,
					riskfactor, final_cltv, fuzz, &seed);
				self.master_replies.push(MasterReply::GetRouteReply { hops });
			}
			MasterRequest::GetChannels { short_channel_id } => {
				let mut channels = Vec::new();
				match short_channel_id {
					Some(scid) => {
						if let Some(chan) = self.rstate.get_channel(scid) {
							Self::append_channel_entries(&mut channels, scid, chan);
						}
					}
					None => {
						for (scid, chan) in self.rstate.channels().iter() {
							Self::append_channel_entries(&mut channels, *scid, chan);
						}
					}
				}
				self.master_replies.push(MasterReply::GetChannelsReply { channels });
			}
			MasterRequest::GetChannelPeer { short_channel_id } => {
				let node_id = self.rstate.get_channel(short_channel_id).and_then(|chan| {
					chan.direction_from(&self.config.local_id)
						.map(|direction| *chan.node(direction ^ 1))
				});
				if node_id.is_none() {
					log_trace!(self.logger, "Failed to resolve local channel {}",
						scid_utils::scid_to_string(short_channel_id));
				}
				self.master_replies.push(MasterReply::GetChannelPeerReply { node_id });
			}
			MasterRequest::GetIncomingChannels => {
				let mut channels = Vec::new();
				if let Some(node) = self.rstate.get_node(&self.config.local_id) {
					for scid in node.channels.iter() {
						let chan = match self.rstate.get_channel(*scid) {
							Some(chan) => chan,
							None => continue,
						};
						// Don't leak private channels.
						if !chan.is_public() {
							continue;
						}
						let direction = match chan.direction_from(&self.config.local_id) {
							Some(direction) => direction,
							None => continue,
						};
						// The half *toward* us carries the fees a payer would be quoted.
						let half = match chan.half(direction ^ 1) {
							Some(half) if half.enabled => half,
							_ => continue,
						};
						channels.push(IncomingChannel {
							node_id: *chan.node(direction ^ 1),
							short_channel_id: *scid,
							fee_base_msat: half.fees.base_msat,
							fee_proportional_millionths: half.fees.proportional_millionths,
							cltv_expiry_delta: half.cltv_expiry_delta,
						});
					}
				}
				self.master_replies.push(MasterReply::GetIncomingChannelsReply { channels });
			}
			MasterRequest::Ping { node_id, num_pong_bytes, len } => {
				if !self.peers.contains_key(&node_id) {
					self.master_replies.push(MasterReply::PingReply { node_id, sent: false, totlen: 0 });
					return;
				}
				let peer = self.peers.get_mut(&node_id).unwrap();
				peer.queue_message(wire::encode_msg(&msgs::Ping {
					ponglen: num_pong_bytes,
					byteslen: len,
				}));
				log_trace!(self.logger, "sending ping expecting {}response",
					if num_pong_bytes >= 65532 { "no " } else { "" });
				// A peer must ignore a ping demanding an oversize pong, so answer the master
				// right away in that case.
				if num_pong_bytes >= 65532 {
					self.master_replies.push(MasterReply::PingReply { node_id, sent: true, totlen: 0 });
				} else {
					peer.num_pings_outstanding += 1;
				}
			}
			MasterRequest::GetTxoutReply { short_channel_id, satoshis, outscript } => {
				let script = Script::from(outscript);
				self.rstate.resolve_pending_announcement(short_channel_id, satoshis, &script, now);
				self.maybe_send_own_node_announce(now);
			}
			MasterRequest::RoutingFailure { erring_node, erring_channel, failcode, channel_update } => {
				if !channel_update.is_empty() {
					match wire::read(&mut Cursor::new(&channel_update)) {
						Ok(Message::ChannelUpdate(update)) => {
							if let Err(e) = self.rstate.handle_channel_update(&update) {
								log_debug!(self.logger, "routing_failure enclosed update rejected: {}", e.err);
							}
						}
						_ => log_debug!(self.logger, "routing_failure carried a non-update message"),
					}
				}
				let is_permanent = failcode & FAILCODE_PERM != 0;
				if failcode & FAILCODE_NODE != 0 {
					self.rstate.node_failed(&erring_node, is_permanent);
				} else {
					self.rstate.channel_failed(erring_channel, is_permanent);
				}
			}
			MasterRequest::MarkChannelUnroutable { short_channel_id } => {
				self.rstate.channel_failed(short_channel_id, false);
			}
			MasterRequest::OutpointSpent { short_channel_id } => {
				log_trace!(self.logger, "Deleting channel {} due to the funding outpoint being spent",
					scid_utils::scid_to_string(short_channel_id));
				self.rstate.channel_spent(short_channel_id);
			}
			MasterRequest::LocalChannelClose { short_channel_id } => {
				// handle_outpoint_spent will delete it once the close confirms; meanwhile just
				// stop routing through it.
				if let Some(chan) = self.rstate.get_channel_mut(short_channel_id) {
					chan.local_disabled = true;
				}
			}
			MasterRequest::QueryScids { node_id, short_channel_ids } => {
				let ok = self.send_query_short_channel_ids(&node_id, short_channel_ids);
				if !ok {
					self.master_replies.push(MasterReply::ScidsReply { ok: false, complete: false });
				}
			}
			MasterRequest::SendTimestampFilter { node_id, first_timestamp, timestamp_range } => {
				let chain_hash = self.config.chain_hash;
				match self.peers.get_mut(&node_id) {
					Some(peer) if peer.gossip_queries_feature => {
						peer.queue_message(wire::encode_msg(&msgs::GossipTimestampFilter {
							chain_hash,
							first_timestamp,
							timestamp_range,
						}));
					}
					_ => log_error!(self.logger,
						"send_timestamp_filter: unknown or incapable peer {}", node_id),
				}
			}
			MasterRequest::QueryChannelRange { node_id, first_blocknum, number_of_blocks } => {
				let ok = self.send_query_channel_range(&node_id, first_blocknum, number_of_blocks);
				if !ok {
					self.master_replies.push(MasterReply::QueryChannelRangeReply {
						final_first_block: 0,
						final_num_blocks: 0,
						complete: false,
						short_channel_ids: Vec::new(),
					});
				}
			}
			MasterRequest::DevSetMaxScidsEncodeSize { max } => {
				log_trace!(self.logger, "Set max_scids_encode_bytes to {}", max);
				self.dev.max_scids_encode_bytes = max;
			}
			MasterRequest::DevSuppressGossip => {
				log_info!(self.logger, "Suppressing all gossip");
				self.dev.suppress_gossip = true;
			}
		}
	}

	fn send_query_short_channel_ids(&mut self, node_id: &NodeId, short_channel_ids: Vec<u64>) -> bool {
		// query_short_channel_ids: chain_hash (32) + len (2)
		const QUERY_OVERHEAD: usize = 32 + 2;
		let max_encoded_bytes = 65535 - 2 - QUERY_OVERHEAD;

		let chain_hash = self.config.chain_hash;
		let peer = match self.peers.get_mut(node_id) {
			Some(peer) => peer,
			None => {
				log_error!(self.logger, "query_scids: unknown peer {}", node_id);
				return false;
			}
		};
		if !peer.gossip_queries_feature {
			log_error!(self.logger, "query_scids: no gossip_query support in peer {}", node_id);
			return false;
		}
		// One query at a time per peer, or replies can't be told apart.
		if peer.num_scid_queries_outstanding != 0 {
			log_error!(self.logger, "query_scids: previous query to {} still in flight", node_id);
			return false;
		}
		if msgs::encode_short_channel_ids(&short_channel_ids).len() > max_encoded_bytes {
			log_error!(self.logger, "query_short_channel_ids: {} is too many",
				short_channel_ids.len());
			return false;
		}

		let count = short_channel_ids.len();
		peer.queue_message(wire::encode_msg(&msgs::QueryShortChannelIds {
			chain_hash,
			short_channel_ids,
		}));
		peer.num_scid_queries_outstanding += 1;
		log_trace!(self.logger, "sending query for {} scids", count);
		true
	}

	fn send_query_channel_range(&mut self, node_id: &NodeId, first_blocknum: u32,
		number_of_blocks: u32) -> bool
	{
		let chain_hash = self.config.chain_hash;
		let peer = match self.peers.get_mut(node_id) {
			Some(peer) => peer,
			None => {
				log_error!(self.logger, "query_channel_range: unknown peer {}", node_id);
				return false;
			}
		};
		if !peer.gossip_queries_feature {
			log_error!(self.logger, "query_channel_range: no gossip_query support in peer {}", node_id);
			return false;
		}
		if !peer.start_channel_range_query(first_blocknum, number_of_blocks) {
			log_error!(self.logger, "query_channel_range: previous query active");
			return false;
		}
		log_debug!(self.logger, "sending query_channel_range for blocks {}+{}",
			first_blocknum, number_of_blocks);
		peer.queue_message(wire::encode_msg(&msgs::QueryChannelRange {
			chain_hash,
			first_blocknum,
			number_of_blocks,
		}));
		true
	}

	/// Dispatches one request from the connection daemon.
	pub fn handle_connectd_request(&mut self, request: ConnectdRequest) {
		match request {
			ConnectdRequest::NewPeer { node_id, gossip_queries_feature, initial_routing_sync_feature } => {
				self.new_peer(node_id, gossip_queries_feature, initial_routing_sync_feature);
				self.connectd_replies.push(ConnectdReply::NewPeerReply { success: true });
			}
			ConnectdRequest::GetAddrs { node_id } => {
				self.connectd_replies.push(ConnectdReply::GetAddrsReply {
					addresses: self.rstate.get_addresses(&node_id),
				});
			}
		}
	}

	/// Takes everything owed to the parent process.
	pub fn drain_master_replies(&mut self) -> Vec<MasterReply> {
		std::mem::replace(&mut self.master_replies, Vec::new())
	}

	/// Takes everything owed to the connection daemon.
	pub fn drain_connectd_replies(&mut self) -> Vec<ConnectdReply> {
		std::mem::replace(&mut self.connectd_replies, Vec::new())
	}

	fn node_entry(node_id: NodeId, node: &crate::routing::gossip::NodeInfo) -> NodeEntry {
		match node.announcement_info.as_ref() {
			Some(info) => NodeEntry {
				node_id,
				last_timestamp: Some(info.last_update),
				globalfeatures: info.features.clone(),
				addresses: info.addresses.clone(),
				alias: info.alias,
				rgb: info.rgb,
			},
			None => NodeEntry {
				node_id,
				last_timestamp: None,
				globalfeatures: Vec::new(),
				addresses: Vec::new(),
				alias: [0; 32],
				rgb: [0; 3],
			},
		}
	}

	fn append_channel_entries(entries: &mut Vec<ChannelEntry>, short_channel_id: u64,
		chan: &crate::routing::gossip::ChannelInfo)
	{
		let mut push_half = |direction: u8, half: &Option<ChannelUpdateInfo>| {
			if let Some(half) = half {
				entries.push(ChannelEntry {
					source: *chan.node(direction),
					destination: *chan.node(direction ^ 1),
					satoshis: chan.capacity_sats,
					message_flags: half.message_flags,
					channel_flags: half.channel_flags,
					local_disabled: chan.local_disabled,
					public: chan.is_public(),
					short_channel_id,
					last_update_timestamp: half.last_update,
					base_fee_msat: half.fees.base_msat,
					fee_per_millionth: half.fees.proportional_millionths,
					delay: half.cltv_expiry_delta,
				});
			}
		};
		push_half(0, &chan.one_to_two);
		push_half(1, &chan.two_to_one);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::msgs::CHANNEL_FLAG_DIRECTION;
	use crate::routing::gossip::tests::{chain_hash, get_channel_script,
		get_signed_channel_announcement, get_signed_channel_update, node_id, node_key};
	use crate::util::test_utils::{TestLogger, TestRouter, TestSigner};

	use bitcoin::secp256k1::{All, Secp256k1};

	use std::sync::atomic::Ordering;
	use std::sync::Arc;

	type TestDaemon = GossipDaemon<Arc<TestSigner>, Arc<TestRouter>, Arc<TestLogger>>;

	struct Harness {
		secp_ctx: Secp256k1<All>,
		daemon: TestDaemon,
		signer: Arc<TestSigner>,
		router: Arc<TestRouter>,
		logger: Arc<TestLogger>,
	}

	// Construction time; prune timeout ends up 7200s, refresh every 1800s.
	const T0: u32 = 1000;

	fn make_harness() -> Harness {
		let secp_ctx = Secp256k1::new();
		let local_key = node_key(99);
		let config = Config {
			broadcast_interval_msec: 5_000,
			chain_hash: chain_hash(),
			local_id: node_id(&secp_ctx, &local_key),
			globalfeatures: Vec::new(),
			rgb: [0x30, 0x20, 0x10],
			alias: [0x41; 32],
			update_channel_interval: 3600,
			announcable: vec![NetAddress::IPv4 { addr: [1, 2, 3, 4], port: 9735 }],
		};
		let signer = Arc::new(TestSigner::new(local_key));
		let router = Arc::new(TestRouter::new());
		let logger = Arc::new(TestLogger::new());
		let daemon = GossipDaemon::new(config, None, Arc::clone(&signer), Arc::clone(&router),
			Arc::clone(&logger), T0, 0);
		Harness { secp_ctx, daemon, signer, router, logger }
	}

	fn wire_type(msg: &[u8]) -> u16 {
		u16::from_be_bytes([msg[0], msg[1]])
	}

	/// Announce + resolve a channel between `key_a` and `key_b` via the peer/master paths.
	fn open_channel(h: &mut Harness, from_peer: &NodeId, key_a: u8, key_b: u8, scid: u64, now: u32) {
		let ann = get_signed_channel_announcement(|msg| msg.short_channel_id = scid,
			&node_key(key_a), &node_key(key_b), &h.secp_ctx);
		h.daemon.handle_peer_message(from_peer, &wire::encode_msg(&ann), now).unwrap();
		let replies = h.daemon.drain_master_replies();
		assert!(replies.contains(&MasterReply::GetTxout { short_channel_id: scid }));
		h.daemon.handle_master_request(MasterRequest::GetTxoutReply {
			short_channel_id: scid,
			satoshis: 100_000,
			outscript: get_channel_script(&h.secp_ctx).to_bytes(),
		}, now);
		assert!(h.daemon.graph().get_channel(scid).is_some());
	}

	fn drain_peer(h: &mut Harness, peer: &NodeId, now_ms: u64) -> Vec<Vec<u8>> {
		let mut out = Vec::new();
		while let Some(msg) = h.daemon.next_outbound(peer, now_ms) {
			out.push(msg);
		}
		out
	}

	#[test]
	fn initial_sync_gated_on_timestamp_filter() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, true);

		open_channel(&mut h, &peer_a, 1, 2, 42, 2000);
		let update_low = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = 500;
		}, &node_key(1), &h.secp_ctx);
		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&update_low), 2000).unwrap();
		let update_high = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = 1500;
			msg.channel_flags = CHANNEL_FLAG_DIRECTION;
		}, &node_key(2), &h.secp_ctx);
		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&update_high), 2000).unwrap();

		// A gossip_queries peer gets our own filter request, then *no* gossip.
		let peer_b = node_id(&h.secp_ctx, &node_key(3));
		h.daemon.new_peer(peer_b, true, false);
		let first = h.daemon.next_outbound(&peer_b, 0).unwrap();
		assert_eq!(wire_type(&first), 265); // gossip_timestamp_filter
		assert_eq!(h.daemon.next_outbound(&peer_b, 0), None);

		// The filter opens the tap: everything with ts >= 1000 streams in log order.
		h.daemon.handle_peer_message(&peer_b, &wire::encode_msg(&msgs::GossipTimestampFilter {
			chain_hash: chain_hash(),
			first_timestamp: 1000,
			timestamp_range: u32::max_value(),
		}), 2000).unwrap();

		let streamed = drain_peer(&mut h, &peer_b, 0);
		assert_eq!(streamed.len(), 2);
		assert_eq!(wire_type(&streamed[0]), 256); // the announcement, stamped at resolution time
		assert_eq!(streamed[1], wire::encode_msg(&update_high));
		// The ts=500 update was filtered, and nothing repeats on the next pump.
		assert_eq!(drain_peer(&mut h, &peer_b, 10_000), Vec::<Vec<u8>>::new());
	}

	#[test]
	fn broadcast_cursor_never_repeats_entries() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, true);
		open_channel(&mut h, &peer_a, 1, 2, 42, 2000);

		let streamed = drain_peer(&mut h, &peer_a, 0);
		assert_eq!(streamed.len(), 1);

		// Flush timer armed; once it fires the peer is woken but the log holds nothing new.
		let woken = h.daemon.process_expired_timers(3000, 5_000);
		assert_eq!(woken, vec![peer_a]);
		assert_eq!(drain_peer(&mut h, &peer_a, 5_000), Vec::<Vec<u8>>::new());

		// New gossip lands past the cursor.
		let update = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = 900;
		}, &node_key(1), &h.secp_ctx);
		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&update), 3000).unwrap();
		let woken = h.daemon.process_expired_timers(3000, 10_000);
		assert_eq!(woken, vec![peer_a]);
		let streamed = drain_peer(&mut h, &peer_a, 10_000);
		assert_eq!(streamed, vec![wire::encode_msg(&update)]);
	}

	#[test]
	fn chunked_range_reply_partitions_exactly() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		h.daemon.handle_master_request(MasterRequest::DevSuppressGossip, T0);
		// Clamp hard enough that only a single id fits per reply.
		h.daemon.handle_master_request(MasterRequest::DevSetMaxScidsEncodeSize { max: 9 }, T0);

		let mut scids = Vec::new();
		for block in 100u64..106 {
			let scid = scid_utils::scid_from_parts(block, (block * 7919) & 0xffffff, 3).unwrap();
			open_channel(&mut h, &peer_a, 1, 2, scid, 2000);
			scids.push(scid);
		}

		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&msgs::QueryChannelRange {
			chain_hash: chain_hash(),
			first_blocknum: 100,
			number_of_blocks: 6,
		}), 2000).unwrap();

		let raw_replies = drain_peer(&mut h, &peer_a, 0);
		assert!(raw_replies.len() > 1);

		let mut seen_scids = Vec::new();
		let mut next_block = 100;
		for raw in raw_replies.iter() {
			let reply = match wire::read(&mut Cursor::new(raw)).unwrap() {
				Message::ReplyChannelRange(reply) => reply,
				m => panic!("unexpected message type {}", m.type_id()),
			};
			assert!(reply.full_information);
			// Contiguous, non-overlapping cover.
			assert_eq!(reply.first_blocknum, next_block);
			assert!(reply.number_of_blocks > 0);
			next_block = reply.first_blocknum + reply.number_of_blocks;
			// Every emitted chunk respects the (clamped) encoding limit.
			assert!(msgs::encode_short_channel_ids(&reply.short_channel_ids).len() <= 9);
			seen_scids.extend_from_slice(&reply.short_channel_ids);
		}
		// Union of the ranges is exactly the query, and every scid appears exactly once.
		assert_eq!(next_block, 106);
		assert_eq!(seen_scids, scids);
		assert_eq!(h.daemon.range_reply_overflows, 0);
	}

	#[test]
	fn range_reply_single_block_overflow_is_skipped() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		h.daemon.handle_master_request(MasterRequest::DevSuppressGossip, T0);
		// Even one id does not fit.
		h.daemon.handle_master_request(MasterRequest::DevSetMaxScidsEncodeSize { max: 4 }, T0);

		let scid = scid_utils::scid_from_parts(100, 1, 1).unwrap();
		open_channel(&mut h, &peer_a, 1, 2, scid, 2000);

		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&msgs::QueryChannelRange {
			chain_hash: chain_hash(),
			first_blocknum: 100,
			number_of_blocks: 1,
		}), 2000).unwrap();

		assert_eq!(drain_peer(&mut h, &peer_a, 0), Vec::<Vec<u8>>::new());
		assert_eq!(h.daemon.range_reply_overflows, 1);
		h.logger.assert_log_contains("Could not fit scids for single block");
	}

	#[test]
	fn concurrent_scid_queries_close_connection() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);

		let query = wire::encode_msg(&msgs::QueryShortChannelIds {
			chain_hash: chain_hash(),
			short_channel_ids: vec![42],
		});
		h.daemon.handle_peer_message(&peer_a, &query, T0).unwrap();
		// Second query before the first's end marker went out: wire error + close.
		assert!(h.daemon.handle_peer_message(&peer_a, &query, T0).is_err());
		let out = drain_peer(&mut h, &peer_a, 0);
		assert!(out.iter().any(|msg| wire_type(msg) == 17));
	}

	#[test]
	fn scid_query_reply_streams_and_terminates() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		h.daemon.handle_master_request(MasterRequest::DevSuppressGossip, T0);
		open_channel(&mut h, &peer_a, 1, 2, 42, 2000);
		let update = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = 900;
		}, &node_key(1), &h.secp_ctx);
		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&update), 2000).unwrap();

		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&msgs::QueryShortChannelIds {
			chain_hash: chain_hash(),
			short_channel_ids: vec![42, 4242],
		}), 2000).unwrap();

		let out = drain_peer(&mut h, &peer_a, 0);
		// channel_announcement, its one defined update, then the end marker (no node
		// announcements exist); the unknown scid 4242 is skipped silently.
		assert_eq!(out.iter().map(|m| wire_type(m)).collect::<Vec<_>>(), vec![256, 258, 262]);
	}

	#[test]
	fn keepalive_refresh_re_signs_stale_local_halves() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);

		// A channel we are one end of; announcing it also triggers our node_announcement.
		open_channel(&mut h, &peer_a, 1, 99, 42, T0);
		assert_eq!(h.signer.node_announcement_sigs.load(Ordering::SeqCst), 1);

		h.daemon.handle_local_channel_update(&peer_a, &LocalChannelUpdate {
			short_channel_id: 42,
			disable: false,
			cltv_expiry_delta: 144,
			htlc_minimum_msat: 1000,
			fee_base_msat: 10,
			fee_proportional_millionths: 1,
			htlc_maximum_msat: 50_000_000,
		}, T0);
		assert_eq!(h.signer.channel_update_sigs.load(Ordering::SeqCst), 1);

		let our_direction = h.daemon.graph().get_channel(42).unwrap()
			.direction_from(&h.daemon.config.local_id).unwrap();
		assert_eq!(h.daemon.graph().get_channel(42).unwrap()
			.half(our_direction).as_ref().unwrap().last_update, T0);

		// Just before the half-prune highwater: refresh does nothing.
		let refresh_ms = h.daemon.refresh_interval_ms();
		let now = T0 + h.daemon.config.prune_timeout() / 2;
		h.daemon.process_expired_timers(now, refresh_ms);
		assert_eq!(h.signer.channel_update_sigs.load(Ordering::SeqCst), 2);
		// (exactly at the highwater counts as stale, so the keepalive went out above)
		let half = h.daemon.graph().get_channel(42).unwrap().half(our_direction).clone().unwrap();
		assert_eq!(half.last_update, now);
		assert_eq!(half.fees.base_msat, 10);
		assert_eq!(half.fees.proportional_millionths, 1);
		assert_eq!(half.cltv_expiry_delta, 144);
		assert!(half.enabled);

		// A fresh half is left alone on the next tick.
		h.daemon.process_expired_timers(now + 1, refresh_ms * 2);
		assert_eq!(h.signer.channel_update_sigs.load(Ordering::SeqCst), 2);
		assert!(h.daemon.graph().get_channel(42).is_some());
	}

	#[test]
	fn oversize_ping_is_ignored() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);

		let ping = wire::encode_msg(&msgs::Ping { ponglen: 65533, byteslen: 4 });
		h.daemon.handle_peer_message(&peer_a, &ping, T0).unwrap();
		assert_eq!(drain_peer(&mut h, &peer_a, 0), Vec::<Vec<u8>>::new());

		// The connection is still healthy: a normal ping draws a pong.
		let ping = wire::encode_msg(&msgs::Ping { ponglen: 10, byteslen: 4 });
		h.daemon.handle_peer_message(&peer_a, &ping, T0).unwrap();
		let out = drain_peer(&mut h, &peer_a, 0);
		assert_eq!(out.len(), 1);
		assert_eq!(wire_type(&out[0]), 19);
		assert_eq!(out[0].len(), 2 + 2 + 10);
	}

	#[test]
	fn unexpected_pong_closes_connection() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		let pong = wire::encode_msg(&msgs::Pong { byteslen: 2 });
		assert!(h.daemon.handle_peer_message(&peer_a, &pong, T0).is_err());
	}

	#[test]
	fn master_ping_round_trip() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);

		h.daemon.handle_master_request(MasterRequest::Ping {
			node_id: peer_a,
			num_pong_bytes: 8,
			len: 2,
		}, T0);
		let out = drain_peer(&mut h, &peer_a, 0);
		assert_eq!(wire_type(&out[0]), 18);

		// The pong is matched to the outstanding counter and reported upstream.
		let pong = wire::encode_msg(&msgs::Pong { byteslen: 8 });
		h.daemon.handle_peer_message(&peer_a, &pong, T0).unwrap();
		let replies = h.daemon.drain_master_replies();
		assert!(replies.contains(&MasterReply::PingReply { node_id: peer_a, sent: true, totlen: 8 }));

		// Pinging an unknown peer fails immediately.
		let stranger = node_id(&h.secp_ctx, &node_key(55));
		h.daemon.handle_master_request(MasterRequest::Ping {
			node_id: stranger,
			num_pong_bytes: 8,
			len: 2,
		}, T0);
		let replies = h.daemon.drain_master_replies();
		assert!(replies.contains(&MasterReply::PingReply { node_id: stranger, sent: false, totlen: 0 }));
	}

	#[test]
	fn unknown_message_type_closes_connection() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		// Type 999 is not in the dispatch table.
		let msg = [0x03u8, 0xe7, 0, 0];
		assert!(h.daemon.handle_peer_message(&peer_a, &msg, T0).is_err());
		let out = drain_peer(&mut h, &peer_a, 0);
		assert!(out.iter().any(|m| wire_type(m) == 17));
	}

	#[test]
	fn peer_replacement_disables_local_channels() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		open_channel(&mut h, &peer_a, 1, 99, 42, T0);
		h.daemon.handle_local_channel_update(&peer_a, &LocalChannelUpdate {
			short_channel_id: 42,
			disable: false,
			cltv_expiry_delta: 144,
			htlc_minimum_msat: 1000,
			fee_base_msat: 10,
			fee_proportional_millionths: 1,
			htlc_maximum_msat: 50_000_000,
		}, T0);
		assert!(!h.daemon.graph().get_channel(42).unwrap().local_disabled);

		// A second new_peer for the same id evicts the old session and disables our side.
		h.daemon.new_peer(peer_a, true, false);
		assert!(h.daemon.graph().get_channel(42).unwrap().local_disabled);

		// get_update lazily refreshes, folding local_disabled into a newly signed update.
		let sigs_before = h.signer.channel_update_sigs.load(Ordering::SeqCst);
		let update = h.daemon.handle_get_update(&peer_a, 42, T0 + 10).unwrap();
		assert_eq!(h.signer.channel_update_sigs.load(Ordering::SeqCst), sigs_before + 1);
		match wire::read(&mut Cursor::new(&update)).unwrap() {
			Message::ChannelUpdate(update) => assert!(update.contents.disabled()),
			m => panic!("unexpected message type {}", m.type_id()),
		}

		// Unknown scids are a soft no.
		assert_eq!(h.daemon.handle_get_update(&peer_a, 4242, T0 + 10), None);
	}

	#[test]
	fn private_channel_update_goes_to_peer_only() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, true);
		h.daemon.handle_local_add_channel(&peer_a, 13, 50_000);
		assert!(!h.daemon.graph().get_channel(13).unwrap().is_public());

		h.daemon.handle_local_channel_update(&peer_a, &LocalChannelUpdate {
			short_channel_id: 13,
			disable: false,
			cltv_expiry_delta: 6,
			htlc_minimum_msat: 0,
			fee_base_msat: 1,
			fee_proportional_millionths: 1,
			htlc_maximum_msat: 50_000_000,
		}, T0);

		// The signed update went straight to the channel peer...
		let out = drain_peer(&mut h, &peer_a, 0);
		assert_eq!(out.iter().filter(|m| wire_type(m) == 258).count(), 1);
		// ...but never into the broadcast log.
		assert_eq!(h.daemon.graph().broadcasts.len(), 0);
	}

	#[test]
	fn getroute_uses_external_router() {
		let mut h = make_harness();
		h.daemon.handle_master_request(MasterRequest::GetRoute {
			source: node_id(&h.secp_ctx, &node_key(1)),
			destination: node_id(&h.secp_ctx, &node_key(2)),
			msatoshi: 10_000,
			riskfactor: 10,
			final_cltv: 9,
			fuzz: 0.05,
			seed: [7; 16],
		}, T0);
		assert_eq!(h.router.find_route_calls.load(Ordering::SeqCst), 1);
		let replies = h.daemon.drain_master_replies();
		assert!(replies.contains(&MasterReply::GetRouteReply { hops: Vec::new() }));
	}

	#[test]
	fn outpoint_spent_removes_channel() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		open_channel(&mut h, &peer_a, 1, 2, 42, T0);

		h.daemon.handle_master_request(MasterRequest::OutpointSpent { short_channel_id: 42 }, T0);
		assert!(h.daemon.graph().get_channel(42).is_none());

		// getchannels reflects the removal.
		h.daemon.handle_master_request(MasterRequest::GetChannels { short_channel_id: None }, T0);
		let replies = h.daemon.drain_master_replies();
		assert!(replies.contains(&MasterReply::GetChannelsReply { channels: Vec::new() }));
	}

	#[test]
	fn incoming_channels_lists_enabled_public_halves() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		open_channel(&mut h, &peer_a, 1, 99, 42, T0);

		// No update for the incoming half yet.
		h.daemon.handle_master_request(MasterRequest::GetIncomingChannels, T0);
		let replies = h.daemon.drain_master_replies();
		assert!(replies.contains(&MasterReply::GetIncomingChannelsReply { channels: Vec::new() }));

		// The remote end announces its half (toward us).
		let chan = h.daemon.graph().get_channel(42).unwrap();
		let their_direction = chan.direction_from(&node_id(&h.secp_ctx, &node_key(1))).unwrap();
		let update = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = T0;
			msg.channel_flags = their_direction;
			msg.cltv_expiry_delta = 42;
		}, &node_key(1), &h.secp_ctx);
		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&update), T0).unwrap();

		h.daemon.handle_master_request(MasterRequest::GetIncomingChannels, T0);
		let replies = h.daemon.drain_master_replies();
		match &replies[0] {
			MasterReply::GetIncomingChannelsReply { channels } => {
				assert_eq!(channels.len(), 1);
				assert_eq!(channels[0].short_channel_id, 42);
				assert_eq!(channels[0].node_id, node_id(&h.secp_ctx, &node_key(1)));
				assert_eq!(channels[0].cltv_expiry_delta, 42);
			}
			r => panic!("unexpected reply {:?}", r),
		}
	}

	#[test]
	fn own_node_announcement_not_repeated_when_redundant() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.new_peer(peer_a, false, false);
		open_channel(&mut h, &peer_a, 1, 99, 42, T0);
		assert_eq!(h.signer.node_announcement_sigs.load(Ordering::SeqCst), 1);

		// Another accepted update re-runs the check, but nothing changed.
		let chan = h.daemon.graph().get_channel(42).unwrap();
		let their_direction = chan.direction_from(&node_id(&h.secp_ctx, &node_key(1))).unwrap();
		let update = get_signed_channel_update(|msg| {
			msg.short_channel_id = 42;
			msg.timestamp = T0 + 5;
			msg.channel_flags = their_direction;
		}, &node_key(1), &h.secp_ctx);
		h.daemon.handle_peer_message(&peer_a, &wire::encode_msg(&update), T0 + 5).unwrap();
		assert_eq!(h.signer.node_announcement_sigs.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn connectd_new_peer_and_addrs() {
		let mut h = make_harness();
		let peer_a = node_id(&h.secp_ctx, &node_key(1));
		h.daemon.handle_connectd_request(ConnectdRequest::NewPeer {
			node_id: peer_a,
			gossip_queries_feature: false,
			initial_routing_sync_feature: false,
		});
		assert!(h.daemon.is_peer_connected(&peer_a));
		let replies = h.daemon.drain_connectd_replies();
		assert!(replies.contains(&ConnectdReply::NewPeerReply { success: true }));

		h.daemon.handle_connectd_request(ConnectdRequest::GetAddrs { node_id: peer_a });
		let replies = h.daemon.drain_connectd_replies();
		assert!(replies.contains(&ConnectdReply::GetAddrsReply { addresses: None }));
	}
}
