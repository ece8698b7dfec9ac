// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The broadcast log: a monotonic, indexed sequence of the canonical gossip messages the daemon
//! is currently willing to relay.
//!
//! Every peer carries a cursor (its `broadcast_index` high-water mark) into this log and is fed
//! entries past its cursor, filtered by its timestamp range, at the staggered broadcast cadence.
//! When a message is superseded (a fresher `channel_update` for the same half, a fresher
//! `node_announcement` for the same node) the stale entry is dropped and the replacement appended
//! at the tip, so a slow peer skips straight to the newest version instead of receiving both.

use std::collections::{BTreeMap, HashMap};

use crate::routing::gossip::NodeId;

/// Identity of the graph object an entry describes; at most one live entry per tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BroadcastTag {
	/// The channel_announcement for an scid.
	ChannelAnnouncement(u64),
	/// The channel_update for one direction of an scid.
	ChannelUpdate(u64, u8),
	/// The node_announcement for a node.
	NodeAnnouncement(NodeId),
}

struct QueuedMessage {
	tag: BroadcastTag,
	timestamp: u32,
	payload: Vec<u8>,
}

/// An append-only, indexed sequence of gossip messages with strictly increasing indices.
pub struct BroadcastLog {
	entries: BTreeMap<u64, QueuedMessage>,
	tag_index: HashMap<BroadcastTag, u64>,
	next_index: u64,
}

impl BroadcastLog {
	pub fn new() -> Self {
		// Index 0 is never assigned: a cursor of 0 means "replay from the beginning".
		BroadcastLog { entries: BTreeMap::new(), tag_index: HashMap::new(), next_index: 1 }
	}

	/// The next index that will be assigned.
	pub fn next_index(&self) -> u64 {
		self.next_index
	}

	/// Appends a message, dropping any stale entry with the same tag, and returns its index.
	pub fn queue(&mut self, tag: BroadcastTag, timestamp: u32, payload: Vec<u8>) -> u64 {
		if let Some(old_index) = self.tag_index.remove(&tag) {
			self.entries.remove(&old_index);
		}
		let index = self.next_index;
		self.next_index += 1;
		self.tag_index.insert(tag.clone(), index);
		self.entries.insert(index, QueuedMessage { tag, timestamp, payload });
		index
	}

	/// Drops every live entry whose tag matches `filter`. Used when a channel leaves the graph.
	pub fn remove_where<F: Fn(&BroadcastTag) -> bool>(&mut self, filter: F) {
		let doomed: Vec<u64> = self.entries.iter()
			.filter(|(_, m)| filter(&m.tag))
			.map(|(idx, _)| *idx)
			.collect();
		for idx in doomed {
			let msg = self.entries.remove(&idx).unwrap();
			self.tag_index.remove(&msg.tag);
		}
	}

	/// Returns the first entry past `last_index` whose timestamp falls within
	/// `[timestamp_min, timestamp_max]`, along with its index, or `None` when the cursor has
	/// drained the log. A cursor of `u64::MAX` never matches anything, which is exactly the
	/// "send nothing until a filter arrives" sentinel peers start with.
	pub fn next_after(&self, last_index: u64, timestamp_min: u32, timestamp_max: u32)
		-> Option<(&[u8], u64)>
	{
		if last_index == u64::max_value() {
			return None;
		}
		for (index, msg) in self.entries.range(last_index + 1..) {
			if msg.timestamp >= timestamp_min && msg.timestamp <= timestamp_max {
				return Some((&msg.payload[..], *index));
			}
		}
		None
	}

	/// Number of live (non-superseded) entries.
	pub fn len(&self) -> usize {
		self.entries.len()
	}
}
