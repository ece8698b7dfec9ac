// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A minimal monotonic timer queue. Deadlines are opaque milliseconds supplied by the embedding
//! loop, which also decides when to call [`Timers::pop_expired`] - this module never reads the
//! clock itself, which keeps every timer-driven behaviour deterministic under test.

use std::collections::BTreeMap;

/// An ordered set of pending timers carrying tokens of type `T`.
///
/// The embedding event loop sleeps until [`Timers::next_expiry`] and then drains
/// [`Timers::pop_expired`], handing each token back to the daemon.
pub struct Timers<T> {
	entries: BTreeMap<(u64, u64), T>,
	next_seq: u64,
}

impl<T: PartialEq> Timers<T> {
	pub fn new() -> Self {
		Timers { entries: BTreeMap::new(), next_seq: 0 }
	}

	/// Arms a timer at the given absolute deadline. Multiple timers may share a deadline.
	pub fn arm(&mut self, deadline_ms: u64, token: T) {
		let seq = self.next_seq;
		self.next_seq += 1;
		self.entries.insert((deadline_ms, seq), token);
	}

	/// Disarms every pending timer carrying the given token.
	pub fn cancel(&mut self, token: &T) {
		let keys: Vec<(u64, u64)> = self.entries.iter()
			.filter(|(_, t)| *t == token)
			.map(|(k, _)| *k)
			.collect();
		for k in keys {
			self.entries.remove(&k);
		}
	}

	/// The deadline of the soonest pending timer, if any.
	pub fn next_expiry(&self) -> Option<u64> {
		self.entries.keys().next().map(|(deadline, _)| *deadline)
	}

	/// Removes and returns the soonest timer whose deadline is at or before `now_ms`.
	pub fn pop_expired(&mut self, now_ms: u64) -> Option<T> {
		let key = match self.entries.keys().next() {
			Some(&(deadline, seq)) if deadline <= now_ms => (deadline, seq),
			_ => return None,
		};
		self.entries.remove(&key)
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::Timers;

	#[test]
	fn expires_in_deadline_order() {
		let mut timers = Timers::new();
		timers.arm(300, "c");
		timers.arm(100, "a");
		timers.arm(200, "b");
		assert_eq!(timers.next_expiry(), Some(100));
		assert_eq!(timers.pop_expired(250), Some("a"));
		assert_eq!(timers.pop_expired(250), Some("b"));
		assert_eq!(timers.pop_expired(250), None);
		assert_eq!(timers.pop_expired(300), Some("c"));
		assert!(timers.is_empty());
	}

	#[test]
	fn cancel_removes_all_matching_tokens() {
		let mut timers = Timers::new();
		timers.arm(100, 1u32);
		timers.arm(200, 1u32);
		timers.arm(150, 2u32);
		timers.cancel(&1);
		assert_eq!(timers.pop_expired(1000), Some(2));
		assert_eq!(timers.pop_expired(1000), None);
	}

	#[test]
	fn same_deadline_preserves_arm_order() {
		let mut timers = Timers::new();
		timers.arm(100, "first");
		timers.arm(100, "second");
		assert_eq!(timers.pop_expired(100), Some("first"));
		assert_eq!(timers.pop_expired(100), Some("second"));
	}
}
