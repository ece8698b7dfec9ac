// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bitcoin::hashes::sha256d::Hash as Sha256dHash;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};

use crate::daemon::control::RouteHop;
use crate::daemon::Router;
use crate::routing::gossip::{NetworkGraph, NodeId};
use crate::sign::Signer;
use crate::util::logger::{Level, Logger, Record};

pub struct TestLogger {
	pub lines: Mutex<Vec<(Level, String)>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		TestLogger { lines: Mutex::new(Vec::new()) }
	}

	pub fn assert_log_contains(&self, expected: &str) {
		let lines = self.lines.lock().unwrap();
		assert!(lines.iter().any(|(_, line)| line.contains(expected)),
			"no log line contains {:?}", expected);
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		self.lines.lock().unwrap().push((record.level, format!("{}", record.args)));
	}
}

/// Signs with a fixed node key the way the key daemon would, counting requests.
pub struct TestSigner {
	secp_ctx: Secp256k1<All>,
	node_secret: SecretKey,
	pub channel_update_sigs: AtomicUsize,
	pub node_announcement_sigs: AtomicUsize,
	/// When set, every request errors, for exercising the fatal path.
	pub fail: AtomicUsize,
}

impl TestSigner {
	pub fn new(node_secret: SecretKey) -> TestSigner {
		TestSigner {
			secp_ctx: Secp256k1::new(),
			node_secret,
			channel_update_sigs: AtomicUsize::new(0),
			node_announcement_sigs: AtomicUsize::new(0),
			fail: AtomicUsize::new(0),
		}
	}

	fn sign_contents(&self, unsigned: &[u8]) -> Signature {
		// type (2) + zeroed signature (64), then the signed contents.
		let msghash = Message::from_slice(&Sha256dHash::hash(&unsigned[66..])[..]).unwrap();
		self.secp_ctx.sign_ecdsa(&msghash, &self.node_secret)
	}
}

impl Signer for TestSigner {
	fn sign_node_announcement(&self, unsigned: &[u8]) -> Result<Signature, io::Error> {
		if self.fail.load(Ordering::SeqCst) != 0 {
			return Err(io::Error::new(io::ErrorKind::BrokenPipe, "signer gone"));
		}
		self.node_announcement_sigs.fetch_add(1, Ordering::SeqCst);
		Ok(self.sign_contents(unsigned))
	}

	fn sign_channel_update(&self, unsigned: &[u8]) -> Result<Vec<u8>, io::Error> {
		if self.fail.load(Ordering::SeqCst) != 0 {
			return Err(io::Error::new(io::ErrorKind::BrokenPipe, "signer gone"));
		}
		self.channel_update_sigs.fetch_add(1, Ordering::SeqCst);
		let sig = self.sign_contents(unsigned);
		let mut signed = unsigned.to_vec();
		signed[2..66].copy_from_slice(&sig.serialize_compact());
		Ok(signed)
	}
}

/// A route finder returning no route, counting invocations.
pub struct TestRouter {
	pub find_route_calls: AtomicUsize,
}

impl TestRouter {
	pub fn new() -> TestRouter {
		TestRouter { find_route_calls: AtomicUsize::new(0) }
	}
}

impl Router for TestRouter {
	fn find_route<L: Deref>(&self, _graph: &NetworkGraph<L>, _source: &NodeId,
		_destination: &NodeId, _msatoshi: u64, _riskfactor: u16, _final_cltv: u32, _fuzz: f64,
		_seed: &[u8; 16]) -> Vec<RouteHop> where L::Target: Logger
	{
		self.find_route_calls.fetch_add(1, Ordering::SeqCst);
		Vec::new()
	}
}
