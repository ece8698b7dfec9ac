// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The gossip engine of a payment-channel network daemon.
//!
//! This crate multiplexes the per-peer gossip wire protocol against a shared
//! in-memory routing graph. It validates and ingests channel and node
//! announcements and channel updates, services id- and range-based channel
//! queries with chunked replies, fans new gossip out to every connected peer
//! at a configurable cadence while honouring per-peer timestamp filters, and
//! issues (and re-issues) signed updates for the local node's own channels in
//! concert with an external signing process.
//!
//! The engine is sans-io: [`daemon::GossipDaemon`] owns all protocol state
//! and is driven by an embedding event loop through explicit entry points.
//! The embedder owns the sockets, the signer pipe and the control channels;
//! a single-threaded cooperative driver needs no locking anywhere in here.

#![forbid(unsafe_code)]

extern crate bitcoin;
extern crate flate2;
#[cfg(test)]
extern crate hex;

#[macro_use]
pub mod util;
pub mod ln;
pub mod routing;
pub mod sign;
pub mod daemon;
