// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The shared routing state: the in-memory graph of channels and nodes, the
//! broadcast log hanging off it, and the append-only store it is replayed
//! from at startup.

pub mod gossip;
pub mod broadcast;
pub mod store;
