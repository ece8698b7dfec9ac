// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The peer-facing side of the engine: wire message definitions, the typed
//! message reader/writer, and the per-peer protocol state machine.

pub mod msgs;
pub mod wire;
pub mod peer;
