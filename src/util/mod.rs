// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Low-level utilities: serialization, logging, scid helpers and the timer
//! queue the daemon schedules against.

#[macro_use]
pub(crate) mod macro_logger;

pub mod ser;
pub mod logger;
pub mod scid_utils;
pub mod timer;

#[cfg(test)]
pub(crate) mod test_utils;
