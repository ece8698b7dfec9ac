// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The seam to the external signing process which holds the node's private key.
//!
//! The daemon only ever needs two operations: signing its own node_announcement and signing
//! channel_updates for its own channels. Both take the provisional wire message (zero-filled
//! signature included) exactly as it will be transmitted. Requests are synchronous by design;
//! the signer is latency-bounded and only the controller calls it, never per-peer code.

use std::cell::RefCell;
use std::io::{self, Read, Write};

use bitcoin::secp256k1::ecdsa::Signature;

use crate::util::ser::{Readable, Writeable};

const REQ_SIGN_NODE_ANNOUNCEMENT: u16 = 1;
const REQ_SIGN_CHANNEL_UPDATE: u16 = 2;
const REPLY_SIGN_NODE_ANNOUNCEMENT: u16 = 101;
const REPLY_SIGN_CHANNEL_UPDATE: u16 = 102;

/// The signing oracle interface the daemon consumes.
///
/// Failure here is tier-four fatal: callers abort the daemon and let the supervisor restart it,
/// since a node that cannot sign its own updates can only serve stale gossip.
pub trait Signer {
	/// Signs a provisional node_announcement (signature bytes zeroed), returning the signature
	/// to splice in.
	fn sign_node_announcement(&self, unsigned: &[u8]) -> Result<Signature, io::Error>;
	/// Signs a provisional channel_update (signature bytes zeroed), returning the complete
	/// signed wire message.
	fn sign_channel_update(&self, unsigned: &[u8]) -> Result<Vec<u8>, io::Error>;
}

/// A [`Signer`] speaking length-prefixed request/reply frames over a byte pipe, typically the
/// inherited fd to the key daemon.
pub struct PipeSigner<S: Read + Write> {
	conn: RefCell<S>,
}

impl<S: Read + Write> PipeSigner<S> {
	pub fn new(conn: S) -> Self {
		PipeSigner { conn: RefCell::new(conn) }
	}

	fn round_trip(&self, req_type: u16, payload: &[u8], want_reply: u16) -> Result<Vec<u8>, io::Error> {
		let mut conn = self.conn.borrow_mut();

		let mut frame = Vec::with_capacity(4 + payload.len());
		frame.extend_from_slice(&((payload.len() as u16 + 2).to_be_bytes()));
		frame.extend_from_slice(&req_type.to_be_bytes());
		frame.extend_from_slice(payload);
		conn.write_all(&frame)?;
		conn.flush()?;

		let mut len_buf = [0u8; 2];
		conn.read_exact(&mut len_buf)?;
		let len = u16::from_be_bytes(len_buf) as usize;
		if len < 2 {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "short signer reply"));
		}
		let mut reply = vec![0u8; len];
		conn.read_exact(&mut reply)?;
		let reply_type = u16::from_be_bytes([reply[0], reply[1]]);
		if reply_type != want_reply {
			return Err(io::Error::new(io::ErrorKind::InvalidData,
				format!("unexpected signer reply type {}", reply_type)));
		}
		Ok(reply.split_off(2))
	}
}

impl<S: Read + Write> Signer for PipeSigner<S> {
	fn sign_node_announcement(&self, unsigned: &[u8]) -> Result<Signature, io::Error> {
		let payload = unsigned.to_vec().encode();
		let reply = self.round_trip(REQ_SIGN_NODE_ANNOUNCEMENT, &payload, REPLY_SIGN_NODE_ANNOUNCEMENT)?;
		let sig: Signature = Readable::read(&mut io::Cursor::new(&reply))
			.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid signature from signer"))?;
		Ok(sig)
	}

	fn sign_channel_update(&self, unsigned: &[u8]) -> Result<Vec<u8>, io::Error> {
		let payload = unsigned.to_vec().encode();
		let reply = self.round_trip(REQ_SIGN_CHANNEL_UPDATE, &payload, REPLY_SIGN_CHANNEL_UPDATE)?;
		let signed: Vec<u8> = Readable::read(&mut io::Cursor::new(&reply))
			.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid reply from signer"))?;
		Ok(signed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// A loopback pipe which answers the next queued reply to any request.
	struct FakePipe {
		written: Vec<u8>,
		replies: Vec<u8>,
		read_pos: usize,
	}

	impl Read for FakePipe {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			let remaining = &self.replies[self.read_pos..];
			let n = remaining.len().min(buf.len());
			buf[..n].copy_from_slice(&remaining[..n]);
			self.read_pos += n;
			Ok(n)
		}
	}

	impl Write for FakePipe {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			self.written.extend_from_slice(buf);
			Ok(buf.len())
		}
		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn channel_update_request_frames_and_parses() {
		let signed_msg = vec![9u8; 20];
		let mut reply = Vec::new();
		// reply frame: len, type, length-prefixed message
		reply.extend_from_slice(&((2u16 + 2 + 20).to_be_bytes()));
		reply.extend_from_slice(&REPLY_SIGN_CHANNEL_UPDATE.to_be_bytes());
		reply.extend_from_slice(&(20u16.to_be_bytes()));
		reply.extend_from_slice(&signed_msg);

		let signer = PipeSigner::new(FakePipe { written: Vec::new(), replies: reply, read_pos: 0 });
		let unsigned = vec![1u8, 2, 3];
		let result = signer.sign_channel_update(&unsigned).unwrap();
		assert_eq!(result, signed_msg);

		let pipe = signer.conn.borrow();
		// request frame: len(2) + type(2) + vec len(2) + payload(3)
		assert_eq!(pipe.written.len(), 2 + 2 + 2 + 3);
		assert_eq!(u16::from_be_bytes([pipe.written[2], pipe.written[3]]), REQ_SIGN_CHANNEL_UPDATE);
		assert_eq!(&pipe.written[6..], &unsigned[..]);
	}

	#[test]
	fn mismatched_reply_type_is_an_error() {
		let mut reply = Vec::new();
		reply.extend_from_slice(&(2u16.to_be_bytes()));
		reply.extend_from_slice(&REPLY_SIGN_NODE_ANNOUNCEMENT.to_be_bytes());
		let signer = PipeSigner::new(FakePipe { written: Vec::new(), replies: reply, read_pos: 0 });
		assert!(signer.sign_channel_update(&[1, 2, 3]).is_err());
	}
}
