// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire encoding/decoding for gossip messages.
//!
//! Messages known by this module can be read from the wire using [`read`].
//! The [`Message`] enum returned by [`read`] wraps the decoded message or the message type (if
//! unknown) to use with pattern matching.
//!
//! Messages implementing the [`Encode`] trait define a message type and can be sent over the
//! wire using [`write`].

use std::io;

use crate::ln::msgs;
use crate::util::ser::{Readable, Writeable, Writer};

/// A message returned by [`read`] when decoding bytes received over the wire. Each variant
/// contains a message from [`msgs`] or otherwise the message type if unknown.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub enum Message {
	Error(msgs::ErrorMessage),
	Ping(msgs::Ping),
	Pong(msgs::Pong),
	ChannelAnnouncement(msgs::ChannelAnnouncement),
	NodeAnnouncement(msgs::NodeAnnouncement),
	ChannelUpdate(msgs::ChannelUpdate),
	QueryShortChannelIds(msgs::QueryShortChannelIds),
	ReplyShortChannelIdsEnd(msgs::ReplyShortChannelIdsEnd),
	QueryChannelRange(msgs::QueryChannelRange),
	ReplyChannelRange(msgs::ReplyChannelRange),
	GossipTimestampFilter(msgs::GossipTimestampFilter),
	/// A message that could not be decoded because its type is unknown.
	Unknown(MessageType),
}

/// A number identifying a message to determine how it is encoded on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageType(pub u16);

impl Message {
	/// Returns the type that was used to decode the message payload.
	pub fn type_id(&self) -> MessageType {
		match self {
			&Message::Error(ref msg) => msg.type_id(),
			&Message::Ping(ref msg) => msg.type_id(),
			&Message::Pong(ref msg) => msg.type_id(),
			&Message::ChannelAnnouncement(ref msg) => msg.type_id(),
			&Message::NodeAnnouncement(ref msg) => msg.type_id(),
			&Message::ChannelUpdate(ref msg) => msg.type_id(),
			&Message::QueryShortChannelIds(ref msg) => msg.type_id(),
			&Message::ReplyShortChannelIdsEnd(ref msg) => msg.type_id(),
			&Message::QueryChannelRange(ref msg) => msg.type_id(),
			&Message::ReplyChannelRange(ref msg) => msg.type_id(),
			&Message::GossipTimestampFilter(ref msg) => msg.type_id(),
			&Message::Unknown(type_id) => type_id,
		}
	}
}

impl ::std::fmt::Display for MessageType {
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Reads a message from the data buffer consisting of a 2-byte big-endian type and a
/// variable-length payload conforming to the type.
///
/// # Errors
///
/// Returns an error if the message payload could not be decoded as the specified type.
pub fn read<R: io::Read>(buffer: &mut R) -> Result<Message, msgs::DecodeError> {
	let message_type = <u16 as Readable>::read(buffer)?;
	match message_type {
		msgs::ErrorMessage::TYPE => Ok(Message::Error(Readable::read(buffer)?)),
		msgs::Ping::TYPE => Ok(Message::Ping(Readable::read(buffer)?)),
		msgs::Pong::TYPE => Ok(Message::Pong(Readable::read(buffer)?)),
		msgs::ChannelAnnouncement::TYPE => Ok(Message::ChannelAnnouncement(Readable::read(buffer)?)),
		msgs::NodeAnnouncement::TYPE => Ok(Message::NodeAnnouncement(Readable::read(buffer)?)),
		msgs::ChannelUpdate::TYPE => Ok(Message::ChannelUpdate(Readable::read(buffer)?)),
		msgs::QueryShortChannelIds::TYPE => Ok(Message::QueryShortChannelIds(Readable::read(buffer)?)),
		msgs::ReplyShortChannelIdsEnd::TYPE => Ok(Message::ReplyShortChannelIdsEnd(Readable::read(buffer)?)),
		msgs::QueryChannelRange::TYPE => Ok(Message::QueryChannelRange(Readable::read(buffer)?)),
		msgs::ReplyChannelRange::TYPE => Ok(Message::ReplyChannelRange(Readable::read(buffer)?)),
		msgs::GossipTimestampFilter::TYPE => Ok(Message::GossipTimestampFilter(Readable::read(buffer)?)),
		_ => Ok(Message::Unknown(MessageType(message_type))),
	}
}

/// Writes a message to the data buffer encoded as a 2-byte big-endian type and a variable-length
/// payload.
pub fn write<M: Encode + Writeable, W: Writer>(message: &M, buffer: &mut W) -> Result<(), io::Error> {
	M::TYPE.write(buffer)?;
	message.write(buffer)
}

/// Encodes a message to a fresh buffer, type prefix included. This is the form cached in the
/// graph, appended to the broadcast log and queued to peers.
pub fn encode_msg<M: Encode + Writeable>(message: &M) -> Vec<u8> {
	let mut buffer = crate::util::ser::VecWriter(Vec::new());
	write(message, &mut buffer).expect("in-memory writes cannot fail");
	buffer.0
}

/// Defines a type-identified encoding for sending messages over the wire.
///
/// Messages implementing this trait specify a type and must be [`Writeable`] to use with
/// [`write`].
pub trait Encode {
	/// The type identifying the message payload.
	const TYPE: u16;

	/// Returns the type identifying the message payload. Convenience method for accessing
	/// [`Self::TYPE`].
	fn type_id(&self) -> MessageType {
		MessageType(Self::TYPE)
	}
}

impl Encode for msgs::ErrorMessage {
	const TYPE: u16 = 17;
}

impl Encode for msgs::Ping {
	const TYPE: u16 = 18;
}

impl Encode for msgs::Pong {
	const TYPE: u16 = 19;
}

impl Encode for msgs::ChannelAnnouncement {
	const TYPE: u16 = 256;
}

impl Encode for msgs::NodeAnnouncement {
	const TYPE: u16 = 257;
}

impl Encode for msgs::ChannelUpdate {
	const TYPE: u16 = 258;
}

impl Encode for msgs::QueryShortChannelIds {
	const TYPE: u16 = 261;
}

impl Encode for msgs::ReplyShortChannelIdsEnd {
	const TYPE: u16 = 262;
}

impl Encode for msgs::QueryChannelRange {
	const TYPE: u16 = 263;
}

impl Encode for msgs::ReplyChannelRange {
	const TYPE: u16 = 264;
}

impl Encode for msgs::GossipTimestampFilter {
	const TYPE: u16 = 265;
}

#[cfg(test)]
mod tests {
	use super::*;

	// Big-endian wire encoding of Pong message (type = 19, byteslen = 2).
	const ENCODED_PONG: [u8; 6] = [0u8, 19u8, 0u8, 2u8, 0u8, 0u8];

	#[test]
	fn read_empty_buffer() {
		let buffer = [];
		let mut reader = ::std::io::Cursor::new(buffer);
		assert!(read(&mut reader).is_err());
	}

	#[test]
	fn read_incomplete_type() {
		let buffer = &ENCODED_PONG[..1];
		let mut reader = ::std::io::Cursor::new(buffer);
		assert!(read(&mut reader).is_err());
	}

	#[test]
	fn read_known_message() {
		let buffer = &ENCODED_PONG[..];
		let mut reader = ::std::io::Cursor::new(buffer);
		let message = read(&mut reader).unwrap();
		match message {
			Message::Pong(_) => (),
			_ => panic!("Expected pong message; found message type: {}", message.type_id()),
		}
	}

	#[test]
	fn read_unknown_message() {
		let buffer = ::std::u16::MAX.to_be_bytes();
		let mut reader = ::std::io::Cursor::new(buffer);
		let message = read(&mut reader).unwrap();
		match message {
			Message::Unknown(MessageType(::std::u16::MAX)) => (),
			_ => panic!("Expected message type {}; found: {}", ::std::u16::MAX, message.type_id()),
		}
	}

	#[test]
	fn write_message_with_type() {
		let message = msgs::Pong { byteslen: 2u16 };
		let encoded = encode_msg(&message);
		assert_eq!(&encoded[..], &ENCODED_PONG[..]);
	}

	#[test]
	fn read_message_encoded_with_write() {
		let message = msgs::QueryChannelRange {
			chain_hash: ::bitcoin::hashes::Hash::from_slice(&[11; 32]).unwrap(),
			first_blocknum: 100_000,
			number_of_blocks: 1_000,
		};
		let mut reader = ::std::io::Cursor::new(encode_msg(&message));
		match read(&mut reader).unwrap() {
			Message::QueryChannelRange(decoded) => assert_eq!(decoded, message),
			m => panic!("Expected query_channel_range; found message type: {}", m.type_id()),
		}
	}
}
