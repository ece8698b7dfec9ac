// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The gossip store: an append-only log of every accepted gossip message plus channel-deletion
//! markers, replayed into the graph at startup.
//!
//! Each record is a big-endian u16 length followed by an internal record type and payload.
//! Raw wire messages are stored exactly as relayed; channel announcements additionally carry the
//! funding amount and the broadcast timestamp so promotion state survives a restart. A corrupt
//! or torn tail is truncated on load, everything before it is kept.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::ln::msgs::DecodeError;
use crate::routing::gossip::NodeId;
use crate::util::ser::{Readable, Writeable, Writer};

/// Store format version, bumped on incompatible layout changes.
const STORE_VERSION: u8 = 1;

const REC_CHANNEL_ANNOUNCEMENT: u16 = 4096;
const REC_CHANNEL_UPDATE: u16 = 4097;
const REC_NODE_ANNOUNCEMENT: u16 = 4098;
const REC_LOCAL_ADD_CHANNEL: u16 = 4099;
const REC_CHANNEL_DELETE: u16 = 4100;

/// One record of the append-only gossip store.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreRecord {
	/// A validated, txout-confirmed channel_announcement with its funding amount.
	ChannelAnnouncement {
		/// The confirmed funding output value.
		satoshis: u64,
		/// The broadcast-log timestamp the announcement was queued with.
		timestamp: u32,
		/// The full wire message, type prefix included.
		msg: Vec<u8>,
	},
	/// A validated channel_update, as relayed.
	ChannelUpdate {
		/// The full wire message, type prefix included.
		msg: Vec<u8>,
	},
	/// A validated node_announcement, as relayed.
	NodeAnnouncement {
		/// The full wire message, type prefix included.
		msg: Vec<u8>,
	},
	/// A confirmed local channel which has no (public) announcement yet.
	LocalAddChannel {
		short_channel_id: u64,
		/// The other endpoint; we are always one end.
		remote: NodeId,
		satoshis: u64,
	},
	/// The channel's funding output was spent; it must not resurrect on replay.
	ChannelDelete {
		short_channel_id: u64,
	},
}

impl Writeable for StoreRecord {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			StoreRecord::ChannelAnnouncement { satoshis, timestamp, msg } => {
				REC_CHANNEL_ANNOUNCEMENT.write(w)?;
				satoshis.write(w)?;
				timestamp.write(w)?;
				msg.write(w)?;
			}
			StoreRecord::ChannelUpdate { msg } => {
				REC_CHANNEL_UPDATE.write(w)?;
				msg.write(w)?;
			}
			StoreRecord::NodeAnnouncement { msg } => {
				REC_NODE_ANNOUNCEMENT.write(w)?;
				msg.write(w)?;
			}
			StoreRecord::LocalAddChannel { short_channel_id, remote, satoshis } => {
				REC_LOCAL_ADD_CHANNEL.write(w)?;
				short_channel_id.write(w)?;
				remote.write(w)?;
				satoshis.write(w)?;
			}
			StoreRecord::ChannelDelete { short_channel_id } => {
				REC_CHANNEL_DELETE.write(w)?;
				short_channel_id.write(w)?;
			}
		}
		Ok(())
	}
}

impl Readable for StoreRecord {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let rec_type: u16 = Readable::read(r)?;
		match rec_type {
			REC_CHANNEL_ANNOUNCEMENT => Ok(StoreRecord::ChannelAnnouncement {
				satoshis: Readable::read(r)?,
				timestamp: Readable::read(r)?,
				msg: Readable::read(r)?,
			}),
			REC_CHANNEL_UPDATE => Ok(StoreRecord::ChannelUpdate { msg: Readable::read(r)? }),
			REC_NODE_ANNOUNCEMENT => Ok(StoreRecord::NodeAnnouncement { msg: Readable::read(r)? }),
			REC_LOCAL_ADD_CHANNEL => Ok(StoreRecord::LocalAddChannel {
				short_channel_id: Readable::read(r)?,
				remote: Readable::read(r)?,
				satoshis: Readable::read(r)?,
			}),
			REC_CHANNEL_DELETE => Ok(StoreRecord::ChannelDelete {
				short_channel_id: Readable::read(r)?,
			}),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

/// Handle on the open store file, positioned for appending.
pub struct GossipStore {
	file: File,
}

impl GossipStore {
	/// Opens (creating if absent) the store at `path` and reads every intact record. A torn or
	/// corrupt tail is truncated away so subsequent appends land on a clean boundary.
	pub fn open<P: AsRef<Path>>(path: P) -> io::Result<(GossipStore, Vec<StoreRecord>)> {
		let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;

		let mut contents = Vec::new();
		file.read_to_end(&mut contents)?;

		let mut records = Vec::new();
		let mut good_offset: u64;
		if contents.is_empty() {
			Write::write_all(&mut file, &[STORE_VERSION])?;
			good_offset = 1;
		} else if contents[0] != STORE_VERSION {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown gossip store version"));
		} else {
			good_offset = 1;
			let mut offset = 1usize;
			loop {
				if offset + 2 > contents.len() {
					break;
				}
				let len = u16::from_be_bytes([contents[offset], contents[offset + 1]]) as usize;
				if offset + 2 + len > contents.len() {
					break;
				}
				let mut cursor = io::Cursor::new(&contents[offset + 2..offset + 2 + len]);
				match StoreRecord::read(&mut cursor) {
					Ok(record) => records.push(record),
					Err(_) => break,
				}
				offset += 2 + len;
				good_offset = offset as u64;
			}
		}

		file.set_len(good_offset)?;
		file.seek(SeekFrom::Start(good_offset))?;
		Ok((GossipStore { file }, records))
	}

	/// Appends one record and flushes it.
	pub fn append(&mut self, record: &StoreRecord) -> io::Result<()> {
		if record.serialized_length() > u16::max_value() as usize {
			return Err(io::Error::new(io::ErrorKind::InvalidInput, "oversize gossip store record"));
		}
		let framed = record.encode_with_len();
		Write::write_all(&mut self.file, &framed)?;
		self.file.flush()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use std::path::PathBuf;

	fn temp_store_path(name: &str) -> PathBuf {
		let mut path = std::env::temp_dir();
		path.push(format!("gossipd-store-test-{}-{}", name, std::process::id()));
		let _ = fs::remove_file(&path);
		path
	}

	fn sample_records() -> Vec<StoreRecord> {
		vec![
			StoreRecord::ChannelAnnouncement { satoshis: 100_000, timestamp: 7, msg: vec![1, 0, 3] },
			StoreRecord::ChannelUpdate { msg: vec![1, 2, 4] },
			StoreRecord::NodeAnnouncement { msg: vec![1, 1, 5] },
			StoreRecord::ChannelDelete { short_channel_id: 42 },
		]
	}

	#[test]
	fn append_and_reload() {
		let path = temp_store_path("reload");
		{
			let (mut store, records) = GossipStore::open(&path).unwrap();
			assert!(records.is_empty());
			for record in sample_records().iter() {
				store.append(record).unwrap();
			}
		}
		let (_store, records) = GossipStore::open(&path).unwrap();
		assert_eq!(records, sample_records());
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn torn_tail_is_truncated() {
		let path = temp_store_path("torn");
		{
			let (mut store, _) = GossipStore::open(&path).unwrap();
			for record in sample_records().iter() {
				store.append(record).unwrap();
			}
		}
		// Tear the last record in half.
		let contents = fs::read(&path).unwrap();
		fs::write(&path, &contents[..contents.len() - 3]).unwrap();

		let (mut store, records) = GossipStore::open(&path).unwrap();
		assert_eq!(records.len(), sample_records().len() - 1);

		// Appending after recovery lands on a clean boundary.
		store.append(&StoreRecord::ChannelDelete { short_channel_id: 43 }).unwrap();
		drop(store);
		let (_store, records) = GossipStore::open(&path).unwrap();
		assert_eq!(records.len(), sample_records().len());
		assert_eq!(*records.last().unwrap(), StoreRecord::ChannelDelete { short_channel_id: 43 });
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn unknown_version_is_an_error() {
		let path = temp_store_path("version");
		fs::write(&path, &[99u8]).unwrap();
		assert!(GossipStore::open(&path).is_err());
		let _ = fs::remove_file(&path);
	}
}
