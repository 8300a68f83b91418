#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid channel id: {0}")]
	InvalidChannel(String),
}

/// Visibility channel. Identities subscribe to channels and messages are tagged with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl ChannelId {
	pub const fn get(self) -> u32 {
		self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u32>()
			.map(ChannelId)
			.map_err(|_| ParseIdError::InvalidChannel(s.to_string()))
	}
}

/// Set of channels, ordered for stable logs and storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSet(BTreeSet<ChannelId>);

impl ChannelSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, channel: ChannelId) -> bool {
		self.0.insert(channel)
	}

	pub fn contains(&self, channel: ChannelId) -> bool {
		self.0.contains(&channel)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = ChannelId> + '_ {
		self.0.iter().copied()
	}

	/// True if at least one channel is present in both sets.
	pub fn intersects(&self, other: &ChannelSet) -> bool {
		let (small, large) = if self.len() <= other.len() {
			(self, other)
		} else {
			(other, self)
		};
		small.0.iter().any(|c| large.0.contains(c))
	}

	/// Raw channel numbers (storage representation).
	pub fn to_vec(&self) -> Vec<u32> {
		self.0.iter().map(|c| c.0).collect()
	}
}

impl FromIterator<ChannelId> for ChannelSet {
	fn from_iter<T: IntoIterator<Item = ChannelId>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl FromIterator<u32> for ChannelSet {
	fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
		Self(iter.into_iter().map(ChannelId).collect())
	}
}

impl fmt::Display for ChannelSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("{")?;
		for (i, c) in self.0.iter().enumerate() {
			if i > 0 {
				f.write_str(",")?;
			}
			write!(f, "{c}")?;
		}
		f.write_str("}")
	}
}

/// Authentication token of a relay client; doubles as the stable identity id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
	/// Create a non-empty `IdentityId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for IdentityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for IdentityId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		IdentityId::new(s.to_string())
	}
}

/// Durable identity record as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
	pub id: IdentityId,
	/// Last hostname the identity authenticated with.
	pub display_name: String,
	/// Channels this identity wants delivered to it.
	pub receive_channels: ChannelSet,
	/// Channels messages from this identity are published to.
	pub send_channels: ChannelSet,
}

impl IdentityRecord {
	/// A fresh record with no display name and no channel grants.
	pub fn new(id: IdentityId) -> Self {
		Self {
			id,
			display_name: String::new(),
			receive_channels: ChannelSet::new(),
			send_channels: ChannelSet::new(),
		}
	}

	pub fn receives_any_of(&self, targets: &ChannelSet) -> bool {
		self.receive_channels.intersects(targets)
	}
}

/// Server-assigned id for a routed message, used to correlate logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn set(ids: &[u32]) -> ChannelSet {
		ids.iter().copied().collect()
	}

	#[test]
	fn channel_parse_and_display() {
		assert_eq!("7".parse::<ChannelId>().unwrap(), ChannelId(7));
		assert_eq!(" 12 ".parse::<ChannelId>().unwrap().to_string(), "12");
		assert_eq!("".parse::<ChannelId>(), Err(ParseIdError::Empty));
		assert!(matches!("-1".parse::<ChannelId>(), Err(ParseIdError::InvalidChannel(_))));
	}

	#[test]
	fn intersects_requires_a_shared_channel() {
		assert!(set(&[1, 2]).intersects(&set(&[2, 3])));
		assert!(!set(&[1, 2]).intersects(&set(&[3, 4])));
		assert!(!set(&[]).intersects(&set(&[1])));
		assert!(!set(&[]).intersects(&set(&[])));
	}

	#[test]
	fn channel_set_display_is_sorted() {
		assert_eq!(set(&[3, 1, 2]).to_string(), "{1,2,3}");
		assert_eq!(set(&[]).to_string(), "{}");
	}

	#[test]
	fn rejects_empty_identity() {
		assert!(IdentityId::new("").is_err());
		assert_eq!(IdentityId::new("tok1").unwrap().as_str(), "tok1");
	}

	#[test]
	fn new_record_has_no_grants() {
		let rec = IdentityRecord::new(IdentityId::new("tok1").unwrap());
		assert!(rec.receive_channels.is_empty());
		assert!(rec.send_channels.is_empty());
		assert!(!rec.receives_any_of(&set(&[1])));
	}

	proptest! {
		#[test]
		fn intersects_matches_naive_check(a in proptest::collection::vec(0u32..16, 0..8), b in proptest::collection::vec(0u32..16, 0..8)) {
			let naive = a.iter().any(|x| b.contains(x));
			prop_assert_eq!(set(&a).intersects(&set(&b)), naive);
			prop_assert_eq!(set(&b).intersects(&set(&a)), naive);
		}
	}
}
