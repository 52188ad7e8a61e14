//! Per-member field capabilities.
//!
//! A capability set names the record fields a peer can store. Mergers
//! use it to strip fields a peer would lose (`demerge`) and to restore
//! them from the archived snapshot afterwards (`merge`), so lossy peers
//! never clobber richer data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities {
	fields: BTreeSet<String>,
}

impl Capabilities {
	pub fn new<I, S>(fields: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			fields: fields.into_iter().map(Into::into).collect(),
		}
	}

	pub fn supports(&self, field: &str) -> bool {
		self.fields.contains(field)
	}

	pub fn is_empty(&self) -> bool {
		self.fields.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &str> {
		self.fields.iter().map(String::as_str)
	}
}

impl<S: Into<String>> FromIterator<S> for Capabilities {
	fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
		Self::new(iter)
	}
}
