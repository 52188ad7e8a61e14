//! Format converters and path search.
//!
//! Converters are edges in a directed graph over format names. Sinks
//! accept a set of formats; the engine searches the shortest chain from
//! a payload's current format to one the destination accepts and caches
//! the result per (member, objtype).

use super::{FormatRegistry, ObjectFormat};
use crate::error::{SyncError, SyncResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub type ConvertFn = Arc<dyn Fn(&[u8]) -> SyncResult<Vec<u8>> + Send + Sync>;

/// One directed conversion edge between two formats
pub struct Converter {
	source: String,
	target: String,
	func: ConvertFn,
}

impl Converter {
	pub fn new(
		source: impl Into<String>,
		target: impl Into<String>,
		func: ConvertFn,
	) -> Self {
		Self {
			source: source.into(),
			target: target.into(),
			func,
		}
	}

	pub fn source(&self) -> &str {
		&self.source
	}

	pub fn target(&self) -> &str {
		&self.target
	}
}

/// A resolved chain of converter indices ending at `target`
#[derive(Debug, Clone)]
pub struct ConverterPath {
	steps: Vec<usize>,
	target: String,
}

impl ConverterPath {
	pub fn is_identity(&self) -> bool {
		self.steps.is_empty()
	}

	pub fn target(&self) -> &str {
		&self.target
	}

	pub fn len(&self) -> usize {
		self.steps.len()
	}

	pub fn is_empty(&self) -> bool {
		self.steps.is_empty()
	}
}

pub(super) fn find_path(
	registry: &FormatRegistry,
	source: &str,
	targets: &[String],
	preferred: Option<&str>,
) -> SyncResult<ConverterPath> {
	let accepted = |name: &str| targets.iter().any(|t| t == name);

	if accepted(source) {
		return Ok(ConverterPath {
			steps: Vec::new(),
			target: source.to_owned(),
		});
	}

	// Breadth-first over converter edges; order the frontier so a path
	// into the preferred format is found before its same-length peers.
	let converters = registry.converters();
	let mut frontier = VecDeque::new();
	// Target format name -> index of the edge that discovered it.
	let mut visited: HashMap<&str, usize> = HashMap::new();

	frontier.push_back(source);
	let mut found: Option<&str> = None;
	let mut fallback: Option<&str> = None;

	while let Some(current) = frontier.pop_front() {
		for (index, converter) in converters.iter().enumerate() {
			if converter.source() != current || visited.contains_key(converter.target()) {
				continue;
			}
			visited.insert(converter.target(), index);
			if accepted(converter.target()) {
				if preferred.map_or(true, |p| p == converter.target()) {
					found = Some(converter.target());
					break;
				}
				fallback.get_or_insert(converter.target());
			}
			frontier.push_back(converter.target());
		}
		if found.is_some() {
			break;
		}
	}

	let end = found.or(fallback).ok_or_else(|| {
		SyncError::generic(format!(
			"no conversion path from format {source} to any of [{}]",
			targets.join(", ")
		))
	})?;

	// Walk the visited map backwards to recover the edge sequence.
	let mut steps = Vec::new();
	let mut cursor = end;
	while cursor != source {
		let index = visited[cursor];
		steps.push(index);
		cursor = converters[index].source();
	}
	steps.reverse();

	Ok(ConverterPath {
		steps,
		target: end.to_owned(),
	})
}

pub(super) fn convert_along(
	registry: &FormatRegistry,
	path: &ConverterPath,
	mut bytes: Vec<u8>,
) -> SyncResult<(Vec<u8>, Arc<dyn ObjectFormat>)> {
	for &index in &path.steps {
		let converter = &registry.converters()[index];
		bytes = (converter.func)(&bytes)?;
	}

	let format = registry
		.format(path.target())
		.cloned()
		.ok_or_else(|| {
			SyncError::generic(format!("conversion target {} is not registered", path.target()))
		})?;

	Ok((bytes, format))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::format::{CmpResult, PlainFormat};

	struct UpperFormat;

	impl ObjectFormat for UpperFormat {
		fn name(&self) -> &str {
			"upper"
		}

		fn objtype(&self) -> &str {
			"contact"
		}

		fn compare(&self, left: &[u8], right: &[u8]) -> SyncResult<CmpResult> {
			Ok(if left == right {
				CmpResult::Same
			} else {
				CmpResult::Mismatch
			})
		}
	}

	fn registry_with_edge() -> FormatRegistry {
		let mut registry = FormatRegistry::new();
		registry.register_format(PlainFormat::for_objtype("contact"));
		registry.register_format(Arc::new(UpperFormat));
		registry.register_converter(Converter::new(
			"plain",
			"upper",
			Arc::new(|bytes: &[u8]| Ok(bytes.to_ascii_uppercase())),
		));
		registry
	}

	#[test]
	fn identity_path_when_source_is_accepted() {
		let registry = registry_with_edge();
		let path = registry
			.find_path("plain", &["plain".into(), "upper".into()], None)
			.unwrap();
		assert!(path.is_identity());
		assert_eq!(path.target(), "plain");
	}

	#[test]
	fn single_edge_path_converts_payload() {
		let registry = registry_with_edge();
		let path = registry.find_path("plain", &["upper".into()], None).unwrap();
		assert_eq!(path.len(), 1);

		let (bytes, format) = registry.convert_along(&path, b"alice".to_vec()).unwrap();
		assert_eq!(bytes, b"ALICE");
		assert_eq!(format.name(), "upper");
	}

	#[test]
	fn missing_path_is_an_error() {
		let registry = registry_with_edge();
		assert!(registry.find_path("upper", &["plain".into()], None).is_err());
	}
}
