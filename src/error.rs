//! Error values for the synchronization engine.
//!
//! Every failure carries a kind, a message and an optional inner cause,
//! so call sites can prepend context while keeping the original failure
//! reachable through the chain.

use std::fmt;
use thiserror::Error;

/// Result type used throughout the engine
pub type SyncResult<T = ()> = Result<T, SyncError>;

/// Classification of an engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Unclassified failure
	Generic,
	/// Underlying I/O failed
	Io,
	/// Operation not supported by the format or peer
	NotSupported,
	/// Peer did not answer in time
	Timeout,
	/// Peer vanished mid-call
	Disconnected,
	/// A required file is missing
	FileNotFound,
	/// Group or member configuration is unusable
	Misconfiguration,
	/// The group is locked by another process
	Locked,
	/// Engine lifecycle was violated
	Initialization,
	/// The archive or a helper database failed
	Database,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Generic => "generic",
			Self::Io => "io",
			Self::NotSupported => "not-supported",
			Self::Timeout => "timeout",
			Self::Disconnected => "disconnected",
			Self::FileNotFound => "file-not-found",
			Self::Misconfiguration => "misconfiguration",
			Self::Locked => "locked",
			Self::Initialization => "initialization",
			Self::Database => "database",
		};
		write!(f, "{name}")
	}
}

/// An engine error with an optional cause chain
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SyncError {
	kind: ErrorKind,
	message: String,
	#[source]
	cause: Option<Box<SyncError>>,
}

impl SyncError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			cause: None,
		}
	}

	pub fn generic(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Generic, message)
	}

	pub fn misconfiguration(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Misconfiguration, message)
	}

	pub fn initialization(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Initialization, message)
	}

	pub fn locked(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Locked, message)
	}

	pub fn not_supported(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotSupported, message)
	}

	pub fn kind(&self) -> ErrorKind {
		self.kind
	}

	pub fn message(&self) -> &str {
		&self.message
	}

	pub fn cause(&self) -> Option<&SyncError> {
		self.cause.as_deref()
	}

	/// Attach `inner` as the deepest cause of this error.
	///
	/// Used by the engine's sticky-error rule: a newer error keeps the
	/// older one reachable instead of overwriting it.
	pub fn stack(mut self, inner: SyncError) -> Self {
		let mut slot = &mut self.cause;
		while let Some(existing) = slot {
			slot = &mut existing.cause;
		}
		*slot = Some(Box::new(inner));
		self
	}

	/// Render the whole chain, newest first, one line per cause.
	pub fn print_stack(&self) -> String {
		let mut out = format!("{}: {}", self.kind, self.message);
		let mut next = self.cause.as_deref();
		while let Some(err) = next {
			out.push_str(&format!("\n  caused by: {}: {}", err.kind, err.message));
			next = err.cause.as_deref();
		}
		out
	}
}

impl From<std::io::Error> for SyncError {
	fn from(err: std::io::Error) -> Self {
		let kind = match err.kind() {
			std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
			std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
			_ => ErrorKind::Io,
		};
		Self::new(kind, err.to_string())
	}
}

impl From<sqlx::Error> for SyncError {
	fn from(err: sqlx::Error) -> Self {
		Self::new(ErrorKind::Database, err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stack_preserves_order() {
		let first = SyncError::generic("first failure");
		let second = SyncError::misconfiguration("second failure").stack(first);
		let third = SyncError::locked("third failure").stack(second);

		assert_eq!(third.kind(), ErrorKind::Locked);
		assert_eq!(third.cause().unwrap().kind(), ErrorKind::Misconfiguration);
		assert_eq!(
			third.cause().unwrap().cause().unwrap().kind(),
			ErrorKind::Generic
		);

		let rendered = third.print_stack();
		let lines: Vec<_> = rendered.lines().collect();
		assert_eq!(lines.len(), 3);
		assert!(lines[0].starts_with("locked"));
		assert!(lines[2].contains("first failure"));
	}

	#[test]
	fn io_not_found_maps_to_file_not_found() {
		let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
		let err = SyncError::from(io);
		assert_eq!(err.kind(), ErrorKind::FileNotFound);
	}
}
