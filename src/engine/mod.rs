//! The group engine.
//!
//! One engine drives one group through synchronization runs. All
//! mutable state lives in a single driver task that consumes a message
//! queue: public API calls enqueue commands, and every proxy call is
//! spawned with its completion reported back into the same queue. Phase
//! progression is pure bookkeeping over bitmasks: one bit per peer for
//! the main sinks, one bit per object engine for everything else.

mod command;
mod entry_engine;
mod mapping_engine;
mod obj_engine;
mod resolver;
mod sink_engine;

pub use command::Resolution;
pub use resolver::{
	ConflictDecision, ConflictEntry, ConflictResolver, ConflictView, FixedResolver,
	MemberSummary, MultiplyDecision, MultiplyHook, MultiplySummary, ObjTypeSummary,
};

use crate::archive::Archive;
use crate::config::{Group, MemberId, SinkConfig};
use crate::data::{Change, ChangeType};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::format::{ConverterPath, FormatRegistry};
use crate::infrastructure::events::{
	ChangeEvent, EngineEvent, EventBus, MemberEvent, SyncEvent,
};
use crate::infrastructure::lock::{GroupLock, LockState};
use crate::mapping::MappingId;
use crate::proxy::{ChangeSink, PeerProxy};
use chrono::Utc;
use command::EngineCommand;
use obj_engine::{ObjCommand, ObjCtx, ObjEngine, ObjEvent, ProxyCall, SinkPhase};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Engine lifecycle, as visible to the embedder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallState {
	Uninitialized,
	Initialized,
	InitializationFailed,
}

/// Optional knobs for [`Engine::initialize`]
#[derive(Default)]
pub struct EngineOptions {
	/// Decides conflicting mappings; without one any conflict aborts
	/// the run.
	pub resolver: Option<Arc<dyn ConflictResolver>>,
	/// Reviews the multiplication outcome before writing.
	pub multiply_hook: Option<Arc<dyn MultiplyHook>>,
	/// Per-objtype common format every read payload is converted into.
	pub internal_formats: HashMap<String, String>,
}

/// Messages consumed by the driver task
enum EngineMessage {
	Command(EngineCommand),
	SinkAck {
		objtype: String,
		member: MemberId,
		phase: SinkPhase,
		slow_sync: bool,
		result: SyncResult<()>,
	},
	MainAck {
		member: MemberId,
		phase: SinkPhase,
		slow_sync: bool,
		result: SyncResult<()>,
	},
	ChangeReceived {
		member: MemberId,
		change: Change,
	},
	CommitAck {
		objtype: String,
		member: MemberId,
		mapping: MappingId,
		result: SyncResult<Option<String>>,
	},
	ReadHydrated {
		objtype: String,
		member: MemberId,
		mapping: MappingId,
		result: SyncResult<Change>,
	},
	DiscoverDone {
		member: MemberId,
		result: SyncResult<Vec<SinkConfig>>,
	},
	Continue,
	Repair,
	Finalize {
		reply: oneshot::Sender<SyncResult<()>>,
	},
}

struct EngineShared {
	tx: mpsc::UnboundedSender<EngineMessage>,
	run_done: watch::Sender<u64>,
	last_error: StdMutex<Option<SyncError>>,
	state: StdMutex<OverallState>,
	abort_pending: AtomicBool,
}

impl EngineShared {
	fn send(&self, message: EngineMessage) -> SyncResult<()> {
		self.tx
			.send(message)
			.map_err(|_| SyncError::new(ErrorKind::Disconnected, "engine driver is gone"))
	}
}

/// Handle to a running group engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
	shared: Arc<EngineShared>,
	events: Arc<EventBus>,
}

impl Engine {
	/// Bring a group up: sanity-check the configuration, take the
	/// group lock, open the archive and start the driver task.
	///
	/// A stale lock (or a group that never synchronized) forces a slow
	/// sync on every object type and reports `prev_unclean`.
	pub async fn initialize(
		group: Group,
		proxies: Vec<Arc<dyn PeerProxy>>,
		registry: Arc<FormatRegistry>,
		options: EngineOptions,
	) -> SyncResult<Self> {
		if group.members.len() < 2 {
			return Err(SyncError::misconfiguration(format!(
				"only {} members configured, but at least 2 are needed",
				group.members.len()
			)));
		}
		if proxies.len() != group.members.len() {
			return Err(SyncError::misconfiguration(format!(
				"{} proxies for {} members",
				proxies.len(),
				group.members.len()
			)));
		}
		if group.enabled_objtypes().next().is_none() {
			return Err(SyncError::misconfiguration("no synchronizable objtype"));
		}
		// Phase progression is tracked in 64-bit masks, one bit per
		// peer and per object type.
		if group.members.len() > 64 || group.enabled_objtypes().count() > 64 {
			return Err(SyncError::misconfiguration(
				"at most 64 members and 64 objtypes are supported",
			));
		}

		let (lock, lock_state) = GroupLock::acquire(&group.lock_path())?;
		let first_sync = group.last_sync.is_none();
		let prev_unclean = lock_state == LockState::Stale;

		let archive = match Archive::open(&group.archive_path()).await {
			Ok(archive) => Arc::new(archive),
			Err(err) => {
				let _ = lock.release();
				return Err(err);
			}
		};
		let events = Arc::new(EventBus::default());

		let mut obj_engines = Vec::new();
		for objtype in group.enabled_objtypes() {
			let mut engine = ObjEngine::new(objtype);
			if prev_unclean || first_sync {
				debug!("forcing slow sync for {objtype}");
				engine.set_slow_sync(true);
			}
			obj_engines.push(engine);
		}

		let (tx, rx) = mpsc::unbounded_channel();
		let (run_done, _) = watch::channel(0u64);
		let shared = Arc::new(EngineShared {
			tx: tx.clone(),
			run_done,
			last_error: StdMutex::new(None),
			state: StdMutex::new(OverallState::Initialized),
			abort_pending: AtomicBool::new(false),
		});

		info!(
			"initialized engine for group {} with {} peers",
			group.name,
			group.members.len()
		);

		let driver = Driver {
			shared: shared.clone(),
			group,
			registry,
			archive,
			events: events.clone(),
			proxies,
			obj_engines,
			resolver: options.resolver,
			multiply_hook: options.multiply_hook,
			internal_formats: options.internal_formats,
			converter_paths: HashMap::new(),
			lock: Some(lock),
			prev_unclean,
			error: None,
			error_reported: false,
			last_event: None,
			running: false,
			disconnecting: false,
			discover_reply: None,
			tx,
			proxy_errors: 0,
			proxy_connects: 0,
			proxy_connect_done: 0,
			proxy_get_changes: 0,
			proxy_written: 0,
			proxy_sync_done: 0,
			proxy_disconnects: 0,
			obj_errors: 0,
			obj_connects: 0,
			obj_connect_done: 0,
			obj_get_changes: 0,
			obj_prepared_map: 0,
			obj_mapped: 0,
			obj_solved: 0,
			obj_multiplied: 0,
			obj_prepared_write: 0,
			obj_written: 0,
			obj_sync_done: 0,
			obj_disconnects: 0,
		};
		tokio::spawn(driver.run(rx));

		Ok(Self { shared, events })
	}

	pub fn state(&self) -> OverallState {
		*self.shared.state.lock().expect("state mutex")
	}

	/// Subscribe to engine, member, change and mapping status events.
	pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
		self.events.subscribe()
	}

	fn check_initialized(&self) -> SyncResult<()> {
		if self.state() != OverallState::Initialized {
			return Err(SyncError::initialization("engine is not initialized"));
		}
		Ok(())
	}

	/// Queue a synchronization run. Returns immediately.
	pub fn synchronize(&self) -> SyncResult<()> {
		self.check_initialized()?;
		if self.shared.last_error.lock().expect("error mutex").is_some() {
			return Err(SyncError::initialization(
				"engine is still affected by an error, repair it first",
			));
		}
		self.shared.send(EngineMessage::Command(EngineCommand::Connect))
	}

	/// Run one synchronization and wait for it to finish.
	pub async fn synchronize_and_block(&self) -> SyncResult<()> {
		let mut done = self.shared.run_done.subscribe();
		self.synchronize()?;
		done.changed()
			.await
			.map_err(|_| SyncError::new(ErrorKind::Disconnected, "engine driver is gone"))?;
		self.run_error()
	}

	/// Wait for the currently queued run to finish.
	pub async fn wait_sync_end(&self) -> SyncResult<()> {
		let mut done = self.shared.run_done.subscribe();
		done.changed()
			.await
			.map_err(|_| SyncError::new(ErrorKind::Disconnected, "engine driver is gone"))?;
		self.run_error()
	}

	fn run_error(&self) -> SyncResult<()> {
		match self.shared.last_error.lock().expect("error mutex").clone() {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	/// Abort the running synchronization. Cooperative: calls already
	/// issued to peers complete first, then everything disconnects.
	pub fn abort(&self) -> SyncResult<()> {
		self.check_initialized()?;
		self.shared.abort_pending.store(true, Ordering::SeqCst);
		self.shared.send(EngineMessage::Command(EngineCommand::Abort))
	}

	/// Re-emit the last engine event, resuming a run that paused in an
	/// asynchronous conflict resolution.
	pub fn continue_run(&self) -> SyncResult<()> {
		self.check_initialized()?;
		self.shared.send(EngineMessage::Continue)
	}

	/// Clear the sticky error left behind by a failed run.
	pub fn repair(&self) -> SyncResult<()> {
		self.shared.last_error.lock().expect("error mutex").take();
		self.shared.send(EngineMessage::Repair)
	}

	/// Resolve a deferred conflict.
	pub fn solve_mapping(
		&self,
		objtype: impl Into<String>,
		mapping: MappingId,
		resolution: Resolution,
	) -> SyncResult<()> {
		self.check_initialized()?;
		self.shared.send(EngineMessage::Command(EngineCommand::Solve {
			objtype: objtype.into(),
			mapping,
			resolution,
		}))
	}

	/// One-shot capability discovery for a single member.
	pub async fn discover(&self, member: MemberId) -> SyncResult<Vec<SinkConfig>> {
		self.check_initialized()?;
		let (reply, rx) = oneshot::channel();
		self.shared
			.send(EngineMessage::Command(EngineCommand::Discover { member, reply }))?;
		rx.await
			.map_err(|_| SyncError::new(ErrorKind::Disconnected, "engine driver is gone"))?
	}

	/// Tear the engine down: finalize every proxy, persist the group
	/// and release the lock (kept on error, so the next run knows).
	pub async fn finalize(&self) -> SyncResult<()> {
		let (reply, rx) = oneshot::channel();
		self.shared.send(EngineMessage::Finalize { reply })?;
		let result = rx
			.await
			.map_err(|_| SyncError::new(ErrorKind::Disconnected, "engine driver is gone"))?;
		*self.shared.state.lock().expect("state mutex") = OverallState::Uninitialized;
		result
	}
}

/// Work items of the driver's phase loop
enum Action {
	ObjCommand(ObjCommand),
	ObjEvent(usize, ObjEvent),
	Generate(EngineEvent),
	Issue(EngineEvent),
	ErrorPath(SyncError),
}

struct Driver {
	shared: Arc<EngineShared>,
	group: Group,
	registry: Arc<FormatRegistry>,
	archive: Arc<Archive>,
	events: Arc<EventBus>,
	proxies: Vec<Arc<dyn PeerProxy>>,
	obj_engines: Vec<ObjEngine>,
	resolver: Option<Arc<dyn ConflictResolver>>,
	multiply_hook: Option<Arc<dyn MultiplyHook>>,
	internal_formats: HashMap<String, String>,
	/// Conversion paths cached per (member, objtype)
	converter_paths: HashMap<String, ConverterPath>,
	lock: Option<GroupLock>,
	/// The previous run ended uncleanly (stale lock); reported at the
	/// start of the next run
	prev_unclean: bool,
	error: Option<SyncError>,
	error_reported: bool,
	last_event: Option<EngineEvent>,
	/// True between the connect command and the disconnected event;
	/// stale acknowledgements outside a run are dropped.
	running: bool,
	disconnecting: bool,
	discover_reply: Option<oneshot::Sender<SyncResult<Vec<SinkConfig>>>>,
	tx: mpsc::UnboundedSender<EngineMessage>,

	proxy_errors: u64,
	proxy_connects: u64,
	proxy_connect_done: u64,
	proxy_get_changes: u64,
	proxy_written: u64,
	proxy_sync_done: u64,
	proxy_disconnects: u64,

	obj_errors: u64,
	obj_connects: u64,
	obj_connect_done: u64,
	obj_get_changes: u64,
	obj_prepared_map: u64,
	obj_mapped: u64,
	obj_solved: u64,
	obj_multiplied: u64,
	obj_prepared_write: u64,
	obj_written: u64,
	obj_sync_done: u64,
	obj_disconnects: u64,
}

fn bit(position: usize) -> u64 {
	1 << position
}

/// Build an [`ObjCtx`] from the driver's fields. A free function so
/// the context can borrow `group` while an object engine is borrowed
/// mutably.
fn obj_ctx<'a>(
	group: &'a Group,
	registry: &Arc<FormatRegistry>,
	archive: &Arc<Archive>,
	events: &Arc<EventBus>,
) -> ObjCtx<'a> {
	ObjCtx {
		group,
		registry: registry.clone(),
		archive: archive.clone(),
		events: events.clone(),
	}
}

impl Driver {
	async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMessage>) {
		while let Some(message) = rx.recv().await {
			match message {
				EngineMessage::Command(cmd) => {
					if self.shared.abort_pending.load(Ordering::SeqCst)
						&& !matches!(cmd, EngineCommand::Abort)
					{
						debug!("dropping queued {cmd} while aborting");
						continue;
					}
					self.handle_command(cmd).await;
				}
				EngineMessage::SinkAck {
					objtype,
					member,
					phase,
					slow_sync,
					result,
				} => {
					self.handle_sink_ack(objtype, member, phase, slow_sync, result)
						.await;
				}
				EngineMessage::MainAck {
					member,
					phase,
					slow_sync,
					result,
				} => {
					self.handle_main_ack(member, phase, slow_sync, result).await;
				}
				EngineMessage::ChangeReceived { member, change } => {
					if let Err(err) = self.ingest_change(member, change).await {
						self.set_error(err.clone());
						self.events.emit(SyncEvent::Member {
							member,
							objtype: None,
							event: MemberEvent::Error,
							error: Some(err),
						});
					}
				}
				EngineMessage::CommitAck {
					objtype,
					member,
					mapping,
					result,
				} => {
					self.handle_commit_ack(objtype, member, mapping, result).await;
				}
				EngineMessage::ReadHydrated {
					objtype,
					member,
					mapping,
					result,
				} => {
					if !self.running {
						continue;
					}
					if let Some(idx) = self.obj_index(&objtype) {
						let obj_event =
							self.obj_engines[idx].handle_read_hydrated(member, mapping, result);
						if let Some(obj_event) = obj_event {
							self.drive(Action::ObjEvent(idx, obj_event)).await;
						}
					}
				}
				EngineMessage::DiscoverDone { member, result } => {
					self.handle_discover_done(member, result);
				}
				EngineMessage::Continue => {
					if let Some(event) = self.last_event {
						self.drive(Action::Issue(event)).await;
					}
				}
				EngineMessage::Repair => {
					debug!("engine repaired");
					self.error = None;
					self.error_reported = false;
				}
				EngineMessage::Finalize { reply } => {
					let result = self.do_finalize().await;
					let _ = reply.send(result);
					break;
				}
			}
		}
	}

	fn obj_index(&self, objtype: &str) -> Option<usize> {
		let idx = self.obj_engines.iter().position(|o| o.objtype() == objtype);
		if idx.is_none() {
			warn!("no object engine for {objtype}");
		}
		idx
	}

	fn member_position(&self, member: MemberId) -> Option<usize> {
		self.group.members.iter().position(|m| m.id == member)
	}

	fn proxy_of(&self, member: MemberId) -> Option<Arc<dyn PeerProxy>> {
		self.member_position(member).map(|p| self.proxies[p].clone())
	}

	fn all_proxy_mask(&self) -> u64 {
		(1u64 << self.proxies.len()) - 1
	}

	fn all_obj_mask(&self) -> u64 {
		(1u64 << self.obj_engines.len()) - 1
	}

	fn proxies_covered(&self, mask: u64) -> bool {
		let all = self.all_proxy_mask();
		(mask | self.proxy_errors) & all == all
	}

	fn objs_covered(&self, mask: u64) -> bool {
		let all = self.all_obj_mask();
		(mask | self.obj_errors) & all == all
	}

	/// Sticky error: newest on top, older ones chained underneath.
	fn set_error(&mut self, err: SyncError) {
		self.error = Some(match self.error.take() {
			Some(previous) => err.stack(previous),
			None => err,
		});
	}

	/// A failure outside the phase machinery; the run cannot continue
	/// and waiters are released immediately.
	fn fatal(&mut self, err: SyncError) {
		error!("fatal engine error: {}", err.print_stack());
		self.set_error(err);
		self.running = false;
		self.signal_run_done();
	}

	fn signal_run_done(&mut self) {
		*self.shared.last_error.lock().expect("error mutex") = self.error.clone();
		self.shared.run_done.send_modify(|v| *v += 1);
	}

	async fn handle_command(&mut self, cmd: EngineCommand) {
		trace!("dispatching command {cmd}");
		match cmd {
			EngineCommand::Connect => {
				if self.running {
					warn!("a synchronization is already running");
					return;
				}
				self.error_reported = false;
				self.disconnecting = false;
				self.running = true;

				if self.prev_unclean {
					self.prev_unclean = false;
					self.events.emit(SyncEvent::Engine {
						event: EngineEvent::PrevUnclean,
						error: None,
					});
				}

				for idx in 0..self.obj_engines.len() {
					let result = {
						let ctx = obj_ctx(&self.group, &self.registry, &self.archive, &self.events);
						self.obj_engines[idx].initialize(&ctx).await
					};
					if let Err(err) = result {
						*self.shared.state.lock().expect("state mutex") =
							OverallState::InitializationFailed;
						self.fatal(err);
						return;
					}
				}

				self.drive(Action::ObjCommand(ObjCommand::Connect)).await;

				for position in 0..self.proxies.len() {
					self.spawn_main_call(position, SinkPhase::Connect);
				}
			}
			EngineCommand::EndConflicts => {
				self.drive(Action::ObjCommand(ObjCommand::EndConflicts)).await;
			}
			EngineCommand::Multiply => {
				self.drive(Action::ObjCommand(ObjCommand::Multiply)).await;
			}
			EngineCommand::Solve {
				objtype,
				mapping,
				resolution,
			} => {
				if !self.running {
					warn!("ignoring resolution for mapping {mapping} outside a run");
					return;
				}
				let Some(idx) = self.obj_index(&objtype) else {
					return;
				};
				let result = {
					let ctx = obj_ctx(&self.group, &self.registry, &self.archive, &self.events);
					self.obj_engines[idx].solve(mapping, resolution, &ctx).await
				};
				match result {
					Ok(()) => {
						// The solved conflict may have been the last
						// one blocking the run.
						let _ = self
							.tx
							.send(EngineMessage::Command(EngineCommand::EndConflicts));
					}
					Err(err) => self.fatal(err),
				}
			}
			EngineCommand::Discover { member, reply } => {
				let Some(proxy) = self.proxy_of(member) else {
					let _ = reply.send(Err(SyncError::misconfiguration(format!(
						"member {member} is not part of the group"
					))));
					return;
				};
				self.discover_reply = Some(reply);
				let tx = self.tx.clone();
				tokio::spawn(async move {
					let result = proxy.discover().await;
					let _ = tx.send(EngineMessage::DiscoverDone { member, result });
				});
			}
			EngineCommand::Abort => {
				self.shared.abort_pending.store(false, Ordering::SeqCst);
				if self.error.is_none() {
					self.set_error(SyncError::generic("synchronization got aborted by user"));
				}
				let err = self.error.clone().expect("just set");
				self.emit_error_status(err);
				if !self.running {
					self.signal_run_done();
					return;
				}
				self.drive(Action::Issue(EngineEvent::Error)).await;
			}
		}
	}


	/// The phase loop: executes actions until the machine quiesces,
	/// i.e. everything further waits on a peer acknowledgement.
	async fn drive(&mut self, initial: Action) {
		let mut queue = VecDeque::new();
		queue.push_back(initial);

		while let Some(action) = queue.pop_front() {
			match action {
				Action::ObjCommand(cmd) => {
					for idx in 0..self.obj_engines.len() {
						let result = {
							let ctx =
								obj_ctx(&self.group, &self.registry, &self.archive, &self.events);
							self.obj_engines[idx].command(cmd, &ctx).await
						};
						match result {
							Ok(outcome) => {
								let objtype = self.obj_engines[idx].objtype().to_owned();
								for call in outcome.calls {
									self.spawn_obj_call(idx, &objtype, call);
								}
								for event in outcome.events {
									queue.push_back(Action::ObjEvent(idx, event));
								}
								for conflict in outcome.conflicts {
									self.dispatch_conflict(conflict).await;
								}
							}
							Err(err) => {
								self.fatal(err);
								return;
							}
						}
					}
				}
				Action::ObjEvent(idx, obj_event) => {
					match obj_event.error {
						Some(err) => {
							self.obj_errors |= bit(idx);
							self.set_error(err);
						}
						None => {
							let mask = match obj_event.event {
								EngineEvent::Connected => &mut self.obj_connects,
								EngineEvent::ConnectDone => &mut self.obj_connect_done,
								EngineEvent::Read => &mut self.obj_get_changes,
								EngineEvent::PreparedMap => &mut self.obj_prepared_map,
								EngineEvent::Mapped => &mut self.obj_mapped,
								EngineEvent::EndConflicts => &mut self.obj_solved,
								EngineEvent::Multiplied => &mut self.obj_multiplied,
								EngineEvent::PreparedWrite => &mut self.obj_prepared_write,
								EngineEvent::Written => &mut self.obj_written,
								EngineEvent::SyncDone => &mut self.obj_sync_done,
								EngineEvent::Disconnected => &mut self.obj_disconnects,
								_ => {
									warn!(
										"object engine raised unexpected {}",
										obj_event.event
									);
									continue;
								}
							};
							*mask |= bit(idx);
						}
					}
					queue.push_back(Action::Generate(obj_event.event));
				}
				Action::Generate(event) => {
					self.last_event = Some(event);
					self.generate(event, &mut queue);
				}
				Action::Issue(event) => {
					self.issue(event, &mut queue).await;
				}
				Action::ErrorPath(err) => {
					self.set_error(err.clone());
					self.emit_error_status(err);
					queue.push_back(Action::Issue(EngineEvent::Error));
				}
			}
		}
	}

	/// `engine_status = error` is raised at most once per run.
	fn emit_error_status(&mut self, err: SyncError) {
		if self.error_reported {
			return;
		}
		self.error_reported = true;
		self.events.emit(SyncEvent::Engine {
			event: EngineEvent::Error,
			error: Some(err),
		});
	}

	fn emit_engine_status(&self, event: EngineEvent) {
		self.events.emit(SyncEvent::Engine { event, error: None });
	}

	/// Check whether `event` aggregated across every peer and object
	/// engine; if so, report it and queue the follow-up work.
	fn generate(&mut self, event: EngineEvent, queue: &mut VecDeque<Action>) {
		if !self.running {
			trace!("ignoring {event} outside a run");
			return;
		}
		match event {
			EngineEvent::Connected => {
				if !self.proxies_covered(self.proxy_connects)
					|| !self.objs_covered(self.obj_connects)
				{
					return;
				}
				let all_objs = self.all_obj_mask();
				if self.obj_errors & all_objs == all_objs {
					queue.push_back(Action::ErrorPath(SyncError::generic(
						"no objtypes left without error, aborting",
					)));
				} else if self.proxy_errors != 0 || self.obj_errors != 0 || self.error.is_some()
				{
					queue.push_back(Action::ErrorPath(SyncError::generic(
						"at least one object engine failed while connecting, aborting",
					)));
				} else {
					self.emit_engine_status(EngineEvent::Connected);
					queue.push_back(Action::Issue(EngineEvent::Connected));
				}
			}
			EngineEvent::ConnectDone => {
				self.generate_phase(
					event,
					self.obj_connect_done,
					Some(self.proxy_connect_done),
					"within connect done",
					queue,
				);
			}
			EngineEvent::Read => {
				self.generate_phase(
					event,
					self.obj_get_changes,
					Some(self.proxy_get_changes),
					"while getting changes",
					queue,
				);
			}
			EngineEvent::PreparedMap => {
				self.generate_phase(event, self.obj_prepared_map, None, "while preparing to map", queue);
			}
			EngineEvent::Mapped => {
				if self.generate_phase(event, self.obj_mapped, None, "while mapping changes", queue) {
					let _ = self
						.tx
						.send(EngineMessage::Command(EngineCommand::EndConflicts));
				}
			}
			EngineEvent::EndConflicts => {
				if self.generate_phase(
					event,
					self.obj_solved,
					None,
					"while solving conflicts",
					queue,
				) {
					let _ = self.tx.send(EngineMessage::Command(EngineCommand::Multiply));
				}
			}
			EngineEvent::Multiplied => {
				self.generate_phase(event, self.obj_multiplied, None, "while multiplying changes", queue);
			}
			EngineEvent::PreparedWrite => {
				if !self.objs_covered(self.obj_prepared_write) {
					return;
				}
				if self.obj_errors != 0 || self.error.is_some() {
					queue.push_back(Action::ErrorPath(SyncError::generic(
						"at least one object engine failed while preparing to write, aborting",
					)));
					return;
				}
				self.emit_engine_status(EngineEvent::PreparedWrite);
				self.log_multiply_summary();
				queue.push_back(Action::Issue(EngineEvent::PreparedWrite));
			}
			EngineEvent::Written => {
				self.generate_phase(
					event,
					self.obj_written,
					Some(self.proxy_written),
					"while writing changes",
					queue,
				);
			}
			EngineEvent::SyncDone => {
				self.generate_phase(
					event,
					self.obj_sync_done,
					Some(self.proxy_sync_done),
					"within sync done",
					queue,
				);
			}
			EngineEvent::Disconnected => {
				if !self.proxies_covered(self.proxy_disconnects)
					|| !self.objs_covered(self.obj_disconnects)
				{
					return;
				}
				// Disconnect never takes the error arm; doing so would
				// emit the disconnect commands again.
				self.emit_engine_status(EngineEvent::Disconnected);
				queue.push_back(Action::Issue(EngineEvent::Disconnected));
			}
			EngineEvent::Error
			| EngineEvent::Successful
			| EngineEvent::PrevUnclean => {}
		}
	}

	/// Shared completion check. Returns true when the phase finished
	/// cleanly.
	fn generate_phase(
		&mut self,
		event: EngineEvent,
		obj_mask: u64,
		proxy_mask: Option<u64>,
		label: &str,
		queue: &mut VecDeque<Action>,
	) -> bool {
		if let Some(mask) = proxy_mask {
			if !self.proxies_covered(mask) {
				return false;
			}
		}
		if !self.objs_covered(obj_mask) {
			trace!("{event} not complete yet");
			return false;
		}

		// A sticky error anywhere sends the phase end through the
		// error arm, even when every ack was individually clean.
		if self.obj_errors != 0 || self.error.is_some() {
			queue.push_back(Action::ErrorPath(SyncError::generic(format!(
				"at least one object engine failed {label}, aborting"
			))));
			return false;
		}

		self.emit_engine_status(event);
		queue.push_back(Action::Issue(event));
		true
	}

	/// Issue the follow-up of an aggregated event: the next phase for
	/// every object engine plus the matching main-sink calls.
	async fn issue(&mut self, event: EngineEvent, queue: &mut VecDeque<Action>) {
		if !self.running {
			trace!("not issuing follow-up of {event} outside a run");
			return;
		}
		trace!("issuing follow-up of {event}");
		match event {
			EngineEvent::Connected => {
				queue.push_back(Action::ObjCommand(ObjCommand::ConnectDone));
				for position in 0..self.proxies.len() {
					self.spawn_main_call(position, SinkPhase::ConnectDone);
				}
			}
			EngineEvent::ConnectDone => {
				queue.push_back(Action::ObjCommand(ObjCommand::Read));
				for position in 0..self.proxies.len() {
					self.spawn_main_call(position, SinkPhase::GetChanges);
				}
			}
			EngineEvent::Read => {
				queue.push_back(Action::ObjCommand(ObjCommand::PrepareMap));
			}
			EngineEvent::PreparedMap => {
				queue.push_back(Action::ObjCommand(ObjCommand::Map));
			}
			EngineEvent::Mapped | EngineEvent::EndConflicts => {
				// Follow-ups go through the command queue so deferred
				// conflict resolutions can interleave.
			}
			EngineEvent::Multiplied => {
				if let Some(hook) = self.multiply_hook.clone() {
					let summary = self.multiply_summary();
					if hook.multiplied(&summary).await == MultiplyDecision::Abort {
						queue.push_back(Action::ErrorPath(SyncError::generic(
							"synchronization aborted after multiplication",
						)));
						return;
					}
				}
				queue.push_back(Action::ObjCommand(ObjCommand::PrepareWrite));
			}
			EngineEvent::PreparedWrite => {
				queue.push_back(Action::ObjCommand(ObjCommand::Write));
				for position in 0..self.proxies.len() {
					self.spawn_main_call(position, SinkPhase::Written);
				}
			}
			EngineEvent::Written => {
				queue.push_back(Action::ObjCommand(ObjCommand::SyncDone));
				for position in 0..self.proxies.len() {
					self.spawn_main_call(position, SinkPhase::SyncDone);
				}
			}
			EngineEvent::SyncDone | EngineEvent::Error => {
				if self.disconnecting {
					debug!("already disconnecting");
					return;
				}
				self.disconnecting = true;
				self.group.last_sync = Some(Utc::now());

				queue.push_back(Action::ObjCommand(ObjCommand::Disconnect));

				let mut synthesized = false;
				for position in 0..self.proxies.len() {
					if self.proxy_connects & bit(position) == 0 {
						// Never connected: nothing to disconnect, the
						// ack is synthesized.
						self.proxy_disconnects |= bit(position);
						synthesized = true;
						continue;
					}
					self.spawn_main_call(position, SinkPhase::Disconnect);
				}
				if synthesized {
					queue.push_back(Action::Generate(EngineEvent::Disconnected));
				}

				if self.error.is_none() {
					self.emit_engine_status(EngineEvent::Successful);
				}
			}
			EngineEvent::Disconnected => {
				for engine in &mut self.obj_engines {
					engine.finalize();
				}
				self.disconnecting = false;

				self.proxy_errors = 0;
				self.proxy_connects = 0;
				self.proxy_connect_done = 0;
				self.proxy_get_changes = 0;
				self.proxy_written = 0;
				self.proxy_sync_done = 0;
				self.proxy_disconnects = 0;

				self.obj_errors = 0;
				self.obj_connects = 0;
				self.obj_connect_done = 0;
				self.obj_get_changes = 0;
				self.obj_prepared_map = 0;
				self.obj_mapped = 0;
				self.obj_solved = 0;
				self.obj_multiplied = 0;
				self.obj_prepared_write = 0;
				self.obj_written = 0;
				self.obj_sync_done = 0;
				self.obj_disconnects = 0;

				info!(
					"synchronization run finished{}",
					if self.error.is_some() { " with errors" } else { "" }
				);
				self.running = false;
				self.signal_run_done();
			}
			EngineEvent::Successful | EngineEvent::PrevUnclean => {}
		}
	}

	/// Ask the resolver about one conflicting mapping.
	async fn dispatch_conflict(&mut self, conflict: ConflictView) {
		match self.resolver.clone() {
			None => {
				warn!(
					"conflict on mapping {} of {} but no resolver is installed",
					conflict.mapping, conflict.objtype
				);
				self.set_error(SyncError::misconfiguration(
					"conflicting changes but no conflict resolver installed",
				));
				let _ = self.tx.send(EngineMessage::Command(EngineCommand::Abort));
			}
			Some(resolver) => match resolver.resolve(&conflict).await {
				ConflictDecision::Resolve(resolution) => {
					debug!(
						"resolver picked {resolution} for mapping {} of {}",
						conflict.mapping, conflict.objtype
					);
					let _ = self.tx.send(EngineMessage::Command(EngineCommand::Solve {
						objtype: conflict.objtype,
						mapping: conflict.mapping,
						resolution,
					}));
				}
				ConflictDecision::Defer => {
					debug!(
						"resolution of mapping {} of {} deferred",
						conflict.mapping, conflict.objtype
					);
				}
				ConflictDecision::Abort => {
					let _ = self.tx.send(EngineMessage::Command(EngineCommand::Abort));
				}
			},
		}
	}

	async fn handle_sink_ack(
		&mut self,
		objtype: String,
		member: MemberId,
		phase: SinkPhase,
		slow_sync: bool,
		result: SyncResult<()>,
	) {
		if !self.running {
			trace!("dropping stale {phase:?} ack from member {member}");
			return;
		}
		if phase == SinkPhase::Connect && slow_sync {
			debug!("member {member} requested slow sync during connect");
			for engine in &mut self.obj_engines {
				engine.set_slow_sync(true);
			}
		}

		let Some(idx) = self.obj_index(&objtype) else {
			return;
		};
		let events = self.events.clone();
		let obj_event =
			self.obj_engines[idx].handle_sink_ack(member, phase, result.err(), &events);
		if let Some(obj_event) = obj_event {
			self.drive(Action::ObjEvent(idx, obj_event)).await;
		}
	}

	async fn handle_main_ack(
		&mut self,
		member: MemberId,
		phase: SinkPhase,
		slow_sync: bool,
		result: SyncResult<()>,
	) {
		if !self.running {
			trace!("dropping stale main {phase:?} ack from member {member}");
			return;
		}
		let Some(position) = self.member_position(member) else {
			warn!("main ack from unknown member {member}");
			return;
		};

		if phase == SinkPhase::Connect && slow_sync {
			debug!("member {member} requested slow sync for all objtypes");
			for engine in &mut self.obj_engines {
				engine.set_slow_sync(true);
			}
		}

		let event = match result {
			Err(err) => {
				self.proxy_errors |= bit(position);
				self.set_error(err.clone());
				self.events.emit(SyncEvent::Member {
					member,
					objtype: None,
					event: MemberEvent::Error,
					error: Some(err),
				});
				self.main_phase_event(phase)
			}
			Ok(()) => {
				let (mask, member_event) = match phase {
					SinkPhase::Connect => (&mut self.proxy_connects, MemberEvent::Connected),
					SinkPhase::ConnectDone => {
						(&mut self.proxy_connect_done, MemberEvent::ConnectDone)
					}
					SinkPhase::GetChanges => (&mut self.proxy_get_changes, MemberEvent::Read),
					SinkPhase::Written => (&mut self.proxy_written, MemberEvent::Written),
					SinkPhase::SyncDone => (&mut self.proxy_sync_done, MemberEvent::SyncDone),
					SinkPhase::Disconnect => {
						(&mut self.proxy_disconnects, MemberEvent::Disconnected)
					}
				};
				*mask |= bit(position);
				self.events.emit(SyncEvent::Member {
					member,
					objtype: None,
					event: member_event,
					error: None,
				});
				self.main_phase_event(phase)
			}
		};

		self.drive(Action::Generate(event)).await;
	}

	fn main_phase_event(&self, phase: SinkPhase) -> EngineEvent {
		match phase {
			SinkPhase::Connect => EngineEvent::Connected,
			SinkPhase::ConnectDone => EngineEvent::ConnectDone,
			SinkPhase::GetChanges => EngineEvent::Read,
			SinkPhase::Written => EngineEvent::Written,
			SinkPhase::SyncDone => EngineEvent::SyncDone,
			SinkPhase::Disconnect => EngineEvent::Disconnected,
		}
	}

	async fn handle_commit_ack(
		&mut self,
		objtype: String,
		member: MemberId,
		mapping: MappingId,
		result: SyncResult<Option<String>>,
	) {
		if !self.running {
			trace!("dropping stale commit ack from member {member}");
			return;
		}
		let Some(idx) = self.obj_index(&objtype) else {
			return;
		};
		let obj_event = {
			let ctx = obj_ctx(&self.group, &self.registry, &self.archive, &self.events);
			self.obj_engines[idx]
				.handle_commit_ack(member, mapping, result, &ctx)
				.await
		};
		if let Some(obj_event) = obj_event {
			self.drive(Action::ObjEvent(idx, obj_event)).await;
		}
	}

	/// Convert a freshly received change into the common format, merge
	/// archived detail back into lossy payloads and hand it to the
	/// owning object engine.
	///
	/// Format-operation failures drop the affected change with a
	/// change-status error; the run continues without it. Only routing
	/// failures travel up.
	async fn ingest_change(&mut self, member: MemberId, mut change: Change) -> SyncResult<()> {
		if !self.running {
			trace!("dropping change reported outside a run");
			return Ok(());
		}
		let objtype = change
			.objtype()
			.map(str::to_owned)
			.ok_or_else(|| {
				SyncError::generic(format!("change {} carries no objtype", change.uid()))
			})?;

		trace!(
			"received {} change {} ({objtype}) from member {member}",
			change.change_type(),
			change.uid()
		);

		if let Err(err) = self.prepare_incoming(member, &objtype, &mut change).await {
			warn!(
				"dropping change {} from member {member}: {}",
				change.uid(),
				err.print_stack()
			);
			self.events.emit(SyncEvent::Change {
				member,
				objtype,
				uid: change.uid().to_owned(),
				mapping: None,
				event: ChangeEvent::Error,
				error: Some(err),
			});
			return Ok(());
		}

		let Some(idx) = self.obj_index(&objtype) else {
			return Err(SyncError::generic(format!(
				"unable to find an engine which can handle objtype {objtype}"
			)));
		};
		let ctx = obj_ctx(&self.group, &self.registry, &self.archive, &self.events);
		self.obj_engines[idx].receive_change(member, change, &ctx)
	}

	/// The format pipeline for one incoming change: conversion into the
	/// common format, then merging archived detail into lossy payloads.
	async fn prepare_incoming(
		&mut self,
		member: MemberId,
		objtype: &str,
		change: &mut Change,
	) -> SyncResult<()> {
		if change.change_type() == ChangeType::Deleted {
			return Ok(());
		}

		if self.group.converter_enabled {
			if let Some(target) = self.internal_formats.get(objtype).cloned() {
				let change_uid = change.uid().to_string();
				let data = change.data_mut().ok_or_else(|| {
					SyncError::generic(format!("change {} carries no payload", change_uid))
				})?;
				if data.format().name() != target {
					let key = format!("{member}_{objtype}");
					let path = match self.converter_paths.get(&key).cloned() {
						Some(path) => path,
						None => {
							let path = self.registry.find_path(
								data.format().name(),
								std::slice::from_ref(&target),
								None,
							)?;
							self.converter_paths.insert(key, path.clone());
							path
						}
					};
					if !path.is_identity() {
						let (bytes, format) =
							self.registry.convert_along(&path, data.bytes().to_vec())?;
						let keeps_objtype = format.objtype() == objtype;
						data.set_bytes(bytes);
						data.set_format(format);
						data.set_objtype(if keeps_objtype {
							None
						} else {
							Some(objtype.to_owned())
						});
					}
				}
			}
		}

		if self.group.merger_enabled && self.group.converter_enabled {
			let caps = self
				.group
				.member(member)
				.and_then(|m| m.capabilities.clone());
			if let Some(caps) = caps {
				let has_merger = change
					.format()
					.map(|f| f.has_merger())
					.unwrap_or(false);
				if has_merger {
					if let Some(entire) = self.archive.load_data(change.uid(), objtype).await? {
						let data = change.data_mut().expect("merger implies payload");
						let entire = data.format().demarshal(&entire)?;
						let merged = data.format().merge(data.bytes(), &entire, &caps)?;
						data.set_bytes(merged);
					}
				}
			}
		}

		Ok(())
	}

	fn handle_discover_done(&mut self, member: MemberId, result: SyncResult<Vec<SinkConfig>>) {
		match &result {
			Ok(sinks) => {
				info!("member {member} discovered {} sinks", sinks.len());
				if let Some(config) = self.group.member_mut(member) {
					config.sinks = sinks.clone();
				}
				self.events.emit(SyncEvent::Member {
					member,
					objtype: None,
					event: MemberEvent::Discovered,
					error: None,
				});
			}
			Err(err) => {
				self.events.emit(SyncEvent::Member {
					member,
					objtype: None,
					event: MemberEvent::Error,
					error: Some(err.clone()),
				});
			}
		}

		if let Some(reply) = self.discover_reply.take() {
			let _ = reply.send(result);
		} else {
			warn!("discovery finished but nobody is waiting");
		}
	}

	fn multiply_summary(&self) -> MultiplySummary {
		MultiplySummary {
			objtypes: self
				.obj_engines
				.iter()
				.map(|engine| ObjTypeSummary {
					objtype: engine.objtype().to_owned(),
					members: engine.member_summaries(),
				})
				.collect(),
		}
	}

	fn log_multiply_summary(&self) {
		for objtype in self.multiply_summary().objtypes {
			for member in objtype.members {
				debug!(
					"{}: member {} added:{} modified:{} deleted:{}",
					objtype.objtype, member.member, member.added, member.modified, member.deleted
				);
			}
		}
	}

	/// Spawn one object-sink proxy call; its completion comes back as
	/// a message.
	fn spawn_obj_call(&self, idx: usize, objtype: &str, call: ProxyCall) {
		let tx = self.tx.clone();
		let objtype = objtype.to_owned();
		let slow_sync = self.obj_engines[idx].slow_sync();

		match call {
			ProxyCall::Connect { member } => {
				let Some(proxy) = self.proxy_of(member) else {
					return;
				};
				tokio::spawn(async move {
					let (slow_sync, result) =
						match proxy.connect(Some(&objtype), slow_sync).await {
							Ok(granted) => (granted, Ok(())),
							Err(err) => (false, Err(err)),
						};
					let _ = tx.send(EngineMessage::SinkAck {
						objtype,
						member,
						phase: SinkPhase::Connect,
						slow_sync,
						result,
					});
				});
			}
			ProxyCall::ConnectDone { member } => {
				let Some(proxy) = self.proxy_of(member) else {
					return;
				};
				tokio::spawn(async move {
					let result = proxy.connect_done(Some(&objtype)).await;
					let _ = tx.send(EngineMessage::SinkAck {
						objtype,
						member,
						phase: SinkPhase::ConnectDone,
						slow_sync: false,
						result,
					});
				});
			}
			ProxyCall::GetChanges { member } => {
				let Some(proxy) = self.proxy_of(member) else {
					return;
				};
				tokio::spawn(async move {
					let result =
						run_get_changes(&*proxy, Some(&objtype), slow_sync, member, &tx).await;
					let _ = tx.send(EngineMessage::SinkAck {
						objtype,
						member,
						phase: SinkPhase::GetChanges,
						slow_sync: false,
						result,
					});
				});
			}
			ProxyCall::ReadIgnored {
				member,
				mapping,
				change,
			} => {
				let Some(proxy) = self.proxy_of(member) else {
					return;
				};
				tokio::spawn(async move {
					let result = proxy.read(change).await;
					let _ = tx.send(EngineMessage::ReadHydrated {
						objtype,
						member,
						mapping,
						result,
					});
				});
			}
			ProxyCall::Commit {
				member,
				mapping,
				change,
			} => {
				let Some(proxy) = self.proxy_of(member) else {
					return;
				};
				tokio::spawn(async move {
					let result = proxy.commit_change(change).await;
					let _ = tx.send(EngineMessage::CommitAck {
						objtype,
						member,
						mapping,
						result,
					});
				});
			}
			ProxyCall::CommittedAll { member } => {
				let Some(proxy) = self.proxy_of(member) else {
					return;
				};
				tokio::spawn(async move {
					let result = proxy.committed_all(Some(&objtype)).await;
					let _ = tx.send(EngineMessage::SinkAck {
						objtype,
						member,
						phase: SinkPhase::Written,
						slow_sync: false,
						result,
					});
				});
			}
			ProxyCall::SyncDone { member } => {
				let Some(proxy) = self.proxy_of(member) else {
					return;
				};
				tokio::spawn(async move {
					let result = proxy.sync_done(Some(&objtype)).await;
					let _ = tx.send(EngineMessage::SinkAck {
						objtype,
						member,
						phase: SinkPhase::SyncDone,
						slow_sync: false,
						result,
					});
				});
			}
			ProxyCall::Disconnect { member } => {
				let Some(proxy) = self.proxy_of(member) else {
					return;
				};
				tokio::spawn(async move {
					let result = proxy.disconnect(Some(&objtype)).await;
					let _ = tx.send(EngineMessage::SinkAck {
						objtype,
						member,
						phase: SinkPhase::Disconnect,
						slow_sync: false,
						result,
					});
				});
			}
		}
	}

	/// Spawn one main-sink proxy call for the peer at `position`.
	fn spawn_main_call(&self, position: usize, phase: SinkPhase) {
		let member = self.group.members[position].id;
		let proxy = self.proxies[position].clone();
		let tx = self.tx.clone();

		tokio::spawn(async move {
			let (slow_sync, result) = match phase {
				SinkPhase::Connect => match proxy.connect(None, false).await {
					Ok(granted) => (granted, Ok(())),
					Err(err) => (false, Err(err)),
				},
				SinkPhase::ConnectDone => (false, proxy.connect_done(None).await),
				SinkPhase::GetChanges => {
					(false, run_get_changes(&*proxy, None, false, member, &tx).await)
				}
				SinkPhase::Written => (false, proxy.committed_all(None).await),
				SinkPhase::SyncDone => (false, proxy.sync_done(None).await),
				SinkPhase::Disconnect => (false, proxy.disconnect(None).await),
			};
			let _ = tx.send(EngineMessage::MainAck {
				member,
				phase,
				slow_sync,
				result,
			});
		});
	}

	async fn do_finalize(&mut self) -> SyncResult<()> {
		debug!("finalizing engine for group {}", self.group.name);
		let mut failure: Option<SyncError> = None;

		for proxy in &self.proxies {
			if let Err(err) = proxy.finalize().await {
				warn!("proxy finalize failed: {err}");
				failure.get_or_insert(err);
			}
			if let Err(err) = proxy.shutdown().await {
				warn!("proxy shutdown failed: {err}");
				failure.get_or_insert(err);
			}
		}

		if let Err(err) = self.group.save() {
			failure.get_or_insert(err);
		}

		if self.error.is_none() {
			if let Some(lock) = self.lock.take() {
				if let Err(err) = lock.release() {
					failure.get_or_insert(err);
				}
			}
		} else {
			// Keeping the lock marks the group unclean; the next run
			// will slow-sync.
			self.lock.take();
		}

		self.archive.close().await;

		match failure {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}
}

/// Run a get-changes call, forwarding streamed changes to the driver
/// before the acknowledgement is delivered.
async fn run_get_changes(
	proxy: &dyn PeerProxy,
	objtype: Option<&str>,
	slow_sync: bool,
	member: MemberId,
	tx: &mpsc::UnboundedSender<EngineMessage>,
) -> SyncResult<()> {
	let (sink, mut changes) = ChangeSink::new();
	let call = proxy.get_changes(objtype, slow_sync, sink);
	tokio::pin!(call);

	let mut result: Option<SyncResult<()>> = None;
	loop {
		tokio::select! {
			r = &mut call, if result.is_none() => {
				result = Some(r);
			}
			maybe = changes.recv() => match maybe {
				Some(change) => {
					let _ = tx.send(EngineMessage::ChangeReceived { member, change });
				}
				None => break,
			}
		}
	}

	match result {
		Some(result) => result,
		// The adapter dropped its sink before returning; await the
		// call itself.
		None => call.await,
	}
}
