//! Control-message stream between a test bundle and the controller.
//!
//! A bundle invocation produces a single in-order stream of typed events on
//! its stdout. Each wire record is a length-prefixed JSON object with exactly
//! one non-null field; the field name is the variant discriminant. The
//! [`EventReader`] decodes records, enforces the ordering contract, and owns
//! the inter-event liveness watchdog.
//!
//! # Wire framing
//!
//! ```text
//! <decimal byte length>\n<JSON object of exactly that many bytes>
//! ```
//!
//! # Event variants
//!
//! | Variant       | Payload                                   |
//! |---------------|-------------------------------------------|
//! | `RunStart`    | time, expected entity names, count        |
//! | `RunLog`      | time, text                                |
//! | `EntityStart` | time, entity info, out-dir                |
//! | `EntityLog`   | time, entity name, text                   |
//! | `EntityError` | time, entity name, error report           |
//! | `EntityEnd`   | time, entity name, skip reasons, timing   |
//! | `RunError`    | time, error report (fatal, aborts batch)  |
//! | `RunEnd`      | time, out-dir                             |
//! | `Heartbeat`   | time                                      |
//!
//! # Ordering contract
//!
//! For any entity N the subsequence naming N is
//! `EntityStart (EntityLog | EntityError)* EntityEnd`. Between `RunStart`
//! and `RunEnd` at most one `RunError` may appear and its presence precludes
//! a later `RunEnd`. Entities may interleave; fixtures are long-lived and
//! bracket the tests they own.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::registry::EntityKind;

/// Largest record the reader will accept. Anything bigger indicates a
/// corrupt length prefix rather than a real event.
const MAX_RECORD_LEN: usize = 4 * 1024 * 1024;

/// An error attached to an entity or to the whole run.
///
/// `stack` is empty for run-scope errors; bundles only capture stacks for
/// entity failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub reason: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub stack: String,
}

impl ErrorReport {
    /// Creates a report carrying only a reason string.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            file: String::new(),
            line: 0,
            stack: String::new(),
        }
    }
}

/// Identity of an entity as announced by `EntityStart`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub name: String,
    pub kind: EntityKind,
}

/// A decoded control-stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RunStart {
        time: DateTime<Utc>,
        names: Vec<String>,
        count: usize,
    },
    RunLog {
        time: DateTime<Utc>,
        text: String,
    },
    EntityStart {
        time: DateTime<Utc>,
        entity: EntityInfo,
        out_dir: String,
    },
    EntityLog {
        time: DateTime<Utc>,
        name: String,
        text: String,
    },
    EntityError {
        time: DateTime<Utc>,
        name: String,
        error: ErrorReport,
    },
    EntityEnd {
        time: DateTime<Utc>,
        name: String,
        skip_reasons: Vec<String>,
        timing: Option<serde_json::Value>,
    },
    RunError {
        time: DateTime<Utc>,
        error: ErrorReport,
    },
    RunEnd {
        time: DateTime<Utc>,
        out_dir: String,
    },
    Heartbeat {
        time: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunStartBody {
    time: DateTime<Utc>,
    names: Vec<String>,
    count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunLogBody {
    time: DateTime<Utc>,
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityStartBody {
    time: DateTime<Utc>,
    entity: EntityInfo,
    #[serde(default)]
    out_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityLogBody {
    time: DateTime<Utc>,
    name: String,
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityErrorBody {
    time: DateTime<Utc>,
    name: String,
    error: ErrorReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityEndBody {
    time: DateTime<Utc>,
    name: String,
    #[serde(default)]
    skip_reasons: Vec<String>,
    #[serde(default)]
    timing: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunErrorBody {
    time: DateTime<Utc>,
    error: ErrorReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunEndBody {
    time: DateTime<Utc>,
    #[serde(default)]
    out_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatBody {
    time: DateTime<Utc>,
}

/// The on-wire union record. Exactly one field must be non-null.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct WireEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    run_start: Option<RunStartBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_log: Option<RunLogBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_start: Option<EntityStartBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_log: Option<EntityLogBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_error: Option<EntityErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_end: Option<EntityEndBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_error: Option<RunErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_end: Option<RunEndBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    heartbeat: Option<HeartbeatBody>,
}

impl WireEvent {
    fn discriminant_count(&self) -> usize {
        [
            self.run_start.is_some(),
            self.run_log.is_some(),
            self.entity_start.is_some(),
            self.entity_log.is_some(),
            self.entity_error.is_some(),
            self.entity_end.is_some(),
            self.run_error.is_some(),
            self.run_end.is_some(),
            self.heartbeat.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    fn into_event(self) -> Result<Event, ProtocolError> {
        match self.discriminant_count() {
            0 => return Err(ProtocolError::NoDiscriminant),
            1 => {}
            n => return Err(ProtocolError::MultipleDiscriminants(n)),
        }
        let event = if let Some(b) = self.run_start {
            Event::RunStart {
                time: b.time,
                names: b.names,
                count: b.count,
            }
        } else if let Some(b) = self.run_log {
            Event::RunLog {
                time: b.time,
                text: b.text,
            }
        } else if let Some(b) = self.entity_start {
            Event::EntityStart {
                time: b.time,
                entity: b.entity,
                out_dir: b.out_dir,
            }
        } else if let Some(b) = self.entity_log {
            Event::EntityLog {
                time: b.time,
                name: b.name,
                text: b.text,
            }
        } else if let Some(b) = self.entity_error {
            Event::EntityError {
                time: b.time,
                name: b.name,
                error: b.error,
            }
        } else if let Some(b) = self.entity_end {
            Event::EntityEnd {
                time: b.time,
                name: b.name,
                skip_reasons: b.skip_reasons,
                timing: b.timing,
            }
        } else if let Some(b) = self.run_error {
            Event::RunError {
                time: b.time,
                error: b.error,
            }
        } else if let Some(b) = self.run_end {
            Event::RunEnd {
                time: b.time,
                out_dir: b.out_dir,
            }
        } else if let Some(b) = self.heartbeat {
            Event::Heartbeat { time: b.time }
        } else {
            unreachable!("discriminant count checked above")
        };
        Ok(event)
    }

    fn from_event(event: Event) -> Self {
        let mut wire = WireEvent::default();
        match event {
            Event::RunStart { time, names, count } => {
                wire.run_start = Some(RunStartBody { time, names, count })
            }
            Event::RunLog { time, text } => wire.run_log = Some(RunLogBody { time, text }),
            Event::EntityStart {
                time,
                entity,
                out_dir,
            } => {
                wire.entity_start = Some(EntityStartBody {
                    time,
                    entity,
                    out_dir,
                })
            }
            Event::EntityLog { time, name, text } => {
                wire.entity_log = Some(EntityLogBody { time, name, text })
            }
            Event::EntityError { time, name, error } => {
                wire.entity_error = Some(EntityErrorBody { time, name, error })
            }
            Event::EntityEnd {
                time,
                name,
                skip_reasons,
                timing,
            } => {
                wire.entity_end = Some(EntityEndBody {
                    time,
                    name,
                    skip_reasons,
                    timing,
                })
            }
            Event::RunError { time, error } => wire.run_error = Some(RunErrorBody { time, error }),
            Event::RunEnd { time, out_dir } => wire.run_end = Some(RunEndBody { time, out_dir }),
            Event::Heartbeat { time } => wire.heartbeat = Some(HeartbeatBody { time }),
        }
        wire
    }
}

/// Violations of the stream contract. Any of these fails the batch and the
/// run is not retried.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("record has no discriminant field")]
    NoDiscriminant,

    #[error("record has {0} discriminant fields, expected exactly 1")]
    MultipleDiscriminants(usize),

    #[error("invalid record length prefix: {0:?}")]
    BadLengthPrefix(String),

    #[error("record length {0} exceeds maximum {MAX_RECORD_LEN}")]
    RecordTooLarge(usize),

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event before RunStart")]
    EventBeforeRunStart,

    #[error("duplicate RunStart")]
    DuplicateRunStart,

    #[error("RunStart count {count} does not match {names} expected names")]
    CountMismatch { count: usize, names: usize },

    #[error("event after run terminated")]
    EventAfterEnd,

    #[error("RunEnd after RunError")]
    RunEndAfterRunError,

    #[error("entity {0:?} started while already open")]
    DuplicateEntityStart(String),

    #[error("event names entity {0:?} which is not open")]
    EntityNotOpen(String),
}

/// Failures while pulling the next event off the stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The heartbeat watchdog fired: no event arrived within the timeout.
    #[error("no control message received within {0:?}")]
    MsgTimeout(Duration),

    /// The surrounding context was cancelled.
    #[error("stream cancelled")]
    Cancelled,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes one event in wire framing, for the bundle side of tests and for
/// fake streams.
pub fn encode_event(event: Event) -> Vec<u8> {
    let body = serde_json::to_vec(&WireEvent::from_event(event))
        .expect("wire event serialization cannot fail");
    let mut out = format!("{}\n", body.len()).into_bytes();
    out.extend_from_slice(&body);
    out
}

/// What the stream said about the batch, available once reading stops.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Whether a `RunStart` was observed at all.
    pub run_started: bool,
    /// Entity names announced by `RunStart`, in announcement order.
    pub expected: Vec<String>,
    /// Names that received an `EntityStart`.
    pub started: HashSet<String>,
    /// Currently open entities in start (FIFO) order.
    pub open: Vec<String>,
    /// The fatal run error, if one was reported.
    pub run_error: Option<ErrorReport>,
    /// Whether a `RunEnd` was observed.
    pub run_ended: bool,
}

impl StreamSummary {
    /// Expected entities that never started, in announcement order.
    ///
    /// Returns `None` until a `RunStart` has been seen; the caller cannot
    /// distinguish "nothing remains" from "the runner never reported".
    pub fn unstarted(&self) -> Option<Vec<String>> {
        if !self.run_started {
            return None;
        }
        Some(
            self.expected
                .iter()
                .filter(|name| !self.started.contains(*name))
                .cloned()
                .collect(),
        )
    }
}

/// Validating reader over a bundle's control stream.
///
/// The reader enforces the ordering contract as events are pulled and
/// maintains the liveness deadline: the watchdog is re-armed by any event,
/// including heartbeats. Cancellation of the supplied token is observed
/// within one scheduler tick even while the stream is quiet.
pub struct EventReader<R> {
    input: BufReader<R>,
    msg_timeout: Duration,
    run_started: bool,
    summary: StreamSummary,
}

impl<R: AsyncRead + Unpin> EventReader<R> {
    pub fn new(input: R, msg_timeout: Duration) -> Self {
        Self {
            input: BufReader::new(input),
            msg_timeout,
            run_started: false,
            summary: StreamSummary::default(),
        }
    }

    /// Pulls and validates the next event.
    ///
    /// Returns `Ok(None)` at end of stream. Cancellation and watchdog expiry
    /// surface as [`StreamError::Cancelled`] and [`StreamError::MsgTimeout`].
    pub async fn next_event(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Event>, StreamError> {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            read = tokio::time::timeout(self.msg_timeout, read_record(&mut self.input)) => {
                match read {
                    Ok(record) => record?,
                    Err(_) => return Err(StreamError::MsgTimeout(self.msg_timeout)),
                }
            }
        };
        let Some(raw) = record else {
            return Ok(None);
        };
        let wire: WireEvent = serde_json::from_slice(&raw).map_err(ProtocolError::Malformed)?;
        let event = wire.into_event()?;
        self.validate(&event)?;
        Ok(Some(event))
    }

    /// Consumes the reader, yielding what the stream reported.
    pub fn into_summary(self) -> StreamSummary {
        self.summary
    }

    fn validate(&mut self, event: &Event) -> Result<(), ProtocolError> {
        if self.summary.run_ended {
            return Err(ProtocolError::EventAfterEnd);
        }
        if !self.run_started && !matches!(event, Event::RunStart { .. }) {
            return Err(ProtocolError::EventBeforeRunStart);
        }
        match event {
            Event::RunStart { names, count, .. } => {
                if self.run_started {
                    return Err(ProtocolError::DuplicateRunStart);
                }
                if *count != names.len() {
                    return Err(ProtocolError::CountMismatch {
                        count: *count,
                        names: names.len(),
                    });
                }
                self.run_started = true;
                self.summary.run_started = true;
                self.summary.expected = names.clone();
            }
            Event::EntityStart { entity, .. } => {
                if self.summary.open.contains(&entity.name) {
                    return Err(ProtocolError::DuplicateEntityStart(entity.name.clone()));
                }
                self.summary.open.push(entity.name.clone());
                self.summary.started.insert(entity.name.clone());
            }
            Event::EntityLog { name, .. } | Event::EntityError { name, .. } => {
                if !self.summary.open.contains(name) {
                    return Err(ProtocolError::EntityNotOpen(name.clone()));
                }
            }
            Event::EntityEnd { name, .. } => {
                let Some(pos) = self.summary.open.iter().position(|n| n == name) else {
                    return Err(ProtocolError::EntityNotOpen(name.clone()));
                };
                self.summary.open.remove(pos);
            }
            Event::RunError { error, .. } => {
                self.summary.run_error = Some(error.clone());
            }
            Event::RunEnd { .. } => {
                if self.summary.run_error.is_some() {
                    return Err(ProtocolError::RunEndAfterRunError);
                }
                self.summary.run_ended = true;
            }
            Event::RunLog { .. } | Event::Heartbeat { .. } => {}
        }
        Ok(())
    }
}

/// Reads one length-prefixed record. `Ok(None)` at clean end of stream.
async fn read_record<R: AsyncRead + Unpin>(
    input: &mut BufReader<R>,
) -> Result<Option<Vec<u8>>, StreamError> {
    let mut prefix = String::new();
    let read = input.read_line(&mut prefix).await?;
    if read == 0 {
        return Ok(None);
    }
    let trimmed = prefix.trim_end();
    let len: usize = trimmed
        .parse()
        .map_err(|_| ProtocolError::BadLengthPrefix(trimmed.to_string()))?;
    if len > MAX_RECORD_LEN {
        return Err(ProtocolError::RecordTooLarge(len).into());
    }
    let mut body = vec![0u8; len];
    input.read_exact(&mut body).await?;
    Ok(Some(body))
}
