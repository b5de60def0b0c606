//! Record Access Control Point: wire format and the retrieval engine.
//!
//! The engine is a pure state machine. Each call returns a [`Step`]: the
//! request to write to the control point (if any) and the events to surface.
//! Writing the request and routing indications back in is the session's job.
//!
//! ```text
//! get_all:   Idle ─report-number(all)─► AwaitingCount ─count>0─► AwaitingRecords ─code─► Idle
//!                                                     └count=0─► Idle (Completed 0)
//! get_first/get_last/get_since: Idle ─report-stored─► AwaitingRecords ─code─► Idle
//! delete_all: Idle ─delete-stored(all)─► AwaitingDeletion ─code─► Idle
//! abort:     AwaitingCount|AwaitingRecords ─abort(null)─► Aborting ─first code─► Idle
//! ```
//!
//! A response code is only taken as terminal when it names the op code of
//! the outstanding request. While aborting, the abort's own op code is also
//! accepted. Success, no-records-found and procedure-not-completed then end
//! the retrieval as aborted; any other code ends it as failed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{CgmMeasurement, DecodeError};

/// Filter type for sequence-number operands (the CGM time offset).
const FILTER_SEQUENCE_NUMBER: u8 = 0x01;

/// RACP op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Report stored records.
    ReportStoredRecords,
    /// Delete stored records.
    DeleteStoredRecords,
    /// Abort operation.
    AbortOperation,
    /// Report number of stored records.
    ReportNumberOfRecords,
    /// Number of stored records response.
    NumberOfRecordsResponse,
    /// Response code.
    ResponseCode,
}

impl OpCode {
    /// Wire value.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::ReportStoredRecords => 1,
            Self::DeleteStoredRecords => 2,
            Self::AbortOperation => 3,
            Self::ReportNumberOfRecords => 4,
            Self::NumberOfRecordsResponse => 5,
            Self::ResponseCode => 6,
        }
    }

    /// Parse a wire value.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::ReportStoredRecords,
            2 => Self::DeleteStoredRecords,
            3 => Self::AbortOperation,
            4 => Self::ReportNumberOfRecords,
            5 => Self::NumberOfRecordsResponse,
            6 => Self::ResponseCode,
            _ => return None,
        })
    }
}

/// RACP operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// No operator; used by abort.
    Null,
    /// All records.
    All,
    /// Records with sequence number ≤ operand.
    LessOrEqual,
    /// Records with sequence number ≥ operand.
    GreaterOrEqual,
    /// Records within an inclusive range.
    WithinRange,
    /// The oldest record.
    First,
    /// The newest record.
    Last,
}

impl Operator {
    /// Wire value.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::All => 1,
            Self::LessOrEqual => 2,
            Self::GreaterOrEqual => 3,
            Self::WithinRange => 4,
            Self::First => 5,
            Self::Last => 6,
        }
    }

    /// Parse a wire value.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Null,
            1 => Self::All,
            2 => Self::LessOrEqual,
            3 => Self::GreaterOrEqual,
            4 => Self::WithinRange,
            5 => Self::First,
            6 => Self::Last,
            _ => return None,
        })
    }
}

/// Result carried by a response-code indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// 0x01.
    Success,
    /// 0x02.
    OpCodeNotSupported,
    /// 0x03.
    InvalidOperator,
    /// 0x04.
    OperatorNotSupported,
    /// 0x05.
    InvalidOperand,
    /// 0x06.
    NoRecordsFound,
    /// 0x07.
    AbortUnsuccessful,
    /// 0x08.
    ProcedureNotCompleted,
    /// 0x09.
    OperandNotSupported,
    /// Anything else.
    Reserved(u8),
}

impl From<u8> for ResultCode {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Success,
            2 => Self::OpCodeNotSupported,
            3 => Self::InvalidOperator,
            4 => Self::OperatorNotSupported,
            5 => Self::InvalidOperand,
            6 => Self::NoRecordsFound,
            7 => Self::AbortUnsuccessful,
            8 => Self::ProcedureNotCompleted,
            9 => Self::OperandNotSupported,
            other => Self::Reserved(other),
        }
    }
}

impl From<ResultCode> for u8 {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::Success => 1,
            ResultCode::OpCodeNotSupported => 2,
            ResultCode::InvalidOperator => 3,
            ResultCode::OperatorNotSupported => 4,
            ResultCode::InvalidOperand => 5,
            ResultCode::NoRecordsFound => 6,
            ResultCode::AbortUnsuccessful => 7,
            ResultCode::ProcedureNotCompleted => 8,
            ResultCode::OperandNotSupported => 9,
            ResultCode::Reserved(other) => other,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::OpCodeNotSupported => write!(f, "op code not supported"),
            Self::InvalidOperator => write!(f, "invalid operator"),
            Self::OperatorNotSupported => write!(f, "operator not supported"),
            Self::InvalidOperand => write!(f, "invalid operand"),
            Self::NoRecordsFound => write!(f, "no records found"),
            Self::AbortUnsuccessful => write!(f, "abort unsuccessful"),
            Self::ProcedureNotCompleted => write!(f, "procedure not completed"),
            Self::OperandNotSupported => write!(f, "operand not supported"),
            Self::Reserved(code) => write!(f, "reserved result code {code:#04x}"),
        }
    }
}

/// Sequence-number operand of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// One bound, for `≤` and `≥`.
    Single(u16),
    /// Inclusive bounds, for `WithinRange`.
    Range(u16, u16),
}

/// A request written to the control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RacpRequest {
    /// Op code.
    pub opcode: OpCode,
    /// Operator.
    pub operator: Operator,
    /// Sequence-number operand, if the operator takes one.
    pub operand: Option<Operand>,
}

impl RacpRequest {
    const fn new(opcode: OpCode, operator: Operator) -> Self {
        Self {
            opcode,
            operator,
            operand: None,
        }
    }

    /// `[opcode][operator]` optionally followed by `[filter type][operand]`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode.code(), self.operator.code()];
        match self.operand {
            None => {}
            Some(Operand::Single(n)) => {
                out.push(FILTER_SEQUENCE_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Some(Operand::Range(from, to)) => {
                out.push(FILTER_SEQUENCE_NUMBER);
                out.extend_from_slice(&from.to_le_bytes());
                out.extend_from_slice(&to.to_le_bytes());
            }
        }
        out
    }

    /// Parse a request, as a peripheral would.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for unknown codes, an unknown filter type, or
    /// a length that does not match the operator.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        const CONTEXT: &str = "RACP request";
        let invalid = |field, value: u8| DecodeError::InvalidValue {
            context: CONTEXT,
            field,
            value: u32::from(value),
        };
        let [opcode, operator, rest @ ..] = data else {
            return Err(DecodeError::TooShort {
                context: CONTEXT,
                expected: 2,
                actual: data.len(),
            });
        };
        let opcode = OpCode::from_code(*opcode).ok_or_else(|| invalid("op code", *opcode))?;
        let operator =
            Operator::from_code(*operator).ok_or_else(|| invalid("operator", *operator))?;

        let operand = match (operator, rest) {
            (Operator::LessOrEqual | Operator::GreaterOrEqual, [filter, a, b]) => {
                if *filter != FILTER_SEQUENCE_NUMBER {
                    return Err(invalid("filter type", *filter));
                }
                Some(Operand::Single(u16::from_le_bytes([*a, *b])))
            }
            (Operator::WithinRange, [filter, a, b, c, d]) => {
                if *filter != FILTER_SEQUENCE_NUMBER {
                    return Err(invalid("filter type", *filter));
                }
                Some(Operand::Range(
                    u16::from_le_bytes([*a, *b]),
                    u16::from_le_bytes([*c, *d]),
                ))
            }
            (Operator::LessOrEqual | Operator::GreaterOrEqual | Operator::WithinRange, _) => {
                return Err(DecodeError::TooShort {
                    context: CONTEXT,
                    expected: if operator == Operator::WithinRange { 7 } else { 5 },
                    actual: data.len(),
                });
            }
            (_, []) => None,
            (_, rest) => {
                return Err(DecodeError::TrailingBytes {
                    context: CONTEXT,
                    count: rest.len(),
                })
            }
        };
        Ok(Self {
            opcode,
            operator,
            operand,
        })
    }
}

/// An indication received on the control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RacpResponse {
    /// Answer to report-number-of-records.
    NumberOfRecords(u16),
    /// Terminal answer to any other request.
    ResponseCode {
        /// Op code of the request being answered.
        request_opcode: u8,
        /// Outcome.
        result: ResultCode,
    },
}

impl RacpResponse {
    /// Parse a control point indication.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for an unknown op code or a wrong length.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        const CONTEXT: &str = "RACP response";
        match data {
            [5, _, lo, hi] => Ok(Self::NumberOfRecords(u16::from_le_bytes([*lo, *hi]))),
            [6, _, request_opcode, result] => Ok(Self::ResponseCode {
                request_opcode: *request_opcode,
                result: ResultCode::from(*result),
            }),
            [5 | 6, ..] => Err(DecodeError::SizeMismatch {
                context: CONTEXT,
                size: data.len(),
                expected: 4,
            }),
            [opcode, ..] => Err(DecodeError::InvalidValue {
                context: CONTEXT,
                field: "op code",
                value: u32::from(*opcode),
            }),
            [] => Err(DecodeError::TooShort {
                context: CONTEXT,
                expected: 4,
                actual: 0,
            }),
        }
    }

    /// Encode, as a peripheral would.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::NumberOfRecords(count) => {
                let [lo, hi] = count.to_le_bytes();
                vec![OpCode::NumberOfRecordsResponse.code(), 0, lo, hi]
            }
            Self::ResponseCode {
                request_opcode,
                result,
            } => vec![
                OpCode::ResponseCode.code(),
                0,
                request_opcode,
                u8::from(result),
            ],
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// A stored CGM record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// The record's CGM time offset.
    pub sequence_number: u16,
    /// Decoded record.
    pub measurement: CgmMeasurement,
    /// Session start time plus the time offset, when the start time is known.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    /// Record for `measurement`, timestamped against `session_start`.
    #[must_use]
    pub fn new(measurement: CgmMeasurement, session_start: Option<DateTime<Utc>>) -> Self {
        Self {
            sequence_number: measurement.time_offset,
            timestamp: session_start
                .map(|start| start + chrono::Duration::minutes(i64::from(measurement.time_offset))),
            measurement,
        }
    }
}

/// Records keyed by sequence number. Re-inserting a sequence number
/// overwrites the earlier record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordStore {
    records: BTreeMap<u16, Record>,
}

impl RecordStore {
    /// Empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    /// Insert or overwrite.
    pub fn insert(&mut self, record: Record) {
        self.records.insert(record.sequence_number, record);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest stored sequence number.
    #[must_use]
    pub fn highest_sequence(&self) -> Option<u16> {
        self.records.keys().next_back().copied()
    }

    /// Record with sequence number `sequence`.
    #[must_use]
    pub fn get(&self, sequence: u16) -> Option<&Record> {
        self.records.get(&sequence)
    }

    /// Records in sequence order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Remove every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Retrieval phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No retrieval running.
    #[default]
    Idle,
    /// Waiting for the number-of-records response.
    AwaitingCount,
    /// Records are streaming in.
    AwaitingRecords,
    /// Waiting for the delete-stored-records response.
    AwaitingDeletion,
    /// Abort sent; waiting for the first terminal response.
    Aborting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingCount => "awaiting count",
            Self::AwaitingRecords => "awaiting records",
            Self::AwaitingDeletion => "awaiting deletion",
            Self::Aborting => "aborting",
        };
        f.write_str(name)
    }
}

/// Progress or outcome of a retrieval, surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievalEvent {
    /// A request was written.
    Started,
    /// The peripheral reported how many records match.
    CountReported {
        /// Matching records.
        count: u16,
    },
    /// A record arrived and was stored.
    RecordReceived {
        /// The stored record.
        record: Record,
    },
    /// The procedure finished.
    Completed {
        /// Records received during this retrieval.
        records: usize,
    },
    /// The procedure was aborted on request.
    Aborted,
    /// The peripheral does not support the op code.
    NotSupported,
    /// The procedure failed.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

/// A retrieval request that cannot be accepted in the current phase.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RetrievalError {
    /// Another retrieval is running.
    #[error("a record retrieval is already in progress ({0})")]
    Busy(Phase),

    /// Abort is only legal while waiting for a count or for records.
    #[error("nothing to abort ({0})")]
    NotAbortable(Phase),
}

/// Result of feeding the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    /// Request to write to the control point.
    pub request: Option<RacpRequest>,
    /// Events to surface, in order.
    pub events: Vec<RetrievalEvent>,
}

impl Step {
    fn send(request: RacpRequest) -> Self {
        Self {
            request: Some(request),
            events: vec![RetrievalEvent::Started],
        }
    }

    fn emit(event: RetrievalEvent) -> Self {
        Self {
            request: None,
            events: vec![event],
        }
    }
}

/// One retrieval at a time over a session's record store.
#[derive(Debug, Default)]
pub struct RetrievalEngine {
    phase: Phase,
    outstanding: Option<OpCode>,
    abort_requested: bool,
    received: usize,
}

impl RetrievalEngine {
    /// Idle engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: Phase::Idle,
            outstanding: None,
            abort_requested: false,
            received: 0,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether a retrieval is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    const fn ensure_idle(&self) -> Result<(), RetrievalError> {
        match self.phase {
            Phase::Idle => Ok(()),
            phase => Err(RetrievalError::Busy(phase)),
        }
    }

    fn begin(&mut self, phase: Phase, request: RacpRequest) -> Step {
        self.phase = phase;
        self.outstanding = Some(request.opcode);
        self.abort_requested = false;
        self.received = 0;
        Step::send(request)
    }

    /// Ask for the count, then for every record.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::Busy`] if a retrieval is running.
    pub fn get_all(&mut self) -> Result<Step, RetrievalError> {
        self.ensure_idle()?;
        Ok(self.begin(
            Phase::AwaitingCount,
            RacpRequest::new(OpCode::ReportNumberOfRecords, Operator::All),
        ))
    }

    /// Request the oldest record.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::Busy`] if a retrieval is running.
    pub fn get_first(&mut self) -> Result<Step, RetrievalError> {
        self.ensure_idle()?;
        Ok(self.begin(
            Phase::AwaitingRecords,
            RacpRequest::new(OpCode::ReportStoredRecords, Operator::First),
        ))
    }

    /// Request the newest record.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::Busy`] if a retrieval is running.
    pub fn get_last(&mut self) -> Result<Step, RetrievalError> {
        self.ensure_idle()?;
        Ok(self.begin(
            Phase::AwaitingRecords,
            RacpRequest::new(OpCode::ReportStoredRecords, Operator::Last),
        ))
    }

    /// Request every record newer than the newest one in `store`.
    ///
    /// Falls back to [`Self::get_all`] for an empty store. If the store
    /// already holds sequence number `u16::MAX` nothing newer can exist and
    /// the retrieval completes immediately.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::Busy`] if a retrieval is running.
    pub fn get_since(&mut self, store: &RecordStore) -> Result<Step, RetrievalError> {
        self.ensure_idle()?;
        let Some(highest) = store.highest_sequence() else {
            return self.get_all();
        };
        let Some(next) = highest.checked_add(1) else {
            return Ok(Step::emit(RetrievalEvent::Completed { records: 0 }));
        };
        Ok(self.begin(
            Phase::AwaitingRecords,
            RacpRequest {
                opcode: OpCode::ReportStoredRecords,
                operator: Operator::GreaterOrEqual,
                operand: Some(Operand::Single(next)),
            },
        ))
    }

    /// Delete every record on the peripheral.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::Busy`] if a retrieval is running.
    pub fn delete_all(&mut self) -> Result<Step, RetrievalError> {
        self.ensure_idle()?;
        Ok(self.begin(
            Phase::AwaitingDeletion,
            RacpRequest::new(OpCode::DeleteStoredRecords, Operator::All),
        ))
    }

    /// Abort the running retrieval. Records already received are kept.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::NotAbortable`] unless waiting for a count or records.
    pub fn abort(&mut self) -> Result<Step, RetrievalError> {
        match self.phase {
            Phase::AwaitingCount | Phase::AwaitingRecords => {
                self.phase = Phase::Aborting;
                self.abort_requested = true;
                Ok(Step {
                    request: Some(RacpRequest::new(OpCode::AbortOperation, Operator::Null)),
                    events: Vec::new(),
                })
            }
            phase => Err(RetrievalError::NotAbortable(phase)),
        }
    }

    /// Store a record streamed on the measurement characteristic.
    ///
    /// Records arriving outside a retrieval are still stored but raise no
    /// retrieval event.
    pub fn on_record(&mut self, record: Record, store: &mut RecordStore) -> Step {
        store.insert(record.clone());
        match self.phase {
            Phase::AwaitingRecords | Phase::Aborting => {
                self.received += 1;
                Step::emit(RetrievalEvent::RecordReceived { record })
            }
            _ => Step::default(),
        }
    }

    /// Op code of the request the engine is waiting on.
    #[must_use]
    pub const fn outstanding(&self) -> Option<OpCode> {
        self.outstanding
    }

    fn answers_outstanding(&self, request_opcode: u8) -> bool {
        self.outstanding.map(OpCode::code) == Some(request_opcode)
    }

    /// Handle a control point indication.
    pub fn on_response(&mut self, response: RacpResponse, store: &mut RecordStore) -> Step {
        debug!(phase = %self.phase, ?response, "RACP response");
        if let RacpResponse::ResponseCode { request_opcode, .. } = response {
            let answers_abort = self.phase == Phase::Aborting
                && request_opcode == OpCode::AbortOperation.code();
            if self.phase != Phase::Idle
                && !answers_abort
                && !self.answers_outstanding(request_opcode)
            {
                warn!(
                    phase = %self.phase,
                    request_opcode,
                    expected = ?self.outstanding,
                    "RACP response for a different request, dropping"
                );
                return Step::default();
            }
        }
        match (self.phase, response) {
            (Phase::Idle, _) => {
                warn!(?response, "RACP response with no retrieval in progress, dropping");
                Step::default()
            }
            (Phase::Aborting, RacpResponse::NumberOfRecords(_)) => Step::default(),
            (Phase::Aborting, RacpResponse::ResponseCode { result, .. }) => match result {
                ResultCode::Success
                | ResultCode::NoRecordsFound
                | ResultCode::ProcedureNotCompleted => self.finish(RetrievalEvent::Aborted),
                other => self.finish(RetrievalEvent::Failed {
                    reason: other.to_string(),
                }),
            },
            (Phase::AwaitingCount, RacpResponse::NumberOfRecords(0)) => {
                let mut step = self.finish(RetrievalEvent::Completed { records: 0 });
                step.events.insert(0, RetrievalEvent::CountReported { count: 0 });
                step
            }
            (Phase::AwaitingCount, RacpResponse::NumberOfRecords(count)) => {
                self.phase = Phase::AwaitingRecords;
                self.outstanding = Some(OpCode::ReportStoredRecords);
                Step {
                    request: Some(RacpRequest::new(OpCode::ReportStoredRecords, Operator::All)),
                    events: vec![RetrievalEvent::CountReported { count }],
                }
            }
            (_, RacpResponse::NumberOfRecords(count)) => {
                warn!(phase = %self.phase, count, "Unexpected number-of-records response");
                Step::default()
            }
            (phase, RacpResponse::ResponseCode { result, .. }) => {
                let outcome = match result {
                    ResultCode::Success if self.abort_requested => RetrievalEvent::Aborted,
                    ResultCode::Success | ResultCode::NoRecordsFound => {
                        if phase == Phase::AwaitingDeletion {
                            store.clear();
                        }
                        RetrievalEvent::Completed {
                            records: self.received,
                        }
                    }
                    ResultCode::OpCodeNotSupported => RetrievalEvent::NotSupported,
                    other => RetrievalEvent::Failed {
                        reason: other.to_string(),
                    },
                };
                self.finish(outcome)
            }
        }
    }

    /// The control point write for the current request failed terminally.
    pub fn on_write_failed(&mut self, reason: &str) -> Step {
        if self.phase == Phase::Idle {
            return Step::default();
        }
        self.finish(RetrievalEvent::Failed {
            reason: reason.to_string(),
        })
    }

    /// The session went down mid-retrieval.
    pub fn cancel(&mut self) -> Step {
        self.on_write_failed("cancelled")
    }

    fn finish(&mut self, event: RetrievalEvent) -> Step {
        self.phase = Phase::Idle;
        self.outstanding = None;
        self.abort_requested = false;
        self.received = 0;
        Step::emit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SFloat;

    fn record(sequence: u16) -> Record {
        let concentration = SFloat::new(100 + i16::try_from(sequence).unwrap(), 0).unwrap();
        Record::new(CgmMeasurement::new(concentration, sequence), None)
    }

    fn code(request_opcode: OpCode, result: ResultCode) -> RacpResponse {
        RacpResponse::ResponseCode {
            request_opcode: request_opcode.code(),
            result,
        }
    }

    #[test]
    fn test_request_encoding() {
        let request = RacpRequest::new(OpCode::ReportNumberOfRecords, Operator::All);
        assert_eq!(request.encode(), vec![0x04, 0x01]);

        let request = RacpRequest {
            opcode: OpCode::ReportStoredRecords,
            operator: Operator::GreaterOrEqual,
            operand: Some(Operand::Single(0x0102)),
        };
        assert_eq!(request.encode(), vec![0x01, 0x03, 0x01, 0x02, 0x01]);
        assert_eq!(RacpRequest::decode(&request.encode()).unwrap(), request);

        let abort = RacpRequest::new(OpCode::AbortOperation, Operator::Null);
        assert_eq!(abort.encode(), vec![0x03, 0x00]);
    }

    #[test]
    fn test_request_decode_rejects_malformed() {
        assert!(RacpRequest::decode(&[0x01]).is_err());
        assert!(RacpRequest::decode(&[0x09, 0x01]).is_err());
        assert!(RacpRequest::decode(&[0x01, 0x03, 0x01]).is_err());
        assert!(RacpRequest::decode(&[0x01, 0x03, 0x02, 0x00, 0x00]).is_err());
        assert!(RacpRequest::decode(&[0x01, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_response_decoding() {
        assert_eq!(
            RacpResponse::decode(&[0x05, 0x00, 0x2C, 0x01]).unwrap(),
            RacpResponse::NumberOfRecords(300)
        );
        assert_eq!(
            RacpResponse::decode(&[0x06, 0x00, 0x01, 0x06]).unwrap(),
            code(OpCode::ReportStoredRecords, ResultCode::NoRecordsFound)
        );
        assert!(RacpResponse::decode(&[0x06, 0x00, 0x01]).is_err());
        assert!(RacpResponse::decode(&[0x02, 0x00]).is_err());
        assert!(RacpResponse::decode(&[]).is_err());
        assert_eq!(ResultCode::from(0x42), ResultCode::Reserved(0x42));
    }

    #[test]
    fn test_store_overwrites_duplicates() {
        let mut store = RecordStore::new();
        store.insert(record(5));
        store.insert(record(5));
        assert_eq!(store.len(), 1);
        assert_eq!(store.highest_sequence(), Some(5));
    }

    #[test]
    fn test_record_timestamp() {
        let start = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let r = Record::new(CgmMeasurement::new(SFloat::new(90, 0).unwrap(), 15), Some(start));
        assert_eq!(
            r.timestamp.unwrap(),
            DateTime::parse_from_rfc3339("2024-03-01T10:15:00Z").unwrap()
        );
    }

    #[test]
    fn test_get_all_with_zero_count() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();

        let step = engine.get_all().unwrap();
        assert_eq!(step.request.unwrap().opcode, OpCode::ReportNumberOfRecords);
        assert_eq!(step.events, vec![RetrievalEvent::Started]);

        let step = engine.on_response(RacpResponse::NumberOfRecords(0), &mut store);
        assert!(step.request.is_none());
        assert_eq!(
            step.events,
            vec![
                RetrievalEvent::CountReported { count: 0 },
                RetrievalEvent::Completed { records: 0 }
            ]
        );
        assert_eq!(engine.phase(), Phase::Idle);
    }

    #[test]
    fn test_get_all_full_flow() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();
        engine.get_all().unwrap();

        let step = engine.on_response(RacpResponse::NumberOfRecords(2), &mut store);
        assert_eq!(
            step.request,
            Some(RacpRequest::new(OpCode::ReportStoredRecords, Operator::All))
        );
        assert_eq!(engine.phase(), Phase::AwaitingRecords);

        for n in 0..2 {
            let step = engine.on_record(record(n), &mut store);
            assert!(matches!(
                step.events.as_slice(),
                [RetrievalEvent::RecordReceived { record }] if record.sequence_number == n
            ));
        }

        let step = engine.on_response(
            code(OpCode::ReportStoredRecords, ResultCode::Success),
            &mut store,
        );
        assert_eq!(step.events, vec![RetrievalEvent::Completed { records: 2 }]);
        assert_eq!(store.len(), 2);
        assert!(!engine.is_active());
    }

    #[test]
    fn test_one_retrieval_at_a_time() {
        let mut engine = RetrievalEngine::new();
        engine.get_first().unwrap();
        assert_eq!(
            engine.get_last(),
            Err(RetrievalError::Busy(Phase::AwaitingRecords))
        );
        assert!(engine.delete_all().is_err());
    }

    #[test]
    fn test_get_since() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();

        // Empty store degrades to get_all.
        let step = engine.get_since(&store).unwrap();
        assert_eq!(step.request.unwrap().opcode, OpCode::ReportNumberOfRecords);
        engine.cancel();

        for n in 0..=4 {
            store.insert(record(n));
        }
        let step = engine.get_since(&store).unwrap();
        assert_eq!(
            step.request.unwrap().operand,
            Some(Operand::Single(5))
        );
        assert_eq!(step.request.unwrap().encode(), vec![0x01, 0x03, 0x01, 0x05, 0x00]);
    }

    #[test]
    fn test_get_since_at_sequence_limit() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();
        store.insert(Record::new(
            CgmMeasurement::new(SFloat::new(1, 0).unwrap(), u16::MAX),
            None,
        ));
        let step = engine.get_since(&store).unwrap();
        assert!(step.request.is_none());
        assert_eq!(step.events, vec![RetrievalEvent::Completed { records: 0 }]);
        assert!(!engine.is_active());
    }

    #[test]
    fn test_abort_mid_transfer_keeps_records() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();
        engine.get_all().unwrap();
        engine.on_response(RacpResponse::NumberOfRecords(10), &mut store);
        engine.on_record(record(0), &mut store);
        engine.on_record(record(1), &mut store);

        let step = engine.abort().unwrap();
        assert_eq!(step.request.unwrap().encode(), vec![0x03, 0x00]);
        assert_eq!(engine.phase(), Phase::Aborting);

        // A straggler still lands in the store.
        engine.on_record(record(2), &mut store);

        let step = engine.on_response(
            code(OpCode::AbortOperation, ResultCode::Success),
            &mut store,
        );
        assert_eq!(step.events, vec![RetrievalEvent::Aborted]);
        assert_eq!(store.len(), 3);

        // Late terminal response for the earlier request is dropped.
        let step = engine.on_response(
            code(OpCode::ReportStoredRecords, ResultCode::ProcedureNotCompleted),
            &mut store,
        );
        assert!(step.events.is_empty());
    }

    #[test]
    fn test_abort_ignores_count_and_fails_on_error() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();
        engine.get_all().unwrap();
        engine.abort().unwrap();

        let step = engine.on_response(RacpResponse::NumberOfRecords(3), &mut store);
        assert!(step.events.is_empty());
        assert_eq!(engine.phase(), Phase::Aborting);

        let step = engine.on_response(
            code(OpCode::AbortOperation, ResultCode::AbortUnsuccessful),
            &mut store,
        );
        assert!(matches!(step.events.as_slice(), [RetrievalEvent::Failed { .. }]));
    }

    #[test]
    fn test_abort_outcome_per_result_code() {
        let cases = [
            (ResultCode::Success, true),
            (ResultCode::NoRecordsFound, true),
            (ResultCode::ProcedureNotCompleted, true),
            (ResultCode::OpCodeNotSupported, false),
            (ResultCode::InvalidOperator, false),
            (ResultCode::OperatorNotSupported, false),
            (ResultCode::InvalidOperand, false),
            (ResultCode::AbortUnsuccessful, false),
            (ResultCode::OperandNotSupported, false),
            (ResultCode::Reserved(0x42), false),
        ];
        for answering in [OpCode::AbortOperation, OpCode::ReportStoredRecords] {
            for (result, aborted) in cases {
                let mut engine = RetrievalEngine::new();
                let mut store = RecordStore::new();
                engine.get_first().unwrap();
                engine.abort().unwrap();

                let step = engine.on_response(code(answering, result), &mut store);
                let expected = if aborted {
                    RetrievalEvent::Aborted
                } else {
                    RetrievalEvent::Failed {
                        reason: result.to_string(),
                    }
                };
                assert_eq!(step.events, vec![expected], "{answering:?} {result}");
                assert_eq!(engine.phase(), Phase::Idle);
            }
        }
    }

    #[test]
    fn test_late_abort_answer_does_not_end_next_retrieval() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();
        engine.get_all().unwrap();
        engine.on_response(RacpResponse::NumberOfRecords(10), &mut store);
        engine.abort().unwrap();

        let step = engine.on_response(
            code(OpCode::ReportStoredRecords, ResultCode::ProcedureNotCompleted),
            &mut store,
        );
        assert_eq!(step.events, vec![RetrievalEvent::Aborted]);

        engine.get_last().unwrap();
        let step = engine.on_response(
            code(OpCode::AbortOperation, ResultCode::Success),
            &mut store,
        );
        assert!(step.events.is_empty());
        assert_eq!(engine.phase(), Phase::AwaitingRecords);
        assert_eq!(engine.outstanding(), Some(OpCode::ReportStoredRecords));

        engine.on_record(record(9), &mut store);
        let step = engine.on_response(
            code(OpCode::ReportStoredRecords, ResultCode::Success),
            &mut store,
        );
        assert_eq!(step.events, vec![RetrievalEvent::Completed { records: 1 }]);
    }

    #[test]
    fn test_response_for_other_request_is_dropped() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();
        store.insert(record(1));

        engine.delete_all().unwrap();
        let step = engine.on_response(
            code(OpCode::ReportStoredRecords, ResultCode::Success),
            &mut store,
        );
        assert!(step.events.is_empty());
        assert_eq!(engine.phase(), Phase::AwaitingDeletion);
        assert_eq!(store.len(), 1);

        // Abort's op code is only accepted while aborting.
        let step = engine.on_response(
            code(OpCode::AbortOperation, ResultCode::Success),
            &mut store,
        );
        assert!(step.events.is_empty());

        let step = engine.on_response(
            code(OpCode::DeleteStoredRecords, ResultCode::Success),
            &mut store,
        );
        assert_eq!(step.events, vec![RetrievalEvent::Completed { records: 0 }]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_count_phase_tracks_outstanding_request() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();
        engine.get_all().unwrap();
        assert_eq!(engine.outstanding(), Some(OpCode::ReportNumberOfRecords));

        // Count request rejected outright.
        let step = engine.on_response(
            code(OpCode::ReportNumberOfRecords, ResultCode::OpCodeNotSupported),
            &mut store,
        );
        assert_eq!(step.events, vec![RetrievalEvent::NotSupported]);
        assert_eq!(engine.outstanding(), None);
    }

    #[test]
    fn test_abort_only_while_waiting() {
        let mut engine = RetrievalEngine::new();
        assert_eq!(engine.abort(), Err(RetrievalError::NotAbortable(Phase::Idle)));
        engine.delete_all().unwrap();
        assert_eq!(
            engine.abort(),
            Err(RetrievalError::NotAbortable(Phase::AwaitingDeletion))
        );
    }

    #[test]
    fn test_result_code_mapping() {
        let mut store = RecordStore::new();
        let cases = [
            (ResultCode::NoRecordsFound, RetrievalEvent::Completed { records: 0 }),
            (ResultCode::OpCodeNotSupported, RetrievalEvent::NotSupported),
            (
                ResultCode::InvalidOperand,
                RetrievalEvent::Failed {
                    reason: "invalid operand".into(),
                },
            ),
        ];
        for (result, expected) in cases {
            let mut engine = RetrievalEngine::new();
            engine.get_last().unwrap();
            let step = engine.on_response(code(OpCode::ReportStoredRecords, result), &mut store);
            assert_eq!(step.events, vec![expected]);
        }
    }

    #[test]
    fn test_delete_all_clears_store() {
        let mut engine = RetrievalEngine::new();
        let mut store = RecordStore::new();
        store.insert(record(1));

        let step = engine.delete_all().unwrap();
        assert_eq!(step.request.unwrap().encode(), vec![0x02, 0x01]);
        engine.on_response(
            code(OpCode::DeleteStoredRecords, ResultCode::Success),
            &mut store,
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_cancel_and_write_failure() {
        let mut engine = RetrievalEngine::new();
        assert!(engine.cancel().events.is_empty());

        engine.get_first().unwrap();
        let step = engine.cancel();
        assert_eq!(
            step.events,
            vec![RetrievalEvent::Failed {
                reason: "cancelled".into()
            }]
        );
        assert!(!engine.is_active());
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(RetrievalEvent::CountReported { count: 3 }).unwrap();
        assert_eq!(json["kind"], "count_reported");
        assert_eq!(json["count"], 3);
    }
}
