//! Single-flight operation queue.
//!
//! Each session owns one [`OperationQueue`]. Operations are issued strictly in
//! FIFO order and at most one is in flight at any time. Every issued attempt
//! gets a fresh [`OperationToken`]; a result carrying any other token is
//! stale and is dropped, so out-of-order callbacks can never complete the
//! wrong operation.
//!
//! The queue never talks to the transport itself. [`OperationQueue::start_next`]
//! hands back an [`Issue`] for the caller to send, and the caller feeds results
//! back through [`OperationQueue::complete`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::gatt::CharacteristicId;
use crate::transport::{OperationError, OperationOutcome, OperationToken};

/// What to do on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Read the characteristic value.
    Read,
    /// Write the characteristic value, with response.
    Write(Vec<u8>),
    /// Write `0x0001` to the CCCD.
    EnableNotifications,
    /// Write `0x0002` to the CCCD.
    EnableIndications,
}

impl OperationKind {
    /// Characteristic and descriptor writes; only these wait for bonding.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Who enqueued an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Part of the setup sequence run after validation.
    Setup {
        /// A required step aborts initialization when it fails.
        required: bool,
    },
    /// A record access control point request.
    RecordAccess,
}

/// One queued wire operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Wire action.
    pub kind: OperationKind,
    /// Characteristic it acts on.
    pub target: CharacteristicId,
    /// Retries left before the operation fails terminally.
    pub retries_left: u8,
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Who enqueued it.
    pub origin: Origin,
}

impl Operation {
    /// Operation with the retry and timeout policy from `config`.
    #[must_use]
    pub fn new(
        kind: OperationKind,
        target: CharacteristicId,
        origin: Origin,
        config: &SessionConfig,
    ) -> Self {
        Self {
            kind,
            target,
            retries_left: config.max_retries,
            timeout: config.operation_timeout(),
            origin,
        }
    }

    /// Whether a terminal failure of this operation aborts initialization.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        matches!(self.origin, Origin::Setup { required: true })
    }
}

/// An attempt the caller must hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Token to pass along and expect back.
    pub token: OperationToken,
    /// Wire action.
    pub kind: OperationKind,
    /// Characteristic it acts on.
    pub target: CharacteristicId,
}

/// What a result did to the in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Done; the next operation may be started.
    Succeeded {
        /// The completed operation.
        operation: Operation,
        /// Value returned by a read.
        value: Option<Vec<u8>>,
    },
    /// A retriable failure; the same operation is re-issued after a backoff.
    Retrying {
        /// Characteristic of the retried operation.
        target: CharacteristicId,
        /// Failure of the last attempt.
        error: OperationError,
        /// Retries left after this one.
        retries_left: u8,
    },
    /// Terminal failure; the operation is dropped.
    Failed {
        /// The failed operation.
        operation: Operation,
        /// Failure of the last attempt.
        error: OperationError,
    },
    /// Authentication failure; the operation waits for bonding.
    Parked {
        /// Characteristic of the parked operation.
        target: CharacteristicId,
    },
}

#[derive(Debug)]
enum SlotState {
    Issued {
        token: OperationToken,
        deadline: Instant,
    },
    BackingOff {
        until: Instant,
    },
    Parked,
}

#[derive(Debug)]
struct Slot {
    operation: Operation,
    attempt: u32,
    state: SlotState,
}

/// FIFO of pending operations plus the one currently owned by the wire.
#[derive(Debug)]
pub struct OperationQueue {
    pending: VecDeque<Operation>,
    current: Option<Slot>,
    next_token: u64,
    backoff: Duration,
}

impl OperationQueue {
    /// Empty queue; retries back off linearly in steps of `backoff`.
    #[must_use]
    pub const fn new(backoff: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            next_token: 1,
            backoff,
        }
    }

    /// Append an operation.
    pub fn enqueue(&mut self, operation: Operation) {
        self.pending.push_back(operation);
    }

    /// Issue the next attempt if the wire is free.
    ///
    /// Starts the head of the queue, or re-issues an operation whose backoff
    /// has elapsed. Returns `None` while an attempt is in flight, a backoff is
    /// running, an operation is parked, or nothing is pending.
    pub fn start_next(&mut self, now: Instant) -> Option<Issue> {
        let slot = match self.current.take() {
            None => Slot {
                operation: self.pending.pop_front()?,
                attempt: 0,
                state: SlotState::Parked,
            },
            Some(Slot {
                operation,
                attempt,
                state: SlotState::BackingOff { until },
            }) if now >= until => Slot {
                operation,
                attempt,
                state: SlotState::Parked,
            },
            Some(other) => {
                self.current = Some(other);
                return None;
            }
        };

        let token = OperationToken(self.next_token);
        self.next_token += 1;
        let issue = Issue {
            token,
            kind: slot.operation.kind.clone(),
            target: slot.operation.target,
        };
        self.current = Some(Slot {
            state: SlotState::Issued {
                token,
                deadline: now + slot.operation.timeout,
            },
            ..slot
        });
        Some(issue)
    }

    /// Feed back the result of an attempt.
    ///
    /// Returns `None` if `token` is not the in-flight attempt.
    pub fn complete(
        &mut self,
        token: OperationToken,
        result: OperationOutcome,
        now: Instant,
    ) -> Option<Completion> {
        match &self.current {
            Some(Slot {
                state: SlotState::Issued { token: current, .. },
                ..
            }) if *current == token => {}
            _ => return None,
        }
        let mut slot = self.current.take()?;

        let error = match result {
            Ok(value) => {
                return Some(Completion::Succeeded {
                    operation: slot.operation,
                    value,
                })
            }
            Err(error) => error,
        };

        if error.is_authentication() && slot.operation.kind.is_write() {
            let target = slot.operation.target;
            slot.state = SlotState::Parked;
            self.current = Some(slot);
            return Some(Completion::Parked { target });
        }

        if error.is_retriable() && slot.operation.retries_left > 0 {
            slot.operation.retries_left -= 1;
            slot.attempt += 1;
            let completion = Completion::Retrying {
                target: slot.operation.target,
                error,
                retries_left: slot.operation.retries_left,
            };
            slot.state = SlotState::BackingOff {
                until: now + self.backoff * slot.attempt,
            };
            self.current = Some(slot);
            return Some(completion);
        }

        Some(Completion::Failed {
            operation: slot.operation,
            error,
        })
    }

    /// Fail the in-flight attempt with [`OperationError::Timeout`] if its
    /// deadline has passed.
    pub fn poll_timeouts(&mut self, now: Instant) -> Option<Completion> {
        match self.current {
            Some(Slot {
                state: SlotState::Issued { token, deadline },
                ..
            }) if now >= deadline => self.complete(token, Err(OperationError::Timeout), now),
            _ => None,
        }
    }

    /// Make a parked operation issuable again. Its retry budget is untouched.
    ///
    /// Returns `false` if nothing was parked.
    pub fn resume_parked(&mut self, now: Instant) -> bool {
        match &mut self.current {
            Some(slot) if matches!(slot.state, SlotState::Parked) => {
                slot.state = SlotState::BackingOff { until: now };
                true
            }
            _ => false,
        }
    }

    /// Drop the parked operation, if any, and return it.
    pub fn abandon_parked(&mut self) -> Option<Operation> {
        if !self.is_parked() {
            return None;
        }
        self.current.take().map(|slot| slot.operation)
    }

    /// Drop everything, in-flight first, and return what was dropped.
    pub fn clear(&mut self) -> Vec<Operation> {
        self.current
            .take()
            .map(|slot| slot.operation)
            .into_iter()
            .chain(self.pending.drain(..))
            .collect()
    }

    /// Nothing pending and nothing owned by the wire.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Whether an operation is waiting for bonding.
    #[must_use]
    pub const fn is_parked(&self) -> bool {
        matches!(
            self.current,
            Some(Slot {
                state: SlotState::Parked,
                ..
            })
        )
    }

    /// Number of attempts currently on the wire: zero or one.
    #[must_use]
    pub const fn in_flight_count(&self) -> usize {
        match self.current {
            Some(Slot {
                state: SlotState::Issued { .. },
                ..
            }) => 1,
            _ => 0,
        }
    }

    /// Number of operations not yet started.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Operations not yet finished: pending plus the current one.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }

    /// When the queue next needs [`Self::poll_timeouts`] or [`Self::start_next`].
    #[must_use]
    pub const fn next_deadline(&self) -> Option<Instant> {
        match self.current {
            Some(Slot {
                state: SlotState::Issued { deadline, .. },
                ..
            }) => Some(deadline),
            Some(Slot {
                state: SlotState::BackingOff { until },
                ..
            }) => Some(until),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{BATTERY_LEVEL, HEART_RATE_MEASUREMENT};

    fn config() -> SessionConfig {
        SessionConfig {
            operation_timeout_ms: 1000,
            max_retries: 2,
            retry_backoff_ms: 100,
        }
    }

    fn queue() -> OperationQueue {
        OperationQueue::new(config().retry_backoff())
    }

    fn read(target: CharacteristicId) -> Operation {
        Operation::new(OperationKind::Read, target, Origin::RecordAccess, &config())
    }

    fn subscribe(target: CharacteristicId) -> Operation {
        Operation::new(
            OperationKind::EnableNotifications,
            target,
            Origin::Setup { required: true },
            &config(),
        )
    }

    #[test]
    fn test_single_flight() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(read(HEART_RATE_MEASUREMENT));
        q.enqueue(read(BATTERY_LEVEL));

        let first = q.start_next(now).unwrap();
        assert_eq!(first.target, HEART_RATE_MEASUREMENT);
        assert!(q.start_next(now).is_none());
        assert_eq!(q.in_flight_count(), 1);
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn test_fifo_and_stale_tokens() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(read(HEART_RATE_MEASUREMENT));
        q.enqueue(read(BATTERY_LEVEL));

        let first = q.start_next(now).unwrap();
        // A result for a token that was never issued is ignored.
        assert!(q
            .complete(OperationToken(first.token.0 + 7), Ok(None), now)
            .is_none());
        assert_eq!(q.in_flight_count(), 1);

        let done = q.complete(first.token, Ok(Some(vec![1])), now).unwrap();
        assert!(matches!(
            done,
            Completion::Succeeded { operation, value: Some(v) }
                if operation.target == HEART_RATE_MEASUREMENT && v == vec![1]
        ));

        // A duplicate of the first result is now stale.
        assert!(q.complete(first.token, Ok(None), now).is_none());

        let second = q.start_next(now).unwrap();
        assert_eq!(second.target, BATTERY_LEVEL);
        assert_ne!(second.token, first.token);
    }

    #[test]
    fn test_retry_uses_linear_backoff_then_fails() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(read(BATTERY_LEVEL));

        let issue = q.start_next(now).unwrap();
        let c = q
            .complete(issue.token, Err(OperationError::Gatt { status: 0x0E }), now)
            .unwrap();
        assert!(matches!(c, Completion::Retrying { retries_left: 1, .. }));
        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(100)));
        assert!(q.start_next(now).is_none());

        let later = now + Duration::from_millis(100);
        let issue = q.start_next(later).unwrap();
        let c = q
            .complete(issue.token, Err(OperationError::Timeout), later)
            .unwrap();
        assert!(matches!(c, Completion::Retrying { retries_left: 0, .. }));
        assert_eq!(q.next_deadline(), Some(later + Duration::from_millis(200)));

        let last = later + Duration::from_millis(200);
        let issue = q.start_next(last).unwrap();
        let c = q
            .complete(issue.token, Err(OperationError::Timeout), last)
            .unwrap();
        assert!(matches!(c, Completion::Failed { error: OperationError::Timeout, .. }));
        assert!(q.is_idle());
    }

    #[test]
    fn test_non_retriable_failure_is_terminal() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(read(BATTERY_LEVEL));
        q.enqueue(read(HEART_RATE_MEASUREMENT));

        let issue = q.start_next(now).unwrap();
        let c = q
            .complete(issue.token, Err(OperationError::Gatt { status: 0x03 }), now)
            .unwrap();
        assert!(matches!(c, Completion::Failed { .. }));
        assert_eq!(q.start_next(now).unwrap().target, HEART_RATE_MEASUREMENT);
    }

    #[test]
    fn test_timeout_polling() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(read(BATTERY_LEVEL));
        let issue = q.start_next(now).unwrap();

        assert!(q.poll_timeouts(now + Duration::from_millis(999)).is_none());
        let c = q.poll_timeouts(now + Duration::from_secs(1)).unwrap();
        assert!(matches!(
            c,
            Completion::Retrying { error: OperationError::Timeout, .. }
        ));
        // The timed-out attempt's token is now stale.
        assert!(q.complete(issue.token, Ok(None), now).is_none());
    }

    #[test]
    fn test_authentication_parks_and_resumes() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(subscribe(BATTERY_LEVEL));
        q.enqueue(read(HEART_RATE_MEASUREMENT));

        let issue = q.start_next(now).unwrap();
        let c = q
            .complete(issue.token, Err(OperationError::InsufficientAuthentication), now)
            .unwrap();
        assert_eq!(c, Completion::Parked { target: BATTERY_LEVEL });
        assert!(q.is_parked());
        assert!(q.start_next(now).is_none());
        assert_eq!(q.next_deadline(), None);

        assert!(q.resume_parked(now));
        let again = q.start_next(now).unwrap();
        assert_eq!(again.target, BATTERY_LEVEL);
        let done = q.complete(again.token, Ok(None), now).unwrap();
        assert!(matches!(
            done,
            Completion::Succeeded { operation, .. } if operation.retries_left == 2
        ));
    }

    #[test]
    fn test_abandon_parked() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(subscribe(BATTERY_LEVEL));
        let issue = q.start_next(now).unwrap();
        q.complete(issue.token, Err(OperationError::Gatt { status: 0x05 }), now);

        assert_eq!(q.abandon_parked().unwrap().target, BATTERY_LEVEL);
        assert!(q.is_idle());
        assert!(q.abandon_parked().is_none());
    }

    #[test]
    fn test_authentication_failure_on_read_is_terminal() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(read(BATTERY_LEVEL));
        q.enqueue(read(HEART_RATE_MEASUREMENT));

        let issue = q.start_next(now).unwrap();
        let c = q
            .complete(issue.token, Err(OperationError::InsufficientAuthentication), now)
            .unwrap();
        assert!(matches!(
            c,
            Completion::Failed { error: OperationError::InsufficientAuthentication, .. }
        ));
        assert!(!q.is_parked());
        assert_eq!(q.start_next(now).unwrap().target, HEART_RATE_MEASUREMENT);
    }

    #[test]
    fn test_required_setup_steps() {
        assert!(subscribe(BATTERY_LEVEL).is_required());
        assert!(!read(BATTERY_LEVEL).is_required());
        assert!(OperationKind::Write(vec![1]).is_write());
        assert!(!OperationKind::Read.is_write());
    }

    #[test]
    fn test_clear_returns_everything() {
        let now = Instant::now();
        let mut q = queue();
        q.enqueue(read(BATTERY_LEVEL));
        q.enqueue(read(HEART_RATE_MEASUREMENT));
        let issue = q.start_next(now).unwrap();

        let dropped = q.clear();
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].target, BATTERY_LEVEL);
        assert!(q.is_idle());
        assert!(q.complete(issue.token, Ok(None), now).is_none());
    }
}
