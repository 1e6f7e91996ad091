use drip_core::{SequencerError, SequencerResult};

use crate::types::{EnrollmentStatus, ScheduledEmailStatus};

/// Describes a single valid state transition.
#[derive(Debug, Clone)]
pub struct StateTransition<S> {
    pub from: S,
    pub to: S,
    pub trigger: &'static str,
}

/// Guards a lifecycle by enforcing a finite set of valid transitions.
#[derive(Debug, Clone)]
pub struct StateMachine<S: 'static> {
    transitions: &'static [StateTransition<S>],
}

impl<S: PartialEq + std::fmt::Debug> StateMachine<S> {
    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &S, to: &S) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Checks a transition, returning an error if it is not permitted.
    pub fn check(&self, from: &S, to: &S) -> SequencerResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(SequencerError::InvalidTransition {
                from: format!("{:?}", from),
                to: format!("{:?}", to),
            })
        }
    }

    /// Name of the trigger that moves `from` to `to`, if any.
    pub fn trigger(&self, from: &S, to: &S) -> Option<&'static str> {
        self.transitions
            .iter()
            .find(|t| t.from == *from && t.to == *to)
            .map(|t| t.trigger)
    }
}

const ENROLLMENT_TRANSITIONS: &[StateTransition<EnrollmentStatus>] = &[
    // Active ->
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Paused,
        trigger: "pause",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Completed,
        trigger: "last_step_sent",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Cancelled,
        trigger: "cancel",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Halted,
        trigger: "send_failed",
    },
    // Paused ->
    StateTransition {
        from: EnrollmentStatus::Paused,
        to: EnrollmentStatus::Active,
        trigger: "resume",
    },
    StateTransition {
        from: EnrollmentStatus::Paused,
        to: EnrollmentStatus::Cancelled,
        trigger: "cancel",
    },
    StateTransition {
        from: EnrollmentStatus::Paused,
        to: EnrollmentStatus::Completed,
        trigger: "steps_removed",
    },
    StateTransition {
        from: EnrollmentStatus::Paused,
        to: EnrollmentStatus::Halted,
        trigger: "send_failed",
    },
    // Halted ->
    StateTransition {
        from: EnrollmentStatus::Halted,
        to: EnrollmentStatus::Active,
        trigger: "operator_resolved",
    },
    StateTransition {
        from: EnrollmentStatus::Halted,
        to: EnrollmentStatus::Completed,
        trigger: "operator_skipped_last",
    },
    StateTransition {
        from: EnrollmentStatus::Halted,
        to: EnrollmentStatus::Cancelled,
        trigger: "cancel",
    },
];

const OBLIGATION_TRANSITIONS: &[StateTransition<ScheduledEmailStatus>] = &[
    StateTransition {
        from: ScheduledEmailStatus::Pending,
        to: ScheduledEmailStatus::Claimed,
        trigger: "claim",
    },
    StateTransition {
        from: ScheduledEmailStatus::Pending,
        to: ScheduledEmailStatus::Cancelled,
        trigger: "cancel",
    },
    StateTransition {
        from: ScheduledEmailStatus::Claimed,
        to: ScheduledEmailStatus::Sent,
        trigger: "send_succeeded",
    },
    StateTransition {
        from: ScheduledEmailStatus::Claimed,
        to: ScheduledEmailStatus::Pending,
        trigger: "release_for_retry",
    },
    StateTransition {
        from: ScheduledEmailStatus::Claimed,
        to: ScheduledEmailStatus::Failed,
        trigger: "attempts_exhausted",
    },
    StateTransition {
        from: ScheduledEmailStatus::Claimed,
        to: ScheduledEmailStatus::Cancelled,
        trigger: "suppressed",
    },
];

/// Enrollment lifecycle: active ⇄ paused, active → halted → active, and
/// completed/cancelled as terminal states.
pub fn enrollment_machine() -> StateMachine<EnrollmentStatus> {
    StateMachine {
        transitions: ENROLLMENT_TRANSITIONS,
    }
}

/// ScheduledEmail lifecycle. Only the claim path leaves `pending` other than
/// cancellation, and sent/failed/cancelled are terminal.
pub fn obligation_machine() -> StateMachine<ScheduledEmailStatus> {
    StateMachine {
        transitions: OBLIGATION_TRANSITIONS,
    }
}
