use chrono::{DateTime, Utc};

use crate::model::Status;

use super::TransitionError;

/// Outcome of a status change the lifecycle accepted.
///
/// At most one of the timestamps is set, and only on the step into its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: Status,
    pub checkin_at: Option<DateTime<Utc>>,
    pub checkout_at: Option<DateTime<Utc>>,
}

impl Transition {
    fn unchanged(status: Status) -> Self {
        Self {
            status,
            checkin_at: None,
            checkout_at: None,
        }
    }

    pub fn is_noop(&self, previous: Status) -> bool {
        self.status == previous
    }
}

/// The reservation status state machine.
///
/// `previous` is `None` for a record being created: whatever was requested, the
/// record starts `pending`. For an existing record, `previous` must be the status
/// read under the same lock that will perform the write. A missing `requested`
/// keeps the previous status.
pub fn apply_status_transition(
    previous: Option<Status>,
    requested: Option<Status>,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    let Some(previous) = previous else {
        return Ok(Transition::unchanged(Status::Pending));
    };
    let Some(requested) = requested else {
        return Ok(Transition::unchanged(previous));
    };
    if requested == previous {
        return Ok(Transition::unchanged(previous));
    }
    if previous.next() != Some(requested) {
        return Err(TransitionError { previous, requested });
    }
    let mut transition = Transition::unchanged(requested);
    match requested {
        Status::CheckedIn => transition.checkin_at = Some(now),
        Status::CheckedOut => transition.checkout_at = Some(now),
        // Never a next step.
        Status::Pending => {}
    }
    Ok(transition)
}
