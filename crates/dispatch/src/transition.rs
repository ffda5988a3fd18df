//! Status transition state machine.
//!
//! Deterministic and side-effect free: no storage, no clock, no config.
//! Every writer consults this before changing a message's status, so the
//! rules live in exactly one place.
//!
//! Valid transitions:
//! - PENDING   -> SENT, DELIVERED, FAILED, RETRYING
//! - SCHEDULED -> PENDING, FAILED
//! - RETRYING  -> PENDING, FAILED
//! - SENT      -> DELIVERED, FAILED
//! - FAILED    -> RETRYING, PENDING
//! - DELIVERED, BOUNCED, REJECTED -> (terminal, nothing)
//!
//! Same-state writes are always valid no-ops, including on terminal states.

use courier_common::error::AppError;
use courier_common::types::DeliveryStatus;

/// Check whether a status transition is allowed.
pub fn is_valid_transition(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    use DeliveryStatus::*;

    // Same status is always valid (no-op write)
    if from == to {
        return true;
    }

    if from.is_terminal() {
        tracing::warn!(
            from = %from,
            to = %to,
            "Invalid status transition attempted from terminal state"
        );
        return false;
    }

    let allowed = match (from, to) {
        (Pending, Sent | Delivered | Failed | Retrying) => true,
        (Scheduled, Pending | Failed) => true,
        (Retrying, Pending | Failed) => true,
        (Sent, Delivered | Failed) => true,
        (Failed, Retrying | Pending) => true,
        _ => false,
    };

    if !allowed {
        tracing::warn!(from = %from, to = %to, "Invalid status transition attempted");
    }
    allowed
}

/// Assert that a status transition is valid.
pub fn assert_valid_transition(from: DeliveryStatus, to: DeliveryStatus) -> Result<(), AppError> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeliveryStatus::*;

    /// The full allow-table: (from, every allowed distinct to).
    const ALLOWED: &[(DeliveryStatus, &[DeliveryStatus])] = &[
        (Pending, &[Sent, Delivered, Failed, Retrying]),
        (Scheduled, &[Pending, Failed]),
        (Retrying, &[Pending, Failed]),
        (Sent, &[Delivered, Failed]),
        (Failed, &[Retrying, Pending]),
        (Delivered, &[]),
        (Bounced, &[]),
        (Rejected, &[]),
    ];

    #[test]
    fn test_exhaustive_transition_grid() {
        for from in DeliveryStatus::ALL {
            let allowed = ALLOWED
                .iter()
                .find(|(f, _)| *f == from)
                .map(|(_, tos)| *tos)
                .unwrap();

            for to in DeliveryStatus::ALL {
                let expected = from == to || allowed.contains(&to);
                assert_eq!(
                    is_valid_transition(from, to),
                    expected,
                    "transition {} -> {} expected {}",
                    from,
                    to,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_same_state_is_always_valid() {
        for status in DeliveryStatus::ALL {
            assert!(is_valid_transition(status, status));
        }
    }

    #[test]
    fn test_terminal_states_reject_every_distinct_target() {
        for from in [Delivered, Bounced, Rejected] {
            for to in DeliveryStatus::ALL {
                if to != from {
                    assert!(
                        !is_valid_transition(from, to),
                        "{} -> {} should be rejected",
                        from,
                        to
                    );
                }
            }
        }
    }

    #[test]
    fn test_delivered_cannot_regress_to_failed() {
        assert!(!is_valid_transition(Delivered, Failed));
        assert!(!is_valid_transition(Delivered, Retrying));
        assert!(!is_valid_transition(Delivered, Pending));
    }

    #[test]
    fn test_assert_returns_typed_error() {
        let err = assert_valid_transition(Delivered, Failed).unwrap_err();
        match err {
            AppError::InvalidTransition { from, to } => {
                assert_eq!(from, Delivered);
                assert_eq!(to, Failed);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
