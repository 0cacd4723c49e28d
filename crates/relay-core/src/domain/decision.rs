//! Decision model: what to do with a delivery whose processing failed.
//!
//! The Decider is a pure function over (delivery count, failure). The queue
//! consumer executes the decision against the transport.

use super::errors::{ErrorKind, FailureReason};

/// The next action for a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryDecision {
    /// Release the message back to the transport for another attempt.
    Abandon { reason: String },

    /// Give up and route the message to the dead-letter destination.
    DeadLetter { reason: String },
}

impl DeliveryDecision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DeadLetter { .. })
    }
}

pub trait Decider: Send + Sync {
    /// `delivery_count` is 1 for the first delivery of a message.
    fn decide(&self, delivery_count: u32, failure: &FailureReason) -> DeliveryDecision;
}

/// Attempt-bounded redelivery.
///
/// - Malformed bodies and configuration failures are dead-lettered at once
///   (another delivery cannot fix them).
/// - Everything else is abandoned until `max_delivery_attempts` is reached.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    max_delivery_attempts: u32,
}

impl DefaultDecider {
    pub fn new(max_delivery_attempts: u32) -> Self {
        Self {
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, delivery_count: u32, failure: &FailureReason) -> DeliveryDecision {
        if matches!(
            failure.kind,
            ErrorKind::InvalidInput | ErrorKind::Configuration
        ) {
            return DeliveryDecision::DeadLetter {
                reason: format!("{failure} (not retryable)"),
            };
        }
        if delivery_count >= self.max_delivery_attempts {
            DeliveryDecision::DeadLetter {
                reason: format!(
                    "{failure} (max delivery attempts reached: {}/{})",
                    delivery_count, self.max_delivery_attempts
                ),
            }
        } else {
            DeliveryDecision::Abandon {
                reason: format!(
                    "{failure} (attempt {}/{})",
                    delivery_count, self.max_delivery_attempts
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, false)]
    #[case(2, false)]
    #[case(3, true)]
    #[case(7, true)]
    fn bounded_by_max_attempts(#[case] count: u32, #[case] dead: bool) {
        let decider = DefaultDecider::new(3);
        let failure = FailureReason::new(ErrorKind::Unavailable, "down");
        assert_eq!(decider.decide(count, &failure).is_terminal(), dead);
    }

    #[test]
    fn invalid_input_goes_straight_to_dead_letter() {
        let decider = DefaultDecider::new(5);
        let failure = FailureReason::new(ErrorKind::InvalidInput, "bad json");
        let decision = decider.decide(1, &failure);
        assert!(decision.is_terminal());
        match decision {
            DeliveryDecision::DeadLetter { reason } => assert!(reason.contains("bad json")),
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let decider = DefaultDecider::new(0);
        let failure = FailureReason::new(ErrorKind::Timeout, "slow");
        assert!(decider.decide(1, &failure).is_terminal());
    }
}
