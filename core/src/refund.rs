//! Refund request lifecycle.

use crate::error::RefundError;
use crate::ids::TransactionId;
use serde::{Deserialize, Serialize};

/// What the storefront's refund flow reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundOutcome {
    /// The refund request was submitted.
    Success,
    /// The user closed the refund sheet without submitting.
    UserCancelled,
    /// The storefront could not submit the request.
    Failed(String),
}

/// State of a refund request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundState {
    /// Awaiting the storefront or the host UI.
    Pending,
    /// The storefront accepted the request.
    Succeeded,
    /// The request ended without a refund being submitted.
    Failed(RefundError),
}

impl RefundState {
    /// Whether no further transition can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl From<RefundOutcome> for RefundState {
    fn from(outcome: RefundOutcome) -> Self {
        match outcome {
            RefundOutcome::Success => Self::Succeeded,
            RefundOutcome::UserCancelled => Self::Failed(RefundError::UserDismissed),
            RefundOutcome::Failed(reason) => Self::Failed(RefundError::SubmissionFailed(reason)),
        }
    }
}

/// A refund request for one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Transaction being refunded.
    pub transaction_id: TransactionId,
    /// Current state.
    pub state: RefundState,
}

impl RefundRequest {
    /// A freshly initiated request.
    #[must_use]
    pub const fn pending(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            state: RefundState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_mapping() {
        assert_eq!(RefundState::from(RefundOutcome::Success), RefundState::Succeeded);
        assert_eq!(
            RefundState::from(RefundOutcome::UserCancelled),
            RefundState::Failed(RefundError::UserDismissed)
        );
        assert_eq!(
            RefundState::from(RefundOutcome::Failed("quota".into())),
            RefundState::Failed(RefundError::SubmissionFailed("quota".into()))
        );
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!RefundState::Pending.is_terminal());
        assert!(RefundState::Succeeded.is_terminal());
        assert!(RefundState::Failed(RefundError::UserDismissed).is_terminal());
    }
}
