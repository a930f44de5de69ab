//! Negotiation states and transitions
//!
//! The caller walks `Idle -> OfferCreated -> OfferSent -> AnswerReceived ->
//! Connected`, the callee `Idle -> OfferReceived -> AnswerCreated -> AnswerSent
//! -> Connected`. Any non-terminal state may fail.

use serde::Serialize;

use crate::error::NegotiationError;

/// Which side of the call this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    OfferSent,
    AnswerReceived,
    OfferReceived,
    AnswerCreated,
    AnswerSent,
    Connected,
    Failed,
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateOffer,
    SendOffer,
    ReceiveAnswer,
    ReceiveOffer,
    CreateAnswer,
    SendAnswer,
    Connect,
    Fail,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed)
    }

    /// Apply `step` for a session playing `role`.
    pub fn next(self, role: Role, step: Step) -> Result<Self, NegotiationError> {
        use NegotiationState::*;

        let next = match (role, self, step) {
            (_, s, Step::Fail) if !s.is_terminal() => Failed,

            (Role::Caller, Idle, Step::CreateOffer) => OfferCreated,
            (Role::Caller, OfferCreated, Step::SendOffer) => OfferSent,
            (Role::Caller, OfferSent, Step::ReceiveAnswer) => AnswerReceived,
            (Role::Caller, AnswerReceived, Step::Connect) => Connected,

            (Role::Callee, Idle, Step::ReceiveOffer) => OfferReceived,
            (Role::Callee, OfferReceived, Step::CreateAnswer) => AnswerCreated,
            (Role::Callee, AnswerCreated, Step::SendAnswer) => AnswerSent,
            (Role::Callee, AnswerSent, Step::Connect) => Connected,

            (_, state, step) => return Err(NegotiationError::InvalidTransition { state, step }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationState::*;

    fn walk(role: Role, steps: &[Step]) -> Result<NegotiationState, NegotiationError> {
        steps.iter().try_fold(Idle, |s, step| s.next(role, *step))
    }

    #[test]
    fn caller_happy_path() {
        let end = walk(
            Role::Caller,
            &[Step::CreateOffer, Step::SendOffer, Step::ReceiveAnswer, Step::Connect],
        );
        assert_eq!(end.unwrap(), Connected);
    }

    #[test]
    fn callee_happy_path() {
        let end = walk(
            Role::Callee,
            &[Step::ReceiveOffer, Step::CreateAnswer, Step::SendAnswer, Step::Connect],
        );
        assert_eq!(end.unwrap(), Connected);
    }

    #[test]
    fn answer_without_offer_is_rejected() {
        let err = Idle.next(Role::Caller, Step::ReceiveAnswer).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::InvalidTransition {
                state: Idle,
                step: Step::ReceiveAnswer
            }
        ));
    }

    #[test]
    fn roles_do_not_mix() {
        assert!(Idle.next(Role::Callee, Step::CreateOffer).is_err());
        assert!(Idle.next(Role::Caller, Step::ReceiveOffer).is_err());
    }

    #[test]
    fn any_live_state_can_fail_but_failed_is_final() {
        assert_eq!(OfferSent.next(Role::Caller, Step::Fail).unwrap(), Failed);
        assert_eq!(Connected.next(Role::Callee, Step::Fail).unwrap(), Failed);
        assert!(Failed.next(Role::Caller, Step::Fail).is_err());
        assert!(Failed.next(Role::Caller, Step::Connect).is_err());
    }
}
