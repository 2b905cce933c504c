//! Consent-driven lifecycle shared by the guard, template store and ledger.
//!
//! ```text
//! Active ──RequestWithdrawal──▶ WithdrawalRequested ──Suspend──▶ Suspended ──Erase──▶ Erased
//!    ▲                                                              │
//!    └──────────────────────────RenewConsent────────────────────────┘
//! ```
//!
//! `Suspended → Active` only happens through a fresh explicit consent
//! event. `Erased` is terminal.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    WithdrawalRequested,
    Suspended,
    Erased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    RequestWithdrawal,
    Suspend,
    RenewConsent,
    Erase,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot apply {event:?} while {from:?}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub event: LifecycleEvent,
}

impl LifecycleState {
    pub fn apply(self, event: LifecycleEvent) -> Result<Self, TransitionError> {
        use LifecycleEvent::*;
        use LifecycleState::*;

        match (self, event) {
            (Active, RequestWithdrawal) => Ok(WithdrawalRequested),
            (WithdrawalRequested, Suspend) => Ok(Suspended),
            (Suspended, RenewConsent) => Ok(Active),
            (Suspended, Erase) => Ok(Erased),
            (from, event) => Err(TransitionError { from, event }),
        }
    }

    /// Events needed to reach `Erased` from here, in order.
    pub fn path_to_erased(self) -> &'static [LifecycleEvent] {
        use LifecycleEvent::*;

        match self {
            LifecycleState::Active => &[RequestWithdrawal, Suspend, Erase],
            LifecycleState::WithdrawalRequested => &[Suspend, Erase],
            LifecycleState::Suspended => &[Erase],
            LifecycleState::Erased => &[],
        }
    }

    /// Events needed to reach `Suspended` from here, in order.
    pub fn path_to_suspended(self) -> &'static [LifecycleEvent] {
        use LifecycleEvent::*;

        match self {
            LifecycleState::Active => &[RequestWithdrawal, Suspend],
            LifecycleState::WithdrawalRequested => &[Suspend],
            LifecycleState::Suspended | LifecycleState::Erased => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::WithdrawalRequested => "withdrawal_requested",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Erased => "erased",
        }
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LifecycleState::Active),
            "withdrawal_requested" => Ok(LifecycleState::WithdrawalRequested),
            "suspended" => Ok(LifecycleState::Suspended),
            "erased" => Ok(LifecycleState::Erased),
            other => Err(format!("unknown lifecycle state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdrawal_path() {
        let s = LifecycleState::Active
            .apply(LifecycleEvent::RequestWithdrawal)
            .and_then(|s| s.apply(LifecycleEvent::Suspend))
            .unwrap();
        assert_eq!(s, LifecycleState::Suspended);
    }

    #[test]
    fn test_active_cannot_skip_to_suspended() {
        let err = LifecycleState::Active.apply(LifecycleEvent::Suspend).unwrap_err();
        assert_eq!(err.from, LifecycleState::Active);
    }

    #[test]
    fn test_renewal_only_from_suspended() {
        assert_eq!(
            LifecycleState::Suspended.apply(LifecycleEvent::RenewConsent),
            Ok(LifecycleState::Active)
        );
        assert!(LifecycleState::WithdrawalRequested
            .apply(LifecycleEvent::RenewConsent)
            .is_err());
        assert!(LifecycleState::Erased.apply(LifecycleEvent::RenewConsent).is_err());
    }

    #[test]
    fn test_erased_is_terminal() {
        for event in [
            LifecycleEvent::RequestWithdrawal,
            LifecycleEvent::Suspend,
            LifecycleEvent::RenewConsent,
            LifecycleEvent::Erase,
        ] {
            assert!(LifecycleState::Erased.apply(event).is_err());
        }
    }

    #[test]
    fn test_path_to_erased_is_walkable() {
        for start in [
            LifecycleState::Active,
            LifecycleState::WithdrawalRequested,
            LifecycleState::Suspended,
        ] {
            let end = start
                .path_to_erased()
                .iter()
                .try_fold(start, |s, e| s.apply(*e))
                .unwrap();
            assert_eq!(end, LifecycleState::Erased);
        }
    }
}
