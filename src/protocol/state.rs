//! Per-request protocol states.

use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Where a request is in the challenge/response flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    /// Request arrived without a payment.
    NoPayment,
    /// Payment requirements were issued, or a payment answering them arrived.
    Challenged,
    /// The payment is being checked.
    Verifying,
    /// The payment was refused. Terminal.
    Rejected,
    /// The payment passed verification.
    Verified,
    /// The payment is being finalized.
    Settling,
    /// Resource released and payment settled (or free). Terminal.
    Granted,
    /// Resource released although settlement failed. Terminal.
    GrantedWithSettlementFailure,
}

impl ProtocolState {
    /// Whether the flow may move from `self` to `next`.
    ///
    /// `NoPayment -> Granted` covers free resources and
    /// `Settling -> Rejected` covers strict settlement.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NoPayment, Self::Challenged | Self::Granted)
                | (Self::Challenged, Self::Verifying)
                | (Self::Verifying, Self::Rejected | Self::Verified)
                | (Self::Verified, Self::Settling)
                | (
                    Self::Settling,
                    Self::Granted | Self::GrantedWithSettlementFailure | Self::Rejected
                )
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Granted | Self::GrantedWithSettlementFailure
        )
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoPayment => "no_payment",
            Self::Challenged => "challenged",
            Self::Verifying => "verifying",
            Self::Rejected => "rejected",
            Self::Verified => "verified",
            Self::Settling => "settling",
            Self::Granted => "granted",
            Self::GrantedWithSettlementFailure => "granted_with_settlement_failure",
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The states one request passed through, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowTrace {
    resource: String,
    states: Vec<ProtocolState>,
}

impl FlowTrace {
    /// Start a trace for `resource` in `initial`.
    pub fn start(resource: impl Into<String>, initial: ProtocolState) -> Self {
        Self {
            resource: resource.into(),
            states: vec![initial],
        }
    }

    /// Move to `next`.
    pub fn advance(&mut self, next: ProtocolState) {
        let current = self.current();
        debug_assert!(
            current.can_transition_to(next),
            "illegal transition {current} -> {next}"
        );
        debug!("{}: {current} -> {next}", self.resource);
        self.states.push(next);
    }

    /// The latest state.
    #[must_use]
    pub fn current(&self) -> ProtocolState {
        self.states
            .last()
            .copied()
            .unwrap_or(ProtocolState::NoPayment)
    }

    /// Every state visited.
    #[must_use]
    pub fn states(&self) -> &[ProtocolState] {
        &self.states
    }

    /// The resource this flow was for.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }
}
