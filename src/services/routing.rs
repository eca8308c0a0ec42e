//! Routing Decision Engine: decides whether a P2P transfer leaves the platform
//! through the provider or lands in the recipient's internal wallet. Pure, no
//! I/O; the caller feeds it a snapshot of the recipient's state.

use uuid::Uuid;

use crate::models::accounts::{Account, Beneficiary};
use crate::models::subscriptions::{SubscriptionSnapshot, SubscriptionStatus};
use crate::models::transactions::{Destination, TransactionType};

pub const DEFAULT_FREE_TRANSFER_LIMIT: i32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("recipient {0} has neither a payout beneficiary nor a wallet")]
    NoDestination(Uuid),
}

#[derive(Clone, Copy, Debug)]
pub struct RecipientState<'a> {
    pub user_id: Uuid,
    pub subscription: SubscriptionSnapshot,
    pub default_beneficiary: Option<&'a Beneficiary>,
    pub main_wallet: Option<&'a Account>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    External {
        beneficiary_id: Uuid,
        /// Counts against the recipient's free allowance.
        metered: bool,
    },
    Internal {
        account_id: Uuid,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingDecision {
    pub route: Route,
    /// The subscription state this decision was computed on.
    pub snapshot: SubscriptionSnapshot,
}

impl RoutingDecision {
    pub fn destination(&self) -> Destination {
        match self.route {
            Route::External { beneficiary_id, .. } => Destination::Beneficiary(beneficiary_id),
            Route::Internal { account_id } => Destination::Account(account_id),
        }
    }

    pub fn kind(&self) -> TransactionType {
        match self.route {
            Route::External { .. } => TransactionType::P2pExternal,
            Route::Internal { .. } => TransactionType::P2pInternal,
        }
    }

    pub fn metered(&self) -> bool {
        matches!(self.route, Route::External { metered: true, .. })
    }

    pub fn is_external(&self) -> bool {
        matches!(self.route, Route::External { .. })
    }
}

/// Paid subscribers always qualify; everyone else until the allowance for the
/// period is used up.
pub fn is_eligible_for_external(subscription: &SubscriptionSnapshot, free_limit: i32) -> bool {
    subscription.status == SubscriptionStatus::Active
        || subscription.period_transfers_used < free_limit
}

pub fn decide(
    recipient: &RecipientState<'_>,
    free_limit: i32,
) -> Result<RoutingDecision, RoutingError> {
    let snapshot = recipient.subscription;

    let route = match (
        is_eligible_for_external(&snapshot, free_limit),
        recipient.default_beneficiary,
        recipient.main_wallet,
    ) {
        (true, Some(beneficiary), _) => Route::External {
            beneficiary_id: beneficiary.id,
            // Lapsed subscriptions fall back to the free tier.
            metered: snapshot.status != SubscriptionStatus::Active,
        },
        // Eligible without a payout target, or over the allowance.
        (_, _, Some(wallet)) => Route::Internal {
            account_id: wallet.id,
        },
        (_, _, None) => return Err(RoutingError::NoDestination(recipient.user_id)),
    };

    Ok(RoutingDecision { route, snapshot })
}
