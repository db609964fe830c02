//! Time-lock helpers for `time_locked` escrows.

use chrono::{DateTime, Duration, Utc};

use crate::escrow::types::{Escrow, EscrowStatus, EscrowVariant};

/// Whether the auto-release sweep may release `escrow` at `now`.
///
/// True iff the escrow is funded, opted into auto-release, has a release
/// date and that date has been reached.
pub fn can_auto_release_at(escrow: &Escrow, now: DateTime<Utc>) -> bool {
    escrow.variant == EscrowVariant::TimeLocked
        && escrow.status == EscrowStatus::Funded
        && escrow.auto_release
        && escrow.release_date.is_some_and(|date| now >= date)
}

pub fn can_auto_release(escrow: &Escrow) -> bool {
    can_auto_release_at(escrow, Utc::now())
}

/// Time left until the release date, `None` once reached or when unset.
pub fn time_until_release(escrow: &Escrow, now: DateTime<Utc>) -> Option<Duration> {
    escrow
        .release_date
        .map(|date| date - now)
        .filter(|left| *left > Duration::zero())
}

/// Whether a pending escrow has outlived its funding window.
pub fn funding_expired_at(escrow: &Escrow, timeout: Option<Duration>, now: DateTime<Utc>) -> bool {
    match timeout {
        Some(timeout) => escrow.status == EscrowStatus::Pending && now >= escrow.created_at + timeout,
        None => false,
    }
}
