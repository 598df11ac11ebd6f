use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::models::{BillingFrequency, Escalation};

/// Advances a due timestamp by one billing interval. Month-end dates clamp
/// (Jan 31 + 1 month = Feb 29/28).
pub fn advance_due(frequency: BillingFrequency, from: DateTime<Utc>) -> DateTime<Utc> {
    from + Months::new(frequency.months())
}

/// The billing period an invoice settles, keyed by the due date it was
/// generated for. (obligation_id, period_start) is the invoice idempotency key.
pub fn period_start(due_at: DateTime<Utc>) -> NaiveDate {
    due_at.date_naive()
}

pub fn escalated_amount(amount: Decimal, escalation: &Escalation) -> Decimal {
    match escalation {
        Escalation::None => amount,
        Escalation::Percent(rate) => {
            (amount * (Decimal::ONE_HUNDRED + rate) / Decimal::ONE_HUNDRED).round_dp(4)
        }
        Escalation::Fixed(increment) => (amount + increment).round_dp(4),
    }
}

/// Hours to wait before re-attempting a failed capture: min(2^attempts * 2, 24).
pub fn retry_wait_hours(attempts: i32) -> i64 {
    let shifted = 2i64 << attempts.clamp(0, 6);
    shifted.min(24)
}

/// An invoice past the attempt ceiling is terminal and never auto-retried.
pub fn eligible_for_retry(
    attempts: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    max_attempts: i32,
    as_of: DateTime<Utc>,
) -> bool {
    if attempts >= max_attempts {
        return false;
    }
    match last_attempt_at {
        None => true,
        Some(last) => as_of - last >= Duration::hours(retry_wait_hours(attempts)),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn backoff_doubles_and_caps_at_twenty_four() {
        assert_eq!(retry_wait_hours(0), 2);
        assert_eq!(retry_wait_hours(1), 4);
        assert_eq!(retry_wait_hours(2), 8);
        assert_eq!(retry_wait_hours(3), 16);
        assert_eq!(retry_wait_hours(4), 24);
        assert_eq!(retry_wait_hours(9), 24);
    }

    #[test]
    fn monthly_advance_moves_one_month() {
        let next = advance_due(BillingFrequency::Monthly, at(2024, 1, 1));
        assert_eq!(next, at(2024, 2, 1));
    }

    #[test]
    fn month_end_advance_clamps() {
        let next = advance_due(BillingFrequency::Monthly, at(2024, 1, 31));
        assert_eq!(next, at(2024, 2, 29));
    }

    #[test]
    fn annual_advance_moves_twelve_months() {
        let next = advance_due(BillingFrequency::Annual, at(2024, 3, 15));
        assert_eq!(next, at(2025, 3, 15));
    }

    #[test]
    fn percent_escalation_applies_rate() {
        let amount = escalated_amount(Decimal::new(100, 0), &Escalation::Percent(Decimal::new(5, 0)));
        assert_eq!(amount, Decimal::new(105, 0));
    }

    #[test]
    fn fixed_escalation_adds_increment() {
        let amount = escalated_amount(Decimal::new(9950, 2), &Escalation::Fixed(Decimal::new(250, 2)));
        assert_eq!(amount, Decimal::new(10200, 2));
    }

    #[test]
    fn no_escalation_keeps_amount() {
        let amount = escalated_amount(Decimal::new(100, 0), &Escalation::None);
        assert_eq!(amount, Decimal::new(100, 0));
    }

    #[test]
    fn retry_waits_out_the_backoff_window() {
        let last = at(2024, 1, 1);
        assert!(!eligible_for_retry(1, Some(last), 3, last + Duration::hours(3)));
        assert!(eligible_for_retry(1, Some(last), 3, last + Duration::hours(4)));
    }

    #[test]
    fn retry_ceiling_is_terminal_regardless_of_elapsed_time() {
        let last = at(2024, 1, 1);
        assert!(!eligible_for_retry(3, Some(last), 3, last + Duration::days(365)));
    }

    #[test]
    fn first_attempt_needs_no_wait() {
        assert!(eligible_for_retry(0, None, 3, at(2024, 1, 1)));
    }
}
