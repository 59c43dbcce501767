//! Payment reconciliation - matches a settlement to the enrollments it funds.
//!
//! Two producers feed the same [`reconcile`] operation:
//! - the student-facing flow ([`pay_enrollment`], [`start_checkout`]) charges through the
//!   gateway and reconciles the receipt right away;
//! - the processor's webhook ([`handle_settlement_webhook`]) reports a settlement
//!   for a batch of enrollments, possibly after the synchronous path already ran.
//!
//! Reconciliation is idempotent. An enrollment already past `pending_payment` is
//! left alone, so replaying a transaction reference changes nothing. Each
//! enrollment is advanced in its own transaction, and a failure on one does not
//! stop the others.

use crate::{
    config::settings::Settings,
    core::{
        enrollment::{self as enrollments, enrollment_not_found, transition},
        gateway::{self, ChargeRequest, PaymentGateway},
        identity::{Actor, Role},
        notification::{self, NewNotification, NotificationSink},
        retry::{RetryPolicy, retry_transient},
    },
    entities::{
        Course, Enrollment, EnrollmentState, NotificationKind, Payment, PaymentEnrollment,
        PaymentStatus, course, enrollment, payment, payment_enrollment,
    },
    errors::{Error, Result},
};
use sea_orm::{QuerySelect, Set, TransactionTrait, prelude::*};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A confirmed external settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub transaction_ref: String,
    pub amount_cents: i64,
    pub currency: String,
}

/// Settlement notice delivered by the payment processor's webhook.
///
/// The signature has already been verified by the receiving endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SettlementWebhook {
    pub transaction_id: String,
    pub settled_amount_cents: i64,
    #[serde(default)]
    pub currency: Option<String>,
    pub linked_enrollment_ids: Vec<i64>,
}

/// What happened to one enrollment named by a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Moved from `pending_payment` to `pending_validation_admin`
    Advanced,
    /// Already past `pending_payment`; nothing changed
    AlreadyReconciled,
}

/// Result of reconciling one settlement.
#[derive(Debug)]
pub struct ReconciliationReport {
    pub transaction_ref: String,
    pub payment_id: i64,
    pub payment_status: PaymentStatus,
    /// Per-enrollment results, in the order the enrollments were named
    pub results: Vec<(i64, Result<ReconcileOutcome>)>,
}

impl ReconciliationReport {
    #[must_use]
    pub fn advanced(&self) -> usize {
        self.count(ReconcileOutcome::Advanced)
    }

    #[must_use]
    pub fn already_reconciled(&self) -> usize {
        self.count(ReconcileOutcome::AlreadyReconciled)
    }

    pub fn failures(&self) -> impl Iterator<Item = (i64, &Error)> {
        self.results
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (*id, e)))
    }

    /// Result for one enrollment, if it was part of this settlement.
    #[must_use]
    pub fn outcome_for(&self, enrollment_id: i64) -> Option<&Result<ReconcileOutcome>> {
        self.results
            .iter()
            .find(|(id, _)| *id == enrollment_id)
            .map(|(_, r)| r)
    }

    fn count(&self, outcome: ReconcileOutcome) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(o) if *o == outcome))
            .count()
    }
}

/// Applies a settlement to the named enrollments.
///
/// The payment row is keyed by transaction reference and its figures are written
/// once. When the settled amount does not equal the sum of the enrollments'
/// recorded amounts, the payment is stored as `disputed` and every still-unpaid
/// enrollment fails with [`Error::PaymentMismatch`].
///
/// A replay is checked against the stored row. If it reports a different amount or
/// currency, the row is left as it is and the still-unpaid enrollments fail with
/// [`Error::PaymentMismatch`]. A `disputed` payment becomes `settled` only when its
/// stored amount reconciles with the enrollments the replay names.
///
/// # Errors
/// Only a failure to record the payment itself is returned as `Err`; per-enrollment
/// failures are collected in the report.
pub async fn reconcile(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    policy: RetryPolicy,
    settlement: &Settlement,
    enrollment_ids: &[i64],
) -> Result<ReconciliationReport> {
    let mut seen = HashSet::new();
    let ids: Vec<i64> = enrollment_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect();

    let named = Enrollment::find()
        .filter(enrollment::Column::Id.is_in(ids.iter().copied()))
        .all(db)
        .await?;
    let expected_cents: i64 = named.iter().map(|e| e.amount_cents).sum();

    let (payment, amount_problem) = retry_transient(policy, "record_payment", || {
        record_payment(db, settlement, expected_cents)
    })
    .await?;

    let course_names = course_names(db, &named).await?;

    let mut results = Vec::with_capacity(ids.len());
    for enrollment_id in ids {
        let result = retry_transient(policy, "reconcile_enrollment", || {
            advance(db, payment.id, settlement, enrollment_id, amount_problem.as_deref())
        })
        .await;

        let outcome = match result {
            Ok((outcome, enrollment)) => {
                if outcome == ReconcileOutcome::Advanced {
                    let course_name = course_names
                        .get(&enrollment.course_id)
                        .cloned()
                        .unwrap_or_else(|| format!("course {}", enrollment.course_id));
                    notification::deliver(
                        notifier,
                        NewNotification::for_enrollment(
                            &enrollment.student_id,
                            NotificationKind::PaymentReceived,
                            format!(
                                "Your payment for {course_name} was received. The enrollment is awaiting validation by administration."
                            ),
                            enrollment_id,
                        ),
                    )
                    .await;
                }
                Ok(outcome)
            }
            Err(err) => {
                tracing::warn!(
                    transaction_ref = %settlement.transaction_ref,
                    enrollment_id,
                    error = %err,
                    "Enrollment not reconciled"
                );
                Err(err)
            }
        };
        results.push((enrollment_id, outcome));
    }

    let report = ReconciliationReport {
        transaction_ref: settlement.transaction_ref.clone(),
        payment_id: payment.id,
        payment_status: payment.status,
        results,
    };
    tracing::info!(
        transaction_ref = %report.transaction_ref,
        payment_id = report.payment_id,
        advanced = report.advanced(),
        already_reconciled = report.already_reconciled(),
        failed = report.failures().count(),
        "Settlement reconciled"
    );
    Ok(report)
}

/// Records the payment behind `settlement` and reports why it does not fund the
/// named enrollments, if it does not.
///
/// A concurrent first reconciliation of the same reference may insert the row
/// between our lookup and insert; the losing insert re-reads the winner's row.
async fn record_payment(
    db: &DatabaseConnection,
    settlement: &Settlement,
    expected_cents: i64,
) -> Result<(payment::Model, Option<String>)> {
    match upsert_payment(db, settlement, expected_cents).await {
        Err(err) if err.is_unique_violation() => {
            tracing::debug!(
                transaction_ref = %settlement.transaction_ref,
                "Payment recorded concurrently, reusing the stored row"
            );
            upsert_payment(db, settlement, expected_cents).await
        }
        other => other,
    }
}

async fn upsert_payment(
    db: &DatabaseConnection,
    settlement: &Settlement,
    expected_cents: i64,
) -> Result<(payment::Model, Option<String>)> {
    let txn = db.begin().await?;
    let existing = Payment::find()
        .filter(payment::Column::TransactionRef.eq(settlement.transaction_ref.as_str()))
        .lock_exclusive()
        .one(&txn)
        .await?;

    let now = chrono::Utc::now();
    let recorded = match existing {
        None => {
            let problem = amount_detail(
                settlement.amount_cents,
                &settlement.currency,
                expected_cents,
            );
            let status = if problem.is_some() {
                PaymentStatus::Disputed
            } else {
                PaymentStatus::Settled
            };
            let inserted = payment::ActiveModel {
                transaction_ref: Set(settlement.transaction_ref.clone()),
                amount_cents: Set(settlement.amount_cents),
                currency: Set(settlement.currency.clone()),
                status: Set(status),
                settled_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            (inserted, problem)
        }
        Some(stored)
            if stored.amount_cents != settlement.amount_cents
                || stored.currency != settlement.currency =>
        {
            tracing::warn!(
                transaction_ref = %settlement.transaction_ref,
                reported_cents = settlement.amount_cents,
                reported_currency = %settlement.currency,
                stored_cents = stored.amount_cents,
                stored_currency = %stored.currency,
                "Replay disagrees with the recorded payment, keeping the stored figures"
            );
            let problem = format!(
                "settlement reports {} {} but payment {} recorded {} {}",
                settlement.amount_cents,
                settlement.currency,
                stored.transaction_ref,
                stored.amount_cents,
                stored.currency
            );
            (stored, Some(problem))
        }
        Some(stored) => {
            let problem = amount_detail(stored.amount_cents, &stored.currency, expected_cents);
            if problem.is_none() && stored.status == PaymentStatus::Disputed {
                tracing::info!(
                    transaction_ref = %settlement.transaction_ref,
                    "Disputed payment now reconciles, marking it settled"
                );
                let mut active: payment::ActiveModel = stored.into();
                active.status = Set(PaymentStatus::Settled);
                active.updated_at = Set(now);
                (active.update(&txn).await?, None)
            } else {
                (stored, problem)
            }
        }
    };
    txn.commit().await?;
    Ok(recorded)
}

fn amount_detail(amount_cents: i64, currency: &str, expected_cents: i64) -> Option<String> {
    (amount_cents != expected_cents).then(|| {
        format!("settled {amount_cents} {currency} but the enrollments record {expected_cents} {currency}")
    })
}

async fn advance(
    db: &DatabaseConnection,
    payment_id: i64,
    settlement: &Settlement,
    enrollment_id: i64,
    amount_problem: Option<&str>,
) -> Result<(ReconcileOutcome, enrollment::Model)> {
    let txn = db.begin().await?;
    let current = Enrollment::find_by_id(enrollment_id)
        .lock_exclusive()
        .one(&txn)
        .await?
        .ok_or_else(|| enrollment_not_found(enrollment_id))?;

    match current.state {
        EnrollmentState::PendingValidationAdmin | EnrollmentState::Confirmed => {
            if current.payment_ref.as_deref() != Some(settlement.transaction_ref.as_str()) {
                tracing::warn!(
                    enrollment_id,
                    funded_by = ?current.payment_ref,
                    transaction_ref = %settlement.transaction_ref,
                    "Enrollment already funded by another payment"
                );
            }
            return Ok((ReconcileOutcome::AlreadyReconciled, current));
        }
        EnrollmentState::Pending | EnrollmentState::Cancelled => {
            if current.state == EnrollmentState::Cancelled {
                tracing::warn!(
                    enrollment_id,
                    transaction_ref = %settlement.transaction_ref,
                    "Settlement for a cancelled enrollment, refund must be handled by the payment provider"
                );
            }
            return Err(Error::InvalidState {
                enrollment_id,
                state: current.state,
                expected: "pending_payment",
            });
        }
        EnrollmentState::PendingPayment => {}
    }

    if let Some(detail) = amount_problem {
        return Err(mismatch(settlement, enrollment_id, detail.to_string()));
    }
    if current.currency != settlement.currency {
        return Err(mismatch(
            settlement,
            enrollment_id,
            format!(
                "settled in {} but the enrollment is priced in {}",
                settlement.currency, current.currency
            ),
        ));
    }

    let advanced = transition(
        &txn,
        enrollment_id,
        &[EnrollmentState::PendingPayment],
        EnrollmentState::PendingValidationAdmin,
        Some(&settlement.transaction_ref),
    )
    .await?;
    if !advanced {
        return Err(Error::InvalidState {
            enrollment_id,
            state: current.state,
            expected: "pending_payment",
        });
    }

    if PaymentEnrollment::find_by_id(enrollment_id)
        .one(&txn)
        .await?
        .is_none()
    {
        payment_enrollment::ActiveModel {
            enrollment_id: Set(enrollment_id),
            payment_id: Set(payment_id),
        }
        .insert(&txn)
        .await?;
    }

    let updated = enrollments::get_required(&txn, enrollment_id).await?;
    txn.commit().await?;

    tracing::info!(
        enrollment_id,
        transaction_ref = %settlement.transaction_ref,
        "Enrollment paid, awaiting validation"
    );
    Ok((ReconcileOutcome::Advanced, updated))
}

fn mismatch(settlement: &Settlement, enrollment_id: i64, detail: String) -> Error {
    Error::PaymentMismatch {
        transaction_ref: settlement.transaction_ref.clone(),
        enrollment_id,
        detail,
    }
}

async fn course_names(
    db: &DatabaseConnection,
    enrollments: &[enrollment::Model],
) -> Result<HashMap<i64, String>> {
    let course_ids: HashSet<i64> = enrollments.iter().map(|e| e.course_id).collect();
    let courses = Course::find()
        .filter(course::Column::Id.is_in(course_ids))
        .all(db)
        .await?;
    Ok(courses.into_iter().map(|c| (c.id, c.name)).collect())
}

/// Synchronous confirmation of a single enrollment with a settlement the caller
/// already obtained from the gateway.
///
/// # Errors
/// The enrollment's own reconciliation error, or a failure to record the payment.
pub async fn confirm_payment(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    policy: RetryPolicy,
    enrollment_id: i64,
    settlement: &Settlement,
) -> Result<ReconcileOutcome> {
    let report = reconcile(db, notifier, policy, settlement, &[enrollment_id]).await?;
    report
        .results
        .into_iter()
        .next()
        .map_or_else(|| Err(enrollment_not_found(enrollment_id)), |(_, r)| r)
}

/// Reconciles a settlement webhook payload (JSON).
///
/// # Errors
/// Returns [`Error::Json`] for a malformed payload, otherwise as [`reconcile`].
pub async fn handle_settlement_webhook(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    settings: &Settings,
    payload: &[u8],
) -> Result<ReconciliationReport> {
    let event: SettlementWebhook = serde_json::from_slice(payload)?;
    tracing::debug!(
        transaction_id = %event.transaction_id,
        enrollments = event.linked_enrollment_ids.len(),
        "Settlement webhook received"
    );
    let settlement = Settlement {
        transaction_ref: event.transaction_id,
        amount_cents: event.settled_amount_cents,
        currency: event
            .currency
            .unwrap_or_else(|| settings.default_currency.clone()),
    };
    reconcile(
        db,
        notifier,
        RetryPolicy::from_settings(settings),
        &settlement,
        &event.linked_enrollment_ids,
    )
    .await
}

/// A charge followed by reconciliation.
#[derive(Debug)]
pub struct PaymentConfirmation {
    pub settlement: Settlement,
    pub outcome: ReconcileOutcome,
}

/// Charges the student for one `pending_payment` enrollment and reconciles the receipt.
///
/// On a gateway timeout or decline the enrollment stays `pending_payment` and the
/// error tells the caller to retry.
///
/// # Errors
/// - [`Error::NotFound`] if the enrollment does not belong to the student
/// - [`Error::InvalidState`] if it is not awaiting payment
/// - [`Error::UpstreamTimeout`], [`Error::PaymentDeclined`], [`Error::Gateway`] from the charge
pub async fn pay_enrollment(
    db: &DatabaseConnection,
    gateway: &dyn PaymentGateway,
    notifier: &dyn NotificationSink,
    settings: &Settings,
    actor: &Actor,
    enrollment_id: i64,
) -> Result<PaymentConfirmation> {
    actor.require(Role::Student, "pay_enrollment")?;

    let current = Enrollment::find_by_id(enrollment_id)
        .filter(enrollment::Column::StudentId.eq(actor.user_id.as_str()))
        .one(db)
        .await?
        .ok_or_else(|| enrollment_not_found(enrollment_id))?;
    if current.state != EnrollmentState::PendingPayment {
        return Err(Error::InvalidState {
            enrollment_id,
            state: current.state,
            expected: "pending_payment",
        });
    }

    let settlement = charge(
        gateway,
        settings,
        actor,
        &[enrollment_id],
        current.amount_cents,
        &current.currency,
    )
    .await?;
    let outcome = confirm_payment(
        db,
        notifier,
        RetryPolicy::from_settings(settings),
        enrollment_id,
        &settlement,
    )
    .await
    .inspect_err(|err| {
        tracing::error!(
            enrollment_id,
            transaction_ref = %settlement.transaction_ref,
            error = %err,
            "Charge succeeded but reconciliation failed, replay the settlement"
        );
    })?;

    Ok(PaymentConfirmation {
        settlement,
        outcome,
    })
}

/// Enrolls the student in several courses and pays for them with one charge.
///
/// # Errors
/// Any error from [`enrollments::open_checkout`] or from the charge. After a
/// failed charge the new enrollments remain `pending_payment`.
pub async fn start_checkout(
    db: &DatabaseConnection,
    gateway: &dyn PaymentGateway,
    notifier: &dyn NotificationSink,
    settings: &Settings,
    actor: &Actor,
    course_ids: &[i64],
) -> Result<ReconciliationReport> {
    let created = enrollments::open_checkout(
        db,
        notifier,
        actor,
        course_ids,
        chrono::Utc::now().date_naive(),
    )
    .await?;

    let ids: Vec<i64> = created.iter().map(|e| e.id).collect();
    let total: i64 = created.iter().map(|e| e.amount_cents).sum();
    let currency = created
        .first()
        .map(|e| e.currency.clone())
        .unwrap_or_else(|| settings.default_currency.clone());

    let settlement = charge(gateway, settings, actor, &ids, total, &currency).await?;
    reconcile(
        db,
        notifier,
        RetryPolicy::from_settings(settings),
        &settlement,
        &ids,
    )
    .await
}

async fn charge(
    gateway: &dyn PaymentGateway,
    settings: &Settings,
    actor: &Actor,
    enrollment_ids: &[i64],
    amount_cents: i64,
    currency: &str,
) -> Result<Settlement> {
    let ids = enrollment_ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let metadata = BTreeMap::from([
        ("student_id".to_string(), actor.user_id.clone()),
        ("enrollment_ids".to_string(), ids),
    ]);
    let receipt = gateway::charge_with_timeout(
        gateway,
        ChargeRequest {
            amount_cents,
            currency: currency.to_string(),
            metadata,
        },
        settings.gateway_timeout(),
    )
    .await?;

    Ok(Settlement {
        transaction_ref: receipt.transaction_id,
        amount_cents,
        currency: currency.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::enrollment::get_enrollment;
    use crate::test_utils::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn settlement(reference: &str, amount_cents: i64) -> Settlement {
        Settlement {
            transaction_ref: reference.to_string(),
            amount_cents,
            currency: "PEN".to_string(),
        }
    }

    #[tokio::test]
    async fn test_confirm_payment_advances() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let notifier = RecordingNotifier::default();
        let e = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;

        let outcome = confirm_payment(
            &db,
            &notifier,
            RetryPolicy::none(),
            e.id,
            &settlement("txn_1", course.price_cents),
        )
        .await?;
        assert_eq!(outcome, ReconcileOutcome::Advanced);

        let stored = get_enrollment(&db, e.id).await?.unwrap();
        assert_eq!(stored.state, EnrollmentState::PendingValidationAdmin);
        assert_eq!(stored.payment_ref.as_deref(), Some("txn_1"));

        let link = PaymentEnrollment::find_by_id(e.id).one(&db).await?.unwrap();
        let payment = Payment::find_by_id(link.payment_id).one(&db).await?.unwrap();
        assert_eq!(payment.transaction_ref, "txn_1");
        assert_eq!(payment.status, PaymentStatus::Settled);
        assert_eq!(payment.amount_cents, course.price_cents);

        assert_eq!(notifier.sent()[0].kind, NotificationKind::PaymentReceived);
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let notifier = RecordingNotifier::default();
        let e = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;
        let paid = settlement("txn_1", course.price_cents);

        let first = reconcile(&db, &notifier, RetryPolicy::none(), &paid, &[e.id]).await?;
        let after_first = get_enrollment(&db, e.id).await?.unwrap();
        let second = reconcile(&db, &notifier, RetryPolicy::none(), &paid, &[e.id]).await?;
        let after_second = get_enrollment(&db, e.id).await?.unwrap();

        assert_eq!(first.advanced(), 1);
        assert_eq!(second.advanced(), 0);
        assert_eq!(second.already_reconciled(), 1);
        assert_eq!(first.payment_id, second.payment_id);
        assert_eq!(after_first, after_second);
        assert_eq!(Payment::find().all(&db).await?.len(), 1);
        assert_eq!(notifier.sent().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_batch_with_stale_entry() -> Result<()> {
        let db = setup_test_db().await?;
        let algebra = create_test_course(&db, "Algebra I", 30).await?;
        let physics = create_test_course(&db, "Physics", 30).await?;
        let notifier = RecordingNotifier::default();

        let mut confirmed =
            insert_enrollment(&db, "s1", algebra.id, EnrollmentState::Confirmed).await?;
        let mut active: enrollment::ActiveModel = confirmed.clone().into();
        active.payment_ref = Set(Some("pi_42".to_string()));
        confirmed = active.update(&db).await?;
        let unpaid = insert_enrollment(&db, "s1", physics.id, EnrollmentState::PendingPayment).await?;

        let payload = serde_json::json!({
            "transaction_id": "pi_42",
            "settled_amount_cents": algebra.price_cents + physics.price_cents,
            "linked_enrollment_ids": [confirmed.id, unpaid.id],
        })
        .to_string();

        let report =
            handle_settlement_webhook(&db, &notifier, &Settings::default(), payload.as_bytes())
                .await?;

        assert!(matches!(
            report.outcome_for(confirmed.id),
            Some(Ok(ReconcileOutcome::AlreadyReconciled))
        ));
        assert!(matches!(
            report.outcome_for(unpaid.id),
            Some(Ok(ReconcileOutcome::Advanced))
        ));
        assert_eq!(get_enrollment(&db, confirmed.id).await?.unwrap(), confirmed);
        assert_eq!(
            get_enrollment(&db, unpaid.id).await?.unwrap().state,
            EnrollmentState::PendingValidationAdmin
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_enrollment() -> Result<()> {
        let db = setup_test_db().await?;
        let algebra = create_test_course(&db, "Algebra I", 30).await?;
        let physics = create_test_course(&db, "Physics", 30).await?;
        let notifier = RecordingNotifier::default();

        let cancelled =
            insert_enrollment(&db, "s1", algebra.id, EnrollmentState::Cancelled).await?;
        let unpaid = insert_enrollment(&db, "s1", physics.id, EnrollmentState::PendingPayment).await?;

        let paid = settlement("txn_9", algebra.price_cents + physics.price_cents);
        let report =
            reconcile(&db, &notifier, RetryPolicy::none(), &paid, &[cancelled.id, unpaid.id])
                .await?;

        assert!(matches!(
            report.outcome_for(cancelled.id),
            Some(Err(Error::InvalidState { .. }))
        ));
        assert!(matches!(
            report.outcome_for(unpaid.id),
            Some(Ok(ReconcileOutcome::Advanced))
        ));
        assert_eq!(report.failures().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_amount_mismatch_disputes_payment() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let notifier = RecordingNotifier::default();
        let e = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;

        let short = settlement("txn_short", course.price_cents - 1);
        let result = confirm_payment(&db, &notifier, RetryPolicy::none(), e.id, &short).await;
        assert!(matches!(result, Err(Error::PaymentMismatch { .. })));
        assert_eq!(
            get_enrollment(&db, e.id).await?.unwrap().state,
            EnrollmentState::PendingPayment
        );
        let payment = Payment::find().one(&db).await?.unwrap();
        assert_eq!(payment.status, PaymentStatus::Disputed);

        // A replay reporting other figures for the same reference cannot rewrite the payment
        let rewritten = settlement("txn_short", course.price_cents);
        let report = reconcile(&db, &notifier, RetryPolicy::none(), &rewritten, &[e.id]).await?;
        assert_eq!(report.advanced(), 0);
        assert_eq!(report.payment_status, PaymentStatus::Disputed);
        assert!(matches!(
            report.outcome_for(e.id),
            Some(Err(Error::PaymentMismatch { detail, .. })) if detail.contains("recorded 14999 PEN")
        ));

        let stored = Payment::find().all(&db).await?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].amount_cents, course.price_cents - 1);
        assert_eq!(stored[0].status, PaymentStatus::Disputed);
        assert_eq!(
            get_enrollment(&db, e.id).await?.unwrap().state,
            EnrollmentState::PendingPayment
        );
        assert!(notifier.sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_replay_leaves_settled_payment_alone() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let notifier = RecordingNotifier::default();
        let e = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;

        let paid = settlement("txn_paid", course.price_cents);
        let first = reconcile(&db, &notifier, RetryPolicy::none(), &paid, &[e.id]).await?;
        assert_eq!(first.advanced(), 1);

        let garbled = settlement("txn_paid", 1);
        let replay = reconcile(&db, &notifier, RetryPolicy::none(), &garbled, &[e.id]).await?;
        assert_eq!(replay.payment_status, PaymentStatus::Settled);
        assert_eq!(replay.already_reconciled(), 1);

        let stored = Payment::find().one(&db).await?.unwrap();
        assert_eq!(stored.status, PaymentStatus::Settled);
        assert_eq!(stored.amount_cents, course.price_cents);
        let funded = get_enrollment(&db, e.id).await?.unwrap();
        assert_eq!(funded.state, EnrollmentState::PendingValidationAdmin);
        assert_eq!(funded.payment_ref.as_deref(), Some("txn_paid"));
        Ok(())
    }

    #[tokio::test]
    async fn test_disputed_payment_settles_when_figures_reconcile() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let notifier = RecordingNotifier::default();
        let a = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;
        let b = insert_enrollment(&db, "s2", course.id, EnrollmentState::PendingPayment).await?;

        // One course's price settled against two enrollments
        let single = settlement("txn_single", course.price_cents);
        let batch = reconcile(&db, &notifier, RetryPolicy::none(), &single, &[a.id, b.id]).await?;
        assert_eq!(batch.payment_status, PaymentStatus::Disputed);
        assert_eq!(batch.failures().count(), 2);

        // The processor resends it naming only the enrollment it paid for
        let resent = reconcile(&db, &notifier, RetryPolicy::none(), &single, &[a.id]).await?;
        assert_eq!(resent.payment_status, PaymentStatus::Settled);
        assert_eq!(resent.advanced(), 1);

        let stored = Payment::find().one(&db).await?.unwrap();
        assert_eq!(stored.status, PaymentStatus::Settled);
        assert_eq!(stored.amount_cents, course.price_cents);
        assert_eq!(
            get_enrollment(&db, b.id).await?.unwrap().state,
            EnrollmentState::PendingPayment
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_transaction_ref_is_a_unique_violation() -> Result<()> {
        let db = setup_test_db().await?;
        let now = chrono::Utc::now();
        let row = || payment::ActiveModel {
            transaction_ref: Set("txn_twice".to_string()),
            amount_cents: Set(15_000),
            currency: Set("PEN".to_string()),
            status: Set(PaymentStatus::Settled),
            settled_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        row().insert(&db).await?;

        let err = Error::from(row().insert(&db).await.unwrap_err());
        assert!(err.is_unique_violation());
        assert!(!err.is_transient());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_first_settlements_share_one_payment() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let notifier: Arc<dyn NotificationSink> = Arc::new(RecordingNotifier::default());
        let shared = settlement("txn_shared", course.price_cents);

        let mut handles = Vec::new();
        for n in 0..4 {
            let e = insert_enrollment(
                &db,
                &format!("s{n}"),
                course.id,
                EnrollmentState::PendingPayment,
            )
            .await?;
            let db = db.clone();
            let notifier = Arc::clone(&notifier);
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                reconcile(&db, notifier.as_ref(), RetryPolicy::default(), &shared, &[e.id]).await
            }));
        }

        let mut payment_ids = HashSet::new();
        for handle in handles {
            let report = handle.await.unwrap()?;
            assert_eq!(report.advanced(), 1);
            payment_ids.insert(report.payment_id);
        }
        assert_eq!(payment_ids.len(), 1);
        assert_eq!(Payment::find().all(&db).await?.len(), 1);
        assert_eq!(PaymentEnrollment::find().all(&db).await?.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_currency_mismatch() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let e = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;

        let dollars = Settlement {
            transaction_ref: "txn_usd".to_string(),
            amount_cents: course.price_cents,
            currency: "USD".to_string(),
        };
        let result = confirm_payment(
            &db,
            &RecordingNotifier::default(),
            RetryPolicy::none(),
            e.id,
            &dollars,
        )
        .await;
        assert!(matches!(
            result,
            Err(Error::PaymentMismatch { ref detail, .. }) if detail.contains("USD")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_enrollment_in_batch() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let e = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;

        let report = reconcile(
            &db,
            &RecordingNotifier::default(),
            RetryPolicy::none(),
            &settlement("txn_x", course.price_cents),
            &[e.id, 404, e.id],
        )
        .await?;
        assert_eq!(report.results.len(), 2);
        assert!(matches!(
            report.outcome_for(404),
            Some(Err(Error::NotFound { .. }))
        ));
        assert_eq!(report.advanced(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_webhook() -> Result<()> {
        let db = setup_test_db().await?;
        let result = handle_settlement_webhook(
            &db,
            &RecordingNotifier::default(),
            &Settings::default(),
            b"{\"transaction_id\": 5}",
        )
        .await;
        assert!(matches!(result, Err(Error::Json(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_pay_enrollment_end_to_end() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let notifier = RecordingNotifier::default();
        let gateway = ScriptedGateway::approving("txn_ok");
        let e = crate::core::enrollment::request_enrollment(&db, &notifier, &student("s1"), course.id)
            .await?;

        let paid =
            pay_enrollment(&db, &gateway, &notifier, &Settings::default(), &student("s1"), e.id)
                .await?;
        assert_eq!(paid.outcome, ReconcileOutcome::Advanced);
        assert_eq!(paid.settlement.transaction_ref, "txn_ok");
        assert_eq!(paid.settlement.amount_cents, course.price_cents);

        // A second attempt must not charge again
        let again =
            pay_enrollment(&db, &gateway, &notifier, &Settings::default(), &student("s1"), e.id)
                .await;
        assert!(matches!(again, Err(Error::InvalidState { .. })));
        assert_eq!(gateway.charges(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pay_enrollment_timeout_keeps_pending_payment() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let notifier = RecordingNotifier::default();
        let gateway = crate::core::gateway::SimulatedGateway::new(Duration::from_secs(5));
        let settings = Settings {
            gateway_timeout_ms: 20,
            ..Settings::default()
        };
        let e = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;

        let result = pay_enrollment(&db, &gateway, &notifier, &settings, &student("s1"), e.id).await;
        assert!(matches!(result, Err(Error::UpstreamTimeout { timeout_ms: 20 })));
        assert_eq!(
            get_enrollment(&db, e.id).await?.unwrap().state,
            EnrollmentState::PendingPayment
        );
        assert!(Payment::find().one(&db).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_pay_enrollment_declined() -> Result<()> {
        let (db, course) = setup_with_course(30).await?;
        let gateway = ScriptedGateway::declining("txn_no");
        let e = insert_enrollment(&db, "s1", course.id, EnrollmentState::PendingPayment).await?;

        let result = pay_enrollment(
            &db,
            &gateway,
            &RecordingNotifier::default(),
            &Settings::default(),
            &student("s1"),
            e.id,
        )
        .await;
        assert!(matches!(result, Err(Error::PaymentDeclined { .. })));
        assert_eq!(
            get_enrollment(&db, e.id).await?.unwrap().state,
            EnrollmentState::PendingPayment
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_checkout_pays_all_courses_with_one_charge() -> Result<()> {
        let db = setup_test_db().await?;
        let algebra = create_test_course(&db, "Algebra I", 30).await?;
        let physics = create_test_course(&db, "Physics", 30).await?;
        let gateway = ScriptedGateway::approving("txn_batch");

        let report = start_checkout(
            &db,
            &gateway,
            &RecordingNotifier::default(),
            &Settings::default(),
            &student("s1"),
            &[algebra.id, physics.id],
        )
        .await?;

        assert_eq!(report.advanced(), 2);
        assert_eq!(gateway.charges(), 1);
        assert_eq!(gateway.last_amount(), Some(algebra.price_cents + physics.price_cents));

        let payment = Payment::find_by_id(report.payment_id).one(&db).await?.unwrap();
        let links = PaymentEnrollment::find()
            .filter(payment_enrollment::Column::PaymentId.eq(payment.id))
            .all(&db)
            .await?;
        assert_eq!(links.len(), 2);
        Ok(())
    }
}
