use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{Actor, ExtractedFields, Payment, Reservation, ReservationStatus};

/// What the image scorer concluded about a payment screenshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub is_mobile_money_receipt: bool,
    pub confidence: f64,
    pub ocr_text: String,
    pub extracted_fields: ExtractedFields,
    pub warnings: Vec<String>,
}

impl VerificationResult {
    /// Confidence clamped into `[0, 1]`; NaN counts as zero.
    pub fn normalized_confidence(&self) -> f64 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }
}

/// Input to `Ledger::attach_payment`.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub reservation_id: Uuid,
    pub image_ref: String,
    pub verification: VerificationResult,
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    /// Score a stored screenshot. Never called while a ledger lock is held.
    async fn verify(&self, image_ref: &str) -> CoreResult<VerificationResult>;
}

/// Stand-in scorer: uniform confidence in 0.60..1.00, as the mock ML service does.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockPaymentVerifier;

#[async_trait]
impl PaymentVerifier for MockPaymentVerifier {
    async fn verify(&self, image_ref: &str) -> CoreResult<VerificationResult> {
        let (confidence, transaction_digits) = {
            let mut rng = rand::thread_rng();
            let confidence: f64 = rng.gen_range(0.60..1.00);
            (confidence, rng.gen_range(1_000_000_000u64..10_000_000_000u64))
        };
        let confidence = (confidence * 100.0).round() / 100.0;
        let is_receipt = confidence >= crate::policy::CONFIDENCE_THRESHOLD;

        tracing::info!(image_ref, confidence, "Mock payment verification");

        let result = if is_receipt {
            VerificationResult {
                is_mobile_money_receipt: true,
                confidence,
                ocr_text: format!("Transfer successful\nTransaction: VC{}\nAmount: 50", transaction_digits),
                extracted_fields: ExtractedFields {
                    transaction_id: Some(format!("VC{}", transaction_digits)),
                    amount: Some("50".to_string()),
                    from_phone: None,
                    to_phone: None,
                },
                warnings: Vec::new(),
            }
        } else {
            VerificationResult {
                is_mobile_money_receipt: false,
                confidence,
                ocr_text: "Unable to detect a mobile money receipt".to_string(),
                extracted_fields: ExtractedFields::default(),
                warnings: vec!["receipt layout not recognised".to_string()],
            }
        };
        Ok(result)
    }
}

/// Returns the same result for every image.
#[derive(Debug, Clone)]
pub struct StaticPaymentVerifier {
    result: VerificationResult,
}

impl StaticPaymentVerifier {
    pub fn new(result: VerificationResult) -> Self {
        Self { result }
    }

    pub fn with_confidence(confidence: f64) -> Self {
        Self::new(VerificationResult {
            is_mobile_money_receipt: confidence >= crate::policy::CONFIDENCE_THRESHOLD,
            confidence,
            ocr_text: String::new(),
            extracted_fields: ExtractedFields::default(),
            warnings: Vec::new(),
        })
    }
}

#[async_trait]
impl PaymentVerifier for StaticPaymentVerifier {
    async fn verify(&self, _image_ref: &str) -> CoreResult<VerificationResult> {
        Ok(self.result.clone())
    }
}

/// Passengers may only pay for their own hold; admins may attach on their behalf.
pub fn check_submission(reservation: &Reservation, actor: &Actor) -> CoreResult<()> {
    if !actor.is_admin() && actor.id != reservation.passenger_id {
        return Err(CoreError::Forbidden {
            actor_id: actor.id,
            action: "submit payment for another passenger",
        });
    }
    if reservation.status != ReservationStatus::Temporary {
        return Err(CoreError::NotTemporary(reservation.id));
    }
    Ok(())
}

impl NewPayment {
    /// Materialize the stored row. A re-submission keeps the original payment id.
    pub fn into_payment(self, existing_id: Option<Uuid>, now: DateTime<Utc>) -> Payment {
        let confidence = self.verification.normalized_confidence();
        Payment {
            id: existing_id.unwrap_or_else(Uuid::new_v4),
            reservation_id: self.reservation_id,
            image_ref: self.image_ref,
            ai_confidence: confidence,
            ocr_text: self.verification.ocr_text,
            extracted_fields: self.verification.extracted_fields,
            warnings: self.verification.warnings,
            admin_confirmed: None,
            admin_id: None,
            admin_note: None,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_confidence_stays_in_range() {
        let verifier = MockPaymentVerifier;
        for _ in 0..20 {
            let result = verifier.verify("payments/abc.jpg").await.unwrap();
            assert!((0.60..=1.00).contains(&result.confidence));
            assert_eq!(result.is_mobile_money_receipt, result.confidence >= 0.75);
        }
    }

    #[test]
    fn test_confidence_is_normalized() {
        let mut result = StaticPaymentVerifier::with_confidence(1.4).result;
        assert_eq!(result.normalized_confidence(), 1.0);
        result.confidence = f64::NAN;
        assert_eq!(result.normalized_confidence(), 0.0);
    }

    #[test]
    fn test_submission_requires_own_temporary_hold() {
        use crate::models::Role;
        let now = Utc::now();
        let mut reservation =
            Reservation::new_hold(Uuid::new_v4(), Uuid::new_v4(), 1, now, now + chrono::Duration::minutes(20));
        let owner = Actor::new(reservation.passenger_id, Role::Passenger);
        let stranger = Actor::new(Uuid::new_v4(), Role::Passenger);

        assert!(check_submission(&reservation, &owner).is_ok());
        assert!(matches!(check_submission(&reservation, &stranger), Err(CoreError::Forbidden { .. })));

        reservation.status = ReservationStatus::Confirmed;
        assert_eq!(check_submission(&reservation, &owner), Err(CoreError::NotTemporary(reservation.id)));
    }
}
