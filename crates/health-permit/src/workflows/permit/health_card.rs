use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::domain::{Application, HealthCard, JobCategoryId};
use super::errors::ReviewError;
use super::repository::ReviewStore;
use super::service::PermitReviewService;

const CODE_LENGTH: usize = 12;

/// Build the card for a freshly approved application.
pub fn issue(application: &Application, issued_at: DateTime<Utc>, validity_days: i64) -> HealthCard {
    let serial = application.id.0.simple().to_string();
    let card_number = format!(
        "HC-{}-{}",
        issued_at.format("%Y"),
        serial[..8].to_ascii_uppercase()
    );
    let verification_code = verification_code(&card_number, application, issued_at);
    HealthCard {
        card_number,
        application_id: application.id,
        holder_name: application.form.full_name(),
        job_category_id: application.job_category_id,
        issued_at,
        expires_at: issued_at + Duration::days(validity_days),
        verification_code,
    }
}

/// Truncated SHA-256 over the card's identifying fields, printed on the card.
fn verification_code(card_number: &str, application: &Application, issued_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(card_number.as_bytes());
    hasher.update(b":");
    hasher.update(application.id.0.as_bytes());
    hasher.update(b":");
    hasher.update(issued_at.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..CODE_LENGTH].to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStanding {
    Valid,
    Expired,
}

/// Public answer to "is this card genuine?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardVerification {
    pub card_number: String,
    pub holder_name: String,
    pub job_category: Option<String>,
    pub job_category_id: JobCategoryId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub standing: CardStanding,
}

impl<S> PermitReviewService<S>
where
    S: ReviewStore + 'static,
{
    /// Look up a card by number and printed code. Unknown numbers and wrong codes are both
    /// reported as not found.
    pub fn verify_health_card(
        &self,
        card_number: &str,
        code: &str,
    ) -> Result<CardVerification, ReviewError> {
        let now = self.now();
        let card_number = card_number.trim();
        let code = code.trim();
        let card = self.snapshot(|tables| {
            tables
                .health_cards
                .values()
                .find(|card| {
                    card.card_number.eq_ignore_ascii_case(card_number)
                        && card.verification_code.eq_ignore_ascii_case(code)
                })
                .cloned()
                .ok_or_else(|| ReviewError::not_found("health card", card_number))
        })?;

        Ok(CardVerification {
            job_category: self
                .catalog
                .job_category(&card.job_category_id)
                .map(|category| category.name.clone()),
            standing: if now < card.expires_at {
                CardStanding::Valid
            } else {
                CardStanding::Expired
            },
            card_number: card.card_number,
            holder_name: card.holder_name,
            job_category_id: card.job_category_id,
            issued_at: card.issued_at,
            expires_at: card.expires_at,
        })
    }
}
