//! Push-event adapter for payment processor webhooks.
//!
//! # Responsibility
//! - Authenticate a delivery by HMAC-SHA256 signature before reading it.
//! - Route charge and invoice payment events through the importer.
//! - End sponsorships when their subscription is cancelled.
//!
//! # Invariants
//! - A delivery that fails verification causes no parsing and no writes.
//! - Cancellation never creates donations.
//! - Redelivery is safe: imports are idempotent by charge id and ending an
//!   already-ended sponsorship is a no-op.

use super::CanonicalSource;
use crate::logging::log_field;
use crate::model::record::{
    non_blank, now_epoch_ms, CanonicalRecord, RecordValidationError, STATUS_SUCCEEDED,
};
use crate::repo::ledger_repo::{LedgerRepository, SqliteLedgerRepository};
use crate::repo::RepoError;
use crate::service::importer::{FailureKind, ImportResult, PaymentImporter};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log::{info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::error::Error;
use std::fmt::{Display, Formatter};

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_CHARGE_SUCCEEDED: &str = "charge.succeeded";
pub const EVENT_INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const EVENT_INVOICE_PAID: &str = "invoice.paid";
pub const EVENT_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

const SIGNATURE_SCHEME: &str = "v1";

/// Signature verification failure; the delivery is rejected as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    MissingHeader,
    MalformedHeader,
    MissingSecret,
    TimestampOutsideTolerance { age_secs: i64 },
    Mismatch,
}

impl Display for SignatureError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHeader => write!(f, "signature header is missing"),
            Self::MalformedHeader => write!(f, "signature header is malformed"),
            Self::MissingSecret => write!(f, "no signing secret configured"),
            Self::TimestampOutsideTolerance { age_secs } => {
                write!(f, "signature timestamp is {age_secs}s away from now")
            }
            Self::Mismatch => write!(f, "no signature matches the payload"),
        }
    }
}

impl Error for SignatureError {}

#[derive(Debug)]
pub enum PushError {
    /// Authentication failure; nothing was processed.
    Signature(SignatureError),
    /// Authenticated but unreadable event body.
    Payload(String),
    Repo(RepoError),
}

impl Display for PushError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signature(err) => write!(f, "push delivery rejected: {err}"),
            Self::Payload(msg) => write!(f, "invalid push payload: {msg}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for PushError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Signature(err) => Some(err),
            Self::Payload(_) => None,
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<SignatureError> for PushError {
    fn from(value: SignatureError) -> Self {
        Self::Signature(value)
    }
}

impl From<RepoError> for PushError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// What one authenticated delivery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PushOutcome {
    Import {
        event_id: String,
        result: ImportResult,
    },
    SubscriptionEnded {
        event_id: String,
        subscription_id: String,
        sponsorships_ended: usize,
    },
    Ignored {
        event_id: String,
        event_type: String,
    },
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: Option<i64>,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BillingDetails {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Single successful charge.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    pub amount: i64,
    pub created: Option<i64>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub customer: Option<String>,
    pub invoice: Option<String>,
    pub receipt_email: Option<String>,
    #[serde(default)]
    pub billing_details: BillingDetails,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLine {
    pub description: Option<String>,
}

/// Paid recurring invoice.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    pub charge: Option<String>,
    pub amount_paid: i64,
    pub created: Option<i64>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub customer: Option<String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub subscription: Option<String>,
    #[serde(default)]
    pub lines: InvoiceLines,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionObject {
    id: String,
    ended_at: Option<i64>,
    canceled_at: Option<i64>,
}

impl CanonicalSource for ChargeObject {
    fn to_canonical(&self, now_ms: i64) -> Result<CanonicalRecord, RecordValidationError> {
        let charge_id =
            non_blank(Some(&self.id)).ok_or(RecordValidationError::MissingField("charge_id"))?;
        Ok(CanonicalRecord {
            amount_cents: self.amount,
            payer_name: non_blank(self.billing_details.name.as_deref()),
            payer_email: non_blank(self.billing_details.email.as_deref())
                .or_else(|| non_blank(self.receipt_email.as_deref())),
            occurred_at: epoch_secs_to_ms(self.created, now_ms),
            description_text: non_blank(self.description.as_deref()),
            charge_id,
            customer_id: non_blank(self.customer.as_deref()),
            subscription_id: None,
            invoice_id: non_blank(self.invoice.as_deref()),
            transaction_status: self
                .status
                .as_deref()
                .map(|status| status.trim().to_ascii_lowercase())
                .unwrap_or_else(|| STATUS_SUCCEEDED.to_string()),
        })
    }
}

impl CanonicalSource for InvoiceObject {
    fn to_canonical(&self, now_ms: i64) -> Result<CanonicalRecord, RecordValidationError> {
        let charge_id = non_blank(self.charge.as_deref())
            .ok_or(RecordValidationError::MissingField("charge_id"))?;
        // Multi-child invoices carry one line per child; joining them yields
        // the comma-separated sponsorship text the classifier understands.
        let line_text = self
            .lines
            .data
            .iter()
            .filter_map(|line| non_blank(line.description.as_deref()))
            .collect::<Vec<_>>()
            .join(",");
        let description_text =
            non_blank(Some(&line_text)).or_else(|| non_blank(self.description.as_deref()));
        let transaction_status = match self
            .status
            .as_deref()
            .map(|status| status.trim().to_ascii_lowercase())
        {
            None => STATUS_SUCCEEDED.to_string(),
            Some(status) if status == "paid" => STATUS_SUCCEEDED.to_string(),
            Some(status) => status,
        };

        Ok(CanonicalRecord {
            amount_cents: self.amount_paid,
            payer_name: non_blank(self.customer_name.as_deref()),
            payer_email: non_blank(self.customer_email.as_deref()),
            occurred_at: epoch_secs_to_ms(self.created, now_ms),
            description_text,
            charge_id,
            customer_id: non_blank(self.customer.as_deref()),
            subscription_id: non_blank(self.subscription.as_deref()),
            invoice_id: non_blank(Some(&self.id)),
            transaction_status,
        })
    }
}

/// Authenticates and dispatches push deliveries.
pub struct PushHandler<'a> {
    conn: &'a Connection,
    importer: &'a PaymentImporter<'a>,
    signing_secret: Option<&'a str>,
    tolerance_secs: u64,
}

impl<'a> PushHandler<'a> {
    pub fn new(
        conn: &'a Connection,
        importer: &'a PaymentImporter<'a>,
        signing_secret: Option<&'a str>,
        tolerance_secs: u64,
    ) -> Self {
        Self {
            conn,
            importer,
            signing_secret,
            tolerance_secs,
        }
    }

    /// Handles one delivery using the current wall clock.
    pub fn handle(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<PushOutcome, PushError> {
        self.handle_at(payload, signature_header, now_epoch_ms() / 1000)
    }

    /// Handles one delivery as if received at `now_secs`.
    pub fn handle_at(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now_secs: i64,
    ) -> Result<PushOutcome, PushError> {
        if let Err(err) = self.authenticate(payload, signature_header, now_secs) {
            warn!(
                "event=push_verify module=push status=error error_code=signature_rejected error={}",
                log_field(&err)
            );
            return Err(err.into());
        }

        let envelope: EventEnvelope = serde_json::from_slice(payload)
            .map_err(|err| PushError::Payload(err.to_string()))?;
        let now_ms = now_secs.saturating_mul(1000);
        info!(
            "event=push_receive module=push status=start event_id={} event_type={}",
            envelope.id, envelope.event_type
        );

        match envelope.event_type.as_str() {
            EVENT_CHARGE_SUCCEEDED => {
                let charge: ChargeObject = parse_object(envelope.data.object)?;
                Ok(self.import(envelope.id, &charge, now_ms))
            }
            EVENT_INVOICE_PAYMENT_SUCCEEDED | EVENT_INVOICE_PAID => {
                let invoice: InvoiceObject = parse_object(envelope.data.object)?;
                Ok(self.import(envelope.id, &invoice, now_ms))
            }
            EVENT_SUBSCRIPTION_DELETED => {
                let subscription: SubscriptionObject = parse_object(envelope.data.object)?;
                let ended_at_secs = subscription
                    .ended_at
                    .or(subscription.canceled_at)
                    .or(envelope.created);
                let ended_at = epoch_secs_to_ms(ended_at_secs, now_ms);
                let ended = SqliteLedgerRepository::new(self.conn)
                    .end_sponsorships_by_subscription(&subscription.id, ended_at)?;
                info!(
                    "event=subscription_end module=push status=ok event_id={} subscription_id={} sponsorships_ended={}",
                    envelope.id, subscription.id, ended
                );
                Ok(PushOutcome::SubscriptionEnded {
                    event_id: envelope.id,
                    subscription_id: subscription.id,
                    sponsorships_ended: ended,
                })
            }
            _ => {
                info!(
                    "event=push_receive module=push status=skip event_id={} event_type={}",
                    envelope.id, envelope.event_type
                );
                Ok(PushOutcome::Ignored {
                    event_id: envelope.id,
                    event_type: envelope.event_type,
                })
            }
        }
    }

    fn authenticate(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now_secs: i64,
    ) -> Result<(), SignatureError> {
        let secret = self.signing_secret.ok_or(SignatureError::MissingSecret)?;
        let header = signature_header.ok_or(SignatureError::MissingHeader)?;
        verify_signature(payload, header, secret, self.tolerance_secs, now_secs)
    }

    fn import(&self, event_id: String, source: &impl CanonicalSource, now_ms: i64) -> PushOutcome {
        let result = match source.to_canonical(now_ms) {
            Ok(record) => self.importer.import(&record),
            Err(err) => {
                warn!(
                    "event=push_receive module=push status=error event_id={} error_code=invalid_record error={}",
                    event_id,
                    log_field(&err)
                );
                ImportResult::Failed {
                    kind: FailureKind::Validation,
                    message: err.to_string(),
                }
            }
        };
        PushOutcome::Import { event_id, result }
    }
}

fn parse_object<T: for<'de> Deserialize<'de>>(object: serde_json::Value) -> Result<T, PushError> {
    serde_json::from_value(object).map_err(|err| PushError::Payload(err.to_string()))
}

fn epoch_secs_to_ms(value: Option<i64>, now_ms: i64) -> i64 {
    value
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map_or(now_ms, |at| at.timestamp_millis())
}

/// Verifies a `t=<unix>,v1=<hex>[,v1=<hex>...]` signature header.
///
/// The signed message is `"<t>.<payload>"`. Any matching `v1` entry is
/// accepted so secrets can be rotated. `tolerance_secs == 0` skips the
/// timestamp window.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: u64,
    now_secs: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::MalformedHeader);
        };
        match key {
            "t" => {
                timestamp = Some(value.parse().map_err(|_| SignatureError::MalformedHeader)?);
            }
            SIGNATURE_SCHEME => {
                signatures.push(hex::decode(value).map_err(|_| SignatureError::MalformedHeader)?);
            }
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    if tolerance_secs > 0 {
        let age_secs = now_secs.saturating_sub(timestamp);
        if age_secs.unsigned_abs() > tolerance_secs {
            return Err(SignatureError::TimestampOutsideTolerance { age_secs });
        }
    }

    let mac = signed_mac(payload, secret, timestamp)?;
    if signatures
        .iter()
        .any(|signature| mac.clone().verify_slice(signature).is_ok())
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Builds the signature header a sender would attach to `payload`.
pub fn sign_payload(
    payload: &[u8],
    secret: &str,
    timestamp: i64,
) -> Result<String, SignatureError> {
    let digest = signed_mac(payload, secret, timestamp)?
        .finalize()
        .into_bytes();
    Ok(format!(
        "t={timestamp},{SIGNATURE_SCHEME}={}",
        hex::encode(digest)
    ))
}

fn signed_mac(
    payload: &[u8],
    secret: &str,
    timestamp: i64,
) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::MissingSecret);
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::MissingSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::{sign_payload, verify_signature, SignatureError};

    const SECRET: &str = "whsec_test";
    const PAYLOAD: &[u8] = br#"{"id":"evt_1"}"#;

    #[test]
    fn signed_payload_verifies() {
        let header = sign_payload(PAYLOAD, SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify_signature(PAYLOAD, &header, SECRET, 300, 1_700_000_100),
            Ok(())
        );
    }

    #[test]
    fn tampered_payload_or_wrong_secret_is_rejected() {
        let header = sign_payload(PAYLOAD, SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify_signature(br#"{"id":"evt_2"}"#, &header, SECRET, 0, 0),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(PAYLOAD, &header, "whsec_other", 0, 0),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected_unless_window_disabled() {
        let header = sign_payload(PAYLOAD, SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify_signature(PAYLOAD, &header, SECRET, 300, 1_700_001_000),
            Err(SignatureError::TimestampOutsideTolerance { age_secs: 1_000 })
        );
        assert_eq!(
            verify_signature(PAYLOAD, &header, SECRET, 0, 1_700_001_000),
            Ok(())
        );
    }

    #[test]
    fn any_matching_signature_entry_is_accepted() {
        let good = sign_payload(PAYLOAD, SECRET, 10).unwrap();
        let good_sig = good.split_once(",v1=").map(|(_, sig)| sig).unwrap();
        let header = format!("t=10,v1={},v1={good_sig}", "00".repeat(32));
        assert_eq!(verify_signature(PAYLOAD, &header, SECRET, 0, 0), Ok(()));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in ["", "v1=abcd", "t=abc,v1=00", "t=10", "t=10,v1=zz", "garbage"] {
            assert_eq!(
                verify_signature(PAYLOAD, header, SECRET, 0, 0),
                Err(SignatureError::MalformedHeader),
                "header `{header}` should be malformed"
            );
        }
    }
}
