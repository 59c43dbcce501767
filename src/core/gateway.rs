//! Payment gateway capability.
//!
//! The real processor integration lives outside this crate. The core only needs
//! `charge(amount, currency, metadata) -> {transaction_id, success}`, bounded by a
//! timeout. A timed-out charge is never treated as a success.

use crate::errors::{Error, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Payment gateway result
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Transport-level gateway failure (the charge outcome is unknown).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub message: String,
}

/// A request to charge the student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    pub currency: String,
    /// Opaque key/value pairs forwarded to the processor
    pub metadata: BTreeMap<String, String>,
}

/// What the gateway answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub transaction_id: String,
    pub success: bool,
}

/// Payment gateway trait
///
/// Abstraction over the external payment processor.
pub trait PaymentGateway: Send + Sync {
    /// Charges an amount.
    ///
    /// # Errors
    ///
    /// Returns error if the processor could not be reached
    fn charge(
        &self,
        request: ChargeRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<ChargeReceipt>> + Send + '_>>;
}

/// Simulated gateway that approves every charge after a short delay.
#[derive(Clone, Debug)]
pub struct SimulatedGateway {
    latency: Duration,
}

impl SimulatedGateway {
    #[must_use]
    pub const fn new(latency: Duration) -> Self {
        Self { latency }
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared(latency: Duration) -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new(latency))
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl PaymentGateway for SimulatedGateway {
    fn charge(
        &self,
        request: ChargeRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<ChargeReceipt>> + Send + '_>> {
        Box::pin(async move {
            tokio::time::sleep(self.latency).await;

            let transaction_id = format!("txn_{}", uuid::Uuid::new_v4().simple());
            tracing::info!(
                amount_cents = request.amount_cents,
                currency = %request.currency,
                transaction_id = %transaction_id,
                "Simulated charge approved"
            );

            Ok(ChargeReceipt {
                transaction_id,
                success: true,
            })
        })
    }
}

/// Charges through `gateway`, giving up after `timeout`.
///
/// # Errors
/// - [`Error::UpstreamTimeout`] if the gateway did not answer in time
/// - [`Error::PaymentDeclined`] if the gateway answered with `success = false`
/// - [`Error::Gateway`] on a transport failure
pub async fn charge_with_timeout(
    gateway: &dyn PaymentGateway,
    request: ChargeRequest,
    timeout: Duration,
) -> Result<ChargeReceipt> {
    let amount_cents = request.amount_cents;
    let receipt = match tokio::time::timeout(timeout, gateway.charge(request)).await {
        Err(_) => {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(amount_cents, timeout_ms, "Payment gateway timed out");
            return Err(Error::UpstreamTimeout { timeout_ms });
        }
        Ok(Err(err)) => {
            tracing::error!(amount_cents, error = %err, "Payment gateway failure");
            return Err(Error::Gateway {
                message: err.to_string(),
            });
        }
        Ok(Ok(receipt)) => receipt,
    };

    if !receipt.success {
        tracing::info!(transaction_id = %receipt.transaction_id, "Charge declined");
        return Err(Error::PaymentDeclined {
            transaction_ref: receipt.transaction_id,
        });
    }
    Ok(receipt)
}
