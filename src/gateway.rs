use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{ChargeStatus, Minor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReceipt {
    pub transaction_reference: String,
    pub status: ChargeStatus,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("declined: {0}")]
    Declined(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl From<GatewayError> for EngineError {
    fn from(e: GatewayError) -> Self {
        EngineError::Gateway(e.to_string())
    }
}

/// Moves money for a booking. Called while the booking's service is locked,
/// so implementations should answer promptly.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Short label stored on each payment row.
    fn name(&self) -> String;

    async fn charge(&self, booking_id: Ulid, amount: Minor) -> Result<GatewayReceipt, GatewayError>;

    async fn refund(&self, booking_id: Ulid, amount: Minor) -> Result<GatewayReceipt, GatewayError>;
}

/// Records offline payments (cash, card terminal) as settled immediately.
#[derive(Debug, Default)]
pub struct ManualGateway;

#[async_trait]
impl PaymentGateway for ManualGateway {
    fn name(&self) -> String {
        "manual".into()
    }

    async fn charge(&self, _booking_id: Ulid, amount: Minor) -> Result<GatewayReceipt, GatewayError> {
        if amount <= 0 {
            return Err(GatewayError::Declined(format!("cannot charge {amount}")));
        }
        Ok(GatewayReceipt {
            transaction_reference: format!("manual-{}", Ulid::new()),
            status: ChargeStatus::Completed,
        })
    }

    async fn refund(&self, _booking_id: Ulid, amount: Minor) -> Result<GatewayReceipt, GatewayError> {
        if amount <= 0 {
            return Err(GatewayError::Declined(format!("cannot refund {amount}")));
        }
        Ok(GatewayReceipt {
            transaction_reference: format!("manual-refund-{}", Ulid::new()),
            status: ChargeStatus::Completed,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn manual_gateway_settles_immediately() {
        let gw = ManualGateway;
        let receipt = assert_ok!(gw.charge(Ulid::new(), 5400).await);
        assert_eq!(receipt.status, ChargeStatus::Completed);
        assert!(receipt.transaction_reference.starts_with("manual-"));

        let other = assert_ok!(gw.charge(Ulid::new(), 5400).await);
        assert_ne!(receipt.transaction_reference, other.transaction_reference);
    }

    #[tokio::test]
    async fn manual_gateway_rejects_non_positive_amounts() {
        let gw = ManualGateway;
        assert_err!(gw.charge(Ulid::new(), 0).await);
        assert_err!(gw.refund(Ulid::new(), -5).await);
    }

    #[test]
    fn gateway_errors_map_to_engine_errors() {
        let e: EngineError = GatewayError::Declined("insufficient funds".into()).into();
        assert!(matches!(e, EngineError::Gateway(ref m) if m.contains("insufficient funds")));
    }
}
