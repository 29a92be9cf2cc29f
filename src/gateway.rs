//! Remote mutation gateway.
//!
//! The only path by which a sale reaches the admin dashboard. Wraps the
//! backend collaborator with a hard timeout and sorts every failure into
//! `Transient` (retry later, unchanged) or `Rejected` (dead-letter, never
//! retried automatically).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{AuthorityError, SubmissionError};
use crate::model::{is_local_id, CanonicalTransaction, Transaction};

/// Backend operation that turns a local sale into the authoritative record.
///
/// Implementations should pass `transaction.local_id` to the server as an
/// idempotency key.
#[async_trait]
pub trait TransactionAuthority: Send + Sync {
    async fn create_authoritative_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<CanonicalTransaction, AuthorityError>;
}

pub struct RemoteMutationGateway {
    authority: Arc<dyn TransactionAuthority>,
    timeout: Duration,
}

impl RemoteMutationGateway {
    pub fn new(authority: Arc<dyn TransactionAuthority>, timeout: Duration) -> Self {
        Self { authority, timeout }
    }

    /// Submit one transaction and wait at most `timeout` for the canonical
    /// result.
    pub async fn submit(
        &self,
        transaction: &Transaction,
    ) -> Result<CanonicalTransaction, SubmissionError> {
        let call = self.authority.create_authoritative_transaction(transaction);
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    local_id = %transaction.local_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Transaction submission timed out"
                );
                return Err(SubmissionError::Transient {
                    message: format!(
                        "Submission timed out after {}ms",
                        self.timeout.as_millis()
                    ),
                    retry_after: None,
                });
            }
        };

        match result {
            Ok(mut canonical) => {
                if canonical.server_id.trim().is_empty() || is_local_id(&canonical.server_id) {
                    // Accepted but unusable; the idempotency key makes the retry safe.
                    return Err(SubmissionError::Transient {
                        message: format!(
                            "Server returned an unusable transaction id {:?}",
                            canonical.server_id
                        ),
                        retry_after: None,
                    });
                }
                if canonical.local_id != transaction.local_id {
                    warn!(
                        local_id = %transaction.local_id,
                        echoed = %canonical.local_id,
                        "Server echoed a different local id, keeping ours"
                    );
                    canonical.local_id = transaction.local_id.clone();
                }
                debug!(
                    local_id = %transaction.local_id,
                    server_id = %canonical.server_id,
                    "Transaction accepted by admin dashboard"
                );
                Ok(canonical)
            }
            Err(err) => Err(classify(&err)),
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn is_backpressure_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("http 429")
        || lower.contains("status 429")
        || lower.contains("queue is backed up")
        || lower.contains("retry later")
}

/// Messages the server uses when it refuses the payload itself.
fn is_permanent_submission_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("validation failed")
        || lower.contains("invalid product")
        || lower.contains("product not found")
        || lower.contains("invalid customer")
        || lower.contains("customer not found in organization")
        || lower.contains("total mismatch")
        || lower.contains("totals do not match")
        || lower.contains("payment amount mismatch")
        || lower.contains("missing required parameter")
        || lower.contains("branch access denied")
}

/// Sort a backend failure into retry-later or never-retry.
///
/// 401/403 mean the terminal's credentials are bad, not the sale, so they stay
/// transient: the sale must survive until the session is fixed. Anything the
/// server did not clearly refuse is treated as transient.
pub fn classify(err: &AuthorityError) -> SubmissionError {
    let retry_after = err.retry_after_secs.map(Duration::from_secs);
    let transient = |message: &str| SubmissionError::Transient {
        message: message.to_string(),
        retry_after,
    };

    match err.status {
        Some(401 | 403 | 408 | 425 | 429) => transient(&err.message),
        Some(status) if status >= 500 => transient(&err.message),
        Some(status) if (400..500).contains(&status) => SubmissionError::Rejected {
            message: err.message.clone(),
            status: Some(status),
        },
        _ if is_backpressure_error(&err.message) => transient(&err.message),
        _ if is_permanent_submission_error(&err.message) => SubmissionError::Rejected {
            message: err.message.clone(),
            status: err.status,
        },
        _ => transient(&err.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sale, Reply, ScriptedAuthority};

    #[test]
    fn test_http_status_classification() {
        assert!(classify(&AuthorityError::http(503, "Admin dashboard server error")).is_transient());
        assert!(classify(&AuthorityError::http(429, "Queue is backed up")).is_transient());
        assert!(classify(&AuthorityError::http(408, "Request timeout")).is_transient());
        assert!(classify(&AuthorityError::http(401, "API key is invalid or expired")).is_transient());

        match classify(&AuthorityError::http(422, "Validation failed: items[0].quantity")) {
            SubmissionError::Rejected { status, .. } => assert_eq!(status, Some(422)),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(!classify(&AuthorityError::http(409, "Duplicate transaction")).is_transient());
    }

    #[test]
    fn test_message_classification_without_status() {
        assert!(classify(&AuthorityError::network("Cannot reach admin dashboard")).is_transient());
        assert!(classify(&AuthorityError::network("something odd happened")).is_transient());
        assert!(!classify(&AuthorityError::network("Invalid product: sku-404")).is_transient());
        assert!(
            classify(&AuthorityError::network("Invalid product, retry later")).is_transient(),
            "backpressure wording wins over payload wording"
        );
    }

    #[test]
    fn test_retry_after_is_carried() {
        let mut err = AuthorityError::http(429, "Queue is backed up");
        err.retry_after_secs = Some(7);
        match classify(&err) {
            SubmissionError::Transient { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_returns_canonical() {
        let authority = Arc::new(ScriptedAuthority::default());
        let gateway = RemoteMutationGateway::new(authority.clone(), Duration::from_secs(5));
        let tx = sale("p", 1);

        let canonical = gateway.submit(&tx).await.expect("accepted");
        assert_eq!(canonical.local_id, tx.local_id);
        assert!(!is_local_id(&canonical.server_id));
        assert_eq!(authority.calls(), vec![tx.local_id]);
    }

    #[tokio::test]
    async fn test_submit_timeout_is_transient() {
        let authority = Arc::new(ScriptedAuthority::with_script(vec![Reply::Hang]));
        let gateway = RemoteMutationGateway::new(authority, Duration::from_millis(20));

        let err = gateway.submit(&sale("p", 1)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_submit_rejection_is_classified() {
        let authority = Arc::new(ScriptedAuthority::with_script(vec![Reply::Fail(
            AuthorityError::http(400, "Missing required parameter: payments"),
        )]));
        let gateway = RemoteMutationGateway::new(authority, Duration::from_secs(5));

        let err = gateway.submit(&sale("p", 1)).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Rejected { status: Some(400), .. }));
    }
}
