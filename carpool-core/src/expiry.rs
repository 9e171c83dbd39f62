use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::repository::Ledger;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
    /// (car_id, reservation_id) of every hold that was cancelled.
    #[serde(skip)]
    pub released: Vec<(Uuid, Uuid)>,
}

/// Cancels temporary holds whose deadline has passed.
///
/// Stateless: every pass re-derives its work from the stored deadlines, so it is safe
/// to run from several processes at once.
pub struct ExpirySweeper {
    ledger: Arc<dyn Ledger>,
}

impl ExpirySweeper {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> CoreResult<SweepReport> {
        let candidates = self.ledger.expired_holds(now).await?;
        let mut report = SweepReport::default();

        for hold in candidates {
            match self.ledger.expire_hold(hold.id, now).await {
                Ok(true) => {
                    report.expired += 1;
                    report.released.push((hold.car_id, hold.id));
                }
                // Confirmed, rejected or cancelled since the candidate list was read.
                Ok(false) => debug!(reservation_id = %hold.id, "Hold changed before expiry, skipped"),
                Err(e) => {
                    report.failed += 1;
                    warn!(reservation_id = %hold.id, error = %e, "Failed to expire hold");
                }
            }
        }

        Ok(report)
    }
}
