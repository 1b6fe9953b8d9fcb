//! Single-use coupon redemption.
//!
//! The claim is one atomic set-if-absent on `coupon:used:{code}`: of any
//! number of concurrent callers exactly one sees it succeed. Validation runs
//! after the claim and releases it when the coupon turns out to be invalid,
//! so a concurrent caller may lose to a claim that is later released. The
//! durable "used" flag is written asynchronously by the [`UsageCommitter`].

use crate::commit::UsageCommitter;
use crate::metadata::CouponMetadataCache;
use chrono::{DateTime, Utc};
use flashsale_core::config::CouponConfig;
use flashsale_core::keys;
use flashsale_core::store::CounterStore;
use flashsale_core::types::UserId;
use flashsale_core::{FlashSaleError, FlashSaleResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Applied,
    AlreadyClaimed,
    NotFound,
    AlreadyUsed,
    Expired,
}

impl ClaimOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ClaimOutcome::Applied)
    }

    fn metric(&self) -> &'static str {
        match self {
            ClaimOutcome::Applied => "coupon.applied",
            ClaimOutcome::AlreadyClaimed => "coupon.already_claimed",
            ClaimOutcome::NotFound => "coupon.not_found",
            ClaimOutcome::AlreadyUsed => "coupon.already_used",
            ClaimOutcome::Expired => "coupon.expired",
        }
    }
}

pub struct CouponLockService {
    store: Arc<dyn CounterStore>,
    metadata: Arc<CouponMetadataCache>,
    committer: UsageCommitter,
    claim_ttl: Duration,
    validate_before_claim: bool,
}

impl CouponLockService {
    pub fn new(
        store: Arc<dyn CounterStore>,
        metadata: Arc<CouponMetadataCache>,
        committer: UsageCommitter,
        config: &CouponConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            committer,
            claim_ttl: config.claim_ttl(),
            validate_before_claim: config.validate_before_claim,
        }
    }

    /// Redeem `code` for `user_id`. `true` only for the caller that won the
    /// claim on a valid coupon.
    pub async fn apply_coupon(&self, code: &str, user_id: UserId) -> FlashSaleResult<bool> {
        Ok(self.claim(code, user_id).await?.is_applied())
    }

    pub async fn claim(&self, code: &str, user_id: UserId) -> FlashSaleResult<ClaimOutcome> {
        if code.trim().is_empty() {
            return Err(FlashSaleError::Validation("coupon code is empty".into()));
        }

        if self.validate_before_claim {
            let outcome = self.validate(code, Utc::now()).await?;
            if !outcome.is_applied() {
                return Ok(self.finish(code, user_id, outcome));
            }
        }

        let key = keys::coupon_claim(code);
        if !self
            .store
            .set_if_absent(&key, &user_id.to_string(), Some(self.claim_ttl))
            .await?
        {
            return Ok(self.finish(code, user_id, ClaimOutcome::AlreadyClaimed));
        }

        let outcome = match self.validate(code, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_claim(&key).await;
                return Err(e);
            }
        };
        if !outcome.is_applied() {
            self.release_claim(&key).await;
            return Ok(self.finish(code, user_id, outcome));
        }

        self.committer.submit(code);
        Ok(self.finish(code, user_id, ClaimOutcome::Applied))
    }

    async fn validate(&self, code: &str, now: DateTime<Utc>) -> FlashSaleResult<ClaimOutcome> {
        Ok(match self.metadata.get(code).await? {
            None => ClaimOutcome::NotFound,
            Some(coupon) if coupon.used => ClaimOutcome::AlreadyUsed,
            Some(coupon) if coupon.valid_until < now => ClaimOutcome::Expired,
            Some(_) => ClaimOutcome::Applied,
        })
    }

    async fn release_claim(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            // The code stays blocked until the claim TTL runs out.
            metrics::counter!("coupon.release_failed").increment(1);
            error!(key = %key, error = %e, "Failed to release coupon claim");
        }
    }

    fn finish(&self, code: &str, user_id: UserId, outcome: ClaimOutcome) -> ClaimOutcome {
        metrics::counter!(outcome.metric()).increment(1);
        if outcome.is_applied() {
            info!(code = %code, user_id = user_id, "Coupon applied");
        } else {
            debug!(code = %code, user_id = user_id, outcome = ?outcome, "Coupon refused");
        }
        outcome
    }
}
