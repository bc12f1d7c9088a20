//! Fee optimization for batched submission
//!
//! Transactions submitted together inside one sequence window share the
//! per-submission overhead: the first member pays the standard fee, every
//! further member pays a discounted marginal fee. The discount curve is a
//! policy parameter, not a constant.
//!
//! Everything here is pure: identical input gives identical output.

use crate::{types::TransactionType, Error, Result};
use serde::{Deserialize, Serialize};

/// Basis points in one whole
const BPS_SCALE: u64 = 10_000;

/// Fee policy (all amounts in drops)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeePolicy {
    /// Standard per-transaction fee
    pub base_fee_drops: u64,

    /// Discount applied to each member beyond the first (basis points)
    pub marginal_discount_bps: u32,

    /// Floor for a discounted member fee
    pub min_marginal_fee_drops: u64,

    /// EscrowFinish costs this multiple of the base fee (fulfillment verification)
    pub escrow_finish_multiplier: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            base_fee_drops: 10,
            marginal_discount_bps: 5_000, // 50% off each extra member
            min_marginal_fee_drops: 2,
            escrow_finish_multiplier: 33,
        }
    }
}

impl FeePolicy {
    /// Validate policy bounds
    pub fn validate(&self) -> Result<()> {
        if self.base_fee_drops == 0 {
            return Err(Error::Config("base_fee_drops must be > 0".to_string()));
        }
        if self.marginal_discount_bps as u64 > BPS_SCALE {
            return Err(Error::Config(format!(
                "marginal_discount_bps must be <= {}, got {}",
                BPS_SCALE, self.marginal_discount_bps
            )));
        }
        if self.escrow_finish_multiplier == 0 {
            return Err(Error::Config(
                "escrow_finish_multiplier must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fees computed for one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    /// Sum of standard per-transaction fees
    pub total_fee: u64,
    /// Fee actually charged
    pub optimized_fee: u64,
    /// `total_fee - optimized_fee`
    pub fee_savings: u64,
    /// Fee charged to each member, in batch order
    pub member_fees: Vec<u64>,
}

/// Computes aggregate vs. per-transaction fees for a batch
#[derive(Debug, Clone)]
pub struct FeeOptimizer {
    policy: FeePolicy,
}

impl FeeOptimizer {
    /// Create optimizer for a policy
    pub fn new(policy: FeePolicy) -> Self {
        Self { policy }
    }

    /// Active policy
    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    /// Standard fee when submitted on its own
    pub fn standard_fee(&self, tx_type: TransactionType) -> u64 {
        match tx_type {
            TransactionType::EscrowFinish => self
                .policy
                .base_fee_drops
                .saturating_mul(self.policy.escrow_finish_multiplier),
            _ => self.policy.base_fee_drops,
        }
    }

    /// Fee for a member riding along with an earlier member
    pub fn marginal_fee(&self, tx_type: TransactionType) -> u64 {
        let standard = self.standard_fee(tx_type);
        let keep_bps = BPS_SCALE.saturating_sub(self.policy.marginal_discount_bps as u64);
        let discounted = (standard as u128 * keep_bps as u128 / BPS_SCALE as u128) as u64;

        discounted.max(self.policy.min_marginal_fee_drops).min(standard)
    }

    /// Compute fees for batch members in submission order
    pub fn optimize(&self, members: &[TransactionType]) -> FeeBreakdown {
        let mut total_fee = 0u64;
        let mut optimized_fee = 0u64;
        let mut member_fees = Vec::with_capacity(members.len());

        for (position, tx_type) in members.iter().enumerate() {
            let standard = self.standard_fee(*tx_type);
            let charged = if position == 0 {
                standard
            } else {
                self.marginal_fee(*tx_type)
            };

            total_fee = total_fee.saturating_add(standard);
            optimized_fee = optimized_fee.saturating_add(charged);
            member_fees.push(charged);
        }

        FeeBreakdown {
            total_fee,
            optimized_fee,
            fee_savings: total_fee.saturating_sub(optimized_fee),
            member_fees,
        }
    }
}
