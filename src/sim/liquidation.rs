// =============================================================================
// Liquidation pricing — tiered maintenance-margin schedule
// =============================================================================
//
// The liquidation price is where equity allocated to the position falls to
// the maintenance requirement:
//
//   margin + (p - entry) * qty * dir = p * qty * mmr - maint_amount
//
// Solved for p:
//
//   LONG:  liq = (entry*qty - margin - maint_amount) / (qty * (1 - mmr))
//   SHORT: liq = (entry*qty + margin + maint_amount) / (qty * (1 + mmr))
//
// The tier is selected by the position's entry notional.  This is an
// approximation computed once at entry; it is not re-tiered as the mark
// moves.
// =============================================================================

use crate::runtime_config::MmrTier;
use crate::types::Side;

/// Select the maintenance tier for `notional`.
fn tier_for(notional: f64, tiers: &[MmrTier]) -> MmrTier {
    tiers
        .iter()
        .find(|t| notional <= t.notional_cap)
        .copied()
        .or_else(|| tiers.last().copied())
        .unwrap_or(MmrTier { notional_cap: f64::MAX, mmr: 0.004, maint_amount: 0.0 })
}

/// Approximate liquidation price for a position opened at `entry_price` with
/// `qty` and isolated `margin`.
pub fn liq_price(
    side: Side,
    entry_price: f64,
    qty: f64,
    margin: f64,
    tiers: &[MmrTier],
) -> f64 {
    if qty <= 0.0 || entry_price <= 0.0 {
        return 0.0;
    }

    let notional = entry_price * qty;
    let tier = tier_for(notional, tiers);

    let liq = match side {
        Side::Long => {
            (entry_price * qty - margin - tier.maint_amount) / (qty * (1.0 - tier.mmr))
        }
        Side::Short => {
            (entry_price * qty + margin + tier.maint_amount) / (qty * (1.0 + tier.mmr))
        }
    };

    liq.max(0.0)
}
