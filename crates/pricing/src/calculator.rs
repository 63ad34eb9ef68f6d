//! Price calculation
//!
//! Single source of truth for the pricing formula:
//! - base   = mass * rate
//! - markup = base * p / 100 (percentage) or mass * m (flat per gram)
//! - total  = base + markup, rounded half-up to 2 decimal places
//!
//! Base is rounded the same way and markup is taken as `total - base`, so the
//! three amounts always add up exactly.

use rust_decimal::{Decimal, RoundingStrategy};

use aurum_core::{MarkupSpec, PriceBreakdown, PricedEntity, UnpricedReason};

const ONE_HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Pure price calculator
#[derive(Debug, Clone, Copy, Default)]
pub struct PriceCalculator;

impl PriceCalculator {
    /// Price one entity at `rate` per unit of mass. `None` means the rate
    /// for the entity's key is unknown.
    pub fn compute(
        entity: &PricedEntity,
        rate: Option<Decimal>,
    ) -> Result<PriceBreakdown, UnpricedReason> {
        if entity.rate_key.is_none() {
            return Err(UnpricedReason::MissingRateKey);
        }

        let mass = entity
            .mass
            .filter(|m| *m > Decimal::ZERO)
            .ok_or(UnpricedReason::InvalidMass)?;

        let markup = entity
            .markup
            .filter(|m| m.value() >= Decimal::ZERO)
            .ok_or(UnpricedReason::InvalidMarkup)?;

        let rate = rate.ok_or(UnpricedReason::UnknownRate)?;
        if rate <= Decimal::ZERO {
            return Err(UnpricedReason::InvalidRate);
        }

        Self::breakdown(mass, rate, markup).ok_or(UnpricedReason::Overflow)
    }

    fn breakdown(mass: Decimal, rate: Decimal, markup: MarkupSpec) -> Option<PriceBreakdown> {
        let base = mass.checked_mul(rate)?;
        let markup = match markup {
            MarkupSpec::Percentage(p) => base.checked_mul(p)?.checked_div(ONE_HUNDRED)?,
            MarkupSpec::FlatPerUnit(m) => mass.checked_mul(m)?,
        };

        let total = round_money(base.checked_add(markup)?);
        let base = round_money(base);
        Some(PriceBreakdown::new(base, total - base))
    }
}

/// Round half-up to 2 decimal places
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
