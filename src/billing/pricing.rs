use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

const COST_SCALE: u32 = 4;
const UNITS_PER_RATE: i64 = 1000;

/// Usage reported by a generation capability after the call returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_units: u64,
    pub output_units: u64,
}

/// key: cost-model -> provider cost of a generation request
///
/// `per_request` selects fixed pricing and wins whenever it is set. Otherwise the
/// request is metered against `input_per_1k` / `output_per_1k`. A metered model
/// without usage prices at zero, which is only meaningful as a pre-call estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    #[serde(default)]
    pub per_request: Option<Decimal>,
    #[serde(default)]
    pub input_per_1k: Option<Decimal>,
    #[serde(default)]
    pub output_per_1k: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostStrategy {
    Fixed,
    Metered,
    Free,
}

impl CostModel {
    pub fn fixed(per_request: Decimal) -> Self {
        Self {
            per_request: Some(per_request),
            ..Self::default()
        }
    }

    pub fn metered(input_per_1k: Decimal, output_per_1k: Decimal) -> Self {
        Self {
            per_request: None,
            input_per_1k: Some(input_per_1k),
            output_per_1k: Some(output_per_1k),
        }
    }

    pub fn strategy(&self) -> CostStrategy {
        if self.per_request.is_some() {
            CostStrategy::Fixed
        } else if self.input_per_1k.is_some() || self.output_per_1k.is_some() {
            CostStrategy::Metered
        } else {
            CostStrategy::Free
        }
    }

    pub fn calculate(&self, usage: Option<&Usage>) -> Decimal {
        let raw = match self.strategy() {
            CostStrategy::Fixed => self.per_request.unwrap_or_default(),
            CostStrategy::Metered => match usage {
                Some(usage) => {
                    metered_part(usage.input_units, self.input_per_1k)
                        + metered_part(usage.output_units, self.output_per_1k)
                }
                None => Decimal::ZERO,
            },
            CostStrategy::Free => Decimal::ZERO,
        };
        raw.round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointAwayFromZero)
    }
}

fn metered_part(units: u64, rate: Option<Decimal>) -> Decimal {
    match rate {
        Some(rate) => Decimal::from(units) / Decimal::from(UNITS_PER_RATE) * rate,
        None => Decimal::ZERO,
    }
}

/// Token price of a request: `unit_price × quantity`, truncated toward zero.
///
/// `quantity` is 1 for per-request models and the billed amount (minutes,
/// images) for per-unit models. Non-positive quantities cost nothing.
pub fn token_cost(unit_price: i64, quantity: Decimal) -> i64 {
    if unit_price <= 0 || quantity <= Decimal::ZERO {
        return 0;
    }
    (Decimal::from(unit_price) * quantity)
        .trunc()
        .to_i64()
        .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    #[test]
    fn fixed_price_ignores_usage() {
        let model = CostModel::fixed(dec("0.04"));
        let heavy = Usage {
            input_units: 1_000_000,
            output_units: 250_000,
        };
        assert_eq!(model.calculate(None), dec("0.04"));
        assert_eq!(model.calculate(Some(&Usage::default())), dec("0.04"));
        assert_eq!(model.calculate(Some(&heavy)), dec("0.04"));
    }

    #[test]
    fn fixed_price_wins_over_metered_rates() {
        let model = CostModel {
            per_request: Some(dec("0.5")),
            input_per_1k: Some(dec("10")),
            output_per_1k: Some(dec("10")),
        };
        let usage = Usage {
            input_units: 5000,
            output_units: 5000,
        };
        assert_eq!(model.strategy(), CostStrategy::Fixed);
        assert_eq!(model.calculate(Some(&usage)), dec("0.5"));
    }

    #[test]
    fn metered_price_scales_per_thousand_units() {
        let model = CostModel::metered(dec("0.0025"), dec("0.01"));
        let usage = Usage {
            input_units: 1200,
            output_units: 800,
        };
        // 1.2 * 0.0025 + 0.8 * 0.01 = 0.003 + 0.008
        assert_eq!(model.calculate(Some(&usage)), dec("0.011"));
    }

    #[test]
    fn metered_price_rounds_half_up_to_four_places() {
        let model = CostModel::metered(dec("0.00015"), Decimal::ZERO);
        let usage = Usage {
            input_units: 1000,
            output_units: 0,
        };
        assert_eq!(model.calculate(Some(&usage)), dec("0.0002"));

        let below_half = CostModel::metered(dec("0.00014"), Decimal::ZERO);
        assert_eq!(below_half.calculate(Some(&usage)), dec("0.0001"));
    }

    #[test]
    fn metered_price_without_usage_is_zero() {
        let model = CostModel::metered(dec("0.003"), dec("0.015"));
        assert_eq!(model.calculate(None), Decimal::ZERO);
    }

    #[test]
    fn unconfigured_cost_is_free() {
        assert_eq!(CostModel::default().strategy(), CostStrategy::Free);
        assert_eq!(CostModel::default().calculate(None), Decimal::ZERO);
    }

    #[test]
    fn token_cost_truncates_fractional_quantities() {
        assert_eq!(token_cost(15, Decimal::ONE), 15);
        assert_eq!(token_cost(10, dec("2.5")), 25);
        assert_eq!(token_cost(3, dec("1.9")), 5);
        assert_eq!(token_cost(0, dec("4")), 0);
        assert_eq!(token_cost(10, Decimal::ZERO), 0);
        assert_eq!(token_cost(10, dec("-1")), 0);
    }
}
