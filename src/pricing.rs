//! Cost computation
//!
//! Maps a usage breakdown and a model's per-million rates to USD. Results
//! are rounded to 6 decimal places before persistence.

use crate::db::ModelPrice;
use crate::forward::context::Usage;

const TOKENS_PER_RATE_UNIT: f64 = 1_000_000.0;

pub fn cost_usd(usage: &Usage, price: &ModelPrice) -> f64 {
    let cost = (usage.input_tokens as f64 / TOKENS_PER_RATE_UNIT) * price.input_rate
        + (usage.output_tokens as f64 / TOKENS_PER_RATE_UNIT) * price.output_rate
        + (usage.cache_read_tokens as f64 / TOKENS_PER_RATE_UNIT) * price.cache_read_rate
        + (usage.cache_write_tokens as f64 / TOKENS_PER_RATE_UNIT) * price.cache_write_rate;
    round6(cost)
}

pub fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(input: f64, output: f64, cache_read: f64, cache_write: f64) -> ModelPrice {
        ModelPrice {
            model_name: "m1".into(),
            provider: "p".into(),
            input_rate: input,
            output_rate: output,
            cache_read_rate: cache_read,
            cache_write_rate: cache_write,
            updated_at: 0,
        }
    }

    #[test]
    fn calc_cost() {
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 2_000_000,
            ..Default::default()
        };
        assert!((cost_usd(&usage, &price(1.0, 2.0, 0.0, 0.0)) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn all_four_components() {
        let usage = Usage {
            input_tokens: 500_000,
            output_tokens: 250_000,
            cache_read_tokens: 1_000_000,
            cache_write_tokens: 2_000_000,
            estimated: false,
        };
        let p = price(2.0, 8.0, 0.5, 1.0);
        // 1.0 + 2.0 + 0.5 + 2.0
        assert!((cost_usd(&usage, &p) - 5.5).abs() < 1e-9);
    }

    #[test]
    fn rounds_to_six_decimals() {
        let usage = Usage { input_tokens: 1, output_tokens: 1, ..Default::default() };
        // 1 token at $1/M + 1 token at $2/M = 0.000003
        let cost = cost_usd(&usage, &price(1.0, 2.0, 0.0, 0.0));
        assert_eq!(cost, 0.000003);

        // Sub-micro-dollar amounts round away
        let cost = cost_usd(&usage, &price(0.1, 0.1, 0.0, 0.0));
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn zero_usage_is_free() {
        assert_eq!(cost_usd(&Usage::default(), &price(10.0, 10.0, 10.0, 10.0)), 0.0);
    }
}
