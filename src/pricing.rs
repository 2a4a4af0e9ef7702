//! Pure money rules shared by cart pricing and checkout.

/// Orders above this subtotal ship for free.
pub const FREE_SHIPPING_THRESHOLD: f64 = 100.00;
pub const FLAT_SHIPPING_FEE: f64 = 9.99;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn shipping_fee(subtotal: f64) -> f64 {
    if subtotal > FREE_SHIPPING_THRESHOLD {
        0.0
    } else {
        FLAT_SHIPPING_FEE
    }
}

#[derive(Debug, PartialEq)]
pub struct OrderTotals {
    pub subtotal: f64,
    pub shipping_fee: f64,
    pub grand_total: f64,
}

/// Totals for a set of `(unit_price, quantity)` lines.
pub fn order_totals(lines: &[(f64, i32)]) -> OrderTotals {
    let subtotal = round2(
        lines
            .iter()
            .map(|(price, quantity)| price * f64::from(*quantity))
            .sum(),
    );
    let shipping_fee = shipping_fee(subtotal);
    OrderTotals {
        subtotal,
        shipping_fee,
        grand_total: round2(subtotal + shipping_fee),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_for_small_order() {
        // 2 x 10.00 + 1 x 5.00, under the free-shipping threshold
        let totals = order_totals(&[(10.00, 2), (5.00, 1)]);
        assert_eq!(totals.subtotal, 25.00);
        assert_eq!(totals.shipping_fee, 9.99);
        assert_eq!(totals.grand_total, 34.99);
    }

    #[test]
    fn shipping_is_free_strictly_above_threshold() {
        assert_eq!(shipping_fee(100.00), FLAT_SHIPPING_FEE);
        assert_eq!(shipping_fee(100.01), 0.0);
        assert_eq!(shipping_fee(0.0), FLAT_SHIPPING_FEE);
    }

    #[test]
    fn grand_total_includes_fee_only_when_charged() {
        let totals = order_totals(&[(60.00, 2)]);
        assert_eq!(totals.subtotal, 120.00);
        assert_eq!(totals.shipping_fee, 0.0);
        assert_eq!(totals.grand_total, 120.00);
    }

    #[test]
    fn empty_line_set_totals_to_fee_only() {
        // Checkout rejects empty carts before totalling; this pins the math anyway.
        let totals = order_totals(&[]);
        assert_eq!(totals.subtotal, 0.0);
        assert_eq!(totals.grand_total, 9.99);
    }

    #[test]
    fn round2_clamps_float_noise() {
        assert_eq!(round2(34.989999999999995), 34.99);
        assert_eq!(round2(3.3333333333), 3.33);
        assert_eq!(round2(3.335), 3.34);
    }
}
