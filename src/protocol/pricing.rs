//! Canonical order pricing.
//!
//! Terminal checkout and server ingestion both compute totals here, so a sale
//! priced offline reconciles to the same cents upstream.
//!
//! Per line:
//! `gross = round2(unit_price * quantity)`, `discount = clamp(discount, 0, gross)`,
//! `net = gross - discount`, `tax = round2(net * tax_rate)`.
//!
//! Per order: `subtotal = sum(gross)`, `discount_amount = sum(discount)`,
//! `tax_amount = sum(tax)`, `total_amount = subtotal - discount_amount + tax_amount`.

use super::OrderItem;

/// Tolerance used when comparing reported and recomputed totals.
pub const TOTALS_TOLERANCE: f64 = 0.01;

/// Round to cents, half away from zero.
///
/// The scaled value is nudged by a tiny epsilon so that amounts like `1.005`
/// (stored as `1.00499999...`) still round up.
pub fn round2(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let scaled = value * 100.0;
    let nudged = scaled + scaled.signum() * 1e-7;
    nudged.round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineTotals {
    pub gross: f64,
    pub discount: f64,
    pub net: f64,
    pub tax: f64,
    pub total: f64,
}

impl LineTotals {
    pub fn compute(quantity: i64, unit_price: f64, tax_rate: f64, discount: f64) -> Self {
        let gross = round2(unit_price * quantity as f64);
        let discount = round2(discount.max(0.0)).min(gross.max(0.0));
        let net = round2(gross - discount);
        let tax = round2(net * tax_rate);
        Self {
            gross,
            discount,
            net,
            tax,
            total: round2(net + tax),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OrderTotals {
    pub subtotal: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
}

impl OrderTotals {
    pub fn from_items(items: &[OrderItem]) -> Self {
        Self::from_lines(items.iter().map(OrderItem::totals))
    }

    pub fn from_lines(lines: impl IntoIterator<Item = LineTotals>) -> Self {
        let (subtotal, discount, tax) = lines
            .into_iter()
            .fold((0.0, 0.0, 0.0), |(s, d, t), line| {
                (s + line.gross, d + line.discount, t + line.tax)
            });
        let subtotal = round2(subtotal);
        let discount_amount = round2(discount);
        let tax_amount = round2(tax);
        Self {
            subtotal,
            discount_amount,
            tax_amount,
            total_amount: round2(subtotal - discount_amount + tax_amount),
        }
    }

    /// True when every component is within [`TOTALS_TOLERANCE`] of `other`.
    pub fn matches(&self, other: &OrderTotals) -> bool {
        (self.subtotal - other.subtotal).abs() <= TOTALS_TOLERANCE
            && (self.discount_amount - other.discount_amount).abs() <= TOTALS_TOLERANCE
            && (self.tax_amount - other.tax_amount).abs() <= TOTALS_TOLERANCE
            && (self.total_amount - other.total_amount).abs() <= TOTALS_TOLERANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: i64, unit_price: f64, tax_rate: f64, discount: f64) -> OrderItem {
        OrderItem {
            product_id: "p".into(),
            sku: "SKU".into(),
            name: "Item".into(),
            quantity,
            unit_price,
            tax_rate,
            discount_amount: discount,
        }
    }

    #[test]
    fn test_round2_half_away_from_zero() {
        assert_eq!(round2(1.005), 1.01);
        assert_eq!(round2(2.675), 2.68);
        assert_eq!(round2(-1.005), -1.01);
        assert_eq!(round2(0.004), 0.0);
    }

    #[test]
    fn test_discount_applies_before_tax() {
        let line = LineTotals::compute(3, 2.50, 0.2, 1.50);
        assert_eq!(line.gross, 7.50);
        assert_eq!(line.discount, 1.50);
        assert_eq!(line.net, 6.00);
        assert_eq!(line.tax, 1.20);
        assert_eq!(line.total, 7.20);
    }

    #[test]
    fn test_discount_is_capped_at_gross() {
        let line = LineTotals::compute(1, 4.00, 0.1, 10.0);
        assert_eq!(line.discount, 4.00);
        assert_eq!(line.net, 0.0);
        assert_eq!(line.tax, 0.0);
    }

    #[test]
    fn test_order_totals_sum_lines() {
        let totals = OrderTotals::from_items(&[
            item(2, 1.99, 0.08, 0.0),
            item(1, 10.00, 0.08, 2.00),
        ]);
        assert_eq!(totals.subtotal, 13.98);
        assert_eq!(totals.discount_amount, 2.00);
        // 3.98 * 0.08 = 0.3184 -> 0.32 ; 8.00 * 0.08 = 0.64
        assert_eq!(totals.tax_amount, 0.96);
        assert_eq!(totals.total_amount, 12.94);
    }

    #[test]
    fn test_matches_within_tolerance() {
        let a = OrderTotals::from_items(&[item(1, 9.99, 0.2, 0.0)]);
        let mut b = a;
        b.total_amount += 0.005;
        assert!(a.matches(&b));
        b.total_amount += 0.05;
        assert!(!a.matches(&b));
    }
}
