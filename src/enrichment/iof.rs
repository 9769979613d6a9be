// 🏛️ IOF Calculator - Brazilian financial-operations tax on card postings

use rust_decimal::Decimal;

use crate::model::Transaction;

/// 0.38% on domestic-currency postings
pub fn national_rate() -> Decimal {
    Decimal::new(38, 4)
}

/// 6.38% on postings carrying a foreign original currency
pub fn international_rate() -> Decimal {
    Decimal::new(638, 4)
}

pub struct IofCalculator;

impl IofCalculator {
    pub fn new() -> Self {
        IofCalculator
    }

    pub fn calculate(&self, tx: &Transaction) -> Decimal {
        let rate = if tx.is_foreign_currency() {
            international_rate()
        } else {
            national_rate()
        };
        (tx.amount.abs() * rate).round_dp(2)
    }

    /// Fill IOF where unset; returns how many were filled
    pub fn apply(&self, transactions: &mut [Transaction]) -> usize {
        let mut filled = 0;
        for tx in transactions.iter_mut().filter(|t| t.iof.is_none()) {
            tx.iof = Some(self.calculate(tx));
            filled += 1;
        }
        filled
    }
}

impl Default for IofCalculator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn tx(cents: i64) -> Transaction {
        Transaction::new(NaiveDate::from_ymd_opt(2024, 10, 5).unwrap(), "X", Decimal::new(cents, 2))
    }

    #[test]
    fn test_domestic_and_international_rates() {
        let calculator = IofCalculator::new();
        assert_eq!(calculator.calculate(&tx(100000)), Decimal::new(380, 2));
        assert_eq!(calculator.calculate(&tx(-100000)), Decimal::new(380, 2));

        let foreign = tx(100000).with_original(Decimal::new(18000, 2), "USD");
        assert_eq!(calculator.calculate(&foreign), Decimal::new(6380, 2));

        let brl = tx(100000).with_original(Decimal::new(100000, 2), "BRL");
        assert_eq!(calculator.calculate(&brl), Decimal::new(380, 2));
    }

    #[test]
    fn test_apply_keeps_existing_iof() {
        let mut transactions = vec![tx(100000), tx(50000)];
        transactions[1].iof = Some(Decimal::new(999, 2));

        let filled = IofCalculator::new().apply(&mut transactions);

        assert_eq!(filled, 1);
        assert_eq!(transactions[0].iof, Some(Decimal::new(380, 2)));
        assert_eq!(transactions[1].iof, Some(Decimal::new(999, 2)));
    }
}
