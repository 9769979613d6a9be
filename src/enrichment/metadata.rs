// 🏷️ Metadata Enricher - identity hash, currency inference, defaults

use rust_decimal::Decimal;

use crate::model::{Transaction, BASE_CURRENCY};

/// Base/original ratio band read as a USD purchase
fn usd_band() -> (Decimal, Decimal) {
    (Decimal::new(45, 1), Decimal::new(65, 1))
}

pub struct MetadataEnricher;

impl MetadataEnricher {
    pub fn new() -> Self {
        MetadataEnricher
    }

    /// Infer the original currency from the original/base amount pair.
    /// Anything ambiguous is the base currency.
    pub fn infer_currency(&self, amount_orig: Option<Decimal>, amount: Decimal) -> &'static str {
        let Some(orig) = amount_orig else {
            return BASE_CURRENCY;
        };
        if orig.is_zero() || (orig - amount).abs() < Decimal::new(1, 2) {
            return BASE_CURRENCY;
        }

        let ratio = (amount / orig).abs();
        let (low, high) = usd_band();
        if ratio >= low && ratio <= high {
            "USD"
        } else {
            BASE_CURRENCY
        }
    }

    pub fn usd_amount(&self, amount: Decimal, fx_rate: Option<Decimal>) -> Option<Decimal> {
        match fx_rate {
            Some(rate) if !rate.is_zero() => Some((amount / rate).round_dp(2)),
            _ => None,
        }
    }

    pub fn enrich(&self, tx: &mut Transaction) {
        tx.ensure_ledger_hash();

        if tx.currency_orig.is_none() {
            tx.currency_orig = Some(self.infer_currency(tx.amount_orig, tx.amount).to_string());
        }
        if tx.amount_usd.is_none() {
            tx.amount_usd = self.usd_amount(tx.amount, tx.fx_rate);
        }

        tx.installment_seq.get_or_insert(1);
        tx.installment_tot.get_or_insert(1);
        tx.interest_amount.get_or_insert(Decimal::ZERO);
        tx.prev_bill_amount.get_or_insert(Decimal::ZERO);
    }

    pub fn apply(&self, transactions: &mut [Transaction]) {
        for tx in transactions.iter_mut() {
            self.enrich(tx);
        }
    }
}

impl Default for MetadataEnricher {
    fn default() -> Self {
        Self::new()
    }
}
