// 💱 Multi-line FX Parser - foreign purchases spread over 2-3 statement lines
//
//   05/10 NETFLIX.COM 39,90 218,50      ← posting: original + base amount
//   Repasse de IOF 3,50                  ← optional IOF passthrough
//   Dólar de Conversão R$ 5,4750         ← conversion rate (required)
//
// IOF and rate lines may appear in either order.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::debug;

use super::{amounts_match, StatementText};
use crate::model::{parse_amount, Transaction};

static RE_FX_MAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<date>\d{2}/\d{2})\s+(?P<descr>.+?)\s+(?P<orig>-?\d{1,3}(?:\.\d{3})*,\d{2})\s+(?P<brl>-?\d{1,3}(?:\.\d{3})*,\d{2})$",
    )
    .expect("fx main regex")
});
static RE_IOF_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Repasse de IOF").expect("iof regex"));
static RE_RATE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^D[óo]lar de Convers[ãa]o.*?(\d+,\d{4})").expect("rate regex"));
static RE_BRL_AMOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\s*\d{1,3}(?:\.\d{3})*,\d{2}").expect("amount regex"));

/// Fields recovered from one FX chunk
#[derive(Debug, Clone, PartialEq)]
pub struct FxRecord {
    pub date: String,
    pub description: String,
    pub amount_orig: Decimal,
    pub amount_brl: Decimal,
    pub fx_rate: Decimal,
    pub iof: Option<Decimal>,
    /// Statement lines consumed (posting line included)
    pub lines_consumed: usize,
}

pub struct FxParser;

impl FxParser {
    pub fn new() -> Self {
        FxParser
    }

    /// Parse a chunk starting at `lines[0]`. Only the IOF/rate lines directly
    /// following the posting line are consumed; the rate line is mandatory.
    pub fn parse_chunk(&self, lines: &[String]) -> Option<FxRecord> {
        let main = RE_FX_MAIN.captures(lines.first()?)?;

        let mut iof = None;
        let mut fx_rate = None;
        let mut consumed = 1;

        for line in lines.iter().skip(1).take(2) {
            if iof.is_none() && RE_IOF_LINE.is_match(line) {
                iof = RE_BRL_AMOUNT
                    .find(line)
                    .and_then(|m| parse_amount(&m.as_str().replace(' ', "")).ok());
            } else if fx_rate.is_none() {
                if let Some(c) = RE_RATE_LINE.captures(line) {
                    fx_rate = Decimal::from_str(&c[1].replace(',', ".")).ok();
                } else {
                    break;
                }
            } else {
                break;
            }
            consumed += 1;
        }

        Some(FxRecord {
            date: main["date"].to_string(),
            description: main["descr"].trim().to_string(),
            amount_orig: parse_amount(&main["orig"]).ok()?,
            amount_brl: parse_amount(&main["brl"]).ok()?,
            fx_rate: fx_rate?,
            iof,
            lines_consumed: consumed,
        })
    }

    /// Scan every line, collecting distinct FX records
    pub fn parse_lines(&self, lines: &[String]) -> Vec<FxRecord> {
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut i = 0;

        while i < lines.len() {
            match self.parse_chunk(&lines[i..]) {
                Some(record) => {
                    i += record.lines_consumed;
                    let key = (
                        record.description.clone(),
                        record.date.clone(),
                        record.amount_brl,
                        record.amount_orig,
                        record.fx_rate,
                    );
                    if seen.insert(key) {
                        records.push(record);
                    }
                }
                None => i += 1,
            }
        }

        records
    }

    /// Attach each record to the first transaction with a matching base amount
    /// that has no FX rate yet. Returns the number of transactions enriched.
    pub fn apply(&self, transactions: &mut [Transaction], statement: &StatementText) -> usize {
        let records = self.parse_lines(&statement.lines());
        let mut attached = 0;

        for record in &records {
            let Some(tx) = transactions
                .iter_mut()
                .find(|t| t.fx_rate.is_none() && amounts_match(t.amount, record.amount_brl))
            else {
                debug!(description = %record.description, amount = %record.amount_brl, "FX record without transaction");
                continue;
            };

            tx.fx_rate = Some(record.fx_rate);
            if tx.amount_orig.is_none() {
                tx.amount_orig = Some(record.amount_orig);
            }
            if tx.iof.is_none() {
                tx.iof = record.iof;
            }
            if tx.currency_orig.is_none() {
                tx.currency_orig = Some("USD".to_string());
            }
            attached += 1;
        }

        debug!(records = records.len(), attached, "FX pass applied");
        attached
    }
}

impl Default for FxParser {
    fn default() -> Self {
        Self::new()
    }
}
