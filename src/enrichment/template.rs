// 🧾 Statement Template - header metadata and section-aware line hints
// Card suffix, billing period and due date come from the statement header;
// posting lines under each section header back-fill installments, merchant
// city and original currency on the matching transaction.

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use super::{amounts_match, StatementText};
use crate::model::{parse_amount, StatementMetadata, Transaction, BASE_CURRENCY};

static RE_CARD_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)CARTÃO.*?FINAL (\d{4})").expect("card header regex"));
static RE_PERIOD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)PERÍODO:\s*(\d{2}/\d{2}/\d{4})\s*A\s*(\d{2}/\d{2}/\d{4})").expect("period regex")
});
static RE_DUE_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)VENCIMENTO:\s*(\d{2}/\d{2}/\d{4})").expect("due date regex"));

static RE_SECTION_NATIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)LANÇAMENTOS NACIONAIS").expect("section regex"));
static RE_SECTION_INTERNATIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)LANÇAMENTOS INTERNACIONAIS").expect("section regex"));
static RE_SECTION_PAYMENTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)PAGAMENTOS EFETUADOS").expect("section regex"));

static RE_POSTING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<date>\d{2}/\d{2})\s+(?P<desc>.+?)\s+(?P<amount>-?\d{1,3}(?:\.\d{3})*,\d{2})$")
        .expect("posting regex")
});
static RE_PAYMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<date>\d{2}/\d{2})\s+PAGAMENTO.*?(?P<code>\d{4})\s*[-\t ]+(?P<amount>-\s*[\d.,]+)\s*$")
        .expect("payment regex")
});
static RE_INSTALLMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s(?P<seq>\d{1,2})/(?P<tot>\d{1,2})$").expect("installment regex"));
static RE_ONLINE_MERCHANT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<merchant>.+?)\s+(?:INTERNET|ONLINE|WEB)\s*(?P<city>[A-Z\s]*)$").expect("online regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    National,
    International,
    Payments,
}

/// One posting line recognised under a section header
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateLine {
    pub day: u32,
    pub month: u32,
    pub description: String,
    pub amount: Decimal,
    pub section: Section,
    pub installment: Option<(u32, u32)>,
    pub merchant_city: Option<String>,
}

impl TemplateLine {
    fn currency(&self) -> &'static str {
        match self.section {
            Section::International => "USD",
            Section::National | Section::Payments => BASE_CURRENCY,
        }
    }

    fn matches(&self, tx: &Transaction) -> bool {
        tx.date.day() == self.day && tx.date.month() == self.month && amounts_match(tx.amount, self.amount)
    }
}

pub struct TemplateMatcher;

impl TemplateMatcher {
    pub fn new() -> Self {
        TemplateMatcher
    }

    pub fn extract_card(&self, text: &str) -> Option<String> {
        RE_CARD_HEADER.captures(text).map(|c| c[1].to_string())
    }

    pub fn extract_metadata(&self, text: &str) -> StatementMetadata {
        let parse = |s: &str| NaiveDate::parse_from_str(s, "%d/%m/%Y").ok();

        let (period_start, period_end) = match RE_PERIOD.captures(text) {
            Some(c) => (parse(&c[1]), parse(&c[2])),
            None => (None, None),
        };

        StatementMetadata {
            card_last4: self.extract_card(text),
            period_start,
            period_end,
            due_date: RE_DUE_DATE.captures(text).and_then(|c| parse(&c[1])),
        }
    }

    fn section_of(line: &str) -> Option<Section> {
        if RE_SECTION_NATIONAL.is_match(line) {
            Some(Section::National)
        } else if RE_SECTION_INTERNATIONAL.is_match(line) {
            Some(Section::International)
        } else if RE_SECTION_PAYMENTS.is_match(line) {
            Some(Section::Payments)
        } else {
            None
        }
    }

    /// Posting lines under a known section. Lines before any section header,
    /// or with unreadable amounts, are ignored.
    pub fn parse_lines(&self, lines: &[String]) -> Vec<TemplateLine> {
        let mut section = None;
        let mut parsed = Vec::new();

        for line in lines {
            if let Some(next) = Self::section_of(line) {
                section = Some(next);
                continue;
            }
            let Some(current) = section else { continue };

            let captures = match current {
                Section::Payments => RE_PAYMENT.captures(line),
                _ => RE_POSTING.captures(line),
            };
            let Some(c) = captures else { continue };

            let Ok(amount) = parse_amount(&c["amount"]) else {
                continue;
            };
            let (Ok(day), Ok(month)) = (c["date"][..2].parse::<u32>(), c["date"][3..].parse::<u32>()) else {
                continue;
            };

            let description = if current == Section::Payments {
                "PAGAMENTO".to_string()
            } else {
                c["desc"].to_string()
            };

            let installment = RE_INSTALLMENT.captures(&description).and_then(|i| {
                let seq: u32 = i["seq"].parse().ok()?;
                let tot: u32 = i["tot"].parse().ok()?;
                (seq >= 1 && seq <= tot).then_some((seq, tot))
            });

            let merchant_city = if current == Section::International {
                RE_ONLINE_MERCHANT.captures(&description).map(|o| {
                    let city = o["city"].trim();
                    if city.is_empty() { "ONLINE".to_string() } else { city.to_string() }
                })
            } else {
                None
            };

            parsed.push(TemplateLine {
                day,
                month,
                description,
                amount,
                section: current,
                installment,
                merchant_city,
            });
        }

        parsed
    }

    /// Back-fill card suffix and line hints; returns the statement metadata
    pub fn apply(&self, transactions: &mut [Transaction], statement: &StatementText) -> StatementMetadata {
        let metadata = self.extract_metadata(&statement.text);

        if let Some(card) = &metadata.card_last4 {
            for tx in transactions.iter_mut().filter(|t| t.card_last4.is_none()) {
                tx.card_last4 = Some(card.clone());
            }
        }

        let lines = self.parse_lines(&statement.lines());
        // Each transaction takes hints from at most one line
        let mut taken = vec![false; transactions.len()];
        let mut hinted = 0;
        for line in &lines {
            let Some((index, tx)) = transactions
                .iter_mut()
                .enumerate()
                .find(|(i, t)| !taken[*i] && line.matches(t))
            else {
                continue;
            };
            taken[index] = true;
            if let (None, None, Some((seq, tot))) = (tx.installment_seq, tx.installment_tot, line.installment) {
                tx.installment_seq = Some(seq);
                tx.installment_tot = Some(tot);
            }
            if tx.merchant_city.is_none() {
                tx.merchant_city = line.merchant_city.clone();
            }
            if tx.currency_orig.is_none() {
                tx.currency_orig = Some(line.currency().to_string());
            }
            hinted += 1;
        }

        debug!(
            card = metadata.card_last4.as_deref().unwrap_or("-"),
            template_lines = lines.len(),
            hinted,
            "Template pass applied"
        );
        metadata
    }
}

impl Default for TemplateMatcher {
    fn default() -> Self {
        Self::new()
    }
}
