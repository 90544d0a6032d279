//! Ordered regex rules that pull offer fields out of rendered product text.

use anyhow::{Context, Result};
use harvest_core::{Candidate, SlotFill};
use regex::Regex;

const PRICE_RULES: &[&str] = &[
    r"(?i)\bprice[ \t]*:?[ \t]*\$?[ \t]*([\d,]*\d(?:\.\d+)?)",
    r"\$[ \t]*([\d,]*\d(?:\.\d+)?)",
    r"(?i)([\d,]*\d\.\d{2})[ \t]*(?:EA|USD)\b",
];

const CONTRACTOR_RULES: &[&str] = &[
    r"(?im)\bcontractor[ \t]*:?[ \t]*\n?[ \t]*([^\n]+?)[ \t]*(?:\n|contract#|includes|$)",
    r"(?im)^[ \t]*(?:vendor|supplier|company|distributor)[ \t]*:?[ \t]*\n?[ \t]*([^\n]+?)[ \t]*(?:\n|contract#|includes|$)",
];

const CONTRACT_RULES: &[&str] = &[
    r"(?i)contract#[ \t]*:?[ \t]*([a-z0-9][a-z0-9-]*)",
    r"(?i)contract[ \t]*number[ \t]*[:#]?[ \t]*([a-z0-9][a-z0-9-]*)",
    r"(?i)gsa[ \t]*contract[ \t]*[:#]?[ \t]*([a-z0-9][a-z0-9-]*)",
    r"(?i)\bcontract[:#\s]+([a-z0-9][a-z0-9-]*)",
];

// The value is always the last capture group, so `MAS/332510C` yields `332510C`.
const SIN_RULES: &[&str] = &[
    r"(?i)schedule[ \t]*/[ \t]*sin[:\s]+([a-z0-9]+)/([a-z0-9]+)",
    r"(?i)schedule[ \t]*/[ \t]*sin[:\s]+([a-z0-9]+)",
    r"(?i)\bsin[:\s]+([a-z0-9]+)/([a-z0-9]+)",
    r"(?i)\bsin[:\s]+([a-z0-9]+)",
];

const MANUFACTURER_RULES: &[&str] = &[
    r"(?i)\bmfr\b[ \t]*:?[ \t]*([a-z0-9][a-z0-9 &.,®'\-]*)",
    r"(?i)\bmanufacturer\b[ \t]*:?[ \t]*([a-z0-9][a-z0-9 &.,®'\-]*)",
    r"(?i)\bmfg\b[ \t]*:?[ \t]*([a-z0-9][a-z0-9 &.,®'\-]*)",
    r"(?i)\bbrand\b[ \t]*:?[ \t]*([a-z0-9][a-z0-9 &.,®'\-]*)",
];

const UNIT_RULES: &[&str] = &[
    r"(?i)\$[ \t]*[\d,]*\d(?:\.\d+)?[ \t]*(?:/[ \t]*)?([a-z]{1,10})\b",
    r"(?i)\b(?:unit of measure|unit|uom)[ \t]*:[ \t]*([a-z0-9]+)",
    r"(?i)\bper[ \t]+([a-z]{1,10})\b",
];

const CONTRACT_STOP_WORDS: &[&str] = &[
    "OR", "AND", "THE", "TO", "OF", "IN", "ON", "AT", "BY", "FOR", "NUMBER",
];

/// Listing-chrome phrases that show up in product-shaped elements.
const HEADER_PHRASES: &[&str] = &[
    "name contract number price",
    "contractor name",
    "price low to high",
    "price high to low",
    "view as grid",
    "view as list",
    "sort by",
    "filter by",
];

/// True when the text reads like a results-list header or toolbar rather
/// than a product.
pub fn is_header_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    HEADER_PHRASES.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub price: Option<String>,
    pub contractor: Option<String>,
    pub contract_number: Option<String>,
    pub sin: Option<String>,
}

impl ExtractedFields {
    pub fn is_empty(&self) -> bool {
        self.price.is_none()
            && self.contractor.is_none()
            && self.contract_number.is_none()
            && self.sin.is_none()
    }

    pub fn to_fill(&self) -> SlotFill {
        SlotFill {
            price: self.price.clone(),
            contractor: self.contractor.clone(),
            contract_number: self.contract_number.clone(),
            sin: self.sin.clone(),
        }
    }
}

#[derive(Debug)]
pub struct FieldExtractor {
    price: Vec<Regex>,
    contractor: Vec<Regex>,
    contract: Vec<Regex>,
    sin: Vec<Regex>,
    manufacturer: Vec<Regex>,
    unit: Vec<Regex>,
    trailing_noise: Regex,
}

fn compile(patterns: &[&str], what: &str) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("failed to compile {what} rule {p}")))
        .collect()
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses a price capture to a two-decimal string, dropping thousands
/// separators.
fn normalize_price(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| *c != ',').collect();
    let value: f64 = digits.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(format!("{value:.2}"))
}

fn valid_contract(value: &str) -> bool {
    value.len() >= 3
        && value.chars().any(|c| c.is_ascii_digit())
        && !CONTRACT_STOP_WORDS.contains(&value)
}

fn valid_sin(value: &str) -> bool {
    (4..=15).contains(&value.len()) && value.chars().any(|c| c.is_ascii_digit())
}

impl FieldExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            price: compile(PRICE_RULES, "price")?,
            contractor: compile(CONTRACTOR_RULES, "contractor")?,
            contract: compile(CONTRACT_RULES, "contract")?,
            sin: compile(SIN_RULES, "sin")?,
            manufacturer: compile(MANUFACTURER_RULES, "manufacturer")?,
            unit: compile(UNIT_RULES, "unit")?,
            trailing_noise: Regex::new(r"(?i)\s+(?:contract|includes)\s*$")
                .context("failed to compile contractor cleanup regex")?,
        })
    }

    /// First capture (last group) across the rules, in rule order then
    /// text order, that the validator turns into a value.
    fn first_valid(
        rules: &[Regex],
        raw: &str,
        mut accept: impl FnMut(&str) -> Option<String>,
    ) -> Option<String> {
        for rule in rules {
            for caps in rule.captures_iter(raw) {
                let Some(group) = caps.iter().skip(1).flatten().last() else {
                    continue;
                };
                if let Some(value) = accept(group.as_str().trim()) {
                    return Some(value);
                }
            }
        }
        None
    }

    pub fn price(&self, raw: &str) -> Option<String> {
        Self::first_valid(&self.price, raw, normalize_price)
    }

    pub fn contractor(&self, raw: &str) -> Option<String> {
        Self::first_valid(&self.contractor, raw, |value| {
            let cleaned = collapse_whitespace(value);
            let cleaned = self.trailing_noise.replace(&cleaned, "").trim().to_string();
            let cleaned = cleaned.trim_matches(|c: char| c == ':' || c == ',').trim().to_string();
            (cleaned.len() >= 2 && !is_header_text(&cleaned)).then_some(cleaned)
        })
    }

    pub fn contract_number(&self, raw: &str) -> Option<String> {
        Self::first_valid(&self.contract, raw, |value| {
            let upper = value.trim_matches('-').to_uppercase();
            valid_contract(&upper).then_some(upper)
        })
    }

    pub fn sin(&self, raw: &str) -> Option<String> {
        Self::first_valid(&self.sin, raw, |value| {
            let upper = value.to_uppercase();
            valid_sin(&upper).then_some(upper)
        })
    }

    /// Extracts every offer field. Unmatched fields are `None`.
    pub fn extract(&self, raw: &str) -> ExtractedFields {
        ExtractedFields {
            price: self.price(raw),
            contractor: self.contractor(raw),
            contract_number: self.contract_number(raw),
            sin: self.sin(raw),
        }
    }

    pub fn candidate_manufacturer(&self, raw: &str) -> Option<String> {
        Self::first_valid(&self.manufacturer, raw, |value| {
            let cleaned = collapse_whitespace(value.trim_end_matches([' ', ',', '-']));
            let lower = cleaned.to_lowercase();
            (!cleaned.is_empty() && !lower.starts_with("part")).then_some(cleaned)
        })
    }

    pub fn candidate_unit(&self, raw: &str) -> Option<String> {
        Self::first_valid(&self.unit, raw, |value| {
            (!value.is_empty()).then(|| value.to_uppercase())
        })
    }

    pub fn candidate_from_text(
        &self,
        position: usize,
        raw: &str,
        detail_ref: Option<String>,
    ) -> Candidate {
        Candidate {
            position,
            manufacturer: self.candidate_manufacturer(raw),
            unit: self.candidate_unit(raw),
            raw_text: raw.to_string(),
            detail_ref,
        }
    }
}
