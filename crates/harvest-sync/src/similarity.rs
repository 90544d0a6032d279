use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

use crate::normalize::{normalize, NormalizeKind};

/// Thresholds and unit aliases for similarity decisions. Every field has a
/// default, so a rules file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Strings shorter than this use `short_threshold`.
    pub short_length: usize,
    pub short_threshold: f64,
    pub long_threshold: f64,
    pub unit_threshold: f64,
    /// Both sides must be at least this long for containment to count.
    pub min_containment_len: usize,
    /// Canonical unit -> accepted spellings.
    pub unit_aliases: BTreeMap<String, Vec<String>>,
}

fn default_unit_aliases() -> BTreeMap<String, Vec<String>> {
    let table: &[(&str, &[&str])] = &[
        ("each", &["ea", "piece", "pc", "unit", "u", "pcs"]),
        ("box", &["bx", "case", "cs", "carton"]),
        ("pack", &["pk", "package", "pkg"]),
        ("dozen", &["dz", "12", "doz"]),
        ("gross", &["144", "gr"]),
        ("ream", &["rm", "500"]),
        ("roll", &["rl"]),
        ("set", &["st"]),
        ("pair", &["pr"]),
        ("gallon", &["gal", "g"]),
        ("pound", &["lb", "lbs", "#"]),
        ("ounce", &["oz"]),
        ("inch", &["in", "\""]),
        ("foot", &["ft", "'"]),
        ("yard", &["yd"]),
        ("meter", &["m"]),
        ("centimeter", &["cm"]),
        ("millimeter", &["mm"]),
    ];
    table
        .iter()
        .map(|(canonical, aliases)| {
            (
                canonical.to_string(),
                aliases.iter().map(|a| a.to_string()).collect(),
            )
        })
        .collect()
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            short_length: 8,
            short_threshold: 0.95,
            long_threshold: 0.85,
            unit_threshold: 0.80,
            min_containment_len: 3,
            unit_aliases: default_unit_aliases(),
        }
    }
}

impl MatchConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing match rules")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Fuzzy threshold tiered on the shorter of the two strings.
    pub fn fuzzy_threshold(&self, a: &str, b: &str) -> f64 {
        if a.len().min(b.len()) < self.short_length {
            self.short_threshold
        } else {
            self.long_threshold
        }
    }
}

/// Edit-similarity ratio in [0, 1].
pub fn ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b)
}

#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    config: MatchConfig,
    unit_groups: HashMap<String, String>,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}

impl SimilarityEngine {
    pub fn new(config: MatchConfig) -> Self {
        let mut unit_groups = HashMap::new();
        for (canonical, aliases) in &config.unit_aliases {
            let group = normalize(canonical, NormalizeKind::Unit);
            for spelling in std::iter::once(canonical).chain(aliases) {
                let key = normalize(spelling, NormalizeKind::Unit);
                if !key.is_empty() {
                    unit_groups.entry(key).or_insert_with(|| group.clone());
                }
            }
        }
        Self { config, unit_groups }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Canonical unit for an already-normalized spelling.
    pub fn unit_group(&self, normalized: &str) -> Option<&str> {
        self.unit_groups.get(normalized).map(String::as_str)
    }

    /// Exact, containment, then tiered fuzzy comparison of normalized names.
    pub fn names_similar(&self, a: &str, b: &str) -> bool {
        if a.is_empty() || b.is_empty() {
            return false;
        }
        if a == b {
            return true;
        }
        let min = self.config.min_containment_len;
        if a.len() >= min && b.len() >= min && (a.contains(b) || b.contains(a)) {
            return true;
        }
        ratio(a, b) >= self.config.fuzzy_threshold(a, b)
    }

    /// Exact, alias group, then fuzzy at the unit threshold.
    pub fn units_similar(&self, a: &str, b: &str) -> bool {
        if a.is_empty() || b.is_empty() {
            return false;
        }
        if a == b {
            return true;
        }
        if let (Some(ga), Some(gb)) = (self.unit_group(a), self.unit_group(b)) {
            if ga == gb {
                return true;
            }
        }
        ratio(a, b) >= self.config.unit_threshold
    }

    /// Normalizes both sides for `kind` and compares them.
    pub fn similar(&self, a: &str, b: &str, kind: NormalizeKind) -> bool {
        let (a, b) = (normalize(a, kind), normalize(b, kind));
        match kind {
            NormalizeKind::Manufacturer => self.names_similar(&a, &b),
            NormalizeKind::Unit => self.units_similar(&a, &b),
        }
    }
}
