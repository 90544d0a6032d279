//! Decides which harvested candidates belong to a record.

use std::collections::HashSet;

use harvest_adapters::{is_header_text, FieldExtractor};
use harvest_core::{spaced_lower, Candidate, HarvestKind, ManufacturerMapping, Record};
use tracing::debug;

use crate::normalize::NormalizationCache;
use crate::similarity::{ratio, SimilarityEngine};

/// How a manufacturer check succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManufacturerTier {
    /// Exact mapping key for the record's name.
    MappedRoot,
    /// Mapping looked up by the normalized record name.
    NormalizedRoot,
    /// Direct comparison of normalized names.
    Direct,
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    /// Accepted candidates in page order, never more than requested.
    pub accepted: Vec<Candidate>,
    /// The requested number was reached; loading more content is pointless.
    pub early_satisfied: bool,
    pub rejected: usize,
}

#[derive(Debug)]
pub struct CandidateMatcher {
    mapping: ManufacturerMapping,
    engine: SimilarityEngine,
    extractor: FieldExtractor,
}

impl CandidateMatcher {
    pub fn new(
        mapping: ManufacturerMapping,
        engine: SimilarityEngine,
        extractor: FieldExtractor,
    ) -> Self {
        Self {
            mapping,
            engine,
            extractor,
        }
    }

    pub fn extractor(&self) -> &FieldExtractor {
        &self.extractor
    }

    fn root_hits(&self, root: &str, candidate: &str) -> bool {
        candidate.contains(root) || ratio(root, candidate) >= self.engine.config().long_threshold
    }

    pub fn manufacturer_tier(
        &self,
        record_manufacturer: &str,
        candidate_manufacturer: &str,
        cache: &mut NormalizationCache,
    ) -> Option<ManufacturerTier> {
        if record_manufacturer.trim().is_empty() {
            return None;
        }
        let candidate = cache.manufacturer(candidate_manufacturer);
        if candidate.is_empty() {
            return None;
        }

        if let Some(root) = self.mapping.root_for(record_manufacturer) {
            if self.root_hits(root, &candidate) {
                return Some(ManufacturerTier::MappedRoot);
            }
            let original = spaced_lower(record_manufacturer);
            if !original.is_empty() && spaced_lower(candidate_manufacturer).contains(&original) {
                return Some(ManufacturerTier::MappedRoot);
            }
        } else {
            let key = cache.manufacturer(record_manufacturer);
            if let Some(root) = self.mapping.root_for_normalized(&key) {
                if candidate.contains(root) {
                    return Some(ManufacturerTier::NormalizedRoot);
                }
            }
        }

        let record = cache.manufacturer(record_manufacturer);
        if record == candidate && record.len() <= 2 {
            return None;
        }
        self.engine
            .names_similar(&record, &candidate)
            .then_some(ManufacturerTier::Direct)
    }

    pub fn unit_matches(
        &self,
        record_unit: &str,
        candidate_unit: &str,
        cache: &mut NormalizationCache,
    ) -> bool {
        let a = cache.unit(record_unit);
        let b = cache.unit(candidate_unit);
        self.engine.units_similar(&a, &b)
    }

    /// Accepts up to `required` candidates whose manufacturer and unit both
    /// match the record. Header rows and repeated offers are ignored. For
    /// pricing, offers whose contract already sits in a slot are ignored
    /// too; a SIN harvest still wants those products.
    pub fn match_candidates(
        &self,
        record: &Record,
        kind: HarvestKind,
        required: usize,
        candidates: &[Candidate],
        cache: &mut NormalizationCache,
    ) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        if required == 0 {
            outcome.early_satisfied = true;
            return outcome;
        }
        let mut seen_contracts = HashSet::new();

        for candidate in candidates {
            if is_header_text(&candidate.raw_text) {
                outcome.rejected += 1;
                continue;
            }
            if let Some(contract) = self.extractor.contract_number(&candidate.raw_text) {
                let held = kind == HarvestKind::Pricing && record.has_contract(&contract);
                if held || !seen_contracts.insert(contract.clone()) {
                    debug!(
                        row = record.row,
                        position = candidate.position,
                        %contract,
                        "offer already held"
                    );
                    outcome.rejected += 1;
                    continue;
                }
            }

            let tier = candidate
                .manufacturer
                .as_deref()
                .and_then(|m| self.manufacturer_tier(&record.manufacturer, m, cache));
            let unit_ok = candidate
                .unit
                .as_deref()
                .is_some_and(|u| self.unit_matches(&record.unit, u, cache));

            match tier {
                Some(tier) if unit_ok => {
                    debug!(
                        row = record.row,
                        position = candidate.position,
                        ?tier,
                        "candidate accepted"
                    );
                    outcome.accepted.push(candidate.clone());
                    if outcome.accepted.len() >= required {
                        outcome.early_satisfied = true;
                        break;
                    }
                }
                _ => {
                    debug!(
                        row = record.row,
                        position = candidate.position,
                        manufacturer = candidate.manufacturer.as_deref().unwrap_or(""),
                        unit = candidate.unit.as_deref().unwrap_or(""),
                        "candidate rejected"
                    );
                    outcome.rejected += 1;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(pairs: &[(&str, &str)]) -> CandidateMatcher {
        CandidateMatcher::new(
            ManufacturerMapping::from_pairs(pairs.iter().copied()).unwrap(),
            SimilarityEngine::default(),
            FieldExtractor::new().unwrap(),
        )
    }

    fn candidate(position: usize, manufacturer: &str, unit: &str, contract: &str) -> Candidate {
        Candidate {
            position,
            manufacturer: Some(manufacturer.into()),
            unit: Some(unit.into()),
            raw_text: format!(
                "Mfr: {manufacturer}\n$10.00 {unit}\nContractor: Acme\nContract#: {contract}"
            ),
            detail_ref: None,
        }
    }

    #[test]
    fn exact_root_matches_hyphenated_candidate() {
        let m = matcher(&[("Bi-Silque Inc.", "bisilque")]);
        let mut cache = NormalizationCache::default();
        assert_eq!(
            m.manufacturer_tier("Bi-Silque Inc.", "BI-SILQUE", &mut cache),
            Some(ManufacturerTier::MappedRoot)
        );
        assert_eq!(
            m.manufacturer_tier("BI SILQUE INC", "Bi-Silque Visual Communication", &mut cache),
            Some(ManufacturerTier::NormalizedRoot)
        );
    }

    #[test]
    fn short_identical_names_are_rejected() {
        let m = matcher(&[]);
        let mut cache = NormalizationCache::default();
        assert_eq!(m.manufacturer_tier("3M", "3M", &mut cache), None);
        assert_eq!(
            m.manufacturer_tier("Avery", "Avery Dennison", &mut cache),
            Some(ManufacturerTier::Direct)
        );
    }

    #[test]
    fn accepts_only_when_manufacturer_and_unit_agree() {
        let m = matcher(&[("Avery", "avery")]);
        let mut cache = NormalizationCache::default();
        let record = harvest_core::Record::new(1, "A-1", "Avery", "PK").with_search_ref("q");
        let candidates = vec![
            candidate(0, "Avery Products", "EA", "GS-1"),
            candidate(1, "Quartet", "PK", "GS-2"),
            candidate(2, "AVERY", "Package", "GS-3"),
        ];
        let outcome = m.match_candidates(&record, HarvestKind::Pricing, 3, &candidates, &mut cache);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].position, 2);
        assert_eq!(outcome.rejected, 2);
        assert!(!outcome.early_satisfied);
    }

    #[test]
    fn skips_offers_already_on_the_record_and_stops_when_satisfied() {
        let m = matcher(&[("Avery", "avery")]);
        let mut cache = NormalizationCache::default();
        let mut record = harvest_core::Record::new(1, "A-1", "Avery", "EA").with_search_ref("q");
        record.slots[0].contract_number = Some("GS-1".into());
        let candidates: Vec<_> = (0..4)
            .map(|i| candidate(i, "Avery", "EA", &format!("GS-{}", i + 1)))
            .collect();
        let outcome = m.match_candidates(&record, HarvestKind::Pricing, 2, &candidates, &mut cache);
        let positions: Vec<_> = outcome.accepted.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert!(outcome.early_satisfied);
    }

    #[test]
    fn sin_matching_keeps_products_whose_offer_is_already_priced() {
        let m = matcher(&[("Avery", "avery")]);
        let mut cache = NormalizationCache::default();
        let mut record = harvest_core::Record::new(1, "A-1", "Avery", "EA").with_search_ref("q");
        record.slots[0].contract_number = Some("GS-1".into());
        let candidates = vec![
            candidate(0, "Avery", "EA", "GS-1"),
            candidate(1, "Avery", "EA", "GS-1"),
        ];
        let outcome = m.match_candidates(&record, HarvestKind::Sin, 2, &candidates, &mut cache);
        let positions: Vec<_> = outcome.accepted.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0]);
        assert_eq!(outcome.rejected, 1);

        let priced = m.match_candidates(&record, HarvestKind::Pricing, 2, &candidates, &mut cache);
        assert!(priced.accepted.is_empty());
    }
}
