use std::fmt;

use serde::Serialize;

pub const AUTO_LABEL: &str = "Auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TierIndex(pub usize);

impl fmt::Display for TierIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requested tier: let the ingestion layer choose, or pin a concrete tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierSelection {
    #[default]
    Auto,
    Tier(TierIndex),
}

impl TierSelection {
    pub fn is_auto(&self) -> bool {
        matches!(self, TierSelection::Auto)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityTier {
    pub index: TierIndex,
    pub label: String,
    pub bandwidth: u64,
    pub height: Option<u64>,
}

/// Candidate tier as advertised by a manifest, before ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierCandidate {
    pub bandwidth: u64,
    pub height: Option<u64>,
}

impl TierCandidate {
    fn label(&self) -> String {
        match self.height {
            Some(height) => format!("{height}p"),
            None if self.bandwidth > 0 => format!("{} kbps", self.bandwidth / 1000),
            None => "Source".to_string(),
        }
    }
}

/// Ordered quality ladder, ascending by quality. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualityLadder {
    tiers: Vec<QualityTier>,
}

impl QualityLadder {
    /// Builds the ladder and returns, for each tier index, the position of its
    /// candidate in the input so callers can keep per-tier data aligned.
    pub fn build(candidates: &[TierCandidate]) -> (Self, Vec<usize>) {
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by_key(|&position| {
            let candidate = &candidates[position];
            (candidate.height.unwrap_or(0), candidate.bandwidth)
        });
        let tiers = order
            .iter()
            .enumerate()
            .map(|(index, &position)| {
                let candidate = &candidates[position];
                QualityTier {
                    index: TierIndex(index),
                    label: candidate.label(),
                    bandwidth: candidate.bandwidth,
                    height: candidate.height,
                }
            })
            .collect();
        (Self { tiers }, order)
    }

    pub fn single_source() -> Self {
        Self {
            tiers: vec![QualityTier {
                index: TierIndex(0),
                label: "Source".to_string(),
                bandwidth: 0,
                height: None,
            }],
        }
    }

    pub fn tiers(&self) -> &[QualityTier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn get(&self, index: TierIndex) -> Option<&QualityTier> {
        self.tiers.get(index.0)
    }

    pub fn contains(&self, index: TierIndex) -> bool {
        index.0 < self.tiers.len()
    }

    pub fn highest(&self) -> Option<TierIndex> {
        self.tiers.last().map(|tier| tier.index)
    }

    pub fn find_label(&self, label: &str) -> Option<TierIndex> {
        self.tiers
            .iter()
            .find(|tier| tier.label.eq_ignore_ascii_case(label))
            .map(|tier| tier.index)
    }

    /// Labels offered to the viewer, `Auto` first.
    pub fn menu_labels(&self) -> Vec<String> {
        if self.tiers.is_empty() {
            return Vec::new();
        }
        std::iter::once(AUTO_LABEL.to_string())
            .chain(self.tiers.iter().map(|tier| tier.label.clone()))
            .collect()
    }

    /// Parses a viewer-facing label back into a selection.
    pub fn selection_for(&self, label: &str) -> Option<TierSelection> {
        if label.eq_ignore_ascii_case(AUTO_LABEL) {
            Some(TierSelection::Auto)
        } else {
            self.find_label(label).map(TierSelection::Tier)
        }
    }
}
