use crate::candidate::Score;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown selection mode '{0}', expected max, min or unique-outlier")]
pub struct UnknownSelectMode(pub String);

/// How a batch of scores is turned into a winning candidate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectMode {
    /// Strictly largest score, which must be unique.
    #[default]
    Max,
    /// Strictly smallest score, which must be unique.
    Min,
    /// The minority value of a batch holding exactly two distinct scores.
    UniqueOutlier,
}

impl FromStr for SelectMode {
    type Err = UnknownSelectMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max" => Ok(SelectMode::Max),
            "min" => Ok(SelectMode::Min),
            "unique-outlier" | "unique_outlier" => Ok(SelectMode::UniqueOutlier),
            other => Err(UnknownSelectMode(other.to_string())),
        }
    }
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectMode::Max => "max",
            SelectMode::Min => "min",
            SelectMode::UniqueOutlier => "unique-outlier",
        })
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Selection {
    Winner(usize),
    Inconclusive,
}

impl Selection {
    pub fn winner(&self) -> Option<usize> {
        match self {
            Selection::Winner(index) => Some(*index),
            Selection::Inconclusive => None,
        }
    }
}

pub fn select(scores: &[Score], mode: SelectMode) -> Selection {
    match mode {
        SelectMode::Max => unique_extreme(scores, scores.iter().max()),
        SelectMode::Min => unique_extreme(scores, scores.iter().min()),
        SelectMode::UniqueOutlier => unique_outlier(scores),
    }
}

fn unique_extreme(scores: &[Score], extreme: Option<&Score>) -> Selection {
    let Some(&extreme) = extreme else {
        return Selection::Inconclusive;
    };
    let mut hits = scores.iter().enumerate().filter(|&(_, &s)| s == extreme);
    match (hits.next(), hits.next()) {
        (Some((index, _)), None) => Selection::Winner(index),
        _ => Selection::Inconclusive,
    }
}

/// Median-anchored outlier rule: with `lo`, `mid` (element at `len / 2` of
/// the sorted scores) and `hi`, the outlier is `lo` when `lo != mid`, else
/// `hi` when `hi != mid`. Balanced even-sized batches can make the upper
/// cluster win although it is not a strict minority; that follows the rule
/// as stated rather than a cluster-size comparison.
fn unique_outlier(scores: &[Score]) -> Selection {
    if scores.len() <= 2 {
        return Selection::Inconclusive;
    }
    let distinct: BTreeSet<Score> = scores.iter().copied().collect();
    if distinct.len() != 2 {
        return Selection::Inconclusive;
    }

    let mut sorted = scores.to_vec();
    sorted.sort_unstable();
    let lo = sorted[0];
    let mid = sorted[sorted.len() / 2];
    let hi = sorted[sorted.len() - 1];

    let outlier = if lo != mid {
        lo
    } else if hi != mid {
        hi
    } else {
        return Selection::Inconclusive;
    };
    scores
        .iter()
        .position(|&s| s == outlier)
        .map_or(Selection::Inconclusive, Selection::Winner)
}
