//! Watch-list matching with base-city containment.
//!
//! A monitored locality `M` covers an alerted locality `A` when `A == M` or
//! `A` is a qualified sub-area `"M - <suffix>"`.

use std::collections::HashSet;

use crate::bulletin::{self, BulletinKind};

/// Alerted sub-areas that fell under one monitored locality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalityMatch {
    pub monitored: String,
    pub sub_areas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub kind: BulletinKind,
    pub alerted: Vec<String>,
    /// Watch-list order; monitored localities with no hits are absent.
    pub matches: Vec<LocalityMatch>,
}

impl MatchOutcome {
    fn empty(kind: BulletinKind) -> Self {
        Self {
            kind,
            alerted: Vec::new(),
            matches: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn get(&self, monitored: &str) -> Option<&[String]> {
        self.matches
            .iter()
            .find(|m| m.monitored == monitored)
            .map(|m| m.sub_areas.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Both names must already be normalized.
pub fn covers(monitored: &str, alerted: &str) -> bool {
    alerted == monitored
        || alerted
            .strip_prefix(monitored)
            .is_some_and(|rest| rest.starts_with(" - "))
}

/// Match extracted localities against the watch-list.
///
/// Advisory bulletins short-circuit without touching the input.
pub fn match_localities(
    kind: BulletinKind,
    localities: &[String],
    monitored: &[String],
) -> MatchOutcome {
    if kind == BulletinKind::UpcomingWarning {
        return MatchOutcome::empty(kind);
    }

    let alerted: Vec<String> = localities.iter().map(|l| bulletin::normalize(l)).collect();

    let mut seen_monitored = HashSet::new();
    let mut matches = Vec::new();
    for m in monitored.iter().map(|m| bulletin::normalize(m)) {
        if m.is_empty() || !seen_monitored.insert(m.clone()) {
            continue;
        }
        let sub_areas: Vec<String> = alerted.iter().filter(|a| covers(&m, a)).cloned().collect();
        if !sub_areas.is_empty() {
            matches.push(LocalityMatch {
                monitored: m,
                sub_areas,
            });
        }
    }

    MatchOutcome {
        kind,
        alerted,
        matches,
    }
}
