//! Bulletin classification and locality extraction for Home Front Command
//! channel posts.
//!
//! A bulletin is free-form Hebrew text: a banner line, optional region
//! labels, comma-separated locality lists (each followed by a timing
//! parenthetical on alert bulletins) and instruction lines.  Nothing here
//! can fail: unparseable text degrades to fewer localities.
pub mod phrases;

use std::collections::HashSet;
use std::fmt;

use crate::bulletin::phrases::{
    BULLETIN_BANNERS, ENTER_PROTECTED_SPACE, REGION_PREFIX, ROCKET_FIRE, ROCKET_FIRE_WITH_EMOJI,
    STAND_DOWN, STAND_DOWN_VARIANTS, UPCOMING_WARNING, UPDATE_TOKEN,
};

/// Dash-like glyphs that show up between a city and its sub-area:
/// Hebrew maqaf, en dash, em dash.
const DASH_VARIANTS: &[char] = &['\u{05BE}', '\u{2013}', '\u{2014}'];

// ───────────────────────────── Normalizer ────────────────────────────────

/// Canonicalize a locality name: every dash variant becomes `" - "`,
/// whitespace runs collapse to one space, ends are trimmed.
///
/// Total and idempotent.
pub fn normalize(raw: &str) -> String {
    let dashed: String = raw
        .chars()
        .map(|c| if DASH_VARIANTS.contains(&c) { '-' } else { c })
        .collect();

    dashed
        .split('-')
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join(" - ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ───────────────────────────── Classifier ────────────────────────────────

/// Coarse bulletin type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulletinKind {
    /// "Alerts expected shortly" advisory.  Never arms or clears anything.
    UpcomingWarning,
    /// Authoritative "you may leave the protected space" update.
    StandDown,
    /// Everything else: a siren bulletin listing localities with timings.
    Alert,
}

impl BulletinKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UpcomingWarning => "upcoming_warning",
            Self::StandDown => "stand_down",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for BulletinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// `true` for the advisory bulletin that must be ignored outright.
pub fn is_upcoming_warning(text: &str) -> bool {
    text.contains(UPCOMING_WARNING)
}

/// Classify raw bulletin text.
///
/// The advisory phrase wins over everything.  A stand-down needs both the
/// "update" token on the first non-empty line and the stand-down phrase
/// somewhere in the body.
pub fn classify(text: &str) -> BulletinKind {
    if is_upcoming_warning(text) {
        return BulletinKind::UpcomingWarning;
    }

    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty());
    let update_banner = first_line.is_some_and(|l| l.contains(UPDATE_TOKEN));
    if update_banner && text.contains(STAND_DOWN) {
        return BulletinKind::StandDown;
    }

    BulletinKind::Alert
}

// ───────────────────────────── Extractor ─────────────────────────────────

/// Banner, region label or instruction, never a locality list.
///
/// The stand-down phrases are checked here, ahead of any parenthetical
/// logic, because stand-down lines carry no timing and would otherwise be
/// read as localities.
fn is_header_or_instruction(line: &str) -> bool {
    (line.starts_with(REGION_PREFIX) && !line.contains('('))
        || line.contains(ENTER_PROTECTED_SPACE)
        || line.starts_with(ROCKET_FIRE)
        || line.starts_with(ROCKET_FIRE_WITH_EMOJI)
        || BULLETIN_BANNERS.iter().any(|b| line.starts_with(b))
        || STAND_DOWN_VARIANTS.iter().any(|p| line.contains(p))
}

/// The comma-separated part of a locality line.
///
/// Alert lines end with a timing parenthetical (`"(1 minute)"`) and are
/// only accepted when one is present; stand-down lines have none.
fn locality_list(line: &str, kind: BulletinKind) -> Option<&str> {
    match kind {
        BulletinKind::StandDown => Some(line),
        _ => line.find('(').map(|idx| &line[..idx]),
    }
}

fn is_banner_token(name: &str) -> bool {
    name == ROCKET_FIRE || name == ROCKET_FIRE_WITH_EMOJI
}

/// Extract the normalized, de-duplicated localities named by a bulletin,
/// in first-seen order.  Advisory bulletins always yield nothing.
pub fn extract_localities(text: &str, kind: BulletinKind) -> Vec<String> {
    if kind == BulletinKind::UpcomingWarning {
        return Vec::new();
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    let lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    for line in lines {
        if is_header_or_instruction(line) {
            continue;
        }
        let Some(list) = locality_list(line, kind) else {
            continue;
        };

        for name in list.split(',').map(normalize) {
            if name.is_empty() || is_banner_token(&name) {
                continue;
            }
            if seen.insert(name.clone()) {
                out.push(name);
            }
        }
    }

    out
}
