//! Fixed Home Front Command phrasings the classifier and extractor key on.
//!
//! The channel posts in Hebrew only. Every entry here is matched against the
//! raw (trimmed) line, never lowercased (Hebrew has no case).

/// "Alerts are expected in your area in the next few minutes."  An advisory
/// that precedes real alerts; it names localities but arms nothing.
pub const UPCOMING_WARNING: &str = "בדקות הקרובות צפויות להתקבל התרעות באזורך";

/// "... may exit the protected space ..."  Core of every stand-down bulletin.
pub const STAND_DOWN: &str = "ניתן לצאת מהמרחב המוגן";

/// "Update"; must appear on the first line of a stand-down bulletin.
pub const UPDATE_TOKEN: &str = "עדכון";

/// Both stand-down sentence forms seen in real traffic.  Lines carrying
/// either are instructions, not locality lists.
pub const STAND_DOWN_VARIANTS: &[&str] = &[
    "ניתן לצאת מהמרחב המוגן אך יש להישאר בקרבתו", // may exit but stay nearby
    "באזורים הבאים ניתן לצאת מהמרחב המוגן",      // in the following areas ...
    STAND_DOWN,
];

/// "Enter the protected space."
pub const ENTER_PROTECTED_SPACE: &str = "היכנסו למרחב המוגן";

/// "Rocket and missile fire", the alert bulletin banner.
pub const ROCKET_FIRE: &str = "ירי רקטות וטילים";

/// Banner as posted with its siren emoji.
pub const ROCKET_FIRE_WITH_EMOJI: &str = "🚨 ירי רקטות וטילים";

/// Region label prefix ("Area ...").  Only a header when no timing
/// parenthetical follows on the same line.
pub const REGION_PREFIX: &str = "אזור ";

/// Flash / update banners that open advisory and stand-down bulletins.
pub const BULLETIN_BANNERS: &[&str] = &[
    "🚨 מבזק",  // flash
    "🚨 עדכון", // update
];
