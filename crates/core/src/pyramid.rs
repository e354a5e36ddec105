//! Career Target Pyramid
//!
//! Maps a candidate's career stage to the stages whose content they may
//! receive. Each ladder is ordered from the most senior rung down; a stage
//! inherits everything below it.

use serde::{Deserialize, Serialize};

const ELITE_LADDER: &[&str] = &["exec", "manager", "professional", "graduate", "student"];
const OPERATIONAL_LADDER: &[&str] = &["op_supervisor", "op_experienced", "op_junior", "op_entry"];

/// Population a candidate belongs to; selects the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    #[default]
    Elite,
    Operational,
}

impl Segment {
    /// Anything other than `"operational"` is treated as elite.
    pub fn from_code(code: Option<&str>) -> Self {
        match code.map(|c| c.trim().to_lowercase()).as_deref() {
            Some("operational") => Segment::Operational,
            _ => Segment::Elite,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Segment::Elite => "elite",
            Segment::Operational => "operational",
        }
    }

    /// The ladder for this segment, most senior first.
    pub fn ladder(self) -> &'static [&'static str] {
        match self {
            Segment::Elite => ELITE_LADDER,
            Segment::Operational => OPERATIONAL_LADDER,
        }
    }
}

/// Expands `stage` into itself plus every rung below it.
///
/// Missing or unknown stages resolve to the lowest rung of the segment's ladder.
pub fn eligible_stages(segment: Segment, stage: Option<&str>) -> Vec<String> {
    let ladder = segment.ladder();
    let lowest = ladder.len() - 1;
    let start = stage
        .and_then(|s| ladder.iter().position(|rung| *rung == s))
        .unwrap_or(lowest);
    ladder[start..].iter().map(|rung| rung.to_string()).collect()
}
