//! Controller reply lines.
//!
//! The firmware answers every command with a single line.  Only lines that
//! carry one of the known markers are treated as replies; anything else
//! (debug chatter, the boot banner) is telemetry only and never completes a
//! pending exchange.

/// Boot banner printed once the firmware has finished initialising.
pub const READY_BANNER: &str = "ARDUINO_READY";

/// Marker the `STATUS` reply carries when the controller cannot accept work.
pub const NOT_READY_TOKEN: &str = "READY:0";

const DISTANCE_PREFIX: &str = "DIST:";

/// Recognised reply kinds, in match precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    PollDone,
    TooFar,
    DistanceErr,
    Busy,
    Homed,
    TestDone,
    /// A bare `DIST:<n>` reading.
    Distance,
    /// A `STATUS ...` snapshot.
    Status,
}

impl ReplyKind {
    const MARKERS: [(&'static str, ReplyKind); 6] = [
        ("POLL_DONE", ReplyKind::PollDone),
        ("TOO_FAR", ReplyKind::TooFar),
        ("DISTANCE_ERR", ReplyKind::DistanceErr),
        ("BUSY", ReplyKind::Busy),
        ("HOMED", ReplyKind::Homed),
        ("TEST_DONE", ReplyKind::TestDone),
    ];

    /// Classify a trimmed line, or `None` if it is not a reply.
    pub fn classify(line: &str) -> Option<Self> {
        if let Some((_, kind)) = Self::MARKERS.iter().find(|(marker, _)| line.contains(marker)) {
            return Some(*kind);
        }
        if line.starts_with(DISTANCE_PREFIX) {
            return Some(ReplyKind::Distance);
        }
        if line.starts_with("STATUS") {
            return Some(ReplyKind::Status);
        }
        None
    }
}

/// `true` when `line` completes a pending command exchange.
pub fn is_reply(line: &str) -> bool {
    ReplyKind::classify(line).is_some()
}

/// Extract the first `DIST:<digits>` token from `line`.
///
/// Occurrences without at least one digit are skipped; a value that does not
/// fit in `u32` yields `None`.
pub fn parse_distance(line: &str) -> Option<u32> {
    line.match_indices(DISTANCE_PREFIX).find_map(|(at, _)| {
        let rest = &line[at + DISTANCE_PREFIX.len()..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        rest[..end].parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_anywhere_in_line_are_replies() {
        assert_eq!(ReplyKind::classify("POLL_DONE:2 DIST:18"), Some(ReplyKind::PollDone));
        assert_eq!(ReplyKind::classify("ERR TOO_FAR DIST:55"), Some(ReplyKind::TooFar));
        assert_eq!(ReplyKind::classify("BUSY"), Some(ReplyKind::Busy));
        assert_eq!(ReplyKind::classify("HOMED"), Some(ReplyKind::Homed));
        assert_eq!(ReplyKind::classify("TEST_DONE"), Some(ReplyKind::TestDone));
        assert_eq!(ReplyKind::classify("DISTANCE_ERR"), Some(ReplyKind::DistanceErr));
    }

    #[test]
    fn distance_and_status_must_lead_the_line() {
        assert_eq!(ReplyKind::classify("DIST:31"), Some(ReplyKind::Distance));
        assert_eq!(ReplyKind::classify("STATUS DIST:12 READY:1"), Some(ReplyKind::Status));
        assert!(!is_reply("debug DIST:31"));
        assert!(!is_reply("motor STATUS ok"));
    }

    #[test]
    fn banner_and_chatter_are_not_replies() {
        assert!(!is_reply(READY_BANNER));
        assert!(!is_reply("servo calibrated"));
        assert!(!is_reply(""));
    }

    #[test]
    fn distance_token_extraction() {
        assert_eq!(parse_distance("POLL_DONE DIST:18"), Some(18));
        assert_eq!(parse_distance("STATUS DIST:7 READY:1"), Some(7));
        assert_eq!(parse_distance("DIST: DIST:42"), Some(42));
        assert_eq!(parse_distance("DIST:"), None);
        assert_eq!(parse_distance("HOMED"), None);
        assert_eq!(parse_distance("DIST:99999999999"), None);
    }
}
