//! Query-response filter.
//!
//! When a pane attaches mid-stream or replays scrollback, replies that a
//! terminal sent to some earlier query (device attributes, cursor position,
//! mode reports, color queries) have no query context left and would show up
//! as literal garbage. This filter names exactly those replies; everything else,
//! colors and cursor movement included, is left alone.

use crate::scanner::ScanEvent;

/// Allow-list of query-reply sequences to drop before display.
///
/// Suppressed:
/// - CSI ... c (DA1 and DA2, primary and secondary forms)
/// - CSI ... R (cursor position report)
/// - CSI ... $ y (DEC mode report)
/// - OSC 10-19 (foreground/background/cursor/palette color replies)
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryResponseFilter;

impl QueryResponseFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn should_suppress(&self, event: &ScanEvent) -> bool {
        match event {
            ScanEvent::Csi(csi) => match csi.final_byte {
                b'c' | b'R' => csi.intermediates.is_empty(),
                b'y' => csi.intermediates == b"$",
                _ => false,
            },
            ScanEvent::Osc(osc) => (10..=19).contains(&osc.code),
            ScanEvent::PlainRun(_) | ScanEvent::ClearScrollback => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::EscapeScanner;

    fn suppressed(input: &[u8]) -> Vec<bool> {
        let filter = QueryResponseFilter::new();
        let mut scanner = EscapeScanner::new();
        scanner
            .feed(input)
            .iter()
            .map(|e| filter.should_suppress(e))
            .collect()
    }

    #[test]
    fn test_filter_da1_response() {
        assert_eq!(suppressed(b"\x1b[?64;1;2;6;9;15;18;21;22c"), vec![true]);
    }

    #[test]
    fn test_filter_da1_query() {
        assert_eq!(suppressed(b"\x1b[c"), vec![true]);
        assert_eq!(suppressed(b"\x1b[0c"), vec![true]);
    }

    #[test]
    fn test_filter_da2_response() {
        assert_eq!(suppressed(b"\x1b[>1;123;0c"), vec![true]);
    }

    #[test]
    fn test_filter_cursor_position_report() {
        assert_eq!(suppressed(b"\x1b[24;80R"), vec![true]);
    }

    #[test]
    fn test_filter_mode_report() {
        assert_eq!(suppressed(b"\x1b[?1049;2$y"), vec![true]);
    }

    #[test]
    fn test_filter_color_replies() {
        for code in 10..=19 {
            let input = format!("\x1b]{};rgb:1a1a/1a1a/1a1a\x1b\\", code);
            assert_eq!(suppressed(input.as_bytes()), vec![true], "OSC {}", code);
        }
    }

    #[test]
    fn test_preserve_modes_cwd_and_title() {
        assert_eq!(suppressed(b"\x1b[?1049h"), vec![false]);
        assert_eq!(suppressed(b"\x1b[?2004l"), vec![false]);
        assert_eq!(suppressed(b"\x1b]7;file:///tmp\x07"), vec![false]);
        assert_eq!(suppressed(b"\x1b]0;title\x07"), vec![false]);
        assert_eq!(suppressed(b"\x1b[3J"), vec![false]);
    }

    #[test]
    fn test_preserve_cursor_visibility_and_color() {
        assert_eq!(suppressed(b"\x1b[?25h\x1b[38;5;196m"), vec![false]);
    }
}
