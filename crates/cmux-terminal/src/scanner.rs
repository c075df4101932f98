//! Chunk-safe escape sequence scanner.
//!
//! The scanner walks PTY output one byte at a time and splits it into plain
//! runs and the small set of control sequences the session engine cares about.
//! Its parse position survives between `feed` calls, so a sequence split across
//! two reads is recognized exactly as if it had arrived in one piece.
//!
//! Recognized sequences:
//! - CSI with final `c` (DA1/DA2), final `R` (CPR)
//! - CSI with intermediate `$` and final `y` (DEC mode report)
//! - CSI `?` private mode set/reset (`h`/`l`)
//! - CSI `3 J` (ED3, clear scrollback)
//! - OSC 0 and 2 (title), OSC 7 (cwd), OSC 10-19 (color replies)
//!
//! Every other sequence is released inside a `PlainRun` byte for byte.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Longest CSI sequence (including `ESC [`) held before giving up on it.
pub const MAX_CSI_LEN: usize = 64;

/// Longest OSC sequence (including `ESC ]` and terminator) held before giving up on it.
pub const MAX_OSC_LEN: usize = 8192;

/// Raw bytes of the ED3 clear-scrollback sequence.
pub const ED3: &[u8] = b"\x1b[3J";

/// A complete CSI sequence the scanner extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiSequence {
    /// Leading private marker (`?`, `>`, `<`, `=`), if any
    pub private_marker: Option<u8>,
    /// Numeric parameters; empty or non-numeric parameters read as 0
    pub params: Vec<u16>,
    pub intermediates: Vec<u8>,
    pub final_byte: u8,
    /// The sequence exactly as it appeared in the stream
    pub raw: Vec<u8>,
}

impl CsiSequence {
    pub fn has_param(&self, value: u16) -> bool {
        self.params.contains(&value)
    }
}

/// A complete OSC sequence the scanner extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscSequence {
    pub code: u16,
    /// Bytes after the first `;`, without the terminator
    pub body: Vec<u8>,
    /// The sequence exactly as it appeared in the stream
    pub raw: Vec<u8>,
}

/// One unit of scanner output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    PlainRun(Vec<u8>),
    Csi(CsiSequence),
    Osc(OscSequence),
    /// `ESC [ 3 J`
    ClearScrollback,
}

impl ScanEvent {
    /// The stream bytes this event stands for.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ScanEvent::PlainRun(bytes) => bytes,
            ScanEvent::Csi(csi) => &csi.raw,
            ScanEvent::Osc(osc) => &osc.raw,
            ScanEvent::ClearScrollback => ED3,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    #[default]
    Ground,
    /// Saw ESC
    Escape,
    /// Inside `ESC [`, collecting parameter bytes
    CsiParam,
    /// Inside `ESC [`, collecting intermediate bytes
    CsiIntermediate,
    /// Inside `ESC ]`
    OscBody,
    /// Saw ESC inside an OSC body, expecting `\`
    OscEscape,
}

/// Stateful scanner for one session's output stream.
///
/// Owned by exactly one session; never shared between streams.
#[derive(Debug, Default)]
pub struct EscapeScanner {
    state: ScanState,
    /// Raw bytes of the sequence in progress, starting with ESC
    pending: Vec<u8>,
    /// Plain bytes collected during the current call
    plain: Vec<u8>,
}

impl EscapeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a chunk of output.
    ///
    /// An incomplete trailing sequence is held back and completed by the next
    /// call. Plain bytes are never held back.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        for &byte in data {
            self.advance(byte, &mut events);
        }
        self.flush_plain(&mut events);
        events
    }

    /// Release a held incomplete sequence as plain bytes.
    /// Call this when the stream ends.
    pub fn flush(&mut self) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        self.abandon();
        self.flush_plain(&mut events);
        events
    }

    /// True when no partial sequence is held.
    pub fn is_idle(&self) -> bool {
        self.state == ScanState::Ground
    }

    fn advance(&mut self, byte: u8, events: &mut Vec<ScanEvent>) {
        match self.state {
            ScanState::Ground => {
                if byte == ESC {
                    self.begin();
                } else {
                    self.plain.push(byte);
                }
            }

            ScanState::Escape => match byte {
                b'[' => {
                    self.pending.push(byte);
                    self.state = ScanState::CsiParam;
                }
                b']' => {
                    self.pending.push(byte);
                    self.state = ScanState::OscBody;
                }
                ESC => {
                    self.abandon();
                    self.begin();
                }
                // Two-byte escapes (including RIS `ESC c`) are plain data here
                _ => {
                    self.pending.push(byte);
                    self.abandon();
                }
            },

            ScanState::CsiParam => match byte {
                0x30..=0x3f => self.push_bounded(byte, MAX_CSI_LEN),
                0x20..=0x2f => {
                    self.state = ScanState::CsiIntermediate;
                    self.push_bounded(byte, MAX_CSI_LEN);
                }
                0x40..=0x7e => {
                    self.pending.push(byte);
                    self.finish_csi(events);
                }
                ESC => {
                    self.abandon();
                    self.begin();
                }
                _ => {
                    self.pending.push(byte);
                    self.abandon();
                }
            },

            ScanState::CsiIntermediate => match byte {
                0x20..=0x2f => self.push_bounded(byte, MAX_CSI_LEN),
                0x40..=0x7e => {
                    self.pending.push(byte);
                    self.finish_csi(events);
                }
                ESC => {
                    self.abandon();
                    self.begin();
                }
                // Parameter bytes after an intermediate make the sequence malformed
                _ => {
                    self.pending.push(byte);
                    self.abandon();
                }
            },

            ScanState::OscBody => match byte {
                BEL => {
                    self.pending.push(byte);
                    self.finish_osc(1, events);
                }
                ESC => {
                    self.state = ScanState::OscEscape;
                    self.push_bounded(byte, MAX_OSC_LEN);
                }
                _ => self.push_bounded(byte, MAX_OSC_LEN),
            },

            ScanState::OscEscape => {
                if byte == b'\\' {
                    self.pending.push(byte);
                    self.finish_osc(2, events);
                } else {
                    // An ESC that is not ST cancels the OSC and starts a new sequence
                    self.pending.pop();
                    self.abandon();
                    self.begin();
                    self.advance(byte, events);
                }
            }
        }
    }

    fn begin(&mut self) {
        self.pending.clear();
        self.pending.push(ESC);
        self.state = ScanState::Escape;
    }

    fn push_bounded(&mut self, byte: u8, limit: usize) {
        self.pending.push(byte);
        if self.pending.len() > limit {
            self.abandon();
        }
    }

    /// Give up on the pending sequence; its bytes become plain data.
    fn abandon(&mut self) {
        self.plain.append(&mut self.pending);
        self.state = ScanState::Ground;
    }

    fn flush_plain(&mut self, events: &mut Vec<ScanEvent>) {
        if !self.plain.is_empty() {
            events.push(ScanEvent::PlainRun(std::mem::take(&mut self.plain)));
        }
    }

    fn emit(&mut self, event: ScanEvent, events: &mut Vec<ScanEvent>) {
        self.flush_plain(events);
        events.push(event);
        self.pending.clear();
        self.state = ScanState::Ground;
    }

    fn finish_csi(&mut self, events: &mut Vec<ScanEvent>) {
        match classify_csi(&self.pending) {
            Some(event) => self.emit(event, events),
            None => self.abandon(),
        }
    }

    fn finish_osc(&mut self, terminator_len: usize, events: &mut Vec<ScanEvent>) {
        match classify_osc(&self.pending, terminator_len) {
            Some(event) => self.emit(event, events),
            None => self.abandon(),
        }
    }
}

fn classify_csi(raw: &[u8]) -> Option<ScanEvent> {
    // raw = ESC [ params intermediates final
    let (&final_byte, body) = raw.get(2..)?.split_last()?;
    let split = body
        .iter()
        .position(|b| (0x20..=0x2f).contains(b))
        .unwrap_or(body.len());
    let (param_bytes, intermediates) = body.split_at(split);

    let (private_marker, param_text) = match param_bytes.first() {
        Some(&marker) if (b'<'..=b'?').contains(&marker) => (Some(marker), &param_bytes[1..]),
        _ => (None, param_bytes),
    };

    if final_byte == b'J' && intermediates.is_empty() && private_marker.is_none() {
        return (param_text == b"3").then_some(ScanEvent::ClearScrollback);
    }

    let tracked = match final_byte {
        b'c' | b'R' => intermediates.is_empty(),
        b'y' => intermediates == b"$",
        b'h' | b'l' => intermediates.is_empty() && private_marker == Some(b'?'),
        _ => false,
    };
    if !tracked {
        return None;
    }

    Some(ScanEvent::Csi(CsiSequence {
        private_marker,
        params: parse_params(param_text),
        intermediates: intermediates.to_vec(),
        final_byte,
        raw: raw.to_vec(),
    }))
}

fn parse_params(text: &[u8]) -> Vec<u16> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split(|&b| b == b';')
        .map(|param| {
            param
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .fold(0u16, |acc, &d| {
                    acc.saturating_mul(10).saturating_add(u16::from(d - b'0'))
                })
        })
        .collect()
}

fn classify_osc(raw: &[u8], terminator_len: usize) -> Option<ScanEvent> {
    // raw = ESC ] code ; body terminator
    let content = raw.get(2..raw.len().checked_sub(terminator_len)?)?;
    let (code_text, body) = match content.iter().position(|&b| b == b';') {
        Some(i) => (&content[..i], &content[i + 1..]),
        None => (content, &content[content.len()..]),
    };
    if code_text.is_empty() || code_text.len() > 4 || !code_text.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = code_text
        .iter()
        .fold(0u16, |acc, &d| acc * 10 + u16::from(d - b'0'));

    match code {
        0 | 2 | 7 | 10..=19 => Some(ScanEvent::Osc(OscSequence {
            code,
            body: body.to_vec(),
            raw: raw.to_vec(),
        })),
        _ => None,
    }
}
