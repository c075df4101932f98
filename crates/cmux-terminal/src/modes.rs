//! Sticky terminal modes and metadata derived from scanner events.

use percent_encoding::percent_decode_str;
use tracing::debug;
use url::Url;

use crate::scanner::ScanEvent;

/// DEC private mode for the alternate screen with saved cursor.
pub const ALTERNATE_SCREEN_MODE: u16 = 1049;

/// DEC private mode for bracketed paste.
pub const BRACKETED_PASTE_MODE: u16 = 2004;

/// Bookkeeping for the two binary modes plus title and working directory.
///
/// Pure state: the tracker never writes anything back to the stream.
#[derive(Debug, Default, Clone)]
pub struct ModeTracker {
    alternate_screen: bool,
    bracketed_paste: bool,
    cwd: Option<String>,
    cwd_update: Option<String>,
    title: Option<String>,
    title_update: Option<String>,
}

impl ModeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &ScanEvent) {
        match event {
            ScanEvent::Csi(csi)
                if csi.private_marker == Some(b'?') && csi.intermediates.is_empty() =>
            {
                let enabled = match csi.final_byte {
                    b'h' => true,
                    b'l' => false,
                    _ => return,
                };
                for &mode in &csi.params {
                    match mode {
                        ALTERNATE_SCREEN_MODE => self.alternate_screen = enabled,
                        BRACKETED_PASTE_MODE => self.bracketed_paste = enabled,
                        _ => {}
                    }
                }
            }
            ScanEvent::Osc(osc) => match osc.code {
                7 => match parse_osc7_path(&osc.body) {
                    Some(path) => {
                        if self.cwd.as_deref() != Some(path.as_str()) {
                            self.cwd = Some(path.clone());
                            self.cwd_update = Some(path);
                        }
                    }
                    None => debug!(
                        "[modes] Ignoring OSC 7 body {:?}",
                        String::from_utf8_lossy(&osc.body)
                    ),
                },
                0 | 2 => {
                    let title = String::from_utf8_lossy(&osc.body).into_owned();
                    if self.title.as_deref() != Some(title.as_str()) {
                        self.title = Some(title.clone());
                        self.title_update = Some(title);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    pub fn is_alternate_screen(&self) -> bool {
        self.alternate_screen
    }

    pub fn is_bracketed_paste(&self) -> bool {
        self.bracketed_paste
    }

    /// Last reported working directory.
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Working directory reported since the last call, if it changed.
    pub fn take_cwd_update(&mut self) -> Option<String> {
        self.cwd_update.take()
    }

    /// Window title reported since the last call, if it changed.
    pub fn take_title_update(&mut self) -> Option<String> {
        self.title_update.take()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Extract the path from an OSC 7 body of the form `file://<host>/<path>`.
///
/// The host is discarded and the path is percent-decoded.
pub fn parse_osc7_path(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?.trim();
    let url = Url::parse(text).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    let path = percent_decode_str(url.path()).decode_utf8().ok()?;
    if path.is_empty() {
        None
    } else {
        Some(path.into_owned())
    }
}
