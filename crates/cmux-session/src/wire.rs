//! JSON frames exchanged with the session host over the mux WebSocket.
//!
//! Every frame is a JSON object tagged by `type`. Byte payloads (terminal
//! output, input, scrollback) travel base64-encoded. Requests carry a
//! `request_id` that the host echoes in its reply; stream events carry the
//! `pane_id` they belong to.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::channel::{AttachRequest, AttachResult, PaneId, StreamEvent};
use crate::error::{SessionError, SessionResult};

/// Exit code reported when the host could not determine one.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateOrAttach {
        request_id: u64,
        request: AttachRequest,
    },
    Write {
        request_id: u64,
        pane_id: PaneId,
        data: String,
    },
    Resize {
        request_id: u64,
        pane_id: PaneId,
        cols: u16,
        rows: u16,
    },
    Detach {
        request_id: u64,
        pane_id: PaneId,
    },
    Kill {
        request_id: u64,
        pane_id: PaneId,
    },
    ClearScrollback {
        request_id: u64,
        pane_id: PaneId,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientMessage::CreateOrAttach { request_id, .. }
            | ClientMessage::Write { request_id, .. }
            | ClientMessage::Resize { request_id, .. }
            | ClientMessage::Detach { request_id, .. }
            | ClientMessage::Kill { request_id, .. }
            | ClientMessage::ClearScrollback { request_id, .. } => *request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `create_or_attach`
    Attached {
        request_id: u64,
        #[serde(default)]
        backend_handle: Option<String>,
        #[serde(default)]
        is_cold_restore: bool,
        #[serde(default)]
        previous_cwd: Option<String>,
        #[serde(default)]
        scrollback: Option<String>,
        #[serde(default)]
        snapshot_ansi: Option<String>,
    },
    /// Reply to any other request
    Ok { request_id: u64 },
    Failed { request_id: u64, message: String },
    Data { pane_id: PaneId, data: String },
    Exit {
        pane_id: PaneId,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    Error { pane_id: PaneId, message: String },
    Disconnected { pane_id: PaneId, reason: String },
}

/// Successful reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Attached(AttachResult),
    Ok,
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Reply {
        request_id: u64,
        reply: Result<Reply, String>,
    },
    Event {
        pane_id: PaneId,
        event: StreamEvent,
    },
}

/// Parse one text frame from the host. Errors mark a malformed frame that
/// the caller skips; they never end the stream.
pub fn parse_server_frame(text: &str) -> SessionResult<Incoming> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| SessionError::Protocol(format!("invalid server frame: {}", e)))?;

    let incoming = match message {
        ServerMessage::Attached {
            request_id,
            backend_handle,
            is_cold_restore,
            previous_cwd,
            scrollback,
            snapshot_ansi,
        } => Incoming::Reply {
            request_id,
            reply: Ok(Reply::Attached(AttachResult {
                backend_handle,
                is_cold_restore,
                previous_cwd,
                scrollback: scrollback.as_deref().map(decode_bytes).transpose()?,
                snapshot_ansi: snapshot_ansi.as_deref().map(decode_bytes).transpose()?,
            })),
        },
        ServerMessage::Ok { request_id } => Incoming::Reply {
            request_id,
            reply: Ok(Reply::Ok),
        },
        ServerMessage::Failed {
            request_id,
            message,
        } => Incoming::Reply {
            request_id,
            reply: Err(message),
        },
        ServerMessage::Data { pane_id, data } => Incoming::Event {
            pane_id,
            event: StreamEvent::Data(decode_bytes(&data)?),
        },
        ServerMessage::Exit { pane_id, exit_code } => Incoming::Event {
            pane_id,
            event: StreamEvent::Exit(exit_code.unwrap_or(UNKNOWN_EXIT_CODE)),
        },
        ServerMessage::Error { pane_id, message } => Incoming::Event {
            pane_id,
            event: StreamEvent::Error(message),
        },
        ServerMessage::Disconnected { pane_id, reason } => Incoming::Event {
            pane_id,
            event: StreamEvent::Disconnected(reason),
        },
    };
    Ok(incoming)
}

pub fn encode_bytes(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_bytes(data: &str) -> SessionResult<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| SessionError::Protocol(format!("invalid base64 payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_shape() {
        let msg = ClientMessage::Resize {
            request_id: 7,
            pane_id: PaneId::new("pane-1"),
            cols: 120,
            rows: 40,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "resize");
        assert_eq!(json["pane_id"], "pane-1");
        assert_eq!(json["cols"], 120);
        assert_eq!(msg.request_id(), 7);
    }

    #[test]
    fn test_attach_request_omits_empty_options() {
        let msg = ClientMessage::CreateOrAttach {
            request_id: 1,
            request: AttachRequest {
                pane_id: PaneId::new("p"),
                tab_id: "t".into(),
                workspace_id: "w".into(),
                cols: 80,
                rows: 24,
                initial_commands: None,
                cwd: None,
                allow_killed: true,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["request"].get("cwd").is_none());
        assert_eq!(json["request"]["allow_killed"], true);
    }

    #[test]
    fn test_parse_cold_restore_reply() {
        let frame = format!(
            r#"{{"type":"attached","request_id":3,"is_cold_restore":true,"previous_cwd":"/srv","scrollback":"{}"}}"#,
            encode_bytes(b"abc")
        );
        let Incoming::Reply { request_id, reply } = parse_server_frame(&frame).unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(request_id, 3);
        let Ok(Reply::Attached(result)) = reply else {
            panic!("expected attached reply");
        };
        assert!(result.is_cold_restore);
        assert_eq!(result.previous_cwd.as_deref(), Some("/srv"));
        assert_eq!(result.scrollback.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_parse_events() {
        let data = format!(
            r#"{{"type":"data","pane_id":"p","data":"{}"}}"#,
            encode_bytes(b"\x1b[31mhi")
        );
        assert_eq!(
            parse_server_frame(&data).unwrap(),
            Incoming::Event {
                pane_id: PaneId::new("p"),
                event: StreamEvent::Data(b"\x1b[31mhi".to_vec()),
            }
        );

        let exit = r#"{"type":"exit","pane_id":"p"}"#;
        assert_eq!(
            parse_server_frame(exit).unwrap(),
            Incoming::Event {
                pane_id: PaneId::new("p"),
                event: StreamEvent::Exit(UNKNOWN_EXIT_CODE),
            }
        );
    }

    #[test]
    fn test_failed_reply() {
        let frame = r#"{"type":"failed","request_id":9,"message":"workspace missing"}"#;
        assert_eq!(
            parse_server_frame(frame).unwrap(),
            Incoming::Reply {
                request_id: 9,
                reply: Err("workspace missing".into()),
            }
        );
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(parse_server_frame("not json").is_err());
        assert!(parse_server_frame(r#"{"type":"bogus"}"#).is_err());
        assert!(parse_server_frame(r#"{"type":"data","pane_id":"p","data":"%%%"}"#).is_err());
    }
}
