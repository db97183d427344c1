use serde::{Deserialize, Serialize};

/// Inclusive bounds for terminal dimensions in `resize` frames
pub const MIN_PTY_DIM: i64 = 1;
pub const MAX_PTY_DIM: i64 = 1000;

// ── Client → Server ──────────────────────────────────────────

/// One inbound frame. Dimensions are carried as plain integers so
/// out-of-range values survive decoding and get a proper `error` frame
/// from validation instead of a silent drop.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    CreateSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Input {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    Resize {
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: i64,
        rows: i64,
    },
    CloseSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

// ── Server → Client ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SessionClosed {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Output {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    Error {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
}

impl ServerFrame {
    pub fn created(session_id: impl Into<String>) -> Self {
        Self::SessionCreated {
            session_id: session_id.into(),
        }
    }

    pub fn closed(session_id: impl Into<String>) -> Self {
        Self::SessionClosed {
            session_id: session_id.into(),
        }
    }

    pub fn output(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Output {
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    pub fn error(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Error {
            session_id: session_id.into(),
            error: error.into(),
        }
    }
}

pub fn dims_in_bounds(cols: i64, rows: i64) -> bool {
    (MIN_PTY_DIM..=MAX_PTY_DIM).contains(&cols) && (MIN_PTY_DIM..=MAX_PTY_DIM).contains(&rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_create_session() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"create_session","sessionId":"s1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::CreateSession { session_id } if session_id == "s1"));
    }

    #[test]
    fn test_decode_input() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"input","sessionId":"s1","data":"ls\n"}"#).unwrap();
        match frame {
            ClientFrame::Input { session_id, data } => {
                assert_eq!(session_id, "s1");
                assert_eq!(data, "ls\n");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_resize_keeps_out_of_range_dims() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","sessionId":"s1","cols":0,"rows":24}"#)
                .unwrap();
        match frame {
            ClientFrame::Resize { cols, rows, .. } => {
                assert_eq!(cols, 0);
                assert_eq!(rows, 24);
                assert!(!dims_in_bounds(cols, rows));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let res: Result<ClientFrame, _> =
            serde_json::from_str(r#"{"type":"mystery","sessionId":"s1"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_decode_rejects_missing_session_id() {
        let res: Result<ClientFrame, _> = serde_json::from_str(r#"{"type":"create_session"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_encode_output_uses_wire_spelling() {
        let json = serde_json::to_string(&ServerFrame::output("s1", "hi")).unwrap();
        assert_eq!(json, r#"{"type":"output","sessionId":"s1","data":"hi"}"#);
    }

    #[test]
    fn test_encode_error() {
        let json = serde_json::to_string(&ServerFrame::error("s1", "Session not found")).unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","sessionId":"s1","error":"Session not found"}"#
        );
    }

    #[test]
    fn test_dims_in_bounds() {
        assert!(dims_in_bounds(1, 1));
        assert!(dims_in_bounds(1000, 1000));
        assert!(!dims_in_bounds(0, 24));
        assert!(!dims_in_bounds(80, 1001));
        assert!(!dims_in_bounds(-1, 24));
    }
}
