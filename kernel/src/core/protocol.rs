//! Selection protocol: the strict text grammar emitted by decision backends.
//!
//! ```text
//! <ASK_SUP><END>
//! <NOOP><END>
//! <PICK><SIDdddd>[<INP>{json-object}</INP> | <INP64>base64(json-object)</INP64>]<END>
//! ```
//!
//! [`parse_selection`] never fails: anything outside the grammar is
//! [`Selection::Invalid`].

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::Sid;

const ASK_SUP_TEXT: &str = "<ASK_SUP><END>";
const NOOP_TEXT: &str = "<NOOP><END>";
const INVALID_TEXT: &str = "<INVALID><END>";

static PICK_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)\A<PICK><([^>]*)>(.*)<END>\z").unwrap());

/// Parsed backend decision.
///
/// A PICK's `input_patch` is syntactically a JSON object but otherwise
/// untrusted until the safe merge filters it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Selection {
    Pick {
        sid: Sid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_patch: Option<String>,
    },
    Noop,
    AskSup,
    Invalid,
}

impl Selection {
    pub fn pick(sid: Sid) -> Self {
        Selection::Pick {
            sid,
            input_patch: None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Selection::Invalid)
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Selection::Pick { .. } => "PICK",
            Selection::Noop => "NOOP",
            Selection::AskSup => "ASK_SUP",
            Selection::Invalid => "INVALID",
        }
    }

    /// Canonical protocol text for this selection.
    pub fn to_protocol(&self) -> String {
        match self {
            Selection::Pick {
                sid,
                input_patch: None,
            } => format!("<PICK><{sid}><END>"),
            Selection::Pick {
                sid,
                input_patch: Some(patch),
            } => format!("<PICK><{sid}><INP>{patch}</INP><END>"),
            Selection::Noop => NOOP_TEXT.to_string(),
            Selection::AskSup => ASK_SUP_TEXT.to_string(),
            Selection::Invalid => INVALID_TEXT.to_string(),
        }
    }
}

/// Parse backend output. Whitespace around the message is ignored.
pub fn parse_selection(raw: &str) -> Selection {
    let text = raw.trim();
    if text == ASK_SUP_TEXT {
        return Selection::AskSup;
    }
    if text == NOOP_TEXT {
        return Selection::Noop;
    }
    parse_pick(text).unwrap_or(Selection::Invalid)
}

fn parse_pick(text: &str) -> Option<Selection> {
    let caps = PICK_RE.captures(text)?;
    let sid = Sid::parse(caps.get(1)?.as_str()).ok()?;
    let body = caps.get(2)?.as_str();
    if body.is_empty() {
        return Some(Selection::pick(sid));
    }
    let patch = if let Some(json) = strip_block(body, "<INP>", "</INP>") {
        json.to_string()
    } else if let Some(encoded) = strip_block(body, "<INP64>", "</INP64>") {
        String::from_utf8(decode_base64(encoded)?).ok()?
    } else {
        return None;
    };
    if !is_json_object(&patch) {
        return None;
    }
    Some(Selection::Pick {
        sid,
        input_patch: Some(patch),
    })
}

fn strip_block<'a>(body: &'a str, open: &str, close: &str) -> Option<&'a str> {
    body.strip_prefix(open)?.strip_suffix(close)
}

fn is_json_object(text: &str) -> bool {
    matches!(serde_json::from_str::<Value>(text), Ok(Value::Object(_)))
}

/// Standard-alphabet base64. Decoding stops at the first `=`; any other
/// character outside the alphabet is an error.
fn decode_base64(encoded: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for byte in encoded.bytes() {
        let value = match byte {
            b'A'..=b'Z' => byte - b'A',
            b'a'..=b'z' => byte - b'a' + 26,
            b'0'..=b'9' => byte - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            b'=' => break,
            _ => return None,
        };
        acc = (acc << 6) | u32::from(value);
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terminal_forms() {
        assert_eq!(parse_selection("<NOOP><END>"), Selection::Noop);
        assert_eq!(parse_selection("<ASK_SUP><END>"), Selection::AskSup);
        assert_eq!(parse_selection("  <NOOP><END>\n"), Selection::Noop);
    }

    #[test]
    fn parses_bare_pick() {
        assert_eq!(
            parse_selection("<PICK><SID0004><END>"),
            Selection::pick(Sid::new(4))
        );
    }

    #[test]
    fn parses_pick_with_inline_patch() {
        assert_eq!(
            parse_selection(r#"<PICK><SID0004><INP>{"x":1}</INP><END>"#),
            Selection::Pick {
                sid: Sid::new(4),
                input_patch: Some(r#"{"x":1}"#.to_string()),
            }
        );
    }

    #[test]
    fn parses_pick_with_base64_patch() {
        // {"x":1}
        assert_eq!(
            parse_selection("<PICK><SID0002><INP64>eyJ4IjoxfQ==</INP64><END>"),
            Selection::Pick {
                sid: Sid::new(2),
                input_patch: Some(r#"{"x":1}"#.to_string()),
            }
        );
    }

    #[test]
    fn base64_padding_truncates_decoding() {
        assert_eq!(decode_base64("eyJ4IjoxfQ==trailing"), decode_base64("eyJ4IjoxfQ"));
        assert_eq!(decode_base64("e$"), None);
    }

    #[test]
    fn rejects_everything_else() {
        let cases = [
            "garbage",
            "",
            "<PICK><SID9999999><END>",
            "<PICK><SID004><END>",
            "<pick><SID0004><END>",
            "<PICK><SID0004>",
            "<PICK><SID0004><INP>[1,2]</INP><END>",
            "<PICK><SID0004><INP>not json</INP><END>",
            "<PICK><SID0004><INP>{\"x\":1}<END>",
            "<PICK><SID0004>junk<END>",
            "<PICK><SID0004><INP64>!!!</INP64><END>",
            "<PICK><SID0004><INP64>WzFd</INP64><END>",
            "<NOOP><END><END>",
            "<NOOP>",
            "<ASK_SUP><END> extra",
        ];
        for raw in cases {
            assert_eq!(parse_selection(raw), Selection::Invalid, "input: {raw:?}");
        }
    }

    #[test]
    fn patch_values_are_not_inspected() {
        let raw = r#"<PICK><SID0001><INP>{"_system":{"evil":true}}</INP><END>"#;
        assert!(matches!(
            parse_selection(raw),
            Selection::Pick {
                input_patch: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn protocol_text_round_trips() {
        let selections = [
            Selection::Noop,
            Selection::AskSup,
            Selection::pick(Sid::new(12)),
            Selection::Pick {
                sid: Sid::new(3),
                input_patch: Some(r#"{"note":"hi"}"#.to_string()),
            },
        ];
        for selection in selections {
            assert_eq!(parse_selection(&selection.to_protocol()), selection);
        }
        assert_eq!(
            parse_selection(&Selection::Invalid.to_protocol()),
            Selection::Invalid
        );
    }

    #[test]
    fn selection_serializes_with_kind_tag() {
        let json = serde_json::to_value(Selection::pick(Sid::new(1))).expect("serialize");
        assert_eq!(json, serde_json::json!({"kind": "PICK", "sid": "SID0001"}));
        let json = serde_json::to_value(Selection::AskSup).expect("serialize");
        assert_eq!(json, serde_json::json!({"kind": "ASK_SUP"}));
    }
}
