//! Parses a decoded line into `(verb, req_id, payload)` and formats
//! OK/ERR/PUSH response lines.
//!
//! Payload parsing is lazy: [`Request::args`] splits on first access rather
//! than at parse time, since most handlers only look up a handful of keys.

use std::fmt;

const MAX_TOKEN_LEN: usize = 31;

#[derive(Debug)]
pub enum CodecError {
    Malformed,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed request line")
    }
}

impl std::error::Error for CodecError {}

/// A parsed request line: `VERB SP REQ_ID SP PAYLOAD`.
#[derive(Debug, Clone)]
pub struct Request {
    pub verb: String,
    pub req_id: String,
    payload: String,
}

impl Request {
    /// Parses a raw line (already stripped of `\r\n`). Fails if `VERB` or
    /// `REQ_ID` is missing or empty; each is capped at 31 chars.
    pub fn parse(line: &str) -> Result<Request, CodecError> {
        let mut parts = line.splitn(3, ' ');
        let verb = parts.next().unwrap_or("");
        let req_id = parts.next().unwrap_or("");
        let payload = parts.next().unwrap_or("");
        if verb.is_empty() || req_id.is_empty() {
            return Err(CodecError::Malformed);
        }
        if verb.len() > MAX_TOKEN_LEN || req_id.len() > MAX_TOKEN_LEN {
            return Err(CodecError::Malformed);
        }
        Ok(Request {
            verb: verb.to_owned(),
            req_id: req_id.to_owned(),
            payload: payload.trim_end().to_owned(),
        })
    }

    /// Looks up the first `key=value` token whose key matches. Only the
    /// first `=` in a token separates key from value, so Base64 padding
    /// (`=`) inside a value survives intact.
    pub fn get(&self, key: &str) -> Option<&str> {
        for token in self.payload.split(' ') {
            if token.is_empty() {
                continue;
            }
            if let Some((k, v)) = token.split_once('=') {
                if k == key {
                    return Some(v);
                }
            }
        }
        None
    }

    pub fn get_owned(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.to_owned())
    }
}

/// Formats `OK SP REQ_ID [ SP PAYLOAD ] CRLF`.
pub fn format_ok(req_id: &str, payload: &str) -> String {
    if payload.is_empty() {
        format!("OK {req_id}\r\n")
    } else {
        format!("OK {req_id} {payload}\r\n")
    }
}

/// Formats `ERR SP REQ_ID SP CODE SP MESSAGE CRLF`.
pub fn format_err(req_id: &str, code: u16, message: &str) -> String {
    format!("ERR {req_id} {code} {message}\r\n")
}

/// Formats `PUSH SP SUBJECT SP PAYLOAD CRLF`.
pub fn format_push(subject: &str, payload: &str) -> String {
    format!("PUSH {subject} {payload}\r\n")
}

/// Builds a flat `key=value ...` payload string from ordered pairs.
pub fn build_payload(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verb_req_id_and_payload() {
        let req = Request::parse("REGISTER 1 username=alice password=secret1 email=a@b.co").unwrap();
        assert_eq!(req.verb, "REGISTER");
        assert_eq!(req.req_id, "1");
        assert_eq!(req.get("username"), Some("alice"));
        assert_eq!(req.get("password"), Some("secret1"));
        assert_eq!(req.get("email"), Some("a@b.co"));
    }

    #[test]
    fn missing_payload_is_fine() {
        let req = Request::parse("PING 1").unwrap();
        assert_eq!(req.verb, "PING");
        assert_eq!(req.req_id, "1");
        assert_eq!(req.get("anything"), None);
    }

    #[test]
    fn missing_verb_or_req_id_is_malformed() {
        assert!(Request::parse("").is_err());
        assert!(Request::parse(" 1 payload").is_err());
        assert!(Request::parse("VERB ").is_err());
    }

    #[test]
    fn only_first_equals_splits_key_value_base64_padding_survives() {
        let req = Request::parse("PM_SEND 1 token=T to=bob content=aGk=").unwrap();
        assert_eq!(req.get("content"), Some("aGk="));
    }

    #[test]
    fn unknown_key_returns_none() {
        let req = Request::parse("PING 1 a=b").unwrap();
        assert_eq!(req.get("nope"), None);
    }

    #[test]
    fn first_match_wins_on_duplicate_keys() {
        let req = Request::parse("X 1 k=first k=second").unwrap();
        assert_eq!(req.get("k"), Some("first"));
    }

    #[test]
    fn format_ok_omits_space_when_payload_empty() {
        assert_eq!(format_ok("1", ""), "OK 1\r\n");
        assert_eq!(format_ok("1", "pong=1"), "OK 1 pong=1\r\n");
    }

    #[test]
    fn format_err_matches_wire_grammar() {
        assert_eq!(
            format_err("3", 401, "invalid_token"),
            "ERR 3 401 invalid_token\r\n"
        );
    }

    #[test]
    fn format_push_matches_wire_grammar() {
        assert_eq!(
            format_push("PM", "from=alice content=aGk= msg_id=1 ts=100"),
            "PUSH PM from=alice content=aGk= msg_id=1 ts=100\r\n"
        );
    }
}
