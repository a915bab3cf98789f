//! SenseME wire format
//!
//! Commands are sent as `<target;path...>` and the device answers with
//! `(name;path;value)` records. Records have no length prefix and may be
//! concatenated (`(a)(b)`) or split at any byte by the transport, so framing
//! relies on the `)(` boundary and on buffering the trailing fragment.

use crate::error::{Result, SensemeError};
use std::fmt;

/// Key of the device-reported error notice
pub const ERROR_KEY: &str = "ERROR";

/// Clock parameter pushed every second; never stored
pub const TIME_KEY: &str = "TIME;VALUE";

/// Last parameter of a full snapshot common to fans and lights
pub const FIRST_UPDATE_KEY: &str = "SNSROCC;TIMEOUT;MIN";

/// Target used for requests addressed to every device
pub const ALL_TARGET: &str = "ALL";

/// Discovery replies outside this length range are rejected
const MIN_REPLY_LEN: usize = 31;
const MAX_REPLY_LEN: usize = 200;

/// Fragments that grow past this without a closing `)` are dropped
const MAX_FRAGMENT_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Get,
    Set(String),
    Value(String),
    Bare,
}

/// Outgoing command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    target: String,
    path: String,
    action: Action,
}

impl Command {
    /// `<target;path;GET>`
    pub fn get(target: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(target, path, Action::Get)
    }

    /// `<target;path;SET;value>`
    pub fn set(target: impl Into<String>, path: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::new(target, path, Action::Set(value.to_string()))
    }

    /// `<target;path;value>`
    pub fn value(target: impl Into<String>, path: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::new(target, path, Action::Value(value.to_string()))
    }

    /// `<target;path>`
    pub fn bare(target: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(target, path, Action::Bare)
    }

    /// The discovery request, `<ALL;DEVICE;ID;GET>`
    pub fn discovery() -> Self {
        Self::get(ALL_TARGET, "DEVICE;ID")
    }

    fn new(target: impl Into<String>, path: impl Into<String>, action: Action) -> Self {
        Self {
            target: target.into(),
            path: path.into(),
            action,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Action::Get => write!(f, "<{};{};GET>", self.target, self.path),
            Action::Set(value) => write!(f, "<{};{};SET;{}>", self.target, self.path, value),
            Action::Value(value) => write!(f, "<{};{};{}>", self.target, self.path, value),
            Action::Bare => write!(f, "<{};{}>", self.target, self.path),
        }
    }
}

/// Reassembles `(...)` records from arbitrarily split reads
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every record it completes, in order
    ///
    /// A trailing record without its closing `)` is kept and prefixed to the
    /// next chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        for i in 1..data.len() {
            if data[i - 1] == b')' && data[i] == b'(' {
                frames.push(String::from_utf8_lossy(&data[start..i]).into_owned());
                start = i;
            }
        }

        let tail = &data[start..];
        if tail.last() == Some(&b')') {
            frames.push(String::from_utf8_lossy(tail).into_owned());
        } else if tail.len() > MAX_FRAGMENT_LEN {
            tracing::warn!("Dropping {} byte fragment with no closing delimiter", tail.len());
        } else {
            self.pending = tail.to_vec();
        }
        frames
    }

    /// Bytes of the record still waiting for its closing delimiter
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Number of trailing `;` components that make up the value of `result`
///
/// Most parameters carry one value. Bookends carry a min/max pair, the
/// network parameters carry ip/gateway/mask, and `DEVICE;LIGHT` carries
/// everything after its two key components.
pub fn value_count(result: &str) -> usize {
    if result.contains("BOOKENDS") {
        2
    } else if result.contains("NW;PARAMS;ACTUAL") {
        3
    } else if result.contains("DEVICE;LIGHT") {
        result.split(';').count().saturating_sub(2)
    } else {
        1
    }
}

/// A complete, decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// State update for one parameter
    Param { key: String, value: String },
    /// `ERROR` notice from the device
    Error(String),
}

impl Message {
    /// Decode one `(name;key...;value...)` record
    pub fn parse(frame: &str) -> Result<Self> {
        let inner = frame
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| SensemeError::Malformed(frame.to_string()))?;

        // first component echoes the device name
        let (_, result) = inner
            .split_once(';')
            .ok_or_else(|| SensemeError::Malformed(frame.to_string()))?;

        let count = value_count(result);
        let parts: Vec<&str> = result.split(';').collect();
        if count == 0 || parts.len() <= count {
            return Err(SensemeError::Malformed(frame.to_string()));
        }

        let split = parts.len() - count;
        let key = parts[..split].join(";");
        let value = parts[split..].join(";");

        if key == ERROR_KEY {
            Ok(Message::Error(value))
        } else {
            Ok(Message::Param { key, value })
        }
    }
}

/// Identity announced by a device in answer to `DEVICE;ID;GET`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub name: String,
    pub id: String,
    pub model: String,
}

impl DiscoveryReply {
    /// Parse `(name;DEVICE;ID;mac;model)`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim_end_matches(['\0', '\r', '\n']);
        if raw.len() < MIN_REPLY_LEN || raw.len() > MAX_REPLY_LEN {
            return Err(SensemeError::Malformed(format!(
                "discovery reply of {} bytes",
                raw.len()
            )));
        }

        let inner = raw
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| SensemeError::Malformed(raw.to_string()))?;

        let fields: Vec<&str> = inner.split(';').collect();
        match fields.as_slice() {
            [name, _, _, id, model] => Ok(Self {
                name: (*name).to_string(),
                id: (*id).to_string(),
                model: (*model).to_string(),
            }),
            _ => Err(SensemeError::Malformed(raw.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "(Fan;FAN;PWR;ON)(Fan;FAN;BOOKENDS;1;7)(Fan;DEVICE;LIGHT;PRESENT;COLOR)\
        (Fan;NW;PARAMS;ACTUAL;10.0.0.5;10.0.0.1;255.255.255.0)(Fan;ERROR;PARSE)(Fan;FAN;SPD;ACTUAL;3)";

    fn decode_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut decoder = FrameDecoder::new();
        chunks.iter().flat_map(|c| decoder.decode(c)).collect()
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::get("Fan", "FAN;PWR").encode(), "<Fan;FAN;PWR;GET>");
        assert_eq!(Command::set("Fan", "FAN;SPD", 3).encode(), "<Fan;FAN;SPD;SET;3>");
        assert_eq!(Command::value("Fan", "FAN;PWR", "ON").encode(), "<Fan;FAN;PWR;ON>");
        assert_eq!(Command::bare("Fan", "GETALL").encode(), "<Fan;GETALL>");
        assert_eq!(Command::discovery().encode(), "<ALL;DEVICE;ID;GET>");
    }

    #[test]
    fn test_concatenated_records_are_split() {
        let frames = decode_all(&[b"(a;X;1)(a;Y;2)(a;Z;3)"]);
        assert_eq!(frames, vec!["(a;X;1)", "(a;Y;2)", "(a;Z;3)"]);
    }

    #[test]
    fn test_fragment_is_buffered() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(b"(a;X;1)(a;Y"), vec!["(a;X;1)"]);
        assert_eq!(decoder.pending(), b"(a;Y");
        assert_eq!(decoder.decode(b";2)"), vec!["(a;Y;2)"]);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_buffer() {
        let whole = decode_all(&[STREAM.as_bytes()]);
        let bytes: Vec<&[u8]> = STREAM.as_bytes().chunks(1).collect();
        assert_eq!(decode_all(&bytes), whole);
        assert_eq!(whole.len(), 6);
    }

    #[test]
    fn test_any_split_point_reproduces_stream() {
        let whole = decode_all(&[STREAM.as_bytes()]);
        let data = STREAM.as_bytes();
        for offset in 0..=data.len() {
            let (head, tail) = data.split_at(offset);
            assert_eq!(decode_all(&[head, tail]), whole, "split at {offset}");
        }
    }

    #[test]
    fn test_multibyte_name_split_mid_character() {
        let data = "(Café;FAN;PWR;ON)".as_bytes();
        let bytes: Vec<&[u8]> = data.chunks(1).collect();
        assert_eq!(decode_all(&bytes), vec!["(Café;FAN;PWR;ON)"]);
    }

    #[test]
    fn test_single_value() {
        assert_eq!(
            Message::parse("(Fan;FAN;SPD;ACTUAL;3)").unwrap(),
            Message::Param { key: "FAN;SPD;ACTUAL".into(), value: "3".into() }
        );
    }

    #[test]
    fn test_bookends_carry_two_values() {
        assert_eq!(
            Message::parse("(dev;FAN;BOOKENDS;3;7)").unwrap(),
            Message::Param { key: "FAN;BOOKENDS".into(), value: "3;7".into() }
        );
    }

    #[test]
    fn test_network_params_carry_three_values() {
        assert_eq!(
            Message::parse("(dev;NW;PARAMS;ACTUAL;10.0.0.5;10.0.0.1;255.255.255.0)").unwrap(),
            Message::Param {
                key: "NW;PARAMS;ACTUAL".into(),
                value: "10.0.0.5;10.0.0.1;255.255.255.0".into(),
            }
        );
    }

    #[test]
    fn test_device_light_value_count_is_variable() {
        assert_eq!(
            Message::parse("(dev;DEVICE;LIGHT;PRESENT;COLOR)").unwrap(),
            Message::Param { key: "DEVICE;LIGHT".into(), value: "PRESENT;COLOR".into() }
        );
        assert_eq!(
            Message::parse("(dev;DEVICE;LIGHT;NOT PRESENT)").unwrap(),
            Message::Param { key: "DEVICE;LIGHT".into(), value: "NOT PRESENT".into() }
        );
        assert!(Message::parse("(dev;DEVICE;LIGHT)").is_err());
    }

    #[test]
    fn test_error_notice() {
        assert_eq!(
            Message::parse("(Fan;ERROR;PARSE)").unwrap(),
            Message::Error("PARSE".into())
        );
    }

    #[test]
    fn test_malformed_records() {
        assert!(Message::parse("(nosemicolon)").is_err());
        assert!(Message::parse("(Fan;ONLYKEY)").is_err());
        assert!(Message::parse("Fan;FAN;PWR;ON)").is_err());
    }

    #[test]
    fn test_discovery_reply() {
        let reply =
            DiscoveryReply::parse("(Bedroom Fan;x;y;AA:BB:CC:DD:EE:FF;FAN,HAIKU,SENSEME)").unwrap();
        assert_eq!(reply.name, "Bedroom Fan");
        assert_eq!(reply.id, "AA:BB:CC:DD:EE:FF");
        assert_eq!(reply.model, "FAN,HAIKU,SENSEME");
    }

    #[test]
    fn test_discovery_reply_rejects_bad_shapes() {
        assert!(DiscoveryReply::parse("(short;a;b;c;d)").is_err());
        assert!(DiscoveryReply::parse(&format!("({})", "x".repeat(250))).is_err());
        assert!(DiscoveryReply::parse("(Bedroom Fan;DEVICE;ID;AA:BB:CC:DD:EE:FF)").is_err());
        assert!(DiscoveryReply::parse("Bedroom Fan;DEVICE;ID;AA:BB:CC:DD:EE:FF;FAN,LSERIES").is_err());
    }
}
