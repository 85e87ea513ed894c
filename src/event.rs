//! Nostr event model and wire codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::RelayError;

/// Kind number for file-metadata events referencing blob artifacts.
pub const KIND_FILE_METADATA: u16 = 1063;
/// Kind number for software release events.
pub const KIND_RELEASE: u16 = 30063;
/// Kind number for software application events.
pub const KIND_APP: u16 = 32267;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core Nostr event persisted in SQLite and served to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1063` or `30063`.
    pub kind: u16,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Retention classes derived from the kind number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceClass {
    /// Stored forever, one row per id.
    Regular,
    /// At most one event per `(pubkey, kind)`.
    Replaceable,
    /// At most one event per `(pubkey, kind, d-tag)`.
    Parameterized,
    /// Deleted after a historical query returns it.
    Ephemeral,
}

/// Classify a kind number into its retention class.
pub fn replace_class(kind: u16) -> ReplaceClass {
    match kind {
        0 | 3 => ReplaceClass::Replaceable,
        10000..=19999 => ReplaceClass::Replaceable,
        20000..=29999 => ReplaceClass::Ephemeral,
        30000..=39999 => ReplaceClass::Parameterized,
        _ => ReplaceClass::Regular,
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl Event {
    /// Decode an event from its wire JSON value, rejecting anything outside
    /// the field domains.
    pub fn from_value(val: &Value) -> Result<Self, RelayError> {
        let obj = val
            .as_object()
            .ok_or_else(|| RelayError::MalformedEvent("event is not an object".into()))?;
        let field = |name: &str| {
            obj.get(name)
                .ok_or_else(|| RelayError::MalformedEvent(format!("missing field {name}")))
        };
        let str_field = |name: &str| {
            field(name)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| RelayError::MalformedEvent(format!("{name} is not a string")))
        };

        let id = str_field("id")?;
        if !is_hex(&id, 64) {
            return Err(RelayError::MalformedEvent("id is not 64 hex chars".into()));
        }
        let pubkey = str_field("pubkey")?;
        if !is_hex(&pubkey, 64) {
            return Err(RelayError::MalformedEvent(
                "pubkey is not 64 hex chars".into(),
            ));
        }
        let sig = str_field("sig")?;
        if !is_hex(&sig, 128) {
            return Err(RelayError::MalformedEvent("sig is not 128 hex chars".into()));
        }
        let kind = field("kind")?
            .as_u64()
            .filter(|k| *k <= u64::from(u16::MAX))
            .ok_or_else(|| RelayError::MalformedEvent("kind outside 0..65535".into()))?
            as u16;
        let created_at = field("created_at")?
            .as_u64()
            .ok_or_else(|| RelayError::MalformedEvent("created_at is not an integer".into()))?;
        let content = str_field("content")?;

        let raw_tags = field("tags")?
            .as_array()
            .ok_or_else(|| RelayError::MalformedEvent("tags is not an array".into()))?;
        let mut tags = Vec::with_capacity(raw_tags.len());
        for raw in raw_tags {
            let fields = raw
                .as_array()
                .ok_or_else(|| RelayError::MalformedEvent("tag is not an array".into()))?;
            if fields.is_empty() {
                return Err(RelayError::MalformedEvent("tag is empty".into()));
            }
            let mut tag = Vec::with_capacity(fields.len());
            for f in fields {
                tag.push(f.as_str().map(str::to_string).ok_or_else(|| {
                    RelayError::MalformedEvent("tag element is not a string".into())
                })?);
            }
            tags.push(Tag(tag));
        }

        Ok(Event {
            id,
            pubkey,
            kind,
            created_at,
            tags,
            content,
            sig,
        })
    }

    /// Recompute the canonical event digest from the event fields.
    pub fn digest(&self) -> Result<[u8; 32], RelayError> {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let data =
            serde_json::to_vec(&arr).map_err(|e| RelayError::MalformedEvent(e.to_string()))?;
        Ok(Sha256::digest(&data).into())
    }

    /// First value of the first tag named `d`, or the empty string.
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|Tag(fields)| fields.first().map(String::as_str) == Some("d"))
            .and_then(|Tag(fields)| fields.get(1))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// First value of the first tag with the given name that carries one.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|Tag(fields)| match fields.as_slice() {
                [n, value, ..] if n == name => Some(value.as_str()),
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_event() -> Value {
        serde_json::json!({
            "id": "aa".repeat(32),
            "pubkey": "bb".repeat(32),
            "kind": 30063,
            "created_at": 1000,
            "tags": [["d", "app.one"], ["url", "https://example.com/a.apk"]],
            "content": "release notes",
            "sig": "cc".repeat(64),
        })
    }

    #[test]
    fn decode_round_trips() {
        let val = wire_event();
        let ev = Event::from_value(&val).unwrap();
        let encoded = serde_json::to_value(&ev).unwrap();
        let again = Event::from_value(&encoded).unwrap();
        assert_eq!(ev, again);
        assert_eq!(encoded, val);
    }

    #[test]
    fn decode_rejects_bad_hex() {
        let mut val = wire_event();
        val["id"] = Value::String("zz".repeat(32));
        assert!(matches!(
            Event::from_value(&val),
            Err(RelayError::MalformedEvent(_))
        ));
        let mut val = wire_event();
        val["pubkey"] = Value::String("ab".into());
        assert!(Event::from_value(&val).is_err());
        let mut val = wire_event();
        val["sig"] = Value::String("cc".repeat(32));
        assert!(Event::from_value(&val).is_err());
    }

    #[test]
    fn decode_rejects_kind_outside_domain() {
        let mut val = wire_event();
        val["kind"] = serde_json::json!(70000);
        assert!(Event::from_value(&val).is_err());
        let mut val = wire_event();
        val["kind"] = serde_json::json!(-1);
        assert!(Event::from_value(&val).is_err());
    }

    #[test]
    fn decode_rejects_bad_tags() {
        let mut val = wire_event();
        val["tags"] = serde_json::json!([["d", 5]]);
        assert!(Event::from_value(&val).is_err());
        let mut val = wire_event();
        val["tags"] = serde_json::json!([[]]);
        assert!(Event::from_value(&val).is_err());
        let mut val = wire_event();
        val["tags"] = serde_json::json!("not an array");
        assert!(Event::from_value(&val).is_err());
    }

    #[test]
    fn decode_rejects_missing_fields() {
        let mut val = wire_event();
        val.as_object_mut().unwrap().remove("sig");
        assert!(Event::from_value(&val).is_err());
    }

    #[test]
    fn d_tag_takes_first_d() {
        let ev = Event::from_value(&wire_event()).unwrap();
        assert_eq!(ev.d_tag(), "app.one");
        let mut bare = ev.clone();
        bare.tags = vec![Tag(vec!["d".into()]), Tag(vec!["d".into(), "later".into()])];
        assert_eq!(bare.d_tag(), "");
        bare.tags = vec![];
        assert_eq!(bare.d_tag(), "");
    }

    #[test]
    fn tag_value_finds_first_valued_tag() {
        let ev = Event::from_value(&wire_event()).unwrap();
        assert_eq!(ev.tag_value("url"), Some("https://example.com/a.apk"));
        assert_eq!(ev.tag_value("x"), None);
    }

    #[test]
    fn replace_class_ranges() {
        assert_eq!(replace_class(0), ReplaceClass::Replaceable);
        assert_eq!(replace_class(3), ReplaceClass::Replaceable);
        assert_eq!(replace_class(1), ReplaceClass::Regular);
        assert_eq!(replace_class(KIND_FILE_METADATA), ReplaceClass::Regular);
        assert_eq!(replace_class(10000), ReplaceClass::Replaceable);
        assert_eq!(replace_class(19999), ReplaceClass::Replaceable);
        assert_eq!(replace_class(20000), ReplaceClass::Ephemeral);
        assert_eq!(replace_class(29999), ReplaceClass::Ephemeral);
        assert_eq!(replace_class(30000), ReplaceClass::Parameterized);
        assert_eq!(replace_class(KIND_RELEASE), ReplaceClass::Parameterized);
        assert_eq!(replace_class(KIND_APP), ReplaceClass::Parameterized);
        assert_eq!(replace_class(39999), ReplaceClass::Parameterized);
        assert_eq!(replace_class(40000), ReplaceClass::Regular);
    }

    #[test]
    fn digest_matches_reference() {
        let ev = Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let expected = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            let bytes = Sha256::digest(serde_json::to_vec(&obj).unwrap());
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            arr
        };
        assert_eq!(ev.digest().unwrap(), expected);
    }
}
