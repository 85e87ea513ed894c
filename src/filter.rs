//! Filter parsing and compilation into indexed SQL plans.

use std::collections::BTreeMap;

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::RelayError;

const EVENT_COLUMNS: &str = "e.id, e.pubkey, e.sig, e.kind, e.created_at, e.content, e.tags";

/// A single conjunctive selector over events.
///
/// All present fields must match; a filter set matches when at least one of
/// its filters does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    /// Single-letter tag axes, keyed by the letter after `#`.
    pub tags: BTreeMap<char, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

/// One SQL statement of a compiled plan.
#[derive(Debug, Clone)]
pub struct Select {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Compiled form of a filter set: the statements to run in order, plus
/// whether the set passed the kind admission gate at all.
#[derive(Debug, Clone)]
pub struct Plan {
    pub selects: Vec<Select>,
    /// False when every filter was declined by the admission gate; the
    /// subscription is then answered with CLOSED instead of EOSE.
    pub admitted: bool,
}

fn hex_set(val: &Value, key: &str) -> Result<Vec<String>, RelayError> {
    let arr = val
        .as_array()
        .ok_or_else(|| RelayError::BadInput(format!("{key} is not an array")))?;
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let s = v
            .as_str()
            .ok_or_else(|| RelayError::BadInput(format!("{key} element is not a string")))?;
        let ok = !s.is_empty()
            && s.len() <= 64
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !ok {
            return Err(RelayError::BadInput(format!("{key} element is not hex")));
        }
        out.push(s.to_string());
    }
    Ok(out)
}

fn string_set(val: &Value, key: &str) -> Result<Vec<String>, RelayError> {
    let arr = val
        .as_array()
        .ok_or_else(|| RelayError::BadInput(format!("{key} is not an array")))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| RelayError::BadInput(format!("{key} element is not a string")))
        })
        .collect()
}

fn integer(val: &Value, key: &str) -> Result<u64, RelayError> {
    val.as_u64()
        .ok_or_else(|| RelayError::BadInput(format!("{key} is not a non-negative integer")))
}

impl Filter {
    /// Parse a filter from its wire JSON object, rejecting unknown options
    /// and out-of-domain values.
    pub fn from_value(val: &Value) -> Result<Self, RelayError> {
        let obj = val
            .as_object()
            .ok_or_else(|| RelayError::BadInput("filter is not an object".into()))?;
        let mut f = Filter::default();
        for (key, value) in obj {
            match key.as_str() {
                "ids" => f.ids = Some(hex_set(value, key)?),
                "authors" => f.authors = Some(hex_set(value, key)?),
                "kinds" => {
                    let arr = value
                        .as_array()
                        .ok_or_else(|| RelayError::BadInput("kinds is not an array".into()))?;
                    let mut kinds = Vec::with_capacity(arr.len());
                    for v in arr {
                        let k = v
                            .as_u64()
                            .filter(|k| *k <= u64::from(u16::MAX))
                            .ok_or_else(|| {
                                RelayError::BadInput("kind outside 0..65535".into())
                            })?;
                        kinds.push(k as u16);
                    }
                    f.kinds = Some(kinds);
                }
                "since" => f.since = Some(integer(value, key)?),
                "until" => f.until = Some(integer(value, key)?),
                "search" => {
                    f.search = Some(
                        value
                            .as_str()
                            .map(str::to_string)
                            .ok_or_else(|| RelayError::BadInput("search is not a string".into()))?,
                    )
                }
                "limit" => {
                    let n = integer(value, key)?;
                    if n == 0 {
                        return Err(RelayError::BadInput("limit must be positive".into()));
                    }
                    f.limit = Some(n as usize);
                }
                other => {
                    let mut chars = other.chars();
                    match (chars.next(), chars.next(), chars.next()) {
                        (Some('#'), Some(letter), None) if letter.is_ascii_alphabetic() => {
                            f.tags.insert(letter, string_set(value, other)?);
                        }
                        _ => {
                            return Err(RelayError::BadInput(format!(
                                "unknown filter option {other}"
                            )))
                        }
                    }
                }
            }
        }
        Ok(f)
    }

    /// True when no option is present; such a filter matches no stored rows
    /// but is still admitted, yielding an immediate EOSE.
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none()
            && self.search.is_none()
            && self.limit.is_none()
    }

    /// Clone of this filter with `ids` pinned to a single event id.
    ///
    /// Fan-out matching compiles the constrained filter and runs it, so the
    /// historical query and the live feed share one definition of "matches".
    pub fn constrained_to(&self, id: &str) -> Filter {
        let mut f = self.clone();
        f.ids = Some(vec![id.to_string()]);
        f
    }

    /// True when the filter names at least one kind from the allow-list.
    fn admitted_by(&self, allowed_kinds: &[u16]) -> bool {
        self.kinds
            .as_ref()
            .is_some_and(|ks| ks.iter().any(|k| allowed_kinds.contains(k)))
    }
}

/// Replace every character outside `[A-Za-z0-9_\s]` with a space before the
/// string reaches the FTS engine.
pub fn sanitize_search(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn compile_filter(f: &Filter) -> Option<Select> {
    let mut conj: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    let mut fts = false;
    let mut order = "e.created_at DESC";

    if let Some(ids) = &f.ids {
        conj.push(format!("e.id IN ({})", placeholders(ids.len())));
        params.extend(ids.iter().cloned().map(SqlValue::Text));
    }
    if let Some(authors) = &f.authors {
        conj.push(format!("e.pubkey IN ({})", placeholders(authors.len())));
        params.extend(authors.iter().cloned().map(SqlValue::Text));
    }
    if let Some(kinds) = &f.kinds {
        conj.push(format!("e.kind IN ({})", placeholders(kinds.len())));
        params.extend(kinds.iter().map(|k| SqlValue::Integer(i64::from(*k))));
    }
    if !f.tags.is_empty() {
        // Several single-letter axes in one filter intersect on the index.
        let sub = f
            .tags
            .iter()
            .map(|(name, values)| {
                params.extend(
                    values
                        .iter()
                        .map(|v| SqlValue::Text(format!("{name}:{v}"))),
                );
                format!(
                    "SELECT fid FROM tags_index WHERE value IN ({})",
                    placeholders(values.len())
                )
            })
            .collect::<Vec<_>>()
            .join(" INTERSECT ");
        conj.push(format!("e.rowid IN ({sub})"));
    }
    if let Some(since) = f.since {
        conj.push("e.created_at >= ?".into());
        params.push(SqlValue::Integer(since as i64));
    }
    if let Some(until) = f.until {
        conj.push("e.created_at <= ?".into());
        params.push(SqlValue::Integer(until as i64));
    }
    if let Some(search) = &f.search {
        if search.chars().count() == 2 {
            // Two-character searches probe for a name-tag value prefix on the
            // raw tags column instead of the trigram index.
            conj.push("instr(e.tags, ?) > 0".into());
            params.push(SqlValue::Text(format!("[\"name\",\"{search}")));
        } else {
            let needle = sanitize_search(search);
            if needle.trim().is_empty() {
                return None;
            }
            fts = true;
            conj.push("events_fts MATCH ?".into());
            params.push(SqlValue::Text(needle));
            order = "events_fts.rank";
        }
    }
    if conj.is_empty() {
        return None;
    }

    let from = if fts {
        "events e JOIN events_fts ON events_fts.rowid = e.rowid"
    } else {
        "events e"
    };
    let mut sql = format!(
        "SELECT {EVENT_COLUMNS} FROM {from} WHERE {} ORDER BY {order}",
        conj.join(" AND ")
    );
    if let Some(limit) = f.limit {
        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Integer(limit as i64));
    }
    Some(Select { sql, params })
}

/// Compile a filter set into its query plan.
///
/// Pure translation: the plan carries SQL text and bound parameters and is
/// executed by the storage adapter. Filters that fail the kind admission gate
/// are dropped; a set in which every filter fails compiles to "no rows" with
/// `admitted` false.
pub fn compile(filters: &[Filter], allowed_kinds: &[u16]) -> Plan {
    let mut selects = Vec::new();
    let mut admitted = false;
    for f in filters {
        if f.is_empty() {
            admitted = true;
            continue;
        }
        if !f.admitted_by(allowed_kinds) {
            continue;
        }
        admitted = true;
        if let Some(select) = compile_filter(f) {
            selects.push(select);
        }
    }
    Plan { selects, admitted }
}
