//! SQLite storage adapter for events and their indexes.

use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::error::RelayError;
use crate::event::{Event, Tag};
use crate::filter::Plan;

/// Schema bootstrap. The triggers keep `tags_index` and `events_fts` in step
/// with event inserts and deletes, so callers only ever touch event rows.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id TEXT NOT NULL UNIQUE,
    pubkey TEXT NOT NULL,
    sig TEXT NOT NULL,
    kind INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    content TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_kind_idx ON events(kind);
CREATE INDEX IF NOT EXISTS events_pubkey_idx ON events(pubkey);
CREATE INDEX IF NOT EXISTS events_created_at_idx ON events(created_at);

CREATE TABLE IF NOT EXISTS tags_index (
    fid INTEGER NOT NULL REFERENCES events(rowid),
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS tags_index_value_idx ON tags_index(value);

CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(text, tokenize = 'trigram');

CREATE TRIGGER IF NOT EXISTS events_index_insert AFTER INSERT ON events BEGIN
    INSERT INTO tags_index (fid, value)
        SELECT new.rowid, json_extract(j.value, '$[0]') || ':' || json_extract(j.value, '$[1]')
        FROM json_each(new.tags) j
        WHERE length(json_extract(j.value, '$[0]')) = 1
          AND json_array_length(j.value) >= 2;
    INSERT INTO events_fts (rowid, text)
        VALUES (new.rowid, (
            SELECT coalesce(group_concat(json_extract(j.value, '$[1]'), ' '), '')
            FROM json_each(new.tags) j
            WHERE json_array_length(j.value) >= 2
              AND json_extract(j.value, '$[0]') IN
                ('url','title','description','name','summary','alt','t','os','arch')
        ));
END;

CREATE TRIGGER IF NOT EXISTS events_index_delete AFTER DELETE ON events BEGIN
    DELETE FROM tags_index WHERE fid = old.rowid;
    DELETE FROM events_fts WHERE rowid = old.rowid;
END;
";

const INSERT_EVENT: &str = "INSERT INTO events (id, pubkey, sig, kind, created_at, content, tags)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Persistent store for events and indexes backed by a single connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn storage_err(e: rusqlite::Error) -> RelayError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            RelayError::StorageBusy
        }
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            RelayError::Duplicate
        }
        other => RelayError::StorageCorrupt(other.to_string()),
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get(6)?;
    let tags: Vec<Tag> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Event {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        sig: row.get(2)?,
        kind: row.get(3)?,
        created_at: row.get(4)?,
        content: row.get(5)?,
        tags,
    })
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, RelayError> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::configure(conn)
    }

    /// Open an in-memory database, used by tests and one-shot tooling.
    pub fn open_in_memory() -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch("PRAGMA foreign_keys = OFF")
            .map_err(storage_err)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(storage_err)?;
        conn.busy_timeout(Duration::from_millis(250))
            .map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create tables, indexes, and the index-maintenance triggers.
    pub fn init(&self) -> Result<(), RelayError> {
        self.lock().execute_batch(SCHEMA).map_err(storage_err)
    }

    /// True when an event with this id is stored.
    pub fn exists(&self, id: &str) -> Result<bool, RelayError> {
        self.lock()
            .query_row("SELECT 1 FROM events WHERE id = ?1", [id], |_| Ok(()))
            .optional()
            .map(|found| found.is_some())
            .map_err(storage_err)
    }

    /// Insert a single event; index rows follow via triggers.
    pub fn insert(&self, ev: &Event) -> Result<(), RelayError> {
        let tags = serde_json::to_string(&ev.tags)
            .map_err(|e| RelayError::MalformedEvent(e.to_string()))?;
        self.lock()
            .execute(
                INSERT_EVENT,
                params![
                    ev.id,
                    ev.pubkey,
                    ev.sig,
                    ev.kind,
                    ev.created_at as i64,
                    ev.content,
                    tags
                ],
            )
            .map(|_| ())
            .map_err(storage_err)
    }

    /// Delete an event row (and, via triggers, its index rows).
    pub fn delete_by_id(&self, id: &str) -> Result<(), RelayError> {
        self.lock()
            .execute("DELETE FROM events WHERE id = ?1", [id])
            .map(|_| ())
            .map_err(storage_err)
    }

    /// Insert `ev` and delete its replaced predecessor as one atomic unit, so
    /// a reader never observes zero rows for a replaceable key.
    pub fn replace(&self, ev: &Event, id_to_remove: Option<&str>) -> Result<(), RelayError> {
        let tags = serde_json::to_string(&ev.tags)
            .map_err(|e| RelayError::MalformedEvent(e.to_string()))?;
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(storage_err)?;
        tx.execute(
            INSERT_EVENT,
            params![
                ev.id,
                ev.pubkey,
                ev.sig,
                ev.kind,
                ev.created_at as i64,
                ev.content,
                tags
            ],
        )
        .map_err(storage_err)?;
        if let Some(old) = id_to_remove {
            tx.execute("DELETE FROM events WHERE id = ?1", [old])
                .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)
    }

    /// Id of the event currently holding a replaceable key, if any.
    ///
    /// `d` selects the parameterizable variant; the d-tag is read from the
    /// stored tags JSON so events without a `d` tag hold the empty-string key.
    pub fn current_holder(
        &self,
        pubkey: &str,
        kind: u16,
        d: Option<&str>,
    ) -> Result<Option<String>, RelayError> {
        let guard = self.lock();
        let result = match d {
            None => guard
                .query_row(
                    "SELECT id FROM events WHERE pubkey = ?1 AND kind = ?2 LIMIT 1",
                    params![pubkey, kind],
                    |row| row.get(0),
                )
                .optional(),
            Some(d) => guard
                .query_row(
                    "SELECT id FROM events WHERE pubkey = ?1 AND kind = ?2
                     AND coalesce((SELECT json_extract(j.value, '$[1]')
                                   FROM json_each(events.tags) j
                                   WHERE json_extract(j.value, '$[0]') = 'd'
                                   LIMIT 1), '') = ?3
                     LIMIT 1",
                    params![pubkey, kind, d],
                    |row| row.get(0),
                )
                .optional(),
        };
        result.map_err(storage_err)
    }

    /// Run a compiled plan, streaming each select in order and dropping
    /// events already produced by an earlier select.
    pub fn query(&self, plan: &Plan) -> Result<Vec<Event>, RelayError> {
        if !plan.admitted || plan.selects.is_empty() {
            return Ok(vec![]);
        }
        let guard = self.lock();
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for select in &plan.selects {
            let mut stmt = guard.prepare(&select.sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(select.params.iter()),
                    row_to_event,
                )
                .map_err(storage_err)?;
            for row in rows {
                let ev = row.map_err(storage_err)?;
                if seen.insert(ev.id.clone()) {
                    events.push(ev);
                }
            }
        }
        Ok(events)
    }

    /// Fetch one event by id.
    pub fn get(&self, id: &str) -> Result<Option<Event>, RelayError> {
        self.lock()
            .query_row(
                "SELECT e.id, e.pubkey, e.sig, e.kind, e.created_at, e.content, e.tags
                 FROM events e WHERE e.id = ?1",
                [id],
                row_to_event,
            )
            .optional()
            .map_err(storage_err)
    }

    /// All stored event ids, used by the verify subcommand.
    pub fn all_ids(&self) -> Result<Vec<String>, RelayError> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare("SELECT id FROM events")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(storage_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(storage_err)?);
        }
        Ok(ids)
    }

    #[cfg(test)]
    fn count(&self, sql: &str) -> i64 {
        self.lock().query_row(sql, [], |row| row.get(0)).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{compile, Filter};

    const ALLOWED: [u16; 6] = [1, 1063, 10000, 20000, 30063, 32267];

    fn store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        store
    }

    fn hid(seed: u8) -> String {
        format!("{seed:02x}").repeat(32)
    }

    fn sample_event(seed: u8, pubkey: &str, kind: u16, tags: Vec<Tag>, created: u64) -> Event {
        Event {
            id: hid(seed),
            pubkey: pubkey.into(),
            kind,
            created_at: created,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    fn filters(json: serde_json::Value) -> Vec<Filter> {
        vec![Filter::from_value(&json).unwrap()]
    }

    #[test]
    fn insert_populates_indexes() {
        let store = store();
        let ev = sample_event(
            1,
            &hid(0xaa),
            30063,
            vec![
                Tag(vec!["d".into(), "app.one".into()]),
                Tag(vec!["name".into(), "Example".into()]),
                Tag(vec!["url".into(), "https://x".into()]),
            ],
            1,
        );
        store.insert(&ev).unwrap();
        assert!(store.exists(&ev.id).unwrap());
        // one tag-index row per single-letter tag with a value
        assert_eq!(store.count("SELECT count(*) FROM tags_index"), 1);
        assert_eq!(
            store.count("SELECT count(*) FROM tags_index WHERE value = 'd:app.one'"),
            1
        );
        // the fts row concatenates the inclusion-set tag values
        assert_eq!(
            store.count("SELECT count(*) FROM events_fts WHERE text = 'Example https://x'"),
            1
        );
    }

    #[test]
    fn delete_removes_index_rows() {
        let store = store();
        let ev = sample_event(
            1,
            &hid(0xaa),
            30063,
            vec![
                Tag(vec!["d".into(), "app.one".into()]),
                Tag(vec!["name".into(), "Example".into()]),
            ],
            1,
        );
        store.insert(&ev).unwrap();
        store.delete_by_id(&ev.id).unwrap();
        assert!(!store.exists(&ev.id).unwrap());
        assert_eq!(store.count("SELECT count(*) FROM tags_index"), 0);
        assert_eq!(store.count("SELECT count(*) FROM events_fts"), 0);
    }

    #[test]
    fn duplicate_insert_reports_duplicate() {
        let store = store();
        let ev = sample_event(1, &hid(0xaa), 1063, vec![], 1);
        store.insert(&ev).unwrap();
        assert!(matches!(store.insert(&ev), Err(RelayError::Duplicate)));
    }

    #[test]
    fn query_membership_ranges_and_limit() {
        let store = store();
        let pk = hid(0xaa);
        for (seed, created) in [(1, 10), (2, 20), (3, 30)] {
            store
                .insert(&sample_event(seed, &pk, 1063, vec![], created))
                .unwrap();
        }
        let plan = compile(
            &filters(serde_json::json!({
                "authors": [pk],
                "kinds": [1063],
                "since": 15,
                "until": 35,
                "limit": 1
            })),
            &ALLOWED,
        );
        let events = store.query(&plan).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, hid(3));
    }

    #[test]
    fn query_orders_newest_first() {
        let store = store();
        let pk = hid(0xaa);
        for (seed, created) in [(1, 10), (3, 30), (2, 20)] {
            store
                .insert(&sample_event(seed, &pk, 1063, vec![], created))
                .unwrap();
        }
        let plan = compile(&filters(serde_json::json!({"kinds": [1063]})), &ALLOWED);
        let ids: Vec<String> = store
            .query(&plan)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![hid(3), hid(2), hid(1)]);
    }

    #[test]
    fn query_tag_intersection() {
        let store = store();
        let pk = hid(0xaa);
        let both = sample_event(
            1,
            &pk,
            30063,
            vec![
                Tag(vec!["d".into(), "app.one".into()]),
                Tag(vec!["t".into(), "android".into()]),
            ],
            1,
        );
        let only_d = sample_event(
            2,
            &pk,
            30063,
            vec![Tag(vec!["d".into(), "app.one".into()])],
            2,
        );
        store.insert(&both).unwrap();
        store.insert(&only_d).unwrap();
        let plan = compile(
            &filters(serde_json::json!({
                "kinds": [30063],
                "#d": ["app.one"],
                "#t": ["android"]
            })),
            &ALLOWED,
        );
        let events = store.query(&plan).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, hid(1));
    }

    #[test]
    fn query_search_matches_fts_text() {
        let store = store();
        let pk = hid(0xaa);
        let matching = sample_event(
            1,
            &pk,
            30063,
            vec![
                Tag(vec!["d".into(), "app.one".into()]),
                Tag(vec!["name".into(), "hello world app".into()]),
            ],
            1,
        );
        let other = sample_event(
            2,
            &pk,
            30063,
            vec![
                Tag(vec!["d".into(), "app.two".into()]),
                Tag(vec!["name".into(), "something else".into()]),
            ],
            2,
        );
        store.insert(&matching).unwrap();
        store.insert(&other).unwrap();
        let plan = compile(
            &filters(serde_json::json!({"kinds": [30063], "search": "hello world"})),
            &ALLOWED,
        );
        let events = store.query(&plan).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, hid(1));
    }

    #[test]
    fn query_search_sanitization_is_observable() {
        let store = store();
        let pk = hid(0xaa);
        let ev = sample_event(
            1,
            &pk,
            30063,
            vec![Tag(vec!["name".into(), "alpha beta".into()])],
            1,
        );
        store.insert(&ev).unwrap();
        let clean = compile(
            &filters(serde_json::json!({"kinds": [30063], "search": "alpha beta"})),
            &ALLOWED,
        );
        let noisy = compile(
            &filters(serde_json::json!({"kinds": [30063], "search": "alpha!beta"})),
            &ALLOWED,
        );
        assert_eq!(
            store.query(&clean).unwrap(),
            store.query(&noisy).unwrap()
        );
        assert_eq!(store.query(&noisy).unwrap().len(), 1);
    }

    #[test]
    fn query_two_char_search_prefix_matches_name_tag() {
        let store = store();
        let pk = hid(0xaa);
        let ev = sample_event(
            1,
            &pk,
            30063,
            vec![Tag(vec!["name".into(), "abacus".into()])],
            1,
        );
        let other = sample_event(
            2,
            &pk,
            30063,
            vec![Tag(vec!["name".into(), "zebra".into()])],
            2,
        );
        store.insert(&ev).unwrap();
        store.insert(&other).unwrap();
        let plan = compile(
            &filters(serde_json::json!({"kinds": [30063], "search": "ab"})),
            &ALLOWED,
        );
        let events = store.query(&plan).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, hid(1));
    }

    #[test]
    fn query_filter_set_is_a_union() {
        let store = store();
        let pk = hid(0xaa);
        store
            .insert(&sample_event(1, &pk, 1063, vec![], 1))
            .unwrap();
        store
            .insert(&sample_event(2, &pk, 30063, vec![], 2))
            .unwrap();
        let set = vec![
            Filter::from_value(&serde_json::json!({"kinds": [1063]})).unwrap(),
            Filter::from_value(&serde_json::json!({"kinds": [30063]})).unwrap(),
            // overlapping filter must not duplicate results
            Filter::from_value(&serde_json::json!({"kinds": [1063, 30063]})).unwrap(),
        ];
        let events = store.query(&compile(&set, &ALLOWED)).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn replace_is_atomic_and_reindexes() {
        let store = store();
        let pk = hid(0xaa);
        let old = sample_event(
            1,
            &pk,
            30063,
            vec![Tag(vec!["d".into(), "app.one".into()])],
            1,
        );
        let new = sample_event(
            2,
            &pk,
            30063,
            vec![Tag(vec!["d".into(), "app.one".into()])],
            2,
        );
        store.insert(&old).unwrap();
        store.replace(&new, Some(&old.id)).unwrap();
        assert!(!store.exists(&old.id).unwrap());
        assert!(store.exists(&new.id).unwrap());
        assert_eq!(store.count("SELECT count(*) FROM events"), 1);
        assert_eq!(store.count("SELECT count(*) FROM tags_index"), 1);
    }

    #[test]
    fn current_holder_lookups() {
        let store = store();
        let pk = hid(0xaa);
        let plain = sample_event(1, &pk, 10000, vec![], 1);
        store.insert(&plain).unwrap();
        assert_eq!(
            store.current_holder(&pk, 10000, None).unwrap(),
            Some(plain.id.clone())
        );
        assert_eq!(store.current_holder(&pk, 10001, None).unwrap(), None);

        let tagged = sample_event(
            2,
            &pk,
            30063,
            vec![Tag(vec!["d".into(), "app.one".into()])],
            1,
        );
        let untagged = sample_event(3, &pk, 30063, vec![], 1);
        store.insert(&tagged).unwrap();
        store.insert(&untagged).unwrap();
        assert_eq!(
            store.current_holder(&pk, 30063, Some("app.one")).unwrap(),
            Some(tagged.id.clone())
        );
        // an event without a d tag holds the empty-string key
        assert_eq!(
            store.current_holder(&pk, 30063, Some("")).unwrap(),
            Some(untagged.id.clone())
        );
        assert_eq!(
            store.current_holder(&pk, 30063, Some("app.two")).unwrap(),
            None
        );
    }

    #[test]
    fn unadmitted_plan_returns_no_rows() {
        let store = store();
        store
            .insert(&sample_event(1, &hid(0xaa), 1, vec![], 1))
            .unwrap();
        let plan = compile(&filters(serde_json::json!({"kinds": [2]})), &ALLOWED);
        assert!(store.query(&plan).unwrap().is_empty());
    }

    #[test]
    fn get_round_trips_tags() {
        let store = store();
        let ev = sample_event(
            1,
            &hid(0xaa),
            30063,
            vec![Tag(vec!["d".into(), "app.one".into()])],
            7,
        );
        store.insert(&ev).unwrap();
        assert_eq!(store.get(&ev.id).unwrap(), Some(ev));
        assert_eq!(store.get(&hid(9)).unwrap(), None);
    }

    #[test]
    fn all_ids_lists_everything() {
        let store = store();
        store
            .insert(&sample_event(1, &hid(0xaa), 1, vec![], 1))
            .unwrap();
        store
            .insert(&sample_event(2, &hid(0xaa), 1, vec![], 2))
            .unwrap();
        let mut ids = store.all_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![hid(1), hid(2)]);
    }
}
