//! KeyStore (C7, ambient/supplemented): the concrete, SQLite-backed
//! implementation of the opaque external collaborator from spec.md §3/§6.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use parking_lot::RwLock;
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A bearer token's role, as returned by `KeyStore::lookup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Worker,
    Client,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Worker => "Worker",
            Role::Client => "Client",
        }
    }

    fn parse(s: &str) -> Option<Role> {
        match s {
            "Admin" => Some(Role::Admin),
            "Worker" => Some(Role::Worker),
            "Client" => Some(Role::Client),
            _ => None,
        }
    }
}

/// One row of the `keys` table.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub id: i64,
    pub name: String,
    pub value: String,
    pub role: Role,
}

/// `rusqlite`-backed implementation: a single `keys` table plus an
/// in-memory, no-eviction token->(name, role) cache (§5: "acceptable for
/// admin-issued token sets in the hundreds").
pub struct SqliteKeyStore {
    conn: StdMutex<Connection>,
    cache: RwLock<HashMap<String, (String, Role)>>,
}

impl std::fmt::Debug for SqliteKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKeyStore").finish_non_exhaustive()
    }
}

impl SqliteKeyStore {
    /// Opens (creating if needed) the database at `url` and ensures the
    /// schema exists. `url` is expected in `sqlite://path` form; anything
    /// else is treated as a bare filesystem path.
    pub fn open(url: &str) -> Result<SqliteKeyStore> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        let conn = Connection::open(path).map_err(Error::fatal)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                value TEXT NOT NULL,
                role TEXT NOT NULL
            )",
            [],
        )
        .map_err(Error::fatal)?;
        Ok(SqliteKeyStore {
            conn: StdMutex::new(conn),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// True if the table has no rows — used by bootstrap to decide whether
    /// to seed an initial Admin key.
    pub fn is_empty(&self) -> Result<bool> {
        let conn = self.conn.lock().expect("keystore connection poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM keys", [], |row| row.get(0))
            .map_err(Error::store)?;
        Ok(count == 0)
    }

    /// Looks up a bearer token, first against the in-memory cache, falling
    /// back to the database and populating the cache on a hit.
    pub fn lookup(&self, token: &str) -> Result<Option<(String, Role)>> {
        if let Some(hit) = self.cache.read().get(token) {
            return Ok(Some(hit.clone()));
        }
        let conn = self.conn.lock().expect("keystore connection poisoned");
        let found: Option<(String, String)> = conn
            .query_row(
                "SELECT name, role FROM keys WHERE value = ?1",
                [token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(Error::store)?;
        drop(conn);

        let Some((name, role_str)) = found else {
            return Ok(None);
        };
        let role = Role::parse(&role_str).ok_or_else(|| Error::store("unknown role in store"))?;
        self.cache
            .write()
            .insert(token.to_string(), (name.clone(), role));
        Ok(Some((name, role)))
    }

    /// Inserts a new `(name, role)` pair with a freshly generated UUIDv4
    /// value, returning the value. A duplicate `name` surfaces `StoreError`.
    pub fn insert(&self, name: &str, role: Role) -> Result<String> {
        let value = Uuid::new_v4().to_string();
        let conn = self.conn.lock().expect("keystore connection poisoned");
        conn.execute(
            "INSERT INTO keys (name, value, role) VALUES (?1, ?2, ?3)",
            rusqlite::params![name, value, role.as_str()],
        )
        .map_err(Error::store)?;
        drop(conn);
        self.cache
            .write()
            .insert(value.clone(), (name.to_string(), role));
        Ok(value)
    }

    /// All keys, for the admin `/key` GET route. Plaintext values, per §6.
    pub fn list(&self) -> Result<Vec<KeyRecord>> {
        let conn = self.conn.lock().expect("keystore connection poisoned");
        let mut stmt = conn
            .prepare("SELECT id, name, value, role FROM keys ORDER BY id")
            .map_err(Error::store)?;
        let rows = stmt
            .query_map([], |row| {
                let role_str: String = row.get(3)?;
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, role_str))
            })
            .map_err(Error::store)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, name, value, role_str) = row.map_err(Error::store)?;
            let role = Role::parse(&role_str).ok_or_else(|| Error::store("unknown role in store"))?;
            out.push(KeyRecord { id, name, value, role });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> SqliteKeyStore {
        SqliteKeyStore::open(":memory:").unwrap()
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let store = temp_store();
        let value = store.insert("w1", Role::Worker).unwrap();
        let (name, role) = store.lookup(&value).unwrap().unwrap();
        assert_eq!(name, "w1");
        assert_eq!(role, Role::Worker);
    }

    #[test]
    fn unknown_token_is_none() {
        let store = temp_store();
        assert!(store.lookup("nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_name_is_a_store_error() {
        let store = temp_store();
        store.insert("dup", Role::Admin).unwrap();
        assert!(store.insert("dup", Role::Client).is_err());
    }

    #[test]
    fn is_empty_reflects_table_state() {
        let store = temp_store();
        assert!(store.is_empty().unwrap());
        store.insert("a", Role::Admin).unwrap();
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn list_returns_plaintext_values() {
        let store = temp_store();
        let value = store.insert("w1", Role::Worker).unwrap();
        let keys = store.list().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].value, value);
    }
}
