//! SQLite-backed host registry shared across OS processes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, RegistryError, Result};
use crate::virtnet::Registry;

/// Host registry stored in an SQLite database file.
///
/// Schema:
///
/// ```text
/// hosts(name TEXT PRIMARY KEY, data TEXT NOT NULL)
/// meta (key  TEXT PRIMARY KEY, value TEXT NOT NULL)
/// ```
///
/// The single `("network", <name>)` row in `meta` pins the database to
/// one network; opening it for a differently-named network fails.
/// Concurrent access from several processes is mediated by SQLite's own
/// file locking.
#[derive(Debug)]
pub(crate) struct SqliteRegistry {
    uri: String,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteRegistry {
    /// Open (creating as needed) the registry database at `dbpath`.
    pub(crate) async fn open(dbpath: &str, network: &str) -> Result<SqliteRegistry> {
        let uri = dbpath.to_string();
        let path = dbpath.to_string();
        let netname = network.to_string();

        let conn = run_blocking(move || {
            let conn = Connection::open(&path).map_err(db_err)?;
            conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
            setup(conn, &netname)
        })
        .await
        .map_err(|e| regerr(&uri, "open", format!("{network:?}"), e))?;

        debug!(db = %uri, network = %network, "lonet: registry opened");
        Ok(SqliteRegistry {
            uri,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }
}

/// Create tables if absent and verify the network-name pin.
fn setup(conn: Connection, network: &str) -> Result<Connection> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS hosts (name TEXT PRIMARY KEY, data TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS meta  (key  TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )
    .map_err(db_err)?;

    let have: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'network'", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db_err)?;

    match have {
        Some(v) if v == network => {}
        Some(v) => {
            return Err(Error::Other(format!(
                "network name mismatch: want {network:?} have {v:?}"
            )))
        }
        None => {
            // IGNORE: another process may pin the name concurrently
            conn.execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES ('network', ?1)",
                [network],
            )
            .map_err(db_err)?;
            let now: String = conn
                .query_row("SELECT value FROM meta WHERE key = 'network'", [], |row| {
                    row.get(0)
                })
                .map_err(db_err)?;
            if now != network {
                return Err(Error::Other(format!(
                    "network name mismatch: want {network:?} have {now:?}"
                )));
            }
        }
    }
    Ok(conn)
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Other(format!("sqlite: {e}"))
}

fn regerr(registry: &str, op: &'static str, args: String, err: Error) -> Error {
    Error::Registry(Box::new(RegistryError {
        registry: registry.to_string(),
        op,
        args,
        err,
    }))
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("registry task failed: {e}")))?
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn announce(
        &self,
        _ctx: &CancellationToken,
        hostname: &str,
        hostdata: &str,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let (host, data) = (hostname.to_string(), hostdata.to_string());

        run_blocking(move || {
            let guard = conn.lock().unwrap();
            let conn = guard.as_ref().ok_or(Error::RegistryDown)?;
            match conn.execute("INSERT INTO hosts (name, data) VALUES (?1, ?2)", [&host, &data]) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(Error::HostDup)
                }
                Err(e) => Err(db_err(e)),
            }
        })
        .await
        .map_err(|e| regerr(&self.uri, "announce", format!("{hostname:?} {hostdata:?}"), e))
    }

    async fn query(&self, _ctx: &CancellationToken, hostname: &str) -> Result<String> {
        let conn = self.conn.clone();
        let host = hostname.to_string();

        run_blocking(move || {
            let guard = conn.lock().unwrap();
            let conn = guard.as_ref().ok_or(Error::RegistryDown)?;
            match conn.query_row("SELECT data FROM hosts WHERE name = ?1", [&host], |row| {
                row.get(0)
            }) {
                Ok(data) => Ok(data),
                Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::NoHost),
                Err(e) => Err(db_err(e)),
            }
        })
        .await
        .map_err(|e| regerr(&self.uri, "query", format!("{hostname:?}"), e))
    }

    async fn close(&self) -> Result<()> {
        // taking the handle out makes later operations observe
        // RegistryDown; other handles to the same file are unaffected
        let conn = self.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            let _ = tokio::task::spawn_blocking(move || conn.close()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bg() -> CancellationToken {
        CancellationToken::new()
    }

    fn scratch_db() -> (std::path::PathBuf, String) {
        let dir = std::env::temp_dir().join(format!("virtnet-registry-{:08x}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("1.db");
        (dir, path.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_announce_query_dup_close() {
        let (dir, dbpath) = scratch_db();

        let r1 = SqliteRegistry::open(&dbpath, "aaa").await.unwrap();

        assert!(matches!(
            r1.query(&bg(), "α").await.unwrap_err().cause(),
            Error::NoHost
        ));

        r1.announce(&bg(), "α", "alpha:1234").await.unwrap();
        assert!(matches!(
            r1.announce(&bg(), "α", "alpha:1234").await.unwrap_err().cause(),
            Error::HostDup
        ));
        assert!(matches!(
            r1.announce(&bg(), "α", "alpha:1235").await.unwrap_err().cause(),
            Error::HostDup
        ));
        assert_eq!(r1.query(&bg(), "α").await.unwrap(), "alpha:1234");
        assert!(matches!(
            r1.query(&bg(), "β").await.unwrap_err().cause(),
            Error::NoHost
        ));

        // a second handle to the same database sees the same hosts
        let r2 = SqliteRegistry::open(&dbpath, "aaa").await.unwrap();
        assert_eq!(r2.query(&bg(), "α").await.unwrap(), "alpha:1234");
        r2.announce(&bg(), "β", "beta:zzz").await.unwrap();
        assert_eq!(r1.query(&bg(), "β").await.unwrap(), "beta:zzz");

        // closing one handle leaves the other working
        r1.close().await.unwrap();
        assert!(matches!(
            r1.query(&bg(), "α").await.unwrap_err().cause(),
            Error::RegistryDown
        ));
        assert!(matches!(
            r1.announce(&bg(), "γ", "gamma:qqq").await.unwrap_err().cause(),
            Error::RegistryDown
        ));
        assert_eq!(r2.query(&bg(), "α").await.unwrap(), "alpha:1234");

        r2.close().await.unwrap();
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_network_name_pinned() {
        let (dir, dbpath) = scratch_db();

        let r1 = SqliteRegistry::open(&dbpath, "one").await.unwrap();
        r1.close().await.unwrap();

        // reopening under the pinned name works
        let r2 = SqliteRegistry::open(&dbpath, "one").await.unwrap();
        r2.close().await.unwrap();

        // a different name is a fatal open error
        let err = SqliteRegistry::open(&dbpath, "two").await.unwrap_err();
        assert!(err.to_string().contains("network name mismatch"));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
