use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use anyhow::anyhow;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use transport::core_location::CoreLocation;
use crate::region_state::{BufferedRegionState, LastOperation};

/// Persistent record of region states and of the data extracted from them, so that a host that
///  restarts can continue where it stopped.
pub trait RegionStore: Send + Sync {
    /// Forgets everything, for a fresh run
    fn reset(&self) -> anyhow::Result<()>;

    fn store_region_state(&self, state: &BufferedRegionState) -> anyhow::Result<()>;

    fn region_state(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<Option<BufferedRegionState>>;

    /// Appends extracted data to a region's content. Each call is kept as a separate extraction.
    fn append_content(&self, core: CoreLocation, region_id: u8, data: &[u8], missing: bool) -> anyhow::Result<()>;

    /// All content extracted from a region so far, and whether any of it is known to be incomplete
    fn content(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<(Vec<u8>, bool)>;

    fn content_length(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<usize>;

    fn clear_region(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS region_state(
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    p INTEGER NOT NULL,
    region INTEGER NOT NULL,
    start_address INTEGER NOT NULL,
    end_address INTEGER NOT NULL,
    current_write INTEGER NOT NULL,
    current_dma_write INTEGER NOT NULL,
    current_read INTEGER NOT NULL,
    last_operation INTEGER NOT NULL,
    missing INTEGER NOT NULL,
    base_address INTEGER NOT NULL,
    recorded_size INTEGER NOT NULL,
    content_length INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (x, y, p, region)
);
CREATE TABLE IF NOT EXISTS region_content(
    extraction_id INTEGER PRIMARY KEY AUTOINCREMENT,
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    p INTEGER NOT NULL,
    region INTEGER NOT NULL,
    content BLOB NOT NULL,
    missing INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS region_content_by_region ON region_content(x, y, p, region);
";

/// [RegionStore] backed by an embedded SQLite database
pub struct SqliteRegionStore {
    connection: Mutex<Connection>,
}

impl SqliteRegionStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<SqliteRegionStore> {
        info!("opening region store at {:?}", path.as_ref());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> anyhow::Result<SqliteRegionStore> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> anyhow::Result<SqliteRegionStore> {
        connection.execute_batch(SCHEMA)?;
        Ok(SqliteRegionStore {
            connection: Mutex::new(connection),
        })
    }

    fn connection(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.connection.lock()
            .map_err(|_| anyhow!("region store connection lock is poisoned"))
    }
}

impl RegionStore for SqliteRegionStore {
    fn reset(&self) -> anyhow::Result<()> {
        info!("resetting region store");
        self.connection()?
            .execute_batch("DELETE FROM region_content; DELETE FROM region_state;")?;
        Ok(())
    }

    fn store_region_state(&self, state: &BufferedRegionState) -> anyhow::Result<()> {
        let core = state.core;
        debug!("storing state of {} region {}", core, state.region_id);
        self.connection()?.execute(
            "INSERT INTO region_state(x, y, p, region, start_address, end_address, current_write, current_dma_write,
                    current_read, last_operation, missing, base_address, recorded_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(x, y, p, region) DO UPDATE SET
                    start_address = excluded.start_address,
                    end_address = excluded.end_address,
                    current_write = excluded.current_write,
                    current_dma_write = excluded.current_dma_write,
                    current_read = excluded.current_read,
                    last_operation = excluded.last_operation,
                    missing = excluded.missing,
                    base_address = excluded.base_address,
                    recorded_size = excluded.recorded_size",
            params![
                core.x, core.y, core.p, state.region_id,
                state.start_address, state.end_address,
                state.current_write, state.current_dma_write, state.current_read,
                u8::from(state.last_operation), state.missing,
                state.base_address, state.recorded_size,
            ],
        )?;
        Ok(())
    }

    fn region_state(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<Option<BufferedRegionState>> {
        let result = self.connection()?.query_row(
            "SELECT start_address, end_address, current_write, current_dma_write, current_read,
                    last_operation, missing, base_address, recorded_size
                 FROM region_state WHERE x = ?1 AND y = ?2 AND p = ?3 AND region = ?4",
            params![core.x, core.y, core.p, region_id],
            |row| Ok(BufferedRegionState {
                core,
                region_id,
                start_address: row.get(0)?,
                end_address: row.get(1)?,
                current_write: row.get(2)?,
                current_dma_write: row.get(3)?,
                current_read: row.get(4)?,
                last_operation: LastOperation::from(row.get::<_, u8>(5)?),
                missing: row.get(6)?,
                base_address: row.get(7)?,
                recorded_size: row.get(8)?,
            }),
        ).optional()?;
        Ok(result)
    }

    fn append_content(&self, core: CoreLocation, region_id: u8, data: &[u8], missing: bool) -> anyhow::Result<()> {
        debug!("storing {} bytes for {} region {}", data.len(), core, region_id);
        let mut connection = self.connection()?;
        let tx = connection.transaction()?;
        tx.execute(
            "INSERT INTO region_content(x, y, p, region, content, missing) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![core.x, core.y, core.p, region_id, data, missing],
        )?;
        tx.execute(
            "UPDATE region_state SET content_length = content_length + ?5
                 WHERE x = ?1 AND y = ?2 AND p = ?3 AND region = ?4",
            params![core.x, core.y, core.p, region_id, data.len() as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn content(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<(Vec<u8>, bool)> {
        let connection = self.connection()?;
        let mut stmt = connection.prepare(
            "SELECT content, missing FROM region_content
                 WHERE x = ?1 AND y = ?2 AND p = ?3 AND region = ?4
                 ORDER BY extraction_id")?;
        let rows = stmt.query_map(params![core.x, core.y, core.p, region_id], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, bool>(1)?))
        })?;

        let mut content = Vec::new();
        let mut missing = false;
        for row in rows {
            let (data, m) = row?;
            content.extend_from_slice(&data);
            missing |= m;
        }
        Ok((content, missing))
    }

    fn content_length(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<usize> {
        let length: i64 = self.connection()?.query_row(
            "SELECT COALESCE(SUM(LENGTH(content)), 0) FROM region_content
                 WHERE x = ?1 AND y = ?2 AND p = ?3 AND region = ?4",
            params![core.x, core.y, core.p, region_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(length)?)
    }

    fn clear_region(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<()> {
        info!("clearing stored data of {} region {}", core, region_id);
        let mut connection = self.connection()?;
        let tx = connection.transaction()?;
        tx.execute(
            "DELETE FROM region_content WHERE x = ?1 AND y = ?2 AND p = ?3 AND region = ?4",
            params![core.x, core.y, core.p, region_id],
        )?;
        tx.execute(
            "DELETE FROM region_state WHERE x = ?1 AND y = ?2 AND p = ?3 AND region = ?4",
            params![core.x, core.y, core.p, region_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORE: CoreLocation = CoreLocation { x: 1, y: 0, p: 3 };

    fn state(region_id: u8) -> BufferedRegionState {
        BufferedRegionState {
            core: CORE,
            region_id,
            start_address: 0x7000_0000,
            end_address: 0x7000_1000,
            current_write: 0x7000_0400,
            current_dma_write: 0x7000_0400,
            current_read: 0x7000_0100,
            last_operation: LastOperation::Write,
            missing: region_id == 2,
            base_address: 0x6000_0000,
            recorded_size: 0xffff_fff0 & 0x7fff_ffff,
        }
    }

    #[test]
    fn test_state() {
        let store = SqliteRegionStore::open_in_memory().unwrap();
        assert!(store.region_state(CORE, 1).unwrap().is_none());

        store.store_region_state(&state(1)).unwrap();
        store.store_region_state(&state(2)).unwrap();
        assert_eq!(store.region_state(CORE, 1).unwrap(), Some(state(1)));
        assert_eq!(store.region_state(CORE, 2).unwrap(), Some(state(2)));

        let mut updated = state(1);
        updated.current_read = updated.current_write;
        updated.last_operation = LastOperation::Read;
        store.store_region_state(&updated).unwrap();
        assert_eq!(store.region_state(CORE, 1).unwrap(), Some(updated));
    }

    #[test]
    fn test_content() {
        let store = SqliteRegionStore::open_in_memory().unwrap();
        store.store_region_state(&state(1)).unwrap();

        store.append_content(CORE, 1, &[1, 2, 3], false).unwrap();
        store.append_content(CORE, 1, &[4, 5], false).unwrap();
        store.append_content(CORE, 0, &[9], true).unwrap();

        assert_eq!(store.content(CORE, 1).unwrap(), (vec![1, 2, 3, 4, 5], false));
        assert_eq!(store.content(CORE, 0).unwrap(), (vec![9], true));
        assert_eq!(store.content_length(CORE, 1).unwrap(), 5);
        assert_eq!(store.content_length(CORE, 7).unwrap(), 0);

        store.clear_region(CORE, 1).unwrap();
        assert_eq!(store.content(CORE, 1).unwrap(), (vec![], false));
        assert!(store.region_state(CORE, 1).unwrap().is_none());
        assert_eq!(store.content_length(CORE, 0).unwrap(), 1);

        store.reset().unwrap();
        assert_eq!(store.content_length(CORE, 0).unwrap(), 0);
    }
}
