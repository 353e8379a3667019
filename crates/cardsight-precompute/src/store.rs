//! SQLite card store.
//!
//! Holds the persisted card records the catalog is rebuilt from, the
//! precomputed features, and the precompute checkpoint.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use cardsight_core::{CardRecord, CardSource, CardsightError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::features::LocalFeatures;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cards (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL,
    number     TEXT NOT NULL DEFAULT '',
    rarity     TEXT NOT NULL DEFAULT '',
    price      TEXT NOT NULL DEFAULT '',
    set_title  TEXT,
    image_url  TEXT,
    embedding  TEXT,
    phash       TEXT,
    histogram   TEXT,
    descriptors BLOB
);
CREATE TABLE IF NOT EXISTS precompute_state (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

const CHECKPOINT_KEY: &str = "last_card_id";

/// A card as imported from a JSON dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCard {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub rarity: String,
    #[serde(default, deserialize_with = "price_as_string")]
    pub price: String,
    #[serde(default)]
    pub set_title: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Accepts a price given as a string or a bare number.
fn price_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

/// A card waiting for precompute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCard {
    pub id: i64,
    pub image_url: Option<String>,
}

/// Row counts reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub cards: u64,
    pub with_embedding: u64,
    pub checkpoint: Option<i64>,
}

/// Card records backed by one SQLite connection.
#[derive(Debug)]
pub struct CardStore {
    conn: Mutex<Connection>,
}

impl CardStore {
    /// Opens (and creates if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the parent directory cannot be created and `Store` if
    /// SQLite fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened card store");
        Self::init(conn)
    }

    /// Opens a fresh store that lives only as long as this value.
    ///
    /// # Errors
    ///
    /// Returns `Store` if SQLite fails.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let has_descriptors: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('cards') WHERE name = 'descriptors'",
            [],
            |row| row.get(0),
        )?;
        if has_descriptors == 0 {
            conn.execute_batch("ALTER TABLE cards ADD COLUMN descriptors BLOB")?;
            info!("added descriptors column to card store");
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or updates card metadata; stored features are kept.
    ///
    /// # Errors
    ///
    /// Returns `Store` if SQLite fails; nothing is written in that case.
    pub fn upsert_cards(&self, cards: &[NewCard]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO cards (id, name, number, rarity, price, set_title, image_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    number = excluded.number,
                    rarity = excluded.rarity,
                    price = excluded.price,
                    set_title = excluded.set_title,
                    image_url = excluded.image_url",
            )?;
            for card in cards {
                stmt.execute(params![
                    card.id,
                    card.name,
                    card.number,
                    card.rarity,
                    card.price,
                    card.set_title,
                    card.image_url,
                ])?;
            }
        }
        tx.commit()?;
        info!(cards = cards.len(), "imported cards");
        Ok(cards.len())
    }

    /// Imports a JSON array of cards.
    ///
    /// # Errors
    ///
    /// Returns `Json` for a malformed document, otherwise as [`CardStore::upsert_cards`].
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let cards: Vec<NewCard> = serde_json::from_str(json)?;
        self.upsert_cards(&cards)
    }

    /// Cards with an id greater than `after`, by ascending id.
    ///
    /// # Errors
    ///
    /// Returns `Store` if SQLite fails.
    pub fn cards_after(&self, after: Option<i64>) -> Result<Vec<PendingCard>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, image_url FROM cards WHERE id > ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![after.unwrap_or(i64::MIN)], |row| {
            Ok(PendingCard {
                id: row.get(0)?,
                image_url: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stores the embedding and local features of one card.
    ///
    /// # Errors
    ///
    /// Returns `Json` if serialization fails and `Store` if SQLite fails.
    pub fn save_features(
        &self,
        card_id: i64,
        embedding: &[f32],
        features: &LocalFeatures,
    ) -> Result<()> {
        let embedding = serde_json::to_string(embedding)?;
        let histogram = serde_json::to_string(&features.histogram)?;
        self.conn().execute(
            "UPDATE cards SET embedding = ?1, phash = ?2, histogram = ?3, descriptors = ?4
             WHERE id = ?5",
            params![embedding, features.phash, histogram, features.descriptors, card_id],
        )?;
        Ok(())
    }

    /// Last card id of the most recently saved chunk.
    ///
    /// # Errors
    ///
    /// Returns `Store` if SQLite fails.
    pub fn checkpoint(&self) -> Result<Option<i64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM precompute_state WHERE key = ?1",
                params![CHECKPOINT_KEY],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Records `card_id` as the resume point.
    ///
    /// # Errors
    ///
    /// Returns `Store` if SQLite fails.
    pub fn set_checkpoint(&self, card_id: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO precompute_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CHECKPOINT_KEY, card_id],
        )?;
        Ok(())
    }

    /// Forgets the resume point so the next run starts over.
    ///
    /// # Errors
    ///
    /// Returns `Store` if SQLite fails.
    pub fn clear_checkpoint(&self) -> Result<()> {
        self.conn().execute(
            "DELETE FROM precompute_state WHERE key = ?1",
            params![CHECKPOINT_KEY],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Store` if SQLite fails.
    pub fn counts(&self) -> Result<StoreCounts> {
        let (cards, with_embedding) = self.conn().query_row(
            "SELECT COUNT(*), COUNT(embedding) FROM cards",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(StoreCounts {
            cards: cards.max(0) as u64,
            with_embedding: with_embedding.max(0) as u64,
            checkpoint: self.checkpoint()?,
        })
    }

    /// Every card as a catalog record.
    ///
    /// # Errors
    ///
    /// Returns `Store` if SQLite fails.
    pub fn records(&self) -> Result<Vec<CardRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, number, rarity, price, set_title, embedding FROM cards ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let embedding: Option<String> = row.get(6)?;
            Ok(CardRecord {
                id,
                embedding: embedding.map(|raw| parse_embedding(id, &raw)),
                name: row.get(1)?,
                number: row.get(2)?,
                rarity: row.get(3)?,
                price: row.get(4)?,
                set_title: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Decodes a JSON embedding column.
///
/// An unreadable column becomes an empty vector, which the catalog rejects
/// and logs as malformed instead of treating the card as missing.
fn parse_embedding(card_id: i64, raw: &str) -> Vec<f32> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(card_id, error = %e, "unreadable embedding column");
        Vec::new()
    })
}

impl CardSource for CardStore {
    fn load_records(&self) -> cardsight_core::Result<Vec<CardRecord>> {
        self.records()
            .map_err(|e| CardsightError::CardSource(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: i64, name: &str) -> NewCard {
        NewCard {
            id,
            name: name.into(),
            number: format!("{id}/102"),
            rarity: "Common".into(),
            price: "0.25 €".into(),
            set_title: Some("Base Set".into()),
            image_url: Some(format!("https://images.example/base1/{id}.png")),
        }
    }

    fn features() -> LocalFeatures {
        LocalFeatures {
            phash: "8000000000000000".into(),
            histogram: vec![0.0, 1.0],
            descriptors: vec![7; 64],
        }
    }

    #[test]
    fn upsert_and_list_pending() {
        let store = CardStore::open_in_memory().unwrap();
        store
            .upsert_cards(&[card(3, "Squirtle"), card(1, "Bulbasaur"), card(2, "Ivysaur")])
            .unwrap();
        let ids: Vec<i64> = store.cards_after(None).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let ids: Vec<i64> = store.cards_after(Some(1)).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 3]);

        // re-import updates metadata in place
        store.upsert_cards(&[card(1, "Bulbasaur (holo)")]).unwrap();
        assert_eq!(store.counts().unwrap().cards, 3);
        assert_eq!(store.records().unwrap()[0].name, "Bulbasaur (holo)");
    }

    #[test]
    fn json_import_accepts_numeric_price() {
        let store = CardStore::open_in_memory().unwrap();
        let n = store
            .import_json(r#"[{"id": 58, "name": "Pikachu", "price": 4.5, "image_url": null}]"#)
            .unwrap();
        assert_eq!(n, 1);
        let records = store.records().unwrap();
        assert_eq!(records[0].price, "4.5");
        assert!(records[0].embedding.is_none());
        assert!(store.import_json("{not json").is_err());
    }

    #[test]
    fn features_round_trip_into_records() {
        let store = CardStore::open_in_memory().unwrap();
        store.upsert_cards(&[card(1, "Bulbasaur"), card(2, "Ivysaur")]).unwrap();
        store.save_features(2, &[0.6, 0.8], &features()).unwrap();

        let records = store.load_records().unwrap();
        assert!(records[0].embedding.is_none());
        assert_eq!(records[1].embedding.as_deref(), Some(&[0.6, 0.8][..]));
        assert_eq!(records[1].set_title.as_deref(), Some("Base Set"));
        assert_eq!(store.counts().unwrap().with_embedding, 1);

        let descriptors: Vec<u8> = store
            .conn()
            .query_row("SELECT descriptors FROM cards WHERE id = 2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(descriptors, vec![7; 64]);
    }

    #[test]
    fn corrupt_embedding_is_surfaced_as_malformed() {
        let store = CardStore::open_in_memory().unwrap();
        store.upsert_cards(&[card(1, "Bulbasaur")]).unwrap();
        store
            .conn()
            .execute("UPDATE cards SET embedding = 'oops' WHERE id = 1", [])
            .unwrap();
        let records = store.records().unwrap();
        assert_eq!(records[0].embedding.as_deref(), Some(&[][..]));
    }

    #[test]
    fn older_store_gains_descriptors_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE cards (
                id INTEGER PRIMARY KEY, name TEXT NOT NULL,
                number TEXT NOT NULL DEFAULT '', rarity TEXT NOT NULL DEFAULT '',
                price TEXT NOT NULL DEFAULT '', set_title TEXT, image_url TEXT,
                embedding TEXT, phash TEXT, histogram TEXT
            );
            INSERT INTO cards (id, name) VALUES (1, 'Bulbasaur');",
        )
        .unwrap();
        let store = CardStore::init(conn).unwrap();
        store.save_features(1, &[1.0, 0.0], &features()).unwrap();
        assert_eq!(store.counts().unwrap().with_embedding, 1);
    }

    #[test]
    fn checkpoint_lifecycle() {
        let store = CardStore::open_in_memory().unwrap();
        assert_eq!(store.checkpoint().unwrap(), None);
        store.set_checkpoint(50).unwrap();
        store.set_checkpoint(100).unwrap();
        assert_eq!(store.checkpoint().unwrap(), Some(100));
        assert_eq!(store.counts().unwrap().checkpoint, Some(100));
        store.clear_checkpoint().unwrap();
        assert_eq!(store.checkpoint().unwrap(), None);
    }
}
