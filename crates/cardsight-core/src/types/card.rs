use serde::{Deserialize, Serialize};

/// A persisted card record as the catalog consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    /// Primary key of the card.
    pub id: i64,
    /// Stored visual embedding, if one has been computed.
    pub embedding: Option<Vec<f32>>,
    /// Card name (e.g., "Pikachu").
    pub name: String,
    /// Number within its set (e.g., "58/102").
    pub number: String,
    /// Rarity label.
    pub rarity: String,
    /// Price as stored, formatted with its currency.
    pub price: String,
    /// Title of the set the card belongs to.
    pub set_title: Option<String>,
}

impl CardRecord {
    /// Creates a record without an embedding.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            embedding: None,
            name: name.into(),
            number: String::new(),
            rarity: String::new(),
            price: String::new(),
            set_title: None,
        }
    }

    /// Attaches an embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// The metadata payload kept alongside the embedding in the catalog.
    #[must_use]
    pub fn metadata(&self) -> CardMetadata {
        CardMetadata {
            id: self.id,
            name: self.name.clone(),
            number: self.number.clone(),
            rarity: self.rarity.clone(),
            price: self.price.clone(),
            set_name: self.set_title.clone(),
        }
    }
}

/// Card information returned with a match. Opaque to the matching logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMetadata {
    /// Card id in the store.
    pub id: i64,
    /// Card name.
    pub name: String,
    /// Collector number within the set, e.g. `58/102`.
    pub number: String,
    /// Rarity label.
    pub rarity: String,
    /// Display price, as stored.
    pub price: String,
    /// Title of the set the card belongs to.
    pub set_name: Option<String>,
}
