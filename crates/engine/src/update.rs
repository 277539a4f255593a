//! Canonical inventory update record.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stocksync_core::{ChannelId, ConflictId, EngineError, EngineResult, ProductId, UpdateId, WarehouseId};

/// A piece of product state a channel can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Quantity,
    Price,
    Availability,
    Metadata,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Quantity, Field::Price, Field::Availability, Field::Metadata];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Quantity => "quantity",
            Field::Price => "price",
            Field::Availability => "availability",
            Field::Metadata => "metadata",
        }
    }

    pub fn parse(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl core::fmt::Display for Field {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Quantity,
    Price,
    Availability,
    Metadata,
    Full,
}

impl UpdateType {
    fn for_fields(fields: &BTreeSet<Field>) -> Self {
        let mut iter = fields.iter();
        match (iter.next(), iter.next()) {
            (Some(Field::Quantity), None) => UpdateType::Quantity,
            (Some(Field::Price), None) => UpdateType::Price,
            (Some(Field::Availability), None) => UpdateType::Availability,
            (Some(Field::Metadata), None) => UpdateType::Metadata,
            _ => UpdateType::Full,
        }
    }
}

/// Previous/current/delta for one touched field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub previous: Value,
    pub current: Value,
    /// Numeric difference, for quantity and price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
}

impl FieldChange {
    pub fn new(previous: Value, current: Value) -> Self {
        let delta = match (previous.as_f64(), current.as_f64()) {
            (Some(p), Some(c)) => Some(c - p),
            (None, Some(c)) if previous.is_null() => Some(c),
            _ => None,
        };
        Self {
            previous,
            current,
            delta,
        }
    }
}

/// Who/what produced a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSource {
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub automatic: bool,
}

impl UpdateSource {
    pub fn automatic(system: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user_id: None,
            reason: reason.into(),
            automatic: true,
        }
    }

    pub fn user(system: impl Into<String>, user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user_id: Some(user_id.into()),
            reason: reason.into(),
            automatic: false,
        }
    }
}

/// Inbound change request consumed by ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub channel_id: ChannelId,
    pub product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_id: Option<WarehouseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Version of the product the source last observed, when it knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    pub source: UpdateSource,
}

impl UpdateRequest {
    pub fn new(channel_id: impl Into<String>, product_id: impl Into<String>, source: UpdateSource) -> Self {
        Self {
            channel_id: ChannelId::new(channel_id),
            product_id: ProductId::new(product_id),
            warehouse_id: None,
            quantity: None,
            price: None,
            availability: None,
            metadata: None,
            base_version: None,
            source,
        }
    }

    pub fn quantity(mut self, quantity: i64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn availability(mut self, available: bool) -> Self {
        self.availability = Some(available);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn warehouse(mut self, warehouse_id: impl Into<String>) -> Self {
        self.warehouse_id = Some(WarehouseId::new(warehouse_id));
        self
    }

    pub fn base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    /// The requested new values, keyed by field.
    pub fn requested_values(&self) -> BTreeMap<Field, Value> {
        let mut values = BTreeMap::new();
        if let Some(q) = self.quantity {
            values.insert(Field::Quantity, Value::from(q));
        }
        if let Some(p) = self.price {
            values.insert(Field::Price, Value::from(p));
        }
        if let Some(a) = self.availability {
            values.insert(Field::Availability, Value::Bool(a));
        }
        if let Some(m) = &self.metadata {
            values.insert(Field::Metadata, m.clone());
        }
        values
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.product_id.as_str().trim().is_empty() {
            return Err(EngineError::validation("product_id cannot be empty"));
        }
        if self.quantity.is_some_and(|q| q < 0) {
            return Err(EngineError::validation("quantity cannot be negative"));
        }
        if let Some(price) = self.price {
            if !price.is_finite() || price < 0.0 {
                return Err(EngineError::validation("price must be a non-negative number"));
            }
        }
        if self.metadata.as_ref().is_some_and(|m| !m.is_object()) {
            return Err(EngineError::validation("metadata must be an object"));
        }
        if self.quantity.is_none()
            && self.price.is_none()
            && self.availability.is_none()
            && self.metadata.is_none()
        {
            return Err(EngineError::validation("update carries no changes"));
        }
        Ok(())
    }

    /// Build a request from a canonical-named record pulled from a channel.
    pub fn from_canonical_record(
        channel_id: &ChannelId,
        record: &Map<String, Value>,
        source: UpdateSource,
    ) -> EngineResult<Self> {
        let product_id = record
            .get("product_id")
            .or_else(|| record.get("sku"))
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::validation("record has no product_id"))?;

        let warehouse_id = match record.get("warehouse_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(w)) => Some(WarehouseId::new(w.as_str())),
            Some(other) => {
                return Err(EngineError::validation(format!("warehouse_id must be a string, got {other}")));
            }
        };

        let quantity = match record.get("quantity") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                EngineError::validation(format!("quantity must be an integer, got {v}"))
            })?),
        };
        let price = match record.get("price") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_f64()
                    .ok_or_else(|| EngineError::validation(format!("price must be a number, got {v}")))?,
            ),
        };
        let availability = match record.get("availability") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_bool().ok_or_else(|| {
                EngineError::validation(format!("availability must be a boolean, got {v}"))
            })?),
        };
        let metadata = match record.get("metadata") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        };
        let base_version = record.get("version").and_then(Value::as_u64);

        let request = Self {
            channel_id: channel_id.clone(),
            product_id: ProductId::new(product_id),
            warehouse_id,
            quantity,
            price,
            availability,
            metadata,
            base_version,
            source,
        };
        request.validate()?;
        Ok(request)
    }
}

/// A canonical, versioned record of one change to one product, from one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdate {
    pub id: UpdateId,
    pub source_channel: ChannelId,
    pub product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_id: Option<WarehouseId>,
    pub update_type: UpdateType,
    pub changes: BTreeMap<Field, FieldChange>,
    pub source: UpdateSource,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    pub processed: bool,
    /// Channels this update has been delivered to.
    pub propagated: BTreeSet<ChannelId>,
    pub conflicts: Vec<ConflictId>,
    /// Fields held back from propagation by unresolved conflicts.
    #[serde(default)]
    pub withheld_fields: BTreeSet<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl InventoryUpdate {
    pub fn new(
        request: &UpdateRequest,
        changes: BTreeMap<Field, FieldChange>,
        version: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let fields: BTreeSet<Field> = changes.keys().copied().collect();
        Self {
            id: UpdateId::new(),
            source_channel: request.channel_id.clone(),
            product_id: request.product_id.clone(),
            warehouse_id: request.warehouse_id.clone(),
            update_type: UpdateType::for_fields(&fields),
            changes,
            source: request.source.clone(),
            timestamp,
            version,
            base_version: request.base_version,
            processed: false,
            propagated: BTreeSet::new(),
            conflicts: Vec::new(),
            withheld_fields: BTreeSet::new(),
            blocked_reason: None,
        }
    }

    pub fn fields(&self) -> BTreeSet<Field> {
        self.changes.keys().copied().collect()
    }

    pub fn touches(&self, field: Field) -> bool {
        self.changes.contains_key(&field)
    }

    pub fn current_values(&self) -> BTreeMap<Field, Value> {
        self.changes
            .iter()
            .map(|(f, c)| (*f, c.current.clone()))
            .collect()
    }

    pub fn current_value(&self, field: Field) -> Option<&Value> {
        self.changes.get(&field).map(|c| &c.current)
    }
}
