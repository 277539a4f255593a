//! Inventory ledger boundary: canonical stock state per product and warehouse.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stocksync_core::{EngineError, EngineResult, ProductId, WarehouseId};

use crate::update::Field;

/// Canonical state of one product at one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub available: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Last committed version.
    pub version: u64,
}

impl Default for StockSnapshot {
    fn default() -> Self {
        Self {
            quantity: 0,
            price: None,
            available: false,
            metadata: Map::new(),
            version: 0,
        }
    }
}

impl StockSnapshot {
    pub fn value(&self, field: Field) -> Value {
        match field {
            Field::Quantity => Value::from(self.quantity),
            Field::Price => self.price.map(Value::from).unwrap_or(Value::Null),
            Field::Availability => Value::Bool(self.available),
            Field::Metadata => Value::Object(self.metadata.clone()),
        }
    }

    fn set(&mut self, field: Field, value: &Value) -> EngineResult<()> {
        match field {
            Field::Quantity => {
                self.quantity = value
                    .as_i64()
                    .ok_or_else(|| EngineError::ledger(format!("quantity must be an integer, got {value}")))?;
            }
            Field::Price => {
                self.price = match value {
                    Value::Null => None,
                    v => Some(
                        v.as_f64()
                            .ok_or_else(|| EngineError::ledger(format!("price must be a number, got {v}")))?,
                    ),
                };
            }
            Field::Availability => {
                self.available = value
                    .as_bool()
                    .ok_or_else(|| EngineError::ledger(format!("availability must be a boolean, got {value}")))?;
            }
            Field::Metadata => {
                self.metadata = match value {
                    Value::Object(m) => m.clone(),
                    Value::Null => Map::new(),
                    v => return Err(EngineError::ledger(format!("metadata must be an object, got {v}"))),
                };
            }
        }
        Ok(())
    }
}

/// External inventory ledger.
///
/// Ingest reads previous values from it; accepted changes and conflict
/// resolutions are committed to it.
pub trait InventoryLedger: Send + Sync {
    /// `None` when the ledger has never seen the product at that location.
    fn snapshot(
        &self,
        product_id: &ProductId,
        warehouse_id: Option<&WarehouseId>,
    ) -> EngineResult<Option<StockSnapshot>>;

    /// Apply field values and stamp `version`. Stale versions are rejected.
    fn apply(
        &self,
        product_id: &ProductId,
        warehouse_id: Option<&WarehouseId>,
        values: &BTreeMap<Field, Value>,
        version: u64,
    ) -> EngineResult<StockSnapshot>;
}

type LedgerKey = (ProductId, Option<WarehouseId>);

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: RwLock<HashMap<LedgerKey, StockSnapshot>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a starting position.
    pub fn seed(&self, product_id: ProductId, warehouse_id: Option<WarehouseId>, snapshot: StockSnapshot) {
        if let Ok(mut rows) = self.rows.write() {
            rows.insert((product_id, warehouse_id), snapshot);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InventoryLedger for InMemoryLedger {
    fn snapshot(
        &self,
        product_id: &ProductId,
        warehouse_id: Option<&WarehouseId>,
    ) -> EngineResult<Option<StockSnapshot>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| EngineError::ledger("ledger lock poisoned"))?;
        Ok(rows.get(&(product_id.clone(), warehouse_id.cloned())).cloned())
    }

    fn apply(
        &self,
        product_id: &ProductId,
        warehouse_id: Option<&WarehouseId>,
        values: &BTreeMap<Field, Value>,
        version: u64,
    ) -> EngineResult<StockSnapshot> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| EngineError::ledger("ledger lock poisoned"))?;
        let row = rows
            .entry((product_id.clone(), warehouse_id.cloned()))
            .or_default();

        if version < row.version {
            return Err(EngineError::ledger(format!(
                "stale write for {product_id}: version {version} < committed {}",
                row.version
            )));
        }

        let mut next = row.clone();
        for (field, value) in values {
            next.set(*field, value)?;
        }
        next.version = version;
        *row = next.clone();
        Ok(next)
    }
}
