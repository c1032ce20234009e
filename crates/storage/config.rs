//! Option bags for the external surface (spec §6).

use std::sync::Arc;

use crate::database::Database;

/// Options accepted by [`Database::open`].
#[derive(Clone)]
pub struct DatabaseOptions {
    pub max_stores: usize,
    pub max_map_bytes: u64,
    pub auto_resize: bool,
    pub use_write_map: bool,
    pub min_resize_bytes: u64,
    pub on_upgrade: Option<Arc<dyn Fn(u32, u32, &Database) + Send + Sync>>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_stores: 32,
            max_map_bytes: 1 << 30,
            auto_resize: true,
            use_write_map: false,
            min_resize_bytes: 1 << 20,
            on_upgrade: None,
        }
    }
}

impl std::fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("max_stores", &self.max_stores)
            .field("max_map_bytes", &self.max_map_bytes)
            .field("auto_resize", &self.auto_resize)
            .field("use_write_map", &self.use_write_map)
            .field("min_resize_bytes", &self.min_resize_bytes)
            .field("on_upgrade", &self.on_upgrade.is_some())
            .finish()
    }
}

/// Either a fixed boolean or a predicate consulted during version migration
/// (spec §6 "Index configuration").
#[derive(Clone)]
pub enum UpgradeCondition {
    Bool(bool),
    Predicate(Arc<dyn Fn(u32, u32) -> bool + Send + Sync>),
}

impl UpgradeCondition {
    pub fn evaluate(&self, old_version: u32, new_version: u32) -> bool {
        match self {
            UpgradeCondition::Bool(b) => *b,
            UpgradeCondition::Predicate(p) => p(old_version, new_version),
        }
    }
}

impl Default for UpgradeCondition {
    fn default() -> Self {
        UpgradeCondition::Bool(true)
    }
}

impl std::fmt::Debug for UpgradeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeCondition::Bool(b) => write!(f, "UpgradeCondition::Bool({b})"),
            UpgradeCondition::Predicate(_) => write!(f, "UpgradeCondition::Predicate(..)"),
        }
    }
}

/// Options accepted by [`Database::create_object_store`].
#[derive(Clone, Debug, Default)]
pub struct ObjectStoreOptions {
    pub persistent: bool,
    pub enable_cache: bool,
    pub cache_size: u64,
    pub upgrade_condition: UpgradeCondition,
}

/// Options accepted by [`Database::delete_object_store`].
#[derive(Clone, Debug, Default)]
pub struct DeleteObjectStoreOptions {
    pub upgrade_condition: UpgradeCondition,
    pub index_names: Vec<String>,
}

/// Options accepted by `ObjectStore::create_index`.
#[derive(Clone, Debug)]
pub struct IndexOptions {
    pub unique: bool,
    pub multi_entry: bool,
    pub upgrade_condition: UpgradeCondition,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            unique: false,
            multi_entry: false,
            upgrade_condition: UpgradeCondition::default(),
        }
    }
}
