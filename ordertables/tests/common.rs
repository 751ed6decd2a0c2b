use std::sync::{Arc, Mutex};

use ordertables::OrderTables;
use ordertables::config::StorageConfig;
use ordertables::entity::Entity;
use ordertables::events::{StoreEvent, StoreListener};
use ordertables::mapping::EntityType;
use ordertables::store::EntityStore;
use tempfile::TempDir;

/// Collects every published event for later assertions.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<StoreEvent>>,
}

#[allow(dead_code)]
impl RecordingListener {
    pub fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl StoreListener for RecordingListener {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn on_event(&self, event: &StoreEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub config: StorageConfig,
    pub tables: OrderTables,
    pub recorder: Arc<RecordingListener>,
}

pub fn init_test_context() -> anyhow::Result<TestContext> {
    init_with_config(|config| config)
}

#[allow(dead_code)]
pub fn init_with_config(adjust: impl FnOnce(StorageConfig) -> StorageConfig) -> anyhow::Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;
    let config = adjust(StorageConfig::new(temp_dir.path()));
    let tables = OrderTables::open(config.clone())?;
    let recorder = Arc::new(RecordingListener::default());
    tables.events.register(recorder.clone());

    Ok(TestContext {
        temp_dir,
        config,
        tables,
        recorder,
    })
}

/// Saves an order with the given status through `store` and returns its ID.
#[allow(dead_code)]
pub fn create_order(store: &dyn EntityStore, status: &str, total: &str) -> anyhow::Result<i64> {
    let mut order = Entity::new(EntityType::Order);
    order.set("status", status)?;
    order.set("total", total)?;
    order.set("currency", "EUR")?;
    order.set("billing_first_name", "Ada")?;
    order.set("billing_email", "ada@example.com")?;
    store.save(&mut order)?;
    Ok(order.id())
}

/// Saves a refund for `parent` through `store` and returns its ID.
#[allow(dead_code)]
pub fn create_refund(store: &dyn EntityStore, parent: i64, amount: &str, refunded_payment: bool) -> anyhow::Result<i64> {
    let mut refund = Entity::new(EntityType::Refund);
    refund.set("parent_id", parent)?;
    refund.set("amount", amount)?;
    refund.set("reason", "Damaged in transit")?;
    refund.set("refunded_payment", refunded_payment)?;
    store.save(&mut refund)?;
    Ok(refund.id())
}
