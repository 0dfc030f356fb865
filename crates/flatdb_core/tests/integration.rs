//! Integration tests covering the full engine: on-disk persistence,
//! restarts, seeding, foreign keys, and triggers working together.

use flatdb_core::{
    Candidate, CachingStrategy, CompressionType, DbConfig, DbError, DbResult, FlatDb,
    ForeignKeyDef, IndexDescriptor, IndexDirection, InsertOptions, Row, RowId, TableDef,
    TableImage, TableOptions, TableTrigger, TriggerKinds, WriteStrategy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tempfile::tempdir;

/// Routes engine logs to the test output when `RUST_LOG` is set.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Widget {
    id: RowId,
    name: String,
    price_cents: i64,
}

impl Row for Widget {
    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }
}

fn widget(name: &str, price_cents: i64) -> Widget {
    Widget {
        id: RowId::new(),
        name: name.into(),
        price_cents,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: RowId,
    widget_id: i64,
    quantity: u32,
}

impl Row for Order {
    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }
}

fn widget_table_options() -> TableOptions<Widget> {
    TableOptions::new().index(IndexDescriptor::new("Name", |w: &Widget| {
        w.name.as_str().into()
    }))
}

fn order_table_options() -> TableOptions<Order> {
    TableOptions::new().foreign_key(ForeignKeyDef::new("WidgetId", "widgets", |o: &Order| {
        o.widget_id
    }))
}

#[test]
fn rows_survive_restart() {
    init_tracing();
    let dir = tempdir().unwrap();

    {
        let db = FlatDb::open(dir.path()).unwrap();
        let widgets = db
            .register_table::<Widget>(TableDef::new("widgets").unwrap(), widget_table_options())
            .unwrap();
        widgets.insert(widget("anvil", 1500)).unwrap();
        widgets.insert(widget("rope", 300)).unwrap();
        db.close().unwrap();
    }

    let db = FlatDb::open(dir.path()).unwrap();
    let widgets = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), widget_table_options())
        .unwrap();

    let rows = widgets.select_all().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].name, "anvil");
    assert!(rows[0].id.is_sealed());

    // Id assignment continues where the stored sequence left off.
    let next = widgets.insert(widget("dynamite", 9900)).unwrap().unwrap();
    assert_eq!(next.id(), 3);
}

#[test]
fn compressed_table_round_trips() {
    let dir = tempdir().unwrap();
    let def = || {
        TableDef::new("widgets")
            .unwrap()
            .compression(CompressionType::Brotli)
    };

    {
        let db = FlatDb::open(dir.path()).unwrap();
        let widgets = db
            .register_table::<Widget>(def(), widget_table_options())
            .unwrap();
        for i in 0..100 {
            widgets.insert(widget("identical name", i)).unwrap();
        }
        db.close().unwrap();
    }

    let db = FlatDb::open(dir.path()).unwrap();
    let widgets = db
        .register_table::<Widget>(def(), widget_table_options())
        .unwrap();
    assert_eq!(widgets.count().unwrap(), 100);
}

#[test]
fn index_order_survives_restart() {
    let dir = tempdir().unwrap();
    let options = || {
        TableOptions::new().index(
            IndexDescriptor::new("Name", |w: &Widget| w.name.as_str().into())
                .direction(IndexDirection::Ascending),
        )
    };

    {
        let db = FlatDb::open(dir.path()).unwrap();
        let widgets = db
            .register_table::<Widget>(TableDef::new("widgets").unwrap(), options())
            .unwrap();
        for name in ["rope", "anvil", "dynamite"] {
            widgets.insert(widget(name, 100)).unwrap();
        }
        db.close().unwrap();
    }

    let db = FlatDb::open(dir.path()).unwrap();
    let widgets = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), options())
        .unwrap();

    let names: Vec<String> = widgets
        .select_by_index("Name")
        .unwrap()
        .into_iter()
        .map(|w| w.name)
        .collect();
    assert_eq!(names, vec!["anvil", "dynamite", "rope"]);
}

#[test]
fn lazy_tables_persist_only_flushed_rows() {
    let dir = tempdir().unwrap();
    let db = FlatDb::open(dir.path()).unwrap();
    let widgets = db
        .register_table::<Widget>(
            TableDef::new("widgets")
                .unwrap()
                .write_strategy(WriteStrategy::Lazy),
            widget_table_options(),
        )
        .unwrap();

    widgets.insert(widget("flushed", 1)).unwrap();
    widgets.force_write().unwrap();
    widgets.insert(widget("pending", 2)).unwrap();

    // A crash at this point would lose only the pending row: the stored
    // image still holds exactly the flushed state.
    let bytes = std::fs::read(dir.path().join("widgets.tbl")).unwrap();
    let image: TableImage<Widget> = TableImage::decode(&bytes).unwrap();
    assert_eq!(image.rows.len(), 1);
    assert_eq!(image.rows[0].name, "flushed");

    db.close().unwrap();
    let bytes = std::fs::read(dir.path().join("widgets.tbl")).unwrap();
    let image: TableImage<Widget> = TableImage::decode(&bytes).unwrap();
    assert_eq!(image.rows.len(), 2);
}

#[test]
fn lazy_tables_flush_on_close() {
    let dir = tempdir().unwrap();
    let def = || {
        TableDef::new("widgets")
            .unwrap()
            .write_strategy(WriteStrategy::Lazy)
    };

    {
        let db = FlatDb::open(dir.path()).unwrap();
        let widgets = db
            .register_table::<Widget>(def(), widget_table_options())
            .unwrap();
        widgets.insert(widget("kept", 1)).unwrap();
        assert!(widgets.compact_percent().unwrap() < 100.0);
        db.close().unwrap();
    }

    let db = FlatDb::open(dir.path()).unwrap();
    let widgets = db
        .register_table::<Widget>(def(), widget_table_options())
        .unwrap();
    assert_eq!(widgets.count().unwrap(), 1);
    assert_eq!(widgets.compact_percent().unwrap(), 100.0);
}

#[test]
fn reset_sequence_then_insert() {
    let db = FlatDb::open_in_memory();
    let widgets = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), widget_table_options())
        .unwrap();

    widgets.reset_sequence(100, 0).unwrap();
    let row = widgets.insert(widget("anvil", 1)).unwrap().unwrap();
    assert_eq!(row.id(), 101);
}

#[test]
fn foreign_keys_enforced_across_tables() {
    init_tracing();
    let db = FlatDb::open_in_memory();
    let widgets = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), widget_table_options())
        .unwrap();
    let orders = db
        .register_table::<Order>(TableDef::new("orders").unwrap(), order_table_options())
        .unwrap();

    // Referencing a missing widget fails.
    let result = orders.insert(Order {
        id: RowId::new(),
        widget_id: 42,
        quantity: 1,
    });
    assert!(matches!(result, Err(DbError::ForeignKeyMissing { .. })));

    let anvil = widgets.insert(widget("anvil", 1500)).unwrap().unwrap();
    let order = orders
        .insert(Order {
            id: RowId::new(),
            widget_id: anvil.id(),
            quantity: 2,
        })
        .unwrap()
        .unwrap();

    // The referenced widget cannot be deleted or truncated away.
    assert!(matches!(
        widgets.delete(&anvil),
        Err(DbError::ForeignKeyInUse { .. })
    ));
    assert!(matches!(
        widgets.truncate(),
        Err(DbError::ForeignKeyInUse { .. })
    ));

    orders.delete(&order).unwrap();
    assert!(widgets.delete(&anvil).unwrap());
}

#[test]
fn unregistering_the_holder_keeps_the_declaration() {
    let db = FlatDb::open_in_memory();
    let widgets = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), widget_table_options())
        .unwrap();
    db.register_table::<Order>(TableDef::new("orders").unwrap(), order_table_options())
        .unwrap();

    db.unregister_table("orders").unwrap();

    // With the holder offline nothing can reference the widget, so the
    // delete proceeds; the declaration itself is retained.
    let anvil = widgets.insert(widget("anvil", 1)).unwrap().unwrap();
    assert!(widgets.delete(&anvil).unwrap());
    assert!(db.foreign_keys().has_inbound("widgets"));
}

struct PriceFloor;

impl TableTrigger<Widget> for PriceFloor {
    fn kinds(&self) -> TriggerKinds {
        TriggerKinds::BEFORE_INSERT.with(TriggerKinds::BEFORE_UPDATE_COMPARE)
    }

    fn before_insert(&self, rows: &mut [Candidate<Widget>]) -> DbResult<()> {
        for candidate in rows {
            if candidate.row.price_cents < 0 {
                candidate.veto();
            }
        }
        Ok(())
    }

    fn before_update_compare(&self, old: &Widget, new: &mut Candidate<Widget>) -> DbResult<()> {
        // Never let an update cut a price by more than half.
        if new.row.price_cents * 2 < old.price_cents {
            new.veto();
        }
        Ok(())
    }
}

#[test]
fn trigger_pipeline_vetoes_per_record() {
    let db = FlatDb::open_in_memory();
    let widgets = db
        .register_table::<Widget>(
            TableDef::new("widgets").unwrap(),
            widget_table_options().trigger(Arc::new(PriceFloor)),
        )
        .unwrap();

    let inserted = widgets
        .insert_many(
            vec![widget("ok", 100), widget("negative", -5), widget("fine", 50)],
            InsertOptions::default(),
        )
        .unwrap();
    assert_eq!(inserted.len(), 2);
    assert_eq!(widgets.count().unwrap(), 2);

    // An update vetoed by the compare hook keeps the stored version.
    let mut row = inserted[0].clone();
    row.price_cents = 10;
    let updated = widgets.update(row).unwrap();
    assert!(updated.is_none());
    assert_eq!(
        widgets.select(inserted[0].id()).unwrap().unwrap().price_cents,
        100
    );
}

#[test]
fn seed_data_upgrades_incrementally() {
    let dir = tempdir().unwrap();

    fn seeded(id: i64, name: &str) -> Widget {
        Widget {
            id: RowId::sealed(id),
            name: name.into(),
            price_cents: 100,
        }
    }

    let seed = Arc::new(|version: u16| match version {
        1 => vec![seeded(1, "anvil")],
        2 => vec![seeded(2, "rope")],
        _ => Vec::new(),
    });

    // Version 1: only the first seed batch applies.
    {
        let db = FlatDb::open(dir.path()).unwrap();
        let widgets = db
            .register_table::<Widget>(
                TableDef::new("widgets").unwrap().version(1),
                widget_table_options().seed(seed.clone()),
            )
            .unwrap();
        assert_eq!(widgets.count().unwrap(), 1);

        // Users may edit seeded rows; the edit must survive upgrades.
        let mut anvil = widgets.select(1).unwrap().unwrap();
        anvil.price_cents = 9999;
        widgets.update(anvil).unwrap();
        db.close().unwrap();
    }

    // Version 2: only the new batch is added, the edit is untouched.
    {
        let db = FlatDb::open(dir.path()).unwrap();
        let widgets = db
            .register_table::<Widget>(
                TableDef::new("widgets").unwrap().version(2),
                widget_table_options().seed(seed.clone()),
            )
            .unwrap();
        assert_eq!(widgets.count().unwrap(), 2);
        assert_eq!(widgets.select(1).unwrap().unwrap().price_cents, 9999);
        assert_eq!(widgets.select(2).unwrap().unwrap().name, "rope");
        db.close().unwrap();
    }

    // Reopening at the same version seeds nothing further.
    let db = FlatDb::open(dir.path()).unwrap();
    let widgets = db
        .register_table::<Widget>(
            TableDef::new("widgets").unwrap().version(2),
            widget_table_options().seed(seed),
        )
        .unwrap();
    assert_eq!(widgets.count().unwrap(), 2);
}

#[test]
fn insert_or_update_round_trip() {
    let db = FlatDb::open_in_memory();
    let widgets = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), widget_table_options())
        .unwrap();

    let mut row = widgets
        .insert_or_update(widget("anvil", 100))
        .unwrap()
        .unwrap();
    assert_eq!(row.id(), 1);

    row.price_cents = 200;
    let row = widgets.insert_or_update(row).unwrap().unwrap();
    assert_eq!(row.id(), 1);
    assert_eq!(widgets.count().unwrap(), 1);
    assert_eq!(widgets.select(1).unwrap().unwrap().price_cents, 200);
}

#[test]
fn concurrent_inserts_get_unique_ids() {
    let db = FlatDb::open_in_memory();
    let widgets = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), TableOptions::new())
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let widgets = Arc::clone(&widgets);
            std::thread::spawn(move || {
                let mut ids = Vec::new();
                for i in 0..50 {
                    let row = widgets
                        .insert(widget(&format!("w-{t}-{i}"), i))
                        .unwrap()
                        .unwrap();
                    ids.push(row.id());
                }
                ids
            })
        })
        .collect();

    let mut all_ids: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all_ids.sort_unstable();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 400);
    assert_eq!(widgets.count().unwrap(), 400);
}

#[test]
fn second_process_cannot_open_locked_directory() {
    let dir = tempdir().unwrap();
    let _db = FlatDb::open(dir.path()).unwrap();

    let result = FlatDb::open(dir.path());
    assert!(matches!(result, Err(DbError::DatabaseLocked)));
}

#[test]
fn stale_handles_cannot_write_after_the_directory_is_handed_over() {
    let dir = tempdir().unwrap();

    let db = FlatDb::open(dir.path()).unwrap();
    let widgets = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), widget_table_options())
        .unwrap();
    widgets.insert(widget("anvil", 1500)).unwrap();
    db.close().unwrap();

    // close() released the directory lock, so a kept handle must stop
    // touching the files another opener now owns.
    assert!(matches!(
        widgets.insert(widget("rope", 300)),
        Err(DbError::DatabaseClosed)
    ));
    assert!(matches!(widgets.select_all(), Err(DbError::DatabaseClosed)));

    let db = FlatDb::open(dir.path()).unwrap();
    let reopened = db
        .register_table::<Widget>(TableDef::new("widgets").unwrap(), widget_table_options())
        .unwrap();
    assert_eq!(reopened.count().unwrap(), 1);
}

#[test]
fn missing_directory_without_create_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nope");

    let result = FlatDb::open_with_config(&path, DbConfig::new().create_if_missing(false));
    assert!(matches!(result, Err(DbError::Validation { .. })));

    assert!(FlatDb::open(&path).is_ok());
}

#[test]
fn corrupt_image_is_rejected_at_registration() {
    let dir = tempdir().unwrap();

    {
        let db = FlatDb::open(dir.path()).unwrap();
        let widgets = db
            .register_table::<Widget>(TableDef::new("widgets").unwrap(), TableOptions::new())
            .unwrap();
        widgets.insert(widget("anvil", 1)).unwrap();
        db.close().unwrap();
    }

    // Flip a byte in the stored payload.
    let path = dir.path().join("widgets.tbl");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let db = FlatDb::open(dir.path()).unwrap();
    let result = db.register_table::<Widget>(TableDef::new("widgets").unwrap(), TableOptions::new());
    assert!(matches!(result, Err(DbError::InvalidFormat { .. })));
}

#[test]
fn cached_table_reads_stay_consistent_with_writes() {
    let db = FlatDb::open_in_memory();
    let widgets = db
        .register_table::<Widget>(
            TableDef::new("widgets")
                .unwrap()
                .caching(CachingStrategy::Memory),
            widget_table_options(),
        )
        .unwrap();

    widgets.insert(widget("a", 1)).unwrap();
    assert_eq!(widgets.select_all().unwrap().len(), 1);

    let b = widgets.insert(widget("b", 2)).unwrap().unwrap();
    assert_eq!(widgets.select_all().unwrap().len(), 2);

    widgets.delete(&b).unwrap();
    assert_eq!(widgets.select_all().unwrap().len(), 1);
}
