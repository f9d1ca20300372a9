//! Identity map, handle, object state machine, cursor, and hierarchy
//! behavior.

mod common;

use common::{Account, SavingsAccount, Widget, account_conn, widget_conn};
use loam::{DatabaseConnection, DatabaseTransaction, Error, Handle, TableCursor};
use proptest::prelude::*;

fn widget_row_count(conn: &DatabaseConnection) -> i64 {
    let mut stmt = conn
        .statement("select count(*) from widgets")
        .expect("count prepares");
    assert!(stmt.step().expect("count row"));
    stmt.extract(0).expect("count value")
}

#[test]
fn two_routes_to_one_row_share_one_object() {
    let conn = widget_conn();
    let h1 = Handle::<Widget>::new(&conn).expect("new handle");
    h1.update(|w| w.label = "flange".to_owned()).expect("update");
    let id = h1.save().expect("save");

    let h2 = Handle::<Widget>::get(&conn, id).expect("fetch handle");
    assert_eq!(h1, h2);
    assert_eq!(h1.handle_count(), 2);

    drop(h2);
    assert_eq!(h1.handle_count(), 1);
    assert_eq!(h1.read(|w| w.label.clone()).expect("read"), "flange");
}

#[test]
fn orphaned_clean_objects_are_revived_from_the_cache() {
    let conn = widget_conn();
    let map = conn.identity_map::<Widget>();
    assert!(map.is_caching_enabled());

    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle.update(|w| w.label = "kept".to_owned()).expect("update");
    let id = handle.save().expect("save");
    drop(handle);

    // Unreferenced but clean: parked in the orphan cache.
    assert!(map.is_cached(id));
    let revived = Handle::<Widget>::get(&conn, id).expect("revive");
    // Still loaded, so this is the same object, not a fresh ghost.
    assert!(!revived.is_ghost());
    assert_eq!(revived.read(|w| w.label.clone()).expect("read"), "kept");
    assert_eq!(map.cached_object_count(), 1);
}

#[test]
fn disabled_caching_evicts_at_refcount_zero_and_reloads_ghosts() {
    let conn = widget_conn();
    let map = conn.identity_map::<Widget>();
    map.disable_caching();

    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle
        .update(|w| {
            w.label = "transient".to_owned();
            w.count = 9;
            w.serial = 999_999_983;
            w.ratio = -20_987.987_3;
        })
        .expect("update");
    let id = handle.save().expect("save");
    drop(handle);
    assert!(!map.is_cached(id));
    assert_eq!(map.cached_object_count(), 0);

    // A fresh fetch builds a ghost; the first read loads it whole.
    let fetched = Handle::<Widget>::get(&conn, id).expect("fetch");
    assert!(fetched.is_ghost());
    let fields = fetched.read(Clone::clone).expect("read loads");
    assert!(!fetched.is_ghost());
    assert_eq!(fields.label, "transient");
    assert_eq!(fields.count, 9);
    assert_eq!(fields.serial, 999_999_983);
    assert!((fields.ratio - -20_987.987_3).abs() < f64::EPSILON);
}

#[test]
fn orphan_cache_evicts_oldest_beyond_capacity() {
    let conn = widget_conn();
    let map = conn.identity_map::<Widget>();
    map.set_orphan_capacity(2);

    let mut ids = Vec::new();
    for n in 0..3 {
        let handle = Handle::<Widget>::new(&conn).expect("new handle");
        handle
            .update(|w| w.label = format!("w{n}"))
            .expect("update");
        ids.push(handle.save().expect("save"));
    }
    // All three become orphans in save order; the oldest falls out.
    assert!(!map.is_cached(ids[0]));
    assert!(map.is_cached(ids[1]));
    assert!(map.is_cached(ids[2]));
}

#[test]
fn dirty_objects_survive_refcount_zero() {
    let conn = widget_conn();
    let map = conn.identity_map::<Widget>();
    map.set_orphan_capacity(0);

    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle.update(|w| w.label = "unsaved".to_owned()).expect("update");
    let key_count = map.cached_object_count();
    drop(handle);
    // Dirty and unsaved: not evictable even with a zero-capacity orphan
    // cache.
    assert_eq!(map.cached_object_count(), key_count);
}

#[test]
fn uncache_is_refused_while_handles_exist() {
    let conn = widget_conn();
    let map = conn.identity_map::<Widget>();

    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle.update(|w| w.label = "held".to_owned()).expect("update");
    let id = handle.save().expect("save");

    let err = map.uncache(id).expect_err("handle still out");
    assert!(matches!(err, Error::ObjectInUse { handles: 1 }));

    drop(handle);
    map.uncache(id).expect("orphan can be forced out");
    assert!(!map.is_cached(id));
}

#[test]
fn failed_save_restores_the_snapshot_and_stays_dirty() {
    let conn = widget_conn();
    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle
        .update(|w| {
            w.label = "good".to_owned();
            w.count = 5;
        })
        .expect("update");
    let id = handle.save().expect("first save");

    // Violate the CHECK constraint on count.
    handle.update(|w| w.count = -1).expect("update");
    let err = handle.save().expect_err("constraint must fail the save");
    assert!(matches!(err, Error::Constraint { .. }), "got {err:?}");

    // In memory: snapshot restored (the failed values), Dirty again.
    assert!(handle.is_dirty());
    assert_eq!(handle.read(|w| w.count).expect("read"), -1);
    assert_eq!(handle.id(), Some(id));

    // On disk: untouched.
    let mut stmt = conn
        .statement("select count from widgets where widget_id = :p")
        .expect("select prepares");
    stmt.bind(":p", id).expect("bind");
    assert!(stmt.step().expect("row"));
    assert_eq!(stmt.extract::<i32>(0).expect("count"), 5);
}

#[test]
fn failed_first_save_withdraws_the_provisional_id() {
    let conn = widget_conn();
    let map = conn.identity_map::<Widget>();
    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle.update(|w| w.count = -7).expect("update");

    let err = handle.save().expect_err("constraint must fail the save");
    assert!(matches!(err, Error::Constraint { .. }));
    assert_eq!(handle.id(), None);
    assert!(handle.is_dirty());
    assert_eq!(widget_row_count(&conn), 0);

    // The speculative by-id slot is gone; the id is re-usable.
    handle.update(|w| w.count = 7).expect("repair");
    let id = handle.save().expect("save succeeds now");
    assert!(map.is_cached(id));
    assert_eq!(widget_row_count(&conn), 1);
}

#[test]
fn cancelling_an_enclosing_transaction_rolls_back_a_new_objects_save() {
    let conn = widget_conn();
    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle
        .update(|w| {
            w.label = "provisional".to_owned();
            w.count = 1;
        })
        .expect("update");

    let tx = DatabaseTransaction::begin(&conn).expect("begin");
    let id = handle.save().expect("save inside transaction");
    assert_eq!(handle.id(), Some(id));
    assert!(!handle.is_dirty());
    tx.cancel().expect("cancel");

    // Database and object both reverted: no row, no id, Dirty again,
    // fields as they were at the save.
    assert_eq!(widget_row_count(&conn), 0);
    assert_eq!(handle.id(), None);
    assert!(handle.is_dirty());
    assert_eq!(handle.read(|w| w.label.clone()).expect("read"), "provisional");

    // Saving again re-inserts under a fresh allocation.
    let id2 = handle.save().expect("save after rollback");
    assert_eq!(widget_row_count(&conn), 1);
    assert_eq!(handle.id(), Some(id2));
}

#[test]
fn cancelling_an_enclosing_transaction_restores_an_existing_object() {
    let conn = widget_conn();
    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle
        .update(|w| {
            w.label = "original".to_owned();
            w.count = 1;
        })
        .expect("update");
    let id = handle.save().expect("baseline save");

    let tx = DatabaseTransaction::begin(&conn).expect("begin");
    handle.update(|w| w.label = "modified".to_owned()).expect("update");
    handle.save().expect("save inside transaction");
    tx.cancel().expect("cancel");

    // Disk shows the original, memory keeps the modification as unsaved
    // work.
    let mut stmt = conn
        .statement("select label from widgets where widget_id = :p")
        .expect("select prepares");
    stmt.bind(":p", id).expect("bind");
    assert!(stmt.step().expect("row"));
    assert_eq!(stmt.extract::<String>(0).expect("label"), "original");

    assert!(handle.is_dirty());
    assert_eq!(handle.read(|w| w.label.clone()).expect("read"), "modified");

    // Saving again converges disk onto memory.
    handle.save().expect("re-save");
    let mut stmt = conn
        .statement("select label from widgets where widget_id = :p")
        .expect("select prepares");
    stmt.bind(":p", id).expect("bind");
    assert!(stmt.step().expect("row"));
    assert_eq!(stmt.extract::<String>(0).expect("label"), "modified");
}

#[test]
fn ghostify_discards_loaded_state_until_the_next_read() {
    let conn = widget_conn();
    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle.update(|w| w.label = "stable".to_owned()).expect("update");
    handle.save().expect("save");

    handle.ghostify();
    assert!(handle.is_ghost());
    // The read transparently reloads.
    assert_eq!(handle.read(|w| w.label.clone()).expect("read"), "stable");
    assert!(!handle.is_ghost());
}

#[test]
fn remove_deletes_the_row_and_resets_identity() {
    let conn = widget_conn();
    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle.update(|w| w.label = "doomed".to_owned()).expect("update");
    let id = handle.save().expect("save");
    assert_eq!(widget_row_count(&conn), 1);

    handle.remove().expect("remove");
    assert_eq!(widget_row_count(&conn), 0);
    assert_eq!(handle.id(), None);
    assert!(handle.is_dirty());
    assert!(!conn.identity_map::<Widget>().is_cached(id));

    // The object is an unsaved object again; saving re-inserts it.
    let id2 = handle.save().expect("save after remove");
    assert_eq!(widget_row_count(&conn), 1);
    assert_eq!(handle.id(), Some(id2));
}

#[test]
fn checked_get_rejects_unknown_ids() {
    let conn = widget_conn();
    let err = Handle::<Widget>::get(&conn, 41).expect_err("no such row");
    assert!(matches!(
        err,
        Error::BadIdentifier {
            table: "widgets",
            id: 41,
        }
    ));
}

#[test]
fn unchecked_get_defers_failure_to_the_first_load() {
    let conn = widget_conn();
    let phantom = Handle::<Widget>::get_unchecked(&conn, 999).expect("no probe, no failure");
    assert!(phantom.is_ghost());
    let err = phantom.read(|w| w.count).expect_err("load must fail");
    assert!(matches!(err, Error::BadIdentifier { .. }));
    // Never partially loaded.
    assert!(phantom.is_ghost());
}

#[test]
fn hierarchy_saves_span_both_tables_and_share_the_key_sequence() {
    let conn = account_conn();

    let base = Handle::<Account>::new(&conn).expect("new base");
    base.update(|a| a.name = "cheque".to_owned()).expect("update");
    let base_id = base.save().expect("save base");

    let savings = Handle::<SavingsAccount>::new(&conn).expect("new sub");
    savings
        .update(|s| {
            s.name = "rainy day".to_owned();
            s.rate = 0.0375;
        })
        .expect("update");
    let savings_id = savings.save().expect("save sub");

    // One autoincrement sequence on the base exclusive table.
    assert_eq!(base_id, 1);
    assert_eq!(savings_id, 2);

    let mut stmt = conn
        .statement("select count(*) from savings_accounts")
        .expect("count prepares");
    assert!(stmt.step().expect("row"));
    assert_eq!(stmt.extract::<i64>(0).expect("count"), 1);
}

#[test]
fn base_typed_handles_interchange_with_derived_ones() {
    let conn = account_conn();
    let savings = Handle::<SavingsAccount>::new(&conn).expect("new sub");
    savings
        .update(|s| {
            s.name = "holiday".to_owned();
            s.rate = 0.05;
        })
        .expect("update");
    let id = savings.save().expect("save");

    // The base-typed route lands on the same cached object.
    let as_base = Handle::<Account>::get(&conn, id).expect("base fetch");
    assert_eq!(as_base.handle_count(), 2);
    assert!(as_base.has_dynamic_type::<SavingsAccount>());
    assert!(!as_base.has_dynamic_type::<Account>());

    // Typed field access requires the concrete type.
    let err = as_base.read(|a| a.name.clone()).expect_err("wrong type");
    assert!(matches!(err, Error::WrongObjectType));

    let downcast = as_base
        .downcast::<SavingsAccount>()
        .expect("runtime type matches");
    assert!((downcast.read(|s| s.rate).expect("read") - 0.05).abs() < f64::EPSILON);

    let upcast = downcast.to_base().expect("upcast");
    assert_eq!(upcast.handle_count(), 4);
}

#[test]
fn derived_objects_reload_through_both_tables() {
    let conn = account_conn();
    conn.identity_map::<Account>().disable_caching();

    let savings = Handle::<SavingsAccount>::new(&conn).expect("new sub");
    savings
        .update(|s| {
            s.name = "pension".to_owned();
            s.rate = 0.07;
        })
        .expect("update");
    let id = savings.save().expect("save");
    drop(savings);
    assert!(!conn.identity_map::<Account>().is_cached(id));

    let fetched = Handle::<SavingsAccount>::get(&conn, id).expect("fetch");
    assert!(fetched.is_ghost());
    let (name, rate) = fetched
        .read(|s| (s.name.clone(), s.rate))
        .expect("read loads via join");
    assert_eq!(name, "pension");
    assert!((rate - 0.07).abs() < f64::EPSILON);
}

#[test]
fn cursor_walks_the_table_in_key_order() {
    let conn = widget_conn();
    for n in 0..3 {
        let handle = Handle::<Widget>::new(&conn).expect("new handle");
        handle.update(|w| w.label = format!("w{n}")).expect("update");
        handle.save().expect("save");
    }

    let cursor = TableCursor::<Widget>::new(&conn).expect("cursor");
    let ids: Vec<_> = cursor
        .map(|item| item.expect("row materializes").id().expect("saved id"))
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn cursor_materializes_through_the_identity_map() {
    let conn = widget_conn();
    let held = Handle::<Widget>::new(&conn).expect("new handle");
    held.update(|w| w.label = "held".to_owned()).expect("update");
    let id = held.save().expect("save");

    let cursor = TableCursor::<Widget>::new(&conn).expect("cursor");
    let from_cursor = cursor.current().expect("positioned on the row").clone();
    assert_eq!(from_cursor.id(), Some(id));
    // Same object as the held handle, not a second copy.
    assert_eq!(from_cursor, held);
    assert_eq!(held.handle_count(), 3);
}

#[test]
fn cursor_clones_share_one_stream() {
    let conn = widget_conn();
    for n in 0..3 {
        let handle = Handle::<Widget>::new(&conn).expect("new handle");
        handle.update(|w| w.label = format!("w{n}")).expect("update");
        handle.save().expect("save");
    }

    let mut first = TableCursor::<Widget>::new(&conn).expect("cursor");
    let mut second = first.clone();
    assert_eq!(first.current().expect("row").id(), Some(1));
    assert_eq!(second.current().expect("row").id(), Some(1));

    // Advancing either cursor consumes the shared stream.
    first.advance().expect("advance");
    assert_eq!(first.current().expect("row").id(), Some(2));
    second.advance().expect("advance");
    assert_eq!(second.current().expect("row").id(), Some(3));
}

#[test]
fn exhausted_cursors_equal_the_sentinel() {
    let conn = widget_conn();
    let handle = Handle::<Widget>::new(&conn).expect("new handle");
    handle.update(|w| w.label = "only".to_owned()).expect("update");
    handle.save().expect("save");

    let mut cursor = TableCursor::<Widget>::new(&conn).expect("cursor");
    let sentinel = TableCursor::<Widget>::sentinel();
    assert!(cursor != sentinel);
    cursor.advance().expect("advance past the only row");
    assert!(cursor.is_exhausted());
    assert!(cursor == sentinel);
    assert!(matches!(cursor.current(), Err(Error::UnboundHandle)));

    // An empty result set leaves the cursor exhausted immediately.
    let empty =
        TableCursor::<Widget>::with_statement(&conn, "select widget_id from widgets where 0")
            .expect("cursor");
    assert!(empty == TableCursor::sentinel());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Random clone/drop sequences keep the handle counter in lockstep
    /// with the number of live handles, and the object ends parked in the
    /// orphan cache once the last handle drops.
    #[test]
    fn handle_counter_tracks_live_handles(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
        let conn = widget_conn();
        let seed = Handle::<Widget>::new(&conn).expect("new handle");
        seed.update(|w| w.label = "counted".to_owned()).expect("update");
        let id = seed.save().expect("save");
        let mut handles = vec![seed];

        for clone_next in ops {
            if clone_next || handles.is_empty() {
                let handle = match handles.first() {
                    Some(existing) => existing.clone(),
                    None => Handle::<Widget>::get(&conn, id).expect("revive"),
                };
                handles.push(handle);
            } else {
                handles.pop();
            }
            if let Some(handle) = handles.first() {
                prop_assert_eq!(handle.handle_count() as usize, handles.len());
            }
        }

        handles.clear();
        let map = conn.identity_map::<Widget>();
        prop_assert!(map.is_cached(id));
        prop_assert_eq!(map.cached_object_count(), 1);
    }
}
