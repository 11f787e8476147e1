//! Online link path against the in-process ledger
//!
//! Concurrency tests run real OS threads against one shared engine; the memory backend
//! serializes transactions the way row locks serialize them on PostgreSQL.

use linkledger::store::{Fault, NewEntity};
use linkledger::{
    EngineConfig, EntityKind, Level, LedgerStore, LinkEngine, LinkErrorKind, LinkResult,
    MemoryLedger, ParentStatus,
};
use rust_decimal::Decimal;
use std::sync::Arc;

fn engine() -> Arc<LinkEngine<MemoryLedger>> {
    Arc::new(LinkEngine::new(MemoryLedger::new(), EngineConfig::default()).unwrap())
}

fn kinds(results: &[LinkResult]) -> (usize, usize) {
    let ok = results.iter().filter(|r| r.ok).count();
    let full = results
        .iter()
        .filter(|r| r.error_kind == Some(LinkErrorKind::CapacityReached))
        .count();
    (ok, full)
}

// ============================================================================
// Exclusivity and capacity under contention
// ============================================================================

#[test]
fn test_one_child_many_parents_exactly_one_wins() {
    let engine = engine();
    let parents: Vec<_> = (0..12)
        .map(|n| engine.create_container(&format!("C-{n:04}"), Some(5)).unwrap())
        .collect();

    let results: Vec<LinkResult> = std::thread::scope(|scope| {
        let handles: Vec<_> = parents
            .iter()
            .map(|parent| {
                let engine = &engine;
                scope.spawn(move || engine.link_unit(parent.id, "U-SHARED", 1))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = results.iter().filter(|r| r.ok).collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0].parent_id;
    let winner_code = &parents.iter().find(|p| p.id == winner).unwrap().code;

    for loser in results.iter().filter(|r| !r.ok) {
        assert_eq!(
            loser.error_kind,
            Some(LinkErrorKind::AlreadyLinkedElsewhere {
                parent_id: winner,
                parent_code: winner_code.clone(),
            })
        );
    }
    let linked: i64 = parents
        .iter()
        .map(|p| engine.store().link_count(Level::UnitToContainer, p.id))
        .sum();
    assert_eq!(linked, 1);
    assert_eq!(engine.store().entity_count(EntityKind::Unit), 1);
}

#[test]
fn test_concurrent_links_never_exceed_capacity() {
    let engine = engine();
    let container = engine.create_container("C-0001", Some(25)).unwrap();

    let results: Vec<LinkResult> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..40)
            .map(|n| {
                let engine = &engine;
                scope.spawn(move || engine.link_unit(container.id, &format!("U-{n:04}"), n))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(kinds(&results), (25, 15));
    assert_eq!(engine.store().link_count(Level::UnitToContainer, container.id), 25);
    let parent = engine.store().parent(Level::UnitToContainer, container.id).unwrap();
    assert_eq!(parent.counter, 25);
    assert_eq!(parent.status, ParentStatus::Completed);
    assert_eq!(parent.weight, Decimal::from(25));
    assert!(results.iter().all(|r| r.child_count <= 25));
}

#[test]
fn test_batch_scan_race() {
    let engine = engine();
    let batch = engine.create_batch("B-2024-0001", 50).unwrap();

    let results: Vec<LinkResult> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..60)
            .map(|n| {
                let engine = &engine;
                scope.spawn(move || engine.link_container(batch.id, &format!("C-{n:04}"), n))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(kinds(&results), (50, 10));
    let status = engine.get_batch_status(batch.id).unwrap().unwrap();
    assert_eq!(status.linked_count, 50);
    assert_eq!(status.remaining(), 0);
    assert_eq!(status.status, ParentStatus::Completed);
}

#[test]
fn test_two_scanners_same_child() {
    let engine = engine();
    let a = engine.create_container("C-000A", Some(10)).unwrap();
    let b = engine.create_container("C-000B", Some(10)).unwrap();

    let (first, second) = std::thread::scope(|scope| {
        let to_a = scope.spawn(|| engine.link_unit(a.id, "CHILD001", 1));
        let to_b = scope.spawn(|| engine.link_unit(b.id, "CHILD001", 2));
        (to_a.join().unwrap(), to_b.join().unwrap())
    });

    assert!(first.ok != second.ok, "{first:?} / {second:?}");
    let (winner, loser, winner_code) = if first.ok {
        (first, second, "C-000A")
    } else {
        (second, first, "C-000B")
    };
    assert_eq!(winner.child_count, 1);
    assert_eq!(
        loser.error_kind,
        Some(LinkErrorKind::AlreadyLinkedElsewhere {
            parent_id: winner.parent_id,
            parent_code: winner_code.to_string(),
        })
    );
    assert_eq!(loser.child_id, winner.child_id);
}

// ============================================================================
// Idempotence and drift
// ============================================================================

#[test]
fn test_relink_is_idempotent() {
    let engine = engine();
    let container = engine.create_container("C-0001", Some(3)).unwrap();

    let first = engine.link_unit(container.id, "U-0001", 1);
    let second = engine.link_unit(container.id, " u-0001 ", 1);

    assert!(first.ok && second.ok);
    assert_eq!(first.error_kind, None);
    assert_eq!(second.error_kind, Some(LinkErrorKind::AlreadyLinkedSame));
    assert_eq!(second.child_id, first.child_id);
    assert_eq!(second.child_count, first.child_count);
    assert_eq!(engine.store().link_count(Level::UnitToContainer, container.id), 1);
    assert_eq!(engine.store().parent(Level::UnitToContainer, container.id).unwrap().counter, 1);
}

#[test]
fn test_stale_counter_at_capacity_self_heals() {
    let engine = engine();
    let container = engine.create_container("C-0001", Some(3)).unwrap();
    assert!(engine.link_unit(container.id, "U-0001", 1).ok);
    assert!(engine.store().force_counter(Level::UnitToContainer, container.id, 3));

    let result = engine.link_unit(container.id, "U-0002", 1);

    assert!(result.ok, "{result:?}");
    assert_eq!(result.child_count, 2);
    let parent = engine.store().parent(Level::UnitToContainer, container.id).unwrap();
    assert_eq!(parent.counter, 2);
    assert_eq!(parent.counter, engine.store().link_count(Level::UnitToContainer, container.id));
}

#[test]
fn test_low_counter_is_corrected_on_link() {
    let engine = engine();
    let container = engine.create_container("C-0001", Some(5)).unwrap();
    for code in ["U-0001", "U-0002", "U-0003"] {
        assert!(engine.link_unit(container.id, code, 1).ok);
    }
    engine.store().force_counter(Level::UnitToContainer, container.id, 0);

    let result = engine.link_unit(container.id, "U-0004", 1);
    assert!(result.ok);
    assert_eq!(result.child_count, 4);
    assert_eq!(engine.store().parent(Level::UnitToContainer, container.id).unwrap().counter, 4);
}

#[cfg(feature = "tracing")]
#[test]
fn test_drift_correction_is_traced() {
    use linkledger::logging::channel_layer;
    use tracing_subscriber::layer::SubscriberExt;

    let engine = engine();
    let container = engine.create_container("C-0001", Some(2)).unwrap();
    assert!(engine.link_unit(container.id, "U-0001", 1).ok);
    engine.store().force_counter(Level::UnitToContainer, container.id, 2);

    let (layer, events) = channel_layer();
    let subscriber = tracing_subscriber::Registry::default()
        .with(layer.with_min_level(tracing::Level::WARN));
    let result = tracing::subscriber::with_default(subscriber, || {
        engine.link_unit(container.id, "U-0002", 1)
    });
    assert!(result.ok);

    let drift: Vec<_> = events
        .try_iter()
        .filter(|event| event.target == "linkledger::drift")
        .collect();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].field("link.level"), Some("unit_to_container"));
    assert_eq!(drift[0].field("parent_id"), Some(container.id.to_string().as_str()));
    assert_eq!(drift[0].field("before"), Some("2"));
    assert_eq!(drift[0].field("after"), Some("1"));
}

// ============================================================================
// Failures, unlink and cache
// ============================================================================

#[test]
fn test_store_failure_is_transient_and_rolled_back() {
    let engine = engine();
    let container = engine.create_container("C-0001", Some(3)).unwrap();
    engine.store().inject_fault(Fault::CountLinks);

    let failed = engine.link_unit(container.id, "U-0001", 1);
    assert!(!failed.ok);
    assert_eq!(failed.error_kind, Some(LinkErrorKind::TransientError));
    assert_eq!(engine.store().entity_count(EntityKind::Unit), 0);
    assert!(engine.store().scan_events().is_empty());

    let retried = engine.link_unit(container.id, "U-0001", 1);
    assert!(retried.ok);
    assert_eq!(retried.error_kind, None);
}

#[test]
fn test_full_then_unlink_then_link() {
    let engine = engine();
    let batch = engine.create_batch("B-0001", 1).unwrap();
    assert!(engine.link_container(batch.id, "C-0001", 1).ok);
    let full = engine.link_container(batch.id, "C-0002", 1);
    assert_eq!(full.error_kind, Some(LinkErrorKind::CapacityReached));
    assert_eq!((full.child_count, full.expected_capacity), (1, 1));

    let removed = engine.unlink_child(Level::ContainerToBatch, "C-0001", 1).unwrap();
    assert!(removed.removed);
    let status = engine.get_batch_status(batch.id).unwrap().unwrap();
    assert_eq!(status.linked_count, 0);
    assert_eq!(status.status, ParentStatus::New);

    assert!(engine.link_container(batch.id, "C-0002", 1).ok);
}

#[test]
fn test_unlink_drains_over_capacity_parent() {
    let engine = engine();
    let container = engine.create_container("C-0001", Some(1)).unwrap();
    assert!(engine.link_unit(container.id, "U-0001", 1).ok);

    // links written without counter maintenance push the parent over capacity
    engine
        .store()
        .transaction(|tx| {
            for code in ["U-0002", "U-0003"] {
                let unit = tx.get_or_create_child(
                    Level::UnitToContainer,
                    &NewEntity::unit(code, Decimal::ONE),
                )?;
                tx.insert_link(Level::UnitToContainer, container.id, unit.id)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(engine.store().link_count(Level::UnitToContainer, container.id), 3);

    let first = engine.unlink_child(Level::UnitToContainer, "U-0003", 1).unwrap();
    assert!(first.removed);
    assert_eq!(first.child_count, 2);
    assert_eq!(engine.store().parent(Level::UnitToContainer, container.id).unwrap().counter, 1);

    let second = engine.unlink_child(Level::UnitToContainer, "U-0002", 1).unwrap();
    assert!(second.removed);
    assert_eq!(second.child_count, 1);

    let parent = engine.store().parent(Level::UnitToContainer, container.id).unwrap();
    assert_eq!(parent.counter, 1);
    assert_eq!(parent.status, ParentStatus::Completed);
    assert_eq!(engine.store().link_count(Level::UnitToContainer, container.id), 1);
    assert!(engine.reconcile(Level::UnitToContainer, container.id).unwrap().is_none());
}

#[test]
fn test_link_lost_between_check_and_insert() {
    let engine = engine();
    let a = engine.create_container("C-000A", Some(5)).unwrap();
    let b = engine.create_container("C-000B", Some(5)).unwrap();
    engine
        .store()
        .inject_fault(Fault::InsertLinkConflict { parent_id: b.id });

    let result = engine.link_unit(a.id, "U-0001", 1);

    assert!(!result.ok, "{result:?}");
    assert_eq!(
        result.error_kind,
        Some(LinkErrorKind::AlreadyLinkedElsewhere {
            parent_id: b.id,
            parent_code: "C-000B".to_string(),
        })
    );
    assert_eq!(result.child_count, 1);
    let parent = engine.store().parent(Level::UnitToContainer, a.id).unwrap();
    assert_eq!(parent.counter, 0);
    assert_eq!(engine.store().link_count(Level::UnitToContainer, a.id), 0);
    assert_eq!(engine.store().parent_of(Level::UnitToContainer, "U-0001"), Some(b.id));
}

#[test]
fn test_same_parent_won_between_check_and_insert() {
    let engine = engine();
    let container = engine.create_container("C-0001", Some(5)).unwrap();
    engine
        .store()
        .inject_fault(Fault::InsertLinkConflict { parent_id: container.id });

    let result = engine.link_unit(container.id, "U-0001", 1);

    assert!(result.ok);
    assert_eq!(result.error_kind, Some(LinkErrorKind::AlreadyLinkedSame));
    assert_eq!(engine.store().link_count(Level::UnitToContainer, container.id), 1);
}

#[test]
fn test_cached_status_never_decides_capacity() {
    let engine = engine();
    let batch = engine.create_batch("B-0001", 2).unwrap();
    assert_eq!(engine.get_batch_status(batch.id).unwrap().unwrap().linked_count, 0);

    // links made behind the engine's back leave the cached entry stale
    let store = engine.store();
    store
        .transaction(|tx| {
            for code in ["C-0001", "C-0002"] {
                let container = tx.get_or_create_child(
                    Level::ContainerToBatch,
                    &NewEntity::parent(code, 30),
                )?;
                tx.insert_link(Level::ContainerToBatch, batch.id, container.id)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(engine.cache().get(batch.id).unwrap().linked_count, 0);

    let result = engine.link_container(batch.id, "C-0003", 1);
    assert_eq!(result.error_kind, Some(LinkErrorKind::CapacityReached));
    assert_eq!(engine.store().link_count(Level::ContainerToBatch, batch.id), 2);
}

#[test]
fn test_delete_parent_in_use() {
    let engine = engine();
    let container = engine.create_container("C-0001", Some(3)).unwrap();
    assert!(engine.link_unit(container.id, "U-0001", 1).ok);

    assert!(matches!(
        engine.delete_parent(Level::UnitToContainer, container.id),
        Err(linkledger::LedgerError::ParentInUse(_))
    ));
    engine.unlink_child(Level::UnitToContainer, "U-0001", 1).unwrap();
    assert!(engine.delete_parent(Level::UnitToContainer, container.id).unwrap());
}
