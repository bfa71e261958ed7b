use rtcr::models::{Badge, Kcap};
use rtcr::session::tracked::{MergeSummary, TrackedObjects, TrackedValue};

fn tracked() -> TrackedObjects<Badge, u32> {
    TrackedObjects::new("test")
}

fn snapshot_keys(objects: &TrackedObjects<Badge, u32>) -> Vec<u32> {
    objects.snapshot().into_iter().map(|s| s.record).collect()
}

#[test]
fn created_objects_enter_snapshot_on_commit() {
    let objects = tracked();
    objects.insert(Badge(1), 1);
    objects.insert(Badge(2), 2);
    assert_eq!(objects.pending_created(), vec![Badge(1), Badge(2)]);

    let summary = objects.begin_merge().commit();

    assert_eq!(
        summary,
        MergeSummary {
            created: 2,
            destroyed: 0,
            total: 2
        }
    );
    assert_eq!(snapshot_keys(&objects), vec![1, 2]);
    assert!(objects.pending_created().is_empty());
}

#[test]
fn object_freed_before_checkpoint_never_reaches_snapshot() {
    let objects = tracked();
    objects.insert(Badge(7), 7);
    assert_eq!(objects.remove(Badge(7)), Some(7));

    assert!(objects.pending_created().is_empty());
    assert!(objects.pending_destroyed().is_empty());
    let summary = objects.begin_merge().commit();
    assert_eq!(summary.total, 0);
    assert!(objects.snapshot().is_empty());
}

#[test]
fn destroying_a_stored_object_removes_it_on_next_merge() {
    let objects = tracked();
    objects.insert(Badge(1), 1);
    objects.insert(Badge(2), 2);
    objects.begin_merge().commit();

    objects.remove(Badge(1));
    assert_eq!(objects.pending_destroyed(), vec![Badge(1)]);
    assert_eq!(snapshot_keys(&objects), vec![1, 2], "snapshot unchanged until merge");

    let summary = objects.begin_merge().commit();
    assert_eq!(summary.destroyed, 1);
    assert_eq!(snapshot_keys(&objects), vec![2]);
}

#[test]
fn unknown_removal_returns_none() {
    let objects = tracked();
    assert_eq!(objects.remove(Badge(99)), None);
    assert!(objects.pending_destroyed().is_empty());
}

#[test]
fn aborted_merge_restores_pending_sets_and_keeps_snapshot() {
    let objects = tracked();
    objects.insert(Badge(1), 1);
    objects.begin_merge().commit();

    objects.insert(Badge(2), 2);
    objects.remove(Badge(1));
    {
        let merge = objects.begin_merge();
        assert!(merge.created().contains(&Badge(2)));
        assert!(merge.destroyed().contains_key(&Badge(1)));
    }

    assert_eq!(snapshot_keys(&objects), vec![1]);
    assert_eq!(objects.pending_created(), vec![Badge(2)]);
    assert_eq!(objects.pending_destroyed(), vec![Badge(1)]);

    objects.begin_merge().commit();
    assert_eq!(snapshot_keys(&objects), vec![2]);
}

#[test]
fn object_created_and_destroyed_during_aborted_merge_is_forgotten() {
    let objects = tracked();
    {
        objects.insert(Badge(5), 5);
        let _merge = objects.begin_merge();
        objects.remove(Badge(5));
    }
    assert!(objects.pending_created().is_empty());
    assert!(objects.pending_destroyed().is_empty());
}

#[test]
fn merge_keeps_previous_kcap_annotation() {
    let objects = tracked();
    objects.insert(Badge(3), 3);
    objects.begin_merge().commit();
    objects.annotate(|record| Kcap(u64::from(*record) << 12));

    objects.update(Badge(3), |record| *record = 4);
    objects.begin_merge().commit();

    let stored = objects.snapshot_get(Badge(3)).expect("stored");
    assert_eq!(stored.record, 4);
    assert_eq!(stored.kcap, Kcap(3 << 12));
}

#[test]
fn drain_moves_stored_objects_to_destroyed() {
    let objects = tracked();
    objects.insert(Badge(1), 1);
    objects.begin_merge().commit();
    objects.insert(Badge(2), 2);

    let drained = objects.drain();

    assert_eq!(drained, vec![1, 2]);
    assert!(objects.is_empty());
    assert_eq!(objects.pending_destroyed(), vec![Badge(1)]);
    assert!(objects.pending_created().is_empty());
}

#[test]
fn tracked_value_checkpoint_copies_live_value() {
    let value = TrackedValue::new(1_u32);
    assert!(value.snapshot().is_none());

    value.update(|v| *v = 2);
    value.checkpoint();
    value.annotate(|_| Kcap(0x2000));
    value.update(|v| *v = 3);
    value.checkpoint();

    let stored = value.snapshot().expect("stored value");
    assert_eq!(stored.record, 3);
    assert_eq!(stored.kcap, Kcap(0x2000));
    assert_eq!(value.get(), 3);
}
