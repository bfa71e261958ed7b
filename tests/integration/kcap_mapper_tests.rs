//! Capability-table lookup and kcap annotation of stored records.

use rtcr::models::{Badge, Kcap};
use rtcr::orchestrator::checkpointer::CheckpointerState;
use rtcr::AppError;

use super::test_helpers::Harness;

fn slot(index: u64) -> Kcap {
    Kcap(index << 12)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn table_maps_published_badges_to_slot_kcaps() {
    let h = Harness::new();
    let child = h.launch("app", 1, 1);
    let pd = h.child("app").pd().expect("pd");
    let ram = h.child("app").ram().expect("ram");

    let report = h.checkpointer.run_cycle().await.expect("cycle");

    let table = h.child("app").kcap_table();
    assert_eq!(table.find_kcap_by_badge(pd.badge()), slot(1));
    assert_eq!(table.find_kcap_by_badge(ram.badge()), slot(2));
    assert_eq!(table.find_kcap_by_badge(child.cap_table()), slot(5));
    assert_eq!(table.find_kcap_by_badge(child.data()[0]), slot(6));
    assert_eq!(report.children[0].kcap_entries, table.len());
    assert_eq!(table.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_badge_yields_invalid_kcap() {
    let h = Harness::new();
    let _child = h.launch("app", 0, 0);
    h.checkpointer.run_cycle().await.expect("cycle");

    let mapper = h.child("app").cap_mapper().expect("mapper");
    let kcap = mapper.find_kcap_by_badge(Badge(0xfffe));
    assert_eq!(kcap, Kcap::INVALID);
    assert!(!kcap.is_valid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_capability_table_fails_the_checkpoint() {
    let h = Harness::new();
    let _pd = h.open_pd("bare");

    let err = h.checkpointer.run_cycle().await.unwrap_err();

    assert!(matches!(err, AppError::MissingDependency(_)), "got {err}");
    assert_eq!(h.checkpointer.state().await, CheckpointerState::Idle);
    assert!(h.child("bare").kcap_table().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn table_mapping_is_released_after_the_scan() {
    let h = Harness::new();
    let _child = h.launch("app", 2, 2);
    assert_eq!(h.kernel.active_mappings(), 0);

    h.checkpointer.run_cycle().await.expect("cycle");

    assert_eq!(h.kernel.active_mappings(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stored_records_carry_their_kcap() {
    let h = Harness::new();
    let child = h.launch("app", 1, 1);
    h.checkpointer.run_cycle().await.expect("cycle");

    let info = h.child("app");
    let pd = info.pd().expect("pd");
    let snapshot = info.snapshot();

    let pd_session = snapshot
        .sessions
        .iter()
        .find(|s| s.record.badge == pd.badge())
        .expect("pd session stored");
    assert_eq!(pd_session.kcap, slot(1));

    let table_ds = snapshot
        .ram_dataspaces
        .iter()
        .find(|s| s.record.badge == child.cap_table())
        .expect("cap table stored");
    assert_eq!(table_ds.kcap, slot(5));

    assert_eq!(snapshot.threads.len(), 1);
    assert_eq!(snapshot.threads[0].kcap, slot(7));
    assert_eq!(snapshot.signal_sources[0].kcap, slot(8));
    assert_eq!(snapshot.signal_contexts[0].kcap, slot(9));
    assert_eq!(snapshot.native_caps[0].kcap, slot(10));

    let linker = snapshot
        .region_maps
        .iter()
        .find(|m| m.badge == pd.linker_area().badge())
        .expect("linker area stored");
    assert_eq!(linker.regions.len(), 1);
    assert_eq!(linker.regions[0].kcap, slot(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn newly_published_capability_appears_after_next_cycle() {
    let h = Harness::new();
    let child = h.launch("app", 1, 0);
    h.checkpointer.run_cycle().await.expect("first cycle");
    let before = h.child("app").kcap_table().len();

    child.mutate(0).expect("mutate");
    h.checkpointer.run_cycle().await.expect("second cycle");

    assert_eq!(h.child("app").kcap_table().len(), before + 1);

    child.mutate(1).expect("second mutate");
    h.checkpointer.run_cycle().await.expect("third cycle");
    assert_eq!(h.child("app").kcap_table().len(), before + 1);
}
