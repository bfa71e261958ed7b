//! Pause → checkpoint → resume cycles over simulated children.

use rtcr::kernel::{Affinity, CacheAttr, Kernel};
use rtcr::models::report::{CheckpointMode, CheckpointReport};
use rtcr::orchestrator::checkpointer::CheckpointerState;
use rtcr::config::ChildConfig;
use rtcr::workload::ChildWorkload;
use rtcr::AppError;

use super::test_helpers::Harness;

fn unit_names(report: &CheckpointReport, child: usize) -> Vec<String> {
    let mut units: Vec<String> = report.children[child]
        .units
        .iter()
        .map(|u| u.unit.clone())
        .collect();
    units.sort();
    units
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_allocation_round_trip() {
    let h = Harness::new();
    let ram = h.open_ram("app");
    h.supervisor.mark_bootstrapped("app").expect("bootstrapped");

    let ds = ram.alloc(4096, CacheAttr::Cached).expect("alloc");
    h.kernel
        .memory()
        .attach(ds)
        .expect("attach")
        .write(0, &[0x5a; 4096])
        .expect("write");

    let report = h.checkpointer.run_cycle().await.expect("cycle");

    let snapshot = ram.dataspaces().snapshot();
    assert_eq!(snapshot.len(), 1);
    let record = &snapshot[0].record;
    assert_eq!(record.badge, ds);
    assert!(!record.bootstrapped);
    assert_eq!(record.size, 4096);
    let backing = record.backing.expect("backing recorded");

    let translation = h
        .child("app")
        .context()
        .translations()
        .get(ds)
        .expect("translation");
    assert_eq!(translation.backing, backing);
    assert_eq!(translation.size, 4096);
    assert_eq!(h.kernel.content(backing), Some(vec![0x5a; 4096]));

    assert_eq!(report.epoch, 1);
    assert_eq!(report.children.len(), 1);
    assert_eq!(report.children[0].copied_dataspaces, 1);
    assert_eq!(report.children[0].copied_bytes, 4096);
    assert_eq!(unit_names(&report, 0), vec!["ram"]);
    assert_eq!(h.checkpointer.state().await, CheckpointerState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn free_before_checkpoint_leaves_no_trace() {
    let h = Harness::new();
    let ram = h.open_ram("app");
    let ds = ram.alloc(4096, CacheAttr::Cached).expect("alloc");
    ram.free(ds).expect("free");
    let allocations = h.kernel.allocations();

    h.checkpointer.run_cycle().await.expect("cycle");

    assert!(ram.dataspaces().snapshot_get(ds).is_none());
    assert!(h.child("app").context().translations().get(ds).is_none());
    assert_eq!(h.kernel.allocations(), allocations, "no backing dataspace allocated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_without_activity_is_idempotent() {
    let h = Harness::new();
    let _child = h.launch("app", 2, 2);

    let first_report = h.checkpointer.run_cycle().await.expect("first cycle");
    let first = h.child("app").snapshot();
    let second_report = h.checkpointer.run_cycle().await.expect("second cycle");
    let second = h.child("app").snapshot();

    assert_eq!(first.sessions, second.sessions);
    assert_eq!(first.ram_dataspaces, second.ram_dataspaces);
    assert_eq!(first.region_maps, second.region_maps);
    assert_eq!(first.rm_region_maps, second.rm_region_maps);
    assert_eq!(first.threads, second.threads);
    assert_eq!(first.signal_sources, second.signal_sources);
    assert_eq!(first.signal_contexts, second.signal_contexts);
    assert_eq!(first.native_caps, second.native_caps);
    assert_eq!(first.timer, second.timer);

    let copies = |snapshot: &rtcr::models::report::ChildSnapshot| {
        snapshot
            .translations
            .iter()
            .map(|t| (t.source, t.backing, t.size, t.digest.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(copies(&first), copies(&second));
    assert!(!first.translations.is_empty());
    for translation in &second.translations {
        assert_eq!(
            h.kernel.content(translation.backing),
            h.kernel.content(translation.source)
        );
    }

    assert_eq!(second_report.epoch, first_report.epoch + 1);
    assert_eq!(
        first_report.children[0].copied_dataspaces,
        second_report.children[0].copied_dataspaces
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_thread_between_checkpoints_adds_one_record() {
    let h = Harness::new();
    let _child = h.launch("app", 1, 0);
    let cpu = h.child("app").cpu().expect("cpu session");
    let pd = h.child("app").pd().expect("pd session");

    h.checkpointer.run_cycle().await.expect("first cycle");
    let before = cpu.threads().snapshot();
    assert_eq!(before.len(), 1);

    let thread = cpu
        .create_thread(pd.badge(), "late", Affinity::default(), 1, 0)
        .expect("thread");
    thread.start(0x1000, 0x2000).expect("start");
    h.checkpointer.run_cycle().await.expect("second cycle");
    let after = cpu.threads().snapshot();

    assert_eq!(after.len(), 2);
    let old = after
        .iter()
        .find(|s| s.record.badge == before[0].record.badge)
        .expect("old thread kept");
    assert_eq!(old, &before[0]);
    let new = after
        .iter()
        .find(|s| s.record.badge == thread.badge())
        .expect("new thread stored");
    assert!(!new.record.bootstrapped);
    assert!(new.record.started);
    assert_eq!(new.record.registers.expect("registers").ip, 0x1000);
}

#[tokio::test]
async fn checkpoint_requires_paused_children() {
    let h = Harness::new();
    let err = h.checkpointer.checkpoint().await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_and_resume_leave_thread_attributes_unchanged() {
    let h = Harness::new();
    let _child = h.launch("app", 2, 0);
    let cpu = h.child("app").cpu().expect("cpu session");
    let badges: Vec<_> = cpu.threads().live().iter().map(|t| t.badge).collect();
    let first = cpu.thread(badges[0]).expect("thread");
    first.single_step(true).expect("single step");
    first.affinity(Affinity { xpos: 1, ypos: 0 }).expect("affinity");
    let before = cpu.threads().live();

    h.checkpointer.pause().await.expect("pause");
    h.checkpointer.pause().await.expect("second pause is a no-op");
    assert_eq!(h.checkpointer.state().await, CheckpointerState::Paused);
    for badge in &badges {
        assert_eq!(h.kernel.thread_paused(*badge), Some(true));
    }
    h.checkpointer.resume().await.expect("resume");
    h.checkpointer.resume().await.expect("second resume is a no-op");

    assert_eq!(cpu.threads().live(), before);
    for badge in &badges {
        assert_eq!(h.kernel.thread_paused(*badge), Some(false));
        assert_eq!(h.kernel.thread_pause_count(*badge), Some(1));
    }
    assert_eq!(h.checkpointer.state().await, CheckpointerState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thread_paused_by_child_stays_paused_across_cycle() {
    let h = Harness::new();
    let _child = h.launch("app", 2, 0);
    let cpu = h.child("app").cpu().expect("cpu session");
    let badges: Vec<_> = cpu.threads().live().iter().map(|t| t.badge).collect();
    let held = cpu.thread(badges[0]).expect("thread");
    held.pause().expect("child pause");

    h.checkpointer.pause().await.expect("pause");
    assert_eq!(cpu.suspended(), vec![badges[1]]);
    h.checkpointer.checkpoint().await.expect("checkpoint");
    h.checkpointer.resume().await.expect("resume");

    assert_eq!(h.kernel.thread_paused(badges[0]), Some(true));
    assert_eq!(h.kernel.thread_paused(badges[1]), Some(false));
    assert!(cpu.suspended().is_empty());
    let stored = cpu.threads().snapshot_get(badges[0]).expect("stored");
    assert!(stored.record.paused);

    held.resume().expect("child resume");
    assert_eq!(h.kernel.thread_paused(badges[0]), Some(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_mode_runs_units_in_dependency_order() {
    let h = Harness::new();
    h.kernel.add_rom("config", b"<config/>");
    let config = ChildConfig {
        rom: Some("config".into()),
        ..ChildConfig::named("app")
    };
    let _child = ChildWorkload::launch(&h.supervisor, &config).expect("child launches");

    let report = h.checkpointer.run_cycle().await.expect("cycle");

    let order: Vec<&str> = report.children[0]
        .units
        .iter()
        .map(|u| u.unit.as_str())
        .collect();
    assert_eq!(
        order,
        vec!["pd", "ram", "cpu", "rm", "rom", "log", "timer", "cap_mapper"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_and_parallel_modes_cover_the_same_units() {
    let mut results = Vec::new();
    for mode in [CheckpointMode::Sequential, CheckpointMode::Parallel] {
        let h = Harness::with_mode(mode);
        let _a = h.launch("a", 1, 1);
        let _b = h.launch("b", 2, 3);

        let report = h.checkpointer.run_cycle().await.expect("cycle");

        assert_eq!(report.mode, mode);
        assert_eq!(report.children.len(), 2);
        for idx in 0..2 {
            assert_eq!(
                unit_names(&report, idx),
                vec!["cap_mapper", "cpu", "log", "pd", "ram", "rm", "timer"]
            );
            assert!(report.children[idx].kcap_entries > 0);
        }
        results.push(
            report
                .children
                .iter()
                .map(|c| (c.child.clone(), c.copied_dataspaces, c.copied_bytes, c.kcap_entries))
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(results[0], results[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_report_tracks_latest_cycle() {
    let h = Harness::new();
    let child = h.launch("app", 1, 1);
    assert!(h.checkpointer.last_report().is_none());

    h.checkpointer.run_cycle().await.expect("first cycle");
    child.mutate(1).expect("mutate");
    let report = h.checkpointer.run_cycle().await.expect("second cycle");

    assert_eq!(h.checkpointer.epoch(), 2);
    assert_eq!(h.checkpointer.last_report(), Some(report));
}
