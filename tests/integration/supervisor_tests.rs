//! Session requests, upgrades, closes and child reaping.

use rtcr::kernel::CacheAttr;
use rtcr::models::session::SessionKind;
use rtcr::models::Badge;
use rtcr::session::factory::SessionFactoryRegistry;
use rtcr::AppError;

use super::test_helpers::{label, Harness};

#[test]
fn builtin_factories_cover_every_service() {
    let registry = SessionFactoryRegistry::with_builtin();
    let mut services = registry.services();
    services.sort_unstable();
    assert_eq!(services, vec!["CPU", "LOG", "PD", "RAM", "RM", "ROM", "Timer"]);
    assert_eq!(registry.find("RAM").map(|f| f.kind()), Some(SessionKind::Ram));
    assert!(registry.find("GPU").is_none());
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let h = Harness::new();
    let err = h.supervisor.open_session("GPU", &label("app")).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err}");
    assert!(h.supervisor.registry().find("app").is_none());
}

#[tokio::test]
async fn second_session_of_a_kind_is_rejected() {
    let h = Harness::new();
    let _pd = h.open_pd("app");
    let err = h.supervisor.open_session("PD", &label("app")).unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)), "got {err}");

    // A different child may still open one.
    h.supervisor
        .open_session("PD", &label("other"))
        .expect("other child opens a PD session");
}

#[tokio::test]
async fn opened_session_debug_names_kind_and_label() {
    let h = Harness::new();
    let session = h
        .supervisor
        .open_session("LOG", &label("app"))
        .expect("log session");

    let rendered = format!("{session:?}");
    assert!(rendered.contains("Log"), "got {rendered}");
    assert!(rendered.contains("\"app\""), "got {rendered}");
}

#[tokio::test]
async fn arguments_without_label_are_rejected() {
    let h = Harness::new();
    let err = h.supervisor.open_session("RAM", "ram_quota=4K").unwrap_err();
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

#[tokio::test]
async fn opening_pd_adds_capability_mapper_unit() {
    let h = Harness::new();
    let _ram = h.open_ram("app");
    assert!(h.child("app").cap_mapper().is_none());

    let _pd = h.open_pd("app");
    let units: Vec<String> = h
        .child("app")
        .workers()
        .iter()
        .map(|w| w.unit().to_owned())
        .collect();
    assert_eq!(units, vec!["pd", "ram", "cap_mapper"]);
}

#[tokio::test]
async fn upgrade_donates_quota_to_the_session() {
    let h = Harness::new();
    let ram = h.open_ram("app");
    assert_eq!(ram.quota(), 4 << 20);

    h.supervisor
        .upgrade_session("app", SessionKind::Ram, 1 << 20)
        .expect("upgrade");

    assert_eq!(ram.quota(), 5 << 20);
    assert_eq!(ram.info().get().ram_quota, 5 << 20);
}

#[tokio::test]
async fn upgrade_of_missing_session_is_not_found() {
    let h = Harness::new();
    let _ram = h.open_ram("app");

    let err = h
        .supervisor
        .upgrade_session("app", SessionKind::Cpu, 4096)
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err}");

    let err = h
        .supervisor
        .upgrade_session("ghost", SessionKind::Ram, 4096)
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_pd_and_cpu_reaps_the_child() {
    let h = Harness::new();
    let _child = h.launch("app", 1, 1);
    h.checkpointer.run_cycle().await.expect("cycle");
    let backings: Vec<Badge> = h
        .child("app")
        .context()
        .translations()
        .list()
        .iter()
        .map(|t| t.backing)
        .collect();
    assert!(!backings.is_empty());

    h.supervisor
        .close_session("app", SessionKind::Pd)
        .expect("close pd");
    assert!(h.supervisor.registry().find("app").is_some());
    assert!(h.child("app").cap_mapper().is_none());

    h.supervisor
        .close_session("app", SessionKind::Cpu)
        .expect("close cpu");
    assert!(h.supervisor.registry().find("app").is_none());
    for backing in backings {
        assert!(!h.kernel.dataspace_exists(backing));
    }
}

#[tokio::test]
async fn closing_unknown_session_is_not_found() {
    let h = Harness::new();
    let _ram = h.open_ram("app");
    let err = h
        .supervisor
        .close_session("app", SessionKind::Timer)
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err}");
}

#[tokio::test]
async fn closing_ram_frees_its_dataspaces() {
    let h = Harness::new();
    let _pd = h.open_pd("app");
    let ram = h.open_ram("app");
    let ds = ram.alloc(4096, CacheAttr::Cached).expect("alloc");

    h.supervisor
        .close_session("app", SessionKind::Ram)
        .expect("close ram");

    assert!(!h.kernel.dataspace_exists(ds));
    assert!(h.child("app").ram().is_none());
}

#[tokio::test]
async fn unknown_objects_are_forwarded_to_the_kernel() {
    let h = Harness::new();
    let ram = h.open_ram("app");
    let pd = h.open_pd("app");
    let rm = h.open_rm("app");
    let cpu = h.open_cpu("app");
    let bogus = Badge(0xfff0);

    assert!(matches!(ram.free(bogus), Err(AppError::Kernel(_))));
    assert!(matches!(pd.free_signal_source(bogus), Err(AppError::Kernel(_))));
    assert!(matches!(pd.free_context(bogus), Err(AppError::Kernel(_))));
    assert!(matches!(pd.free_rpc_cap(bogus), Err(AppError::Kernel(_))));
    assert!(matches!(rm.destroy(bogus), Err(AppError::Kernel(_))));
    assert!(matches!(cpu.kill_thread(bogus), Err(AppError::Kernel(_))));
    assert!(matches!(
        pd.address_space().detach(0x1234_0000),
        Err(AppError::Kernel(_))
    ));
}

#[tokio::test]
async fn records_remember_the_bootstrap_phase() {
    let h = Harness::new();
    let ram = h.open_ram("app");
    let early = ram.alloc(4096, CacheAttr::Cached).expect("early");
    h.supervisor.mark_bootstrapped("app").expect("bootstrapped");
    let late = ram.alloc(4096, CacheAttr::Cached).expect("late");

    assert!(ram.dataspaces().get(early).expect("early").bootstrapped);
    assert!(!ram.dataspaces().get(late).expect("late").bootstrapped);
    assert!(ram.info().get().bootstrapped);
    assert!(!h.child("app").context().bootstrapping());

    let err = h.supervisor.mark_bootstrapped("ghost").unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_checkpointing() {
    let h = Harness::new();
    let _ram = h.open_ram("app");

    h.supervisor.shutdown();

    let err = h.checkpointer.run_cycle().await.unwrap_err();
    assert!(matches!(err, AppError::Worker(_)), "got {err}");
}
