//! Proxy sessions forward calls and keep their records in step.

use rtcr::kernel::{Affinity, AttachRequest, CacheAttr, ThreadState};
use rtcr::models::Badge;
use rtcr::session::log::LogSession;
use rtcr::session::rom::RomSession;
use rtcr::session::timer::TimerSession;
use rtcr::session::ProxySession;
use rtcr::AppError;

use super::test_helpers::{label, Harness};

fn open_timer(h: &Harness, child: &str) -> std::sync::Arc<TimerSession> {
    match h.supervisor.open_session("Timer", &label(child)) {
        Ok(ProxySession::Timer(timer)) => timer,
        _ => panic!("Timer request failed"),
    }
}

fn open_log(h: &Harness, child: &str) -> std::sync::Arc<LogSession> {
    match h.supervisor.open_session("LOG", &label(child)) {
        Ok(ProxySession::Log(log)) => log,
        _ => panic!("LOG request failed"),
    }
}

fn open_rom(h: &Harness, child: &str, module: &str) -> std::sync::Arc<RomSession> {
    match h
        .supervisor
        .open_session("ROM", &format!("label=\"{child} -> {module}\""))
    {
        Ok(ProxySession::Rom(rom)) => rom,
        _ => panic!("ROM request failed"),
    }
}

#[tokio::test]
async fn attach_records_region_and_resolves_addresses() {
    let h = Harness::new();
    let pd = h.open_pd("app");
    let ram = h.open_ram("app");
    let ds = ram.alloc(8192, CacheAttr::Cached).expect("alloc");

    let request = AttachRequest {
        offset: 4096,
        ..AttachRequest::default()
    };
    let address = pd.address_space().attach(ds, request).expect("attach");

    let region = pd.address_space().resolve(address + 100).expect("resolved");
    assert_eq!(region.dataspace, ds);
    assert_eq!(region.offset, 4096);
    assert_eq!(region.size, 4096);
    assert!(!region.managed);
    assert!(pd.address_space().resolve(address + 4096).is_none());

    pd.address_space().detach(address).expect("detach");
    assert!(pd.address_space().regions().is_empty());
    assert!(pd.address_space().resolve(address + 100).is_none());
}

#[tokio::test]
async fn rejected_attach_leaves_no_record() {
    let h = Harness::new();
    let pd = h.open_pd("app");
    let ram = h.open_ram("app");
    let first = ram.alloc(4096, CacheAttr::Cached).expect("alloc first");
    let second = ram.alloc(4096, CacheAttr::Cached).expect("alloc second");

    let address = pd
        .address_space()
        .attach(first, AttachRequest::at(0x10_000))
        .expect("attach at fixed address");
    assert_eq!(address, 0x10_000);

    let err = pd
        .address_space()
        .attach(second, AttachRequest::at(0x10_000))
        .unwrap_err();
    assert!(matches!(err, AppError::Kernel(_)), "got {err}");
    assert_eq!(pd.address_space().regions().len(), 1);
}

#[tokio::test]
async fn region_map_dataspace_attaches_as_managed() {
    let h = Harness::new();
    let pd = h.open_pd("app");
    let rm = h.open_rm("app");
    let map = rm.create(0x8000).expect("create");

    let address = pd
        .address_space()
        .attach(map.dataspace(), AttachRequest::default())
        .expect("attach");

    assert!(pd.address_space().resolve(address).expect("region").managed);
    let record = rm.region_maps().get(map.badge()).expect("recorded");
    assert_eq!(record.size, 0x8000);
    assert_eq!(record.dataspace, map.dataspace());
    assert!(h.child("app").context().region_map(map.dataspace()).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn region_map_fault_handler_is_checkpointed() {
    let h = Harness::new();
    let rm = h.open_rm("app");
    let map = rm.create(0x8000).expect("create");
    map.fault_handler(Badge(9)).expect("fault handler");

    h.checkpointer.run_cycle().await.expect("cycle");

    let stored = rm.region_maps().snapshot_get(map.badge()).expect("stored");
    assert_eq!(stored.record.fault_handler, Some(Badge(9)));

    rm.destroy(map.badge()).expect("destroy");
    assert!(rm.region_maps().is_empty());
    assert!(h.child("app").context().region_map(map.dataspace()).is_none());
}

#[tokio::test]
async fn thread_calls_update_the_record() {
    let h = Harness::new();
    let pd = h.open_pd("app");
    let cpu = h.open_cpu("app");
    let thread = cpu
        .create_thread(pd.badge(), "worker", Affinity::default(), 10, 0x5000)
        .expect("create");

    thread.single_step(true).expect("single step");
    thread.affinity(Affinity { xpos: 2, ypos: 0 }).expect("affinity");
    thread.exception_sigh(Badge(77)).expect("exception sigh");
    thread.pause().expect("pause");

    let record = cpu.threads().get(thread.badge()).expect("recorded");
    assert_eq!(record.name, "worker");
    assert_eq!(record.pd, pd.badge());
    assert_eq!(record.weight, 10);
    assert_eq!(record.utcb, 0x5000);
    assert!(record.single_step);
    assert_eq!(record.affinity, Affinity { xpos: 2, ypos: 0 });
    assert_eq!(record.exception_sigh, Some(Badge(77)));
    assert!(record.paused);

    let err = thread.affinity(Affinity { xpos: 9, ypos: 0 }).unwrap_err();
    assert!(matches!(err, AppError::Kernel(_)));
    assert_eq!(
        cpu.threads().get(thread.badge()).expect("recorded").affinity,
        Affinity { xpos: 2, ypos: 0 }
    );

    thread.resume().expect("resume");
    assert!(!cpu.threads().get(thread.badge()).expect("recorded").paused);

    let state = ThreadState {
        ip: 0x42,
        ..ThreadState::default()
    };
    thread.set_state(state).expect("set state");
    assert_eq!(thread.state().expect("state").ip, 0x42);

    cpu.kill_thread(thread.badge()).expect("kill");
    assert!(cpu.threads().is_empty());
    assert!(cpu.thread(thread.badge()).is_none());
}

#[tokio::test]
async fn signal_objects_are_tracked() {
    let h = Harness::new();
    let pd = h.open_pd("app");

    let source = pd.alloc_signal_source().expect("source");
    let context = pd.alloc_context(source, 7).expect("context");
    pd.submit(context, 2).expect("submit");
    let cap = pd.alloc_rpc_cap(pd.badge()).expect("rpc cap");

    let record = pd.signal_contexts().get(context).expect("context recorded");
    assert_eq!(record.source, source);
    assert_eq!(record.imprint, 7);
    assert_eq!(
        pd.native_caps().get(cap).expect("cap recorded").entrypoint,
        pd.badge()
    );

    let err = pd.alloc_context(Badge(0xfff1), 1).unwrap_err();
    assert!(matches!(err, AppError::Kernel(_)));
    assert_eq!(pd.signal_contexts().len(), 1);

    pd.free_context(context).expect("free context");
    pd.free_signal_source(source).expect("free source");
    pd.free_rpc_cap(cap).expect("free cap");
    assert!(pd.signal_contexts().is_empty());
    assert!(pd.signal_sources().is_empty());
    assert!(pd.native_caps().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_state_follows_requests() {
    let h = Harness::new();
    let timer = open_timer(&h, "app");

    let err = timer.trigger_once(100).unwrap_err();
    assert!(matches!(err, AppError::Kernel(_)));
    assert_eq!(timer.state().get().timeout_us, 0);

    timer.sigh(Badge(5)).expect("sigh");
    timer.trigger_periodic(250).expect("periodic");
    let state = timer.state().get();
    assert_eq!(state.timeout_us, 250);
    assert!(state.periodic);
    assert_eq!(state.sigh, Some(Badge(5)));

    assert!(timer.state().snapshot().is_none());
    h.checkpointer.run_cycle().await.expect("cycle");
    let stored = timer.state().snapshot().expect("stored");
    assert_eq!(stored.record, state);
}

#[tokio::test]
async fn rom_dataspace_is_recorded() {
    let h = Harness::new();
    h.kernel.add_rom("config", b"<config/>");
    let rom = open_rom(&h, "app", "config");

    let ds = rom.dataspace().expect("dataspace");
    rom.sigh(Badge(11)).expect("sigh");

    assert_eq!(h.kernel.content(ds), Some(b"<config/>".to_vec()));
    let state = rom.state().get();
    assert_eq!(state.dataspace, Some(ds));
    assert_eq!(state.sigh, Some(Badge(11)));
    assert!(!rom.update());
    assert_eq!(rom.info().get().label, "app -> config");
    assert!(h.child("app").rom().is_some());
}

#[tokio::test]
async fn missing_rom_module_is_not_found() {
    let h = Harness::new();
    let err = h
        .supervisor
        .open_session("ROM", "label=\"app -> missing\"")
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err}");
}

#[tokio::test]
async fn log_lines_are_forwarded() {
    let h = Harness::new();
    let log = open_log(&h, "app");
    assert_eq!(log.write("hello").expect("write"), 5);
    assert_eq!(log.info().get().label, "app");
}
