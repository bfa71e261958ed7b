use rtcr::config::CapTableConfig;
use rtcr::kernel::sim::SimKernel;
use rtcr::kernel::{CacheAttr, Kernel};
use rtcr::models::{Badge, Kcap};
use rtcr::orchestrator::cap_mapper::{parse_cap_table, write_cap_slot};
use rtcr::AppError;

fn slot(layout: &CapTableConfig, refcount: u8, badge: u16) -> Vec<u8> {
    let mut entry = vec![0; layout.slot_size];
    entry[0] = refcount;
    entry[layout.badge_offset..layout.badge_offset + 2].copy_from_slice(&badge.to_le_bytes());
    entry
}

#[test]
fn used_slots_map_badge_to_shifted_index() {
    let layout = CapTableConfig::default();
    let mut bytes = Vec::new();
    bytes.extend(slot(&layout, 0, 0));
    bytes.extend(slot(&layout, 1, 0x21));
    bytes.extend(slot(&layout, 3, 0x42));

    let table = parse_cap_table(&bytes, &layout);

    assert_eq!(table.len(), 2);
    assert_eq!(table.find_kcap_by_badge(Badge(0x21)), Kcap(1 << 12));
    assert_eq!(table.find_kcap_by_badge(Badge(0x42)), Kcap(2 << 12));
}

#[test]
fn free_slots_and_zero_badges_are_skipped() {
    let layout = CapTableConfig::default();
    let mut bytes = Vec::new();
    bytes.extend(slot(&layout, 0, 0x10));
    bytes.extend(slot(&layout, 1, 0));

    let table = parse_cap_table(&bytes, &layout);

    assert!(table.is_empty());
    assert_eq!(table.find_kcap_by_badge(Badge(0x10)), Kcap::INVALID);
}

#[test]
fn unknown_badge_yields_invalid_kcap() {
    let layout = CapTableConfig::default();
    let table = parse_cap_table(&slot(&layout, 1, 5), &layout);
    assert_eq!(table.find_kcap_by_badge(Badge(6)), Kcap::INVALID);
    assert!(!table.find_kcap_by_badge(Badge(6)).is_valid());
}

#[test]
fn trailing_partial_slot_is_ignored() {
    let layout = CapTableConfig::default();
    let mut bytes = slot(&layout, 0, 0);
    bytes.extend(slot(&layout, 1, 9));
    bytes.extend([1, 0, 7]);
    let table = parse_cap_table(&bytes, &layout);
    assert_eq!(table.iter().collect::<Vec<_>>(), vec![(Badge(9), Kcap(1 << 12))]);
}

#[test]
fn custom_layout_is_honored() {
    let layout = CapTableConfig {
        slot_size: 16,
        badge_offset: 8,
        kcap_shift: 4,
        ..CapTableConfig::default()
    };
    let mut bytes = slot(&layout, 0, 0);
    bytes.extend(slot(&layout, 1, 0x77));
    let table = parse_cap_table(&bytes, &layout);
    assert_eq!(table.find_kcap_by_badge(Badge(0x77)), Kcap(1 << 4));
}

#[test]
fn written_slots_parse_back() {
    let kernel = SimKernel::new();
    let layout = CapTableConfig::default();
    let ram = kernel.open_ram("table", 1 << 20).expect("ram");
    let ds = ram.alloc(layout.table_size(), CacheAttr::Cached).expect("alloc");
    let mapping = kernel.memory().attach(ds).expect("attach");

    write_cap_slot(mapping.as_ref(), &layout, 0, 3, Badge(0x55)).expect("write slot");
    write_cap_slot(mapping.as_ref(), &layout, 0, 4, Badge(0x56)).expect("write slot");

    let mut bytes = vec![0; layout.table_size()];
    mapping.read(0, &mut bytes).expect("read");
    let table = parse_cap_table(&bytes, &layout);
    assert_eq!(table.find_kcap_by_badge(Badge(0x55)), Kcap(3 << 12));
    assert_eq!(table.find_kcap_by_badge(Badge(0x56)), Kcap(4 << 12));
}

#[test]
fn write_rejects_out_of_range_slot_and_wide_badge() {
    let kernel = SimKernel::new();
    let layout = CapTableConfig::default();
    let ram = kernel.open_ram("table", 1 << 20).expect("ram");
    let ds = ram.alloc(layout.table_size(), CacheAttr::Cached).expect("alloc");
    let mapping = kernel.memory().attach(ds).expect("attach");

    let slot_err = write_cap_slot(mapping.as_ref(), &layout, 0, layout.slot_count, Badge(1));
    assert!(matches!(slot_err, Err(AppError::Config(_))));
    let badge_err = write_cap_slot(mapping.as_ref(), &layout, 0, 1, Badge(0x1_0000));
    assert!(matches!(badge_err, Err(AppError::Config(_))));
}
