//! Table and pool root sets.

use crate::address::Address;
use crate::engine::{CheckEngine, Site, SlotOutcome};
use crate::error::{EntityKind, ErrorKind};
use crate::reporter::ScanFormatter;
use crate::target::{RootSlot, Target, Walk};

type VerifySlot = fn(&mut CheckEngine, &dyn Target, &RootSlot) -> SlotOutcome;

/// Walk a slot table, grouping scan output by owner.
fn check_slots(
    engine: &mut CheckEngine,
    target: &dyn Target,
    name: &'static str,
    entity_kind: EntityKind,
    slots: Walk<'_, RootSlot>,
    verify: VerifySlot,
) {
    let checking = engine.checking();
    let mut scan = engine.scanning().then(|| ScanFormatter::new(name, Address::NULL));
    let mut owner = None;

    for slot in slots {
        let slot = match slot {
            Ok(slot) => slot,
            Err(fault) => {
                if checking {
                    engine.raise(target, Site::new(fault.address, entity_kind), ErrorKind::CorruptData);
                }
                break;
            }
        };
        if let Some(scan) = scan.as_mut() {
            if owner != Some(slot.owner) {
                scan.section("owner", slot.owner);
                owner = Some(slot.owner);
            }
            scan.entry(slot.value);
        }
        if checking {
            verify(engine, target, &slot);
        }
    }

    if let Some(scan) = scan {
        for line in scan.finish() {
            engine.note(&line);
        }
    }
}

pub(super) fn check_remembered_set(engine: &mut CheckEngine, target: &dyn Target) {
    check_slots(
        engine,
        target,
        "rememberedSet",
        EntityKind::RememberedSetBucket,
        target.remembered_set(),
        CheckEngine::verify_slot_remembered_set,
    );
}

pub(super) fn check_string_table(engine: &mut CheckEngine, target: &dyn Target) {
    check_slots(engine, target, "stringTable", EntityKind::Other, target.string_table(), CheckEngine::verify_slot_pool);
}

pub(super) fn check_class_loaders(engine: &mut CheckEngine, target: &dyn Target) {
    check_slots(engine, target, "classLoaders", EntityKind::Other, target.class_loaders(), CheckEngine::verify_slot_pool);
}

pub(super) fn check_jni_global_refs(engine: &mut CheckEngine, target: &dyn Target) {
    check_slots(
        engine,
        target,
        "jniGlobalReferences",
        EntityKind::Other,
        target.jni_global_refs(),
        CheckEngine::verify_slot_pool,
    );
}

pub(super) fn check_jni_weak_global_refs(engine: &mut CheckEngine, target: &dyn Target) {
    check_slots(
        engine,
        target,
        "jniWeakGlobalReferences",
        EntityKind::Other,
        target.jni_weak_global_refs(),
        CheckEngine::verify_slot_pool,
    );
}

pub(super) fn check_tag_tables(engine: &mut CheckEngine, target: &dyn Target) {
    check_slots(engine, target, "tagTables", EntityKind::Other, target.tag_tables(), CheckEngine::verify_slot_pool);
}

pub(super) fn check_monitor_table(engine: &mut CheckEngine, target: &dyn Target) {
    check_slots(engine, target, "monitorTable", EntityKind::Other, target.monitor_table(), CheckEngine::verify_slot_pool);
}

pub(super) fn check_vm_class_slots(engine: &mut CheckEngine, target: &dyn Target) {
    check_slots(
        engine,
        target,
        "vmClassSlots",
        EntityKind::Other,
        target.vm_class_slots(),
        CheckEngine::verify_slot_class,
    );
}
