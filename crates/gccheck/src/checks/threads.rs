//! Thread structures and thread stacks.

use crate::address::Address;
use crate::engine::{CheckEngine, Site};
use crate::error::{EntityKind, ErrorKind};
use crate::reporter::ScanFormatter;
use crate::target::{StackSlot, Target, ThreadInfo};

pub(super) fn check_vm_threads(engine: &mut CheckEngine, target: &dyn Target) {
    let checking = engine.checking();
    let mut scan = engine
        .scanning()
        .then(|| ScanFormatter::new("vmThreads", Address::NULL));

    for thread in target.threads() {
        let thread = match thread {
            Ok(thread) => thread,
            Err(fault) => {
                if checking {
                    engine.raise(target, Site::new(fault.address, EntityKind::Thread), ErrorKind::CorruptData);
                }
                break;
            }
        };
        if let Some(scan) = scan.as_mut() {
            scan.section("thread", thread.address);
        }
        for slot in target.thread_slots(&thread) {
            let slot = match slot {
                Ok(slot) => slot,
                Err(fault) => {
                    if checking {
                        engine.raise(
                            target,
                            Site::new(thread.address, EntityKind::Thread).slot(fault.address),
                            ErrorKind::CorruptData,
                        );
                    }
                    break;
                }
            };
            if let Some(scan) = scan.as_mut() {
                scan.entry(slot.value);
            }
            if checking {
                engine.verify_slot_vm_thread(target, &thread, &slot);
            }
        }
    }

    if let Some(scan) = scan {
        for line in scan.finish() {
            engine.note(&line);
        }
    }
}

fn dump_stack(engine: &mut CheckEngine, thread: &ThreadInfo, slots: &[StackSlot]) {
    engine.note(&format!(
        "stack of thread {} [{} - {}]",
        thread.address, thread.stack_start, thread.stack_end
    ));
    for slot in slots {
        engine.note(&format!("  {} [{}] -> {}", slot.address, slot.frame, slot.value));
    }
}

pub(super) fn check_thread_stacks(engine: &mut CheckEngine, target: &dyn Target) {
    let checking = engine.checking();
    let mut scan = engine
        .scanning()
        .then(|| ScanFormatter::new("threadStacks", Address::NULL));

    for thread in target.threads() {
        let thread = match thread {
            Ok(thread) => thread,
            Err(fault) => {
                if checking {
                    engine.raise(target, Site::new(fault.address, EntityKind::Thread), ErrorKind::CorruptData);
                }
                break;
            }
        };
        if let Some(scan) = scan.as_mut() {
            scan.section("thread", thread.address);
        }

        let errors_before = engine.error_count();
        let mut visited = Vec::new();
        for slot in target.stack_slots(&thread) {
            let slot = match slot {
                Ok(slot) => slot,
                Err(fault) => {
                    if checking {
                        engine.raise(
                            target,
                            Site::new(thread.address, EntityKind::Thread).slot(fault.address),
                            ErrorKind::CorruptData,
                        );
                    }
                    break;
                }
            };
            if let Some(scan) = scan.as_mut() {
                scan.entry(slot.value);
            }
            if checking {
                engine.verify_slot_stack(target, &thread, &slot);
            }
            visited.push(slot);
        }

        let failed = engine.error_count() > errors_before;
        if engine.is_stack_dump_always_displayed() || (failed && engine.verbose()) {
            dump_stack(engine, &thread, &visited);
        }
    }

    if let Some(scan) = scan {
        for line in scan.finish() {
            engine.note(&line);
        }
    }
}
