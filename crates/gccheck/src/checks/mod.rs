//! Root-set check variants.
//!
//! One adapter per enumerable root set. Each walks its root set lazily and
//! hands every pointer it finds to the [`CheckEngine`]. The registry below
//! fixes the execution order: the ownable-synchronizer lists are counted
//! before the object heap so the two counts can be reconciled once at the
//! end of the cycle.

mod heap;
mod lists;
mod tables;
mod threads;

use std::fmt;

use crate::engine::CheckEngine;
use crate::options::ScanFlags;
use crate::target::Target;

pub use heap::{HeapWalk, HeapWalkEntry, WalkFault};
pub use lists::{ListFault, ListNode, ObjectListWalk};

/// Every enumerable root set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootSetKind {
    /// Every object in every object region
    ObjectHeap,
    /// Every class in every class segment
    ClassHeap,
    /// Generational remembered set
    RememberedSet,
    /// Unfinalized object lists
    Unfinalized,
    /// Finalizable object lists
    Finalizable,
    /// Ownable synchronizer lists
    OwnableSynchronizer,
    /// Interned string table
    StringTable,
    /// Class loader table
    ClassLoaders,
    /// JNI global reference pool
    JniGlobalRefs,
    /// JNI weak global reference pool
    JniWeakGlobalRefs,
    /// Tool object tag tables
    TagTables,
    /// Inflated monitor table
    MonitorTable,
    /// Well-known VM class slots
    VmClassSlots,
    /// Thread structures
    VmThreads,
    /// Thread stacks
    ThreadStacks,
}

impl RootSetKind {
    /// Name used in reports
    pub fn name(self) -> &'static str {
        match self {
            RootSetKind::ObjectHeap => "objectHeap",
            RootSetKind::ClassHeap => "classHeap",
            RootSetKind::RememberedSet => "rememberedSet",
            RootSetKind::Unfinalized => "unfinalized",
            RootSetKind::Finalizable => "finalizable",
            RootSetKind::OwnableSynchronizer => "ownableSynchronizer",
            RootSetKind::StringTable => "stringTable",
            RootSetKind::ClassLoaders => "classLoaders",
            RootSetKind::JniGlobalRefs => "jniGlobalReferences",
            RootSetKind::JniWeakGlobalRefs => "jniWeakGlobalReferences",
            RootSetKind::TagTables => "tagTables",
            RootSetKind::MonitorTable => "monitorTable",
            RootSetKind::VmClassSlots => "vmClassSlots",
            RootSetKind::VmThreads => "vmThreads",
            RootSetKind::ThreadStacks => "threadStacks",
        }
    }

    /// The single scan bit selecting this root set
    pub fn scan_flag(self) -> ScanFlags {
        match self {
            RootSetKind::ObjectHeap => ScanFlags::OBJECT_HEAP,
            RootSetKind::ClassHeap => ScanFlags::CLASS_HEAP,
            RootSetKind::RememberedSet => ScanFlags::REMEMBERED_SET,
            RootSetKind::Unfinalized => ScanFlags::UNFINALIZED,
            RootSetKind::Finalizable => ScanFlags::FINALIZABLE,
            RootSetKind::OwnableSynchronizer => ScanFlags::OWNABLE_SYNCHRONIZER,
            RootSetKind::StringTable => ScanFlags::STRING_TABLE,
            RootSetKind::ClassLoaders => ScanFlags::CLASS_LOADERS,
            RootSetKind::JniGlobalRefs => ScanFlags::JNI_GLOBAL_REFS,
            RootSetKind::JniWeakGlobalRefs => ScanFlags::JNI_WEAK_GLOBAL_REFS,
            RootSetKind::TagTables => ScanFlags::TAG_TABLES,
            RootSetKind::MonitorTable => ScanFlags::MONITOR_TABLE,
            RootSetKind::VmClassSlots => ScanFlags::VM_CLASS_SLOTS,
            RootSetKind::VmThreads => ScanFlags::VM_THREADS,
            RootSetKind::ThreadStacks => ScanFlags::THREAD_STACKS,
        }
    }
}

impl fmt::Display for RootSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Walks one root set, feeding the engine.
pub type CheckFn = fn(&mut CheckEngine, &dyn Target);

/// A check variant: a root set and the function that walks it.
#[derive(Clone, Copy)]
pub struct Check {
    /// Root set walked
    pub kind: RootSetKind,
    run: CheckFn,
}

impl Check {
    /// Walk the root set
    pub fn run(&self, engine: &mut CheckEngine, target: &dyn Target) {
        (self.run)(engine, target)
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("kind", &self.kind).finish()
    }
}

/// All variants, in execution order.
static REGISTRY: [Check; 15] = [
    Check { kind: RootSetKind::OwnableSynchronizer, run: lists::check_ownable_synchronizer },
    Check { kind: RootSetKind::ObjectHeap, run: heap::check_object_heap },
    Check { kind: RootSetKind::ClassHeap, run: heap::check_class_heap },
    Check { kind: RootSetKind::RememberedSet, run: tables::check_remembered_set },
    Check { kind: RootSetKind::Unfinalized, run: lists::check_unfinalized },
    Check { kind: RootSetKind::Finalizable, run: lists::check_finalizable },
    Check { kind: RootSetKind::StringTable, run: tables::check_string_table },
    Check { kind: RootSetKind::ClassLoaders, run: tables::check_class_loaders },
    Check { kind: RootSetKind::JniGlobalRefs, run: tables::check_jni_global_refs },
    Check { kind: RootSetKind::JniWeakGlobalRefs, run: tables::check_jni_weak_global_refs },
    Check { kind: RootSetKind::TagTables, run: tables::check_tag_tables },
    Check { kind: RootSetKind::MonitorTable, run: tables::check_monitor_table },
    Check { kind: RootSetKind::VmClassSlots, run: tables::check_vm_class_slots },
    Check { kind: RootSetKind::VmThreads, run: threads::check_vm_threads },
    Check { kind: RootSetKind::ThreadStacks, run: threads::check_thread_stacks },
];

/// Instantiate exactly the variants selected by `scan`, in registry order.
pub fn generate_check_list(scan: ScanFlags) -> Vec<Check> {
    REGISTRY
        .iter()
        .filter(|check| scan.contains(check.kind.scan_flag()))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_registered_once() {
        let all = generate_check_list(ScanFlags::all());
        assert_eq!(all.len(), 15);
        let flags = all
            .iter()
            .fold(ScanFlags::empty(), |acc, check| acc | check.kind.scan_flag());
        assert_eq!(flags, ScanFlags::all());
    }

    #[test]
    fn test_ownable_synchronizer_before_object_heap() {
        let list = generate_check_list(ScanFlags::OBJECT_HEAP | ScanFlags::OWNABLE_SYNCHRONIZER);
        let kinds: Vec<_> = list.iter().map(|check| check.kind).collect();
        assert_eq!(
            kinds,
            vec![RootSetKind::OwnableSynchronizer, RootSetKind::ObjectHeap]
        );
    }

    #[test]
    fn test_subset() {
        let list = generate_check_list(ScanFlags::THREAD_STACKS | ScanFlags::STRING_TABLE);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].kind, RootSetKind::StringTable);
        assert_eq!(list[1].kind, RootSetKind::ThreadStacks);
    }
}
