//! Slot adapters: bind a root-set container to the generic checks.

use crate::address::Address;
use crate::error::{EntityKind, ErrorKind};
use crate::options::MiscFlags;
use crate::target::{ClassFlags, Generation, ObjectFlags, RootSlot, StackSlot, Target, ThreadInfo, ThreadSlot, ThreadSlotKind};

use super::{CheckEngine, Site, SlotOutcome};

/// Low bit marking a remembered-set entry queued for removal.
pub const DEFERRED_REMOVE_TAG: u64 = 1;

const ABSTRACT_OWNABLE_SYNCHRONIZER: &str = "java/util/concurrent/locks/AbstractOwnableSynchronizer";

impl CheckEngine {
    /// Slot of a thread structure.
    pub fn verify_slot_vm_thread(&mut self, target: &dyn Target, thread: &ThreadInfo, slot: &ThreadSlot) -> SlotOutcome {
        match self.verify_object_indirect(target, slot.value) {
            Ok(()) => SlotOutcome::Ok,
            // Monitor records may name objects allocated on the stack.
            Err(ErrorKind::StackObject) if slot.kind == ThreadSlotKind::MonitorRecord => SlotOutcome::Ok,
            Err(kind) => {
                self.raise(
                    target,
                    Site::new(thread.address, EntityKind::Thread).slot(slot.address),
                    kind,
                );
                SlotOutcome::Recoverable
            }
        }
    }

    /// Reference slot found on a thread's stack.
    pub fn verify_slot_stack(&mut self, target: &dyn Target, thread: &ThreadInfo, slot: &StackSlot) -> SlotOutcome {
        let result = match self.verify_object_indirect(target, slot.value) {
            Err(ErrorKind::StackObject) => self.verify_stack_object(target, slot.value),
            other => other,
        };
        match result {
            Ok(()) => SlotOutcome::Ok,
            Err(kind) => {
                self.raise(
                    target,
                    Site::new(thread.address, EntityKind::Thread)
                        .slot(slot.address)
                        .stack_location(&slot.frame),
                    kind,
                );
                SlotOutcome::Recoverable
            }
        }
    }

    /// Slot of a table or pool.
    pub fn verify_slot_pool(&mut self, target: &dyn Target, slot: &RootSlot) -> SlotOutcome {
        match self.verify_object_indirect(target, slot.value) {
            Ok(()) => SlotOutcome::Ok,
            Err(kind) => {
                self.raise(target, Site::new(slot.owner, EntityKind::Other).slot(slot.address), kind);
                SlotOutcome::Recoverable
            }
        }
    }

    /// Well-known class slot held by the VM.
    pub fn verify_slot_class(&mut self, target: &dyn Target, slot: &RootSlot) -> SlotOutcome {
        if slot.value.is_null() {
            return SlotOutcome::Ok;
        }
        match self.verify_class_pointer(target, slot.value, false) {
            Ok(()) => SlotOutcome::Ok,
            Err(kind) => {
                self.raise(target, Site::new(slot.owner, EntityKind::Other).slot(slot.address), kind);
                SlotOutcome::Recoverable
            }
        }
    }

    /// Remembered-set bucket entry: must be an old, remembered object.
    pub fn verify_slot_remembered_set(&mut self, target: &dyn Target, slot: &RootSlot) -> SlotOutcome {
        let mut object = slot.value;
        if self.context.misc.contains(MiscFlags::MIDSCAVENGE) {
            object = object.untagged(DEFERRED_REMOVE_TAG);
        }
        let site = Site::new(slot.owner, EntityKind::RememberedSetBucket).slot(slot.address);

        if let Err(kind) = self.verify_object_indirect(target, object) {
            self.raise(target, site, kind);
            return SlotOutcome::Recoverable;
        }
        if object.is_null() {
            return SlotOutcome::Ok;
        }

        let region = match self.find_region(target, object) {
            Ok(Some(region)) => region,
            Ok(None) => {
                self.raise(target, site, ErrorKind::NotFound);
                return SlotOutcome::Recoverable;
            }
            Err(kind) => {
                self.raise(target, site, kind);
                return SlotOutcome::Recoverable;
            }
        };
        if region.generation == Generation::New {
            self.raise(target, site, ErrorKind::RememberedSetWrongSegment);
            return SlotOutcome::Recoverable;
        }

        let flags = match target.object_header(object) {
            Ok(header) => header.flags,
            Err(_) => {
                self.raise(target, site, ErrorKind::CorruptData);
                return SlotOutcome::Recoverable;
            }
        };
        if !(flags.contains(ObjectFlags::OLD) && flags.contains(ObjectFlags::REMEMBERED)) {
            let error = self.raise(target, site, ErrorKind::RememberedSetFlags);
            self.reporter.report_object_header(&error, object, target);
            return SlotOutcome::Recoverable;
        }
        SlotOutcome::Ok
    }

    /// Node of an unfinalized list; `holder` is the list head or the
    /// previous node whose link produced `object`.
    pub fn verify_slot_unfinalized(&mut self, target: &dyn Target, holder: Address, object: Address) -> SlotOutcome {
        self.verify_list_node(target, holder, object, EntityKind::UnfinalizedList)
    }

    /// Node of a finalizable list.
    pub fn verify_slot_finalizable(&mut self, target: &dyn Target, holder: Address, object: Address) -> SlotOutcome {
        self.verify_list_node(target, holder, object, EntityKind::FinalizableList)
    }

    fn verify_list_node(
        &mut self,
        target: &dyn Target,
        holder: Address,
        object: Address,
        entity_kind: EntityKind,
    ) -> SlotOutcome {
        match self.verify_object_indirect(target, object) {
            Ok(()) => SlotOutcome::Ok,
            Err(kind) => {
                self.raise(target, Site::new(holder, entity_kind).slot(object), kind);
                SlotOutcome::Recoverable
            }
        }
    }

    /// Node of an ownable synchronizer list. Counts every member.
    pub fn verify_slot_ownable_synchronizer(
        &mut self,
        target: &dyn Target,
        holder: Address,
        object: Address,
    ) -> SlotOutcome {
        if let Some(count) = self.ownable_synchronizers_on_list.as_mut() {
            *count += 1;
        }
        let site = Site::new(holder, EntityKind::OwnableSynchronizerList).slot(object);

        if let Err(kind) = self.verify_object_indirect(target, object) {
            self.raise(target, site, kind);
            return SlotOutcome::Recoverable;
        }
        match self.ownable_synchronizer_class_error(target, object) {
            Ok(None) => SlotOutcome::Ok,
            Ok(Some(kind)) | Err(kind) => {
                self.raise(target, site, kind);
                SlotOutcome::Recoverable
            }
        }
    }

    fn ownable_synchronizer_class_error(
        &self,
        target: &dyn Target,
        object: Address,
    ) -> Result<Option<ErrorKind>, ErrorKind> {
        let class = target.object_header(object)?.class;
        let header = target.class_header(class)?;
        if !header.flags.contains(ClassFlags::OWNABLE_SYNCHRONIZER) {
            return Ok(Some(ErrorKind::InvalidFlags));
        }
        if let Some(base) = target.find_class(ABSTRACT_OWNABLE_SYNCHRONIZER, header.loader)? {
            if !target.is_instance_of(class, base)? {
                return Ok(Some(ErrorKind::OwnableSynchronizerInvalidClass));
            }
        }
        Ok(None)
    }
}
