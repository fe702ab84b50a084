use crate::address::Address;
use crate::error::ErrorKind;
use crate::options::{CheckFlags, MiscFlags};
use crate::target::{
    CLASS_EYECATCHER, ClassFlags, ClassShape, Generation, HeapEntry, HoleInfo, ObjectFlags, ObjectHeader,
    ReferenceSlot, RegionDescriptor, Target,
};

use super::{CheckEngine, HeapElement, Site, SlotOutcome};

/// Stack-allocated objects only need pointer alignment.
pub const ON_STACK_ALIGNMENT_MASK: u64 = 7;
/// Element alignment required for arrays of doubles.
const DOUBLE_ALIGNMENT: u64 = 8;

/// A pointer that resolved to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPointer {
    /// Object address, after following a forwarding pointer
    pub address: Address,
    /// Region holding it
    pub region: RegionDescriptor,
}

fn element_name(header: &ObjectHeader) -> &'static str {
    if header.flags.contains(ObjectFlags::INDEXABLE) {
        "IObject "
    } else {
        "Object "
    }
}

impl CheckEngine {
    /// Resolve `pointer` to an object in an object region.
    ///
    /// Null resolves to `None`. A pointer outside every region is
    /// classified as [`ErrorKind::StackObject`] when it lies on a thread
    /// stack, [`ErrorKind::ObjectSlotPointsToClass`] when it lands on a
    /// class header, and [`ErrorKind::NotFound`] otherwise.
    pub fn verify_object_pointer(
        &mut self,
        target: &dyn Target,
        pointer: Address,
    ) -> Result<Option<ResolvedPointer>, ErrorKind> {
        if pointer.is_null() {
            return Ok(None);
        }

        let Some(mut region) = self.find_region(target, pointer)? else {
            for thread in target.threads() {
                if thread?.stack_contains(pointer) {
                    return Err(ErrorKind::StackObject);
                }
            }
            if target.read_word(pointer).ok() == Some(CLASS_EYECATCHER) {
                return Err(ErrorKind::ObjectSlotPointsToClass);
            }
            return Err(ErrorKind::NotFound);
        };

        if !region.holds_objects() {
            return Err(ErrorKind::NotInObjectRegion);
        }
        if !pointer.is_aligned(region.object_alignment) {
            return Err(ErrorKind::Unaligned);
        }

        let mut address = pointer;
        if self.may_be_forwarded(&region) {
            if let Some(forwarded) = target.forwarded_address(pointer)? {
                if self.verbose() {
                    self.reporter.report_forwarded_object(pointer, forwarded);
                }
                region = self
                    .find_region(target, forwarded)?
                    .ok_or(ErrorKind::NotFound)?;
                if !region.holds_objects() {
                    return Err(ErrorKind::NotInObjectRegion);
                }
                if !forwarded.is_aligned(region.object_alignment) {
                    return Err(ErrorKind::Unaligned);
                }
                address = forwarded;
            }
        }

        self.verify_double_array_alignment(target, address)?;

        Ok(Some(ResolvedPointer { address, region }))
    }

    /// Objects in `region` can carry a forwarding pointer this cycle.
    fn may_be_forwarded(&self, region: &RegionDescriptor) -> bool {
        self.context.misc.contains(MiscFlags::MIDSCAVENGE)
            && (region.generation == Generation::New || !self.config.standard_gc)
    }

    /// First and last element of a double array must be 8-byte aligned.
    fn verify_double_array_alignment(
        &self,
        target: &dyn Target,
        object: Address,
    ) -> Result<(), ErrorKind> {
        // Header and class are verified separately; anything unreadable is
        // not a double array as far as this check is concerned.
        let Ok(header) = target.object_header(object) else {
            return Ok(());
        };
        if !header.flags.contains(ObjectFlags::INDEXABLE) {
            return Ok(());
        }
        let is_doubles = target
            .class_header(header.class)
            .map(|class| class.shape == ClassShape::Doubles)
            .unwrap_or(false);
        if !is_doubles {
            return Ok(());
        }
        if let Ok(Some(array)) = target.array_info(object) {
            if array.length != 0 {
                let first = array.element(0);
                let last = array.element(array.length - 1);
                if !first.is_aligned(DOUBLE_ALIGNMENT) || !last.is_aligned(DOUBLE_ALIGNMENT) {
                    return Err(ErrorKind::DoubleArrayUnaligned);
                }
            }
        }
        Ok(())
    }

    /// Verify the object at `object` in `region` according to `flags`.
    pub fn verify_object(
        &mut self,
        target: &dyn Target,
        object: Address,
        region: &RegionDescriptor,
        flags: CheckFlags,
    ) -> Result<(), ErrorKind> {
        if object.is_null() {
            return Ok(());
        }
        if !region.holds_objects() {
            return Err(ErrorKind::NotInObjectRegion);
        }
        if !object.is_aligned(region.object_alignment) {
            return Err(ErrorKind::Unaligned);
        }

        let header = target.object_header(object)?;
        let indexable = header.flags.contains(ObjectFlags::INDEXABLE);

        if flags.contains(CheckFlags::CLASS_SLOT) {
            // Class unloading races are expected while scanning live objects.
            self.verify_class_pointer(target, header.class, true)?;
        }

        if self.config.virtual_large_object_heap && indexable {
            if let Some(array) = target.array_info(object)? {
                if !target.is_valid_data_address(object, array.data_address)? {
                    return Err(ErrorKind::InvalidIndexableDataAddress);
                }
            }
        }

        if flags.contains(CheckFlags::RANGE) {
            let delta = object.bytes_until(region.end());
            if delta < self.config.object_header_size {
                return Err(ErrorKind::InvalidRange);
            }
            if indexable && delta < self.config.indexable_header_size {
                return Err(ErrorKind::InvalidRange);
            }
            if delta < target.object_size(object)? {
                return Err(ErrorKind::InvalidRange);
            }
        }

        if flags.contains(CheckFlags::FLAGS) {
            let shape = target.class_header(header.class)?.shape;
            if indexable != shape.is_indexable() {
                return Err(ErrorKind::InvalidFlags);
            }
            if self.config.standard_gc {
                let old = header.flags.contains(ObjectFlags::OLD);
                match region.generation {
                    Generation::Old if !old => return Err(ErrorKind::OldSegmentInvalidFlags),
                    Generation::New if old => return Err(ErrorKind::NewSegmentInvalidFlags),
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Full check of an object reached through a pointer, memoized per cycle.
    pub fn verify_object_indirect(
        &mut self,
        target: &dyn Target,
        pointer: Address,
    ) -> Result<(), ErrorKind> {
        if pointer.is_null() || self.cache.has_object(pointer) {
            return Ok(());
        }
        if let Some(resolved) = self.verify_object_pointer(target, pointer)? {
            let flags = self.context.check;
            self.verify_object(target, resolved.address, &resolved.region, flags)?;
        }
        self.cache.record_object(pointer);
        Ok(())
    }

    /// Check an object allocated on a thread stack.
    pub fn verify_stack_object(
        &mut self,
        target: &dyn Target,
        object: Address,
    ) -> Result<(), ErrorKind> {
        if object.is_null() {
            return Ok(());
        }
        if !object.is_masked_clear(ON_STACK_ALIGNMENT_MASK) {
            return Err(ErrorKind::Unaligned);
        }
        let header = target.object_header(object)?;
        if self.context.check.contains(CheckFlags::CLASS_SLOT) {
            self.verify_class_pointer(target, header.class, false)?;
        }
        if self.context.check.contains(CheckFlags::FLAGS) {
            let shape = target.class_header(header.class)?.shape;
            if header.flags.contains(ObjectFlags::INDEXABLE) != shape.is_indexable() {
                return Err(ErrorKind::InvalidFlags);
            }
        }
        Ok(())
    }

    /// Validate a dead span met by the heap walk.
    pub fn verify_hole(
        &self,
        target: &dyn Target,
        hole: Address,
        info: &HoleInfo,
        region: &RegionDescriptor,
    ) -> Result<(), ErrorKind> {
        if info.single_slot {
            return Ok(());
        }
        if info.size == 0 {
            return Err(ErrorKind::DeadObjectSize);
        }
        let alignment = region.object_alignment.max(1);
        if info.size % alignment != 0 {
            return Err(ErrorKind::DeadObjectSizeNotAligned);
        }
        if hole.bytes_until(region.end()) < info.size {
            return Err(ErrorKind::InvalidRange);
        }
        if !info.next.is_null() {
            if !matches!(target.heap_entry(info.next), Ok(HeapEntry::Hole(_))) {
                return Err(ErrorKind::DeadObjectNextIsNotHole);
            }
            if !region.contains(info.next) {
                return Err(ErrorKind::DeadObjectNextIsNotInRegion);
            }
            if info.next > hole && info.next < hole + info.size {
                return Err(ErrorKind::DeadObjectNextIsPointedInside);
            }
        }
        Ok(())
    }

    /// Verify one entry met while walking the object heap.
    pub fn check_object_heap_entry(
        &mut self,
        target: &dyn Target,
        address: Address,
        entry: &HeapEntry,
        region: &RegionDescriptor,
    ) -> SlotOutcome {
        match entry {
            HeapEntry::Hole(info) => self.check_heap_hole(target, address, info, region),
            HeapEntry::Object => self.check_heap_object(target, address, region),
        }
    }

    fn check_heap_hole(
        &mut self,
        target: &dyn Target,
        hole: Address,
        info: &HoleInfo,
        region: &RegionDescriptor,
    ) -> SlotOutcome {
        let Err(kind) = self.verify_hole(target, hole, info, region) else {
            return SlotOutcome::Ok;
        };
        let site = Site::object(hole, "Object ");
        if kind.is_recoverable_in_heap_walk() {
            self.raise(target, site, kind);
            return SlotOutcome::Recoverable;
        }
        self.raise_heap_walk_error(target, site, kind);
        SlotOutcome::Unrecoverable
    }

    fn check_heap_object(
        &mut self,
        target: &dyn Target,
        object: Address,
        region: &RegionDescriptor,
    ) -> SlotOutcome {
        let header = match target.object_header(object) {
            Ok(header) => header,
            Err(_) => {
                self.raise(target, Site::object(object, "Object "), ErrorKind::CorruptData);
                return SlotOutcome::Unrecoverable;
            }
        };
        let element = element_name(&header);

        let flags = self.context.check;
        if let Err(kind) = self.verify_object(target, object, region, flags) {
            if kind.is_recoverable_in_heap_walk() {
                self.raise(target, Site::object(object, element), kind);
                return SlotOutcome::Recoverable;
            }
            self.raise_heap_walk_error(target, Site::object(object, element), kind);
            return SlotOutcome::Unrecoverable;
        }

        let mut outcome = SlotOutcome::Ok;
        let class_ok = self.verify_class_pointer(target, header.class, true).is_ok();
        if class_ok {
            let slots = match target.object_slots(object) {
                Ok(slots) => slots,
                Err(_) => {
                    self.raise(target, Site::object(object, element), ErrorKind::CorruptData);
                    return SlotOutcome::Unrecoverable;
                }
            };
            for slot in slots.iter().filter(|slot| !slot.value.is_null()) {
                outcome = self.verify_slot_object_heap(target, slot, object, &header, region);
                if outcome != SlotOutcome::Ok {
                    break;
                }
            }
        }

        if class_ok && self.ownable_synchronizers_on_heap.is_some() {
            if let Err(kind) = self.count_ownable_synchronizer(target, object, header.class) {
                self.raise(target, Site::object(object, element), kind);
                return SlotOutcome::Unrecoverable;
            }
        }

        if outcome == SlotOutcome::Ok {
            // A forwarded object is only known good once its copy resolves,
            // so references to it must still go through the forwarding path.
            let forwarded = self.may_be_forwarded(region)
                && matches!(target.forwarded_address(object), Ok(Some(_)));
            if !forwarded {
                self.cache.record_object(object);
            }
            self.push_previous(HeapElement::Object(object));
        }
        outcome
    }

    /// Count a heap ownable synchronizer if it is on its list.
    fn count_ownable_synchronizer(
        &mut self,
        target: &dyn Target,
        object: Address,
        class: Address,
    ) -> Result<(), ErrorKind> {
        let class_header = target.class_header(class)?;
        if class_header.shape != ClassShape::Mixed
            || !class_header
                .flags
                .contains(ClassFlags::OWNABLE_SYNCHRONIZER)
        {
            return Ok(());
        }
        if target.is_in_ownable_synchronizer_list(object)? {
            if let Some(count) = self.ownable_synchronizers_on_heap.as_mut() {
                *count += 1;
            }
        } else {
            self.raise(
                target,
                Site::object(object, "Object "),
                ErrorKind::OwnableSynchronizerNotAttached,
            );
        }
        Ok(())
    }

    /// Verify one reference slot of a heap object.
    pub fn verify_slot_object_heap(
        &mut self,
        target: &dyn Target,
        slot: &ReferenceSlot,
        base: Address,
        base_header: &ObjectHeader,
        region: &RegionDescriptor,
    ) -> SlotOutcome {
        let pointer = slot.value;
        if pointer.is_null() {
            return SlotOutcome::Ok;
        }
        let element = element_name(base_header);
        let result = self.verify_object_indirect(target, pointer);

        // Dark matter: only a few errors point at real corruption.
        if self.context.misc.contains(MiscFlags::DARKMATTER) {
            if let Err(kind) = result {
                if !kind.survives_dark_matter() {
                    return SlotOutcome::Ok;
                }
            }
        }

        if let Err(kind) = result {
            self.raise(target, Site::object(base, element).slot(slot.address), kind);
            return SlotOutcome::Ok;
        }

        if !self.config.generational {
            return SlotOutcome::Ok;
        }

        match self.verify_generational_slot(target, slot, base_header, region) {
            Ok(None) => SlotOutcome::Ok,
            Ok(Some(kind)) => {
                self.raise(target, Site::object(base, element).slot(slot.address), kind);
                SlotOutcome::Ok
            }
            Err(kind) => {
                self.raise(target, Site::object(base, element), kind);
                SlotOutcome::Unrecoverable
            }
        }
    }

    /// Remembered-bit and card invariants of an old object's slot.
    ///
    /// `Ok(Some(kind))` is an invariant failure for the slot, `Err` a read
    /// failure that ends the walk.
    fn verify_generational_slot(
        &mut self,
        target: &dyn Target,
        slot: &ReferenceSlot,
        base_header: &ObjectHeader,
        region: &RegionDescriptor,
    ) -> Result<Option<ErrorKind>, ErrorKind> {
        let Some(target_region) = self.find_region(target, slot.value)? else {
            return Ok(Some(ErrorKind::NotFound));
        };
        if region.generation != Generation::Old {
            return Ok(None);
        }
        let remembered = base_header.flags.contains(ObjectFlags::REMEMBERED);

        if target_region.generation == Generation::New {
            if !remembered {
                return Ok(Some(ErrorKind::NewPointerNotRemembered));
            }
            if target.card_dirty(slot.address)? == Some(false) {
                return Ok(Some(ErrorKind::NewPointerCardNotDirty));
            }
        }

        let target_old = target.object_header(slot.value)?.flags.contains(ObjectFlags::OLD);
        if !target_old && !remembered {
            return Ok(Some(ErrorKind::RememberedSetOldObject));
        }
        Ok(None)
    }
}
