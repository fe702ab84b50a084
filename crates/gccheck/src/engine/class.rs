use tracing::trace;

use crate::address::Address;
use crate::error::ErrorKind;
use crate::options::CheckFlags;
use crate::target::{CLASS_EYECATCHER, ClassFlags, ClassSegment, ObjectFlags, Target};

use super::{CheckEngine, HeapElement, Site};

/// Class headers carry metadata in their low address bits.
pub const CLASS_ALIGNMENT_MASK: u64 = 0xFF;

const JAVA_LANG_CLASS: &str = "java/lang/Class";

impl CheckEngine {
    /// Verify a class pointer, memoized per cycle and per undead policy.
    pub fn verify_class_pointer(
        &mut self,
        target: &dyn Target,
        class: Address,
        allow_undead: bool,
    ) -> Result<(), ErrorKind> {
        if self.cache.has_class(class, allow_undead) {
            return Ok(());
        }
        if class.is_null() {
            return Err(ErrorKind::NullClassPointer);
        }
        if !class.is_masked_clear(CLASS_ALIGNMENT_MASK) {
            return Err(ErrorKind::ClassPointerUnaligned);
        }

        let Some(segment) = target.find_class_segment(class)? else {
            for thread in target.threads() {
                if thread?.stack_contains(class) {
                    return Err(ErrorKind::ClassPointerOnStack);
                }
            }
            return Err(ErrorKind::ClassNotFound);
        };
        if segment.undead && !allow_undead {
            return Err(ErrorKind::ClassIsUndead);
        }

        self.verify_class_header(target, class)?;
        self.verify_class_range(class, &segment)?;

        self.cache.record_class(class, allow_undead);
        Ok(())
    }

    /// Eyecatcher and unload state.
    fn verify_class_header(&self, target: &dyn Target, class: Address) -> Result<(), ErrorKind> {
        let header = target.class_header(class)?;
        if header.eyecatcher != CLASS_EYECATCHER {
            return Err(ErrorKind::ClassHeaderInvalid);
        }
        if header.flags.contains(ClassFlags::DYING) {
            return Err(ErrorKind::ClassIsUnloaded);
        }
        Ok(())
    }

    fn verify_class_range(&self, class: Address, segment: &ClassSegment) -> Result<(), ErrorKind> {
        if self.context.check.contains(CheckFlags::RANGE)
            && class.bytes_until(segment.alloc) < self.config.class_header_size
        {
            return Err(ErrorKind::ClassInvalidRange);
        }
        Ok(())
    }

    /// Structural checks of a class met by the class heap walk.
    pub fn verify_class(
        &self,
        target: &dyn Target,
        class: Address,
        segment: &ClassSegment,
    ) -> Result<(), ErrorKind> {
        if class.is_null() {
            return Ok(());
        }
        if !class.is_masked_clear(CLASS_ALIGNMENT_MASK) {
            return Err(ErrorKind::ClassPointerUnaligned);
        }
        self.verify_class_header(target, class)?;
        self.verify_class_range(class, segment)
    }

    /// The `java.lang.Class` instance must be a valid object of that class.
    fn verify_class_object(&mut self, target: &dyn Target, class_object: Address) -> Result<(), ErrorKind> {
        if class_object.is_null() {
            return Ok(());
        }
        self.verify_object_indirect(target, class_object)?;
        let instance_class = target.object_header(class_object)?.class;
        if target.class_name(instance_class)? != JAVA_LANG_CLASS {
            return Err(ErrorKind::ClassObjectNotJavaLangClass);
        }
        Ok(())
    }

    /// Full per-class pass: the class itself, its reference slots, its
    /// statics, hot-swap state and its class-pointer slots.
    ///
    /// Stops at the first slot failure; the class heap walk moves on to
    /// the next class either way.
    pub fn verify_class_heap_entry(&mut self, target: &dyn Target, class: Address, segment: &ClassSegment) {
        if let Err(kind) = self.verify_class(target, class, segment) {
            self.raise(target, Site::class(class, "Class "), kind);
        }

        let header = match target.class_header(class) {
            Ok(header) => header,
            Err(_) => {
                self.raise(target, Site::class(class, "Class "), ErrorKind::CorruptData);
                return;
            }
        };

        if let Err(kind) = self.verify_class_object(target, header.class_object) {
            self.raise(target, Site::class(class, "Class "), kind);
            return;
        }

        let slots = match target.class_reference_slots(class) {
            Ok(slots) => slots,
            Err(_) => {
                self.raise(target, Site::class(class, "Class "), ErrorKind::CorruptData);
                return;
            }
        };
        for slot in &slots {
            if let Err(kind) = self.verify_object_indirect(target, slot.value) {
                self.raise(
                    target,
                    Site::class(class, slot.kind.element_name()).slot(slot.address),
                    kind,
                );
                return;
            }
            if self.config.generational && self.config.standard_gc && !slot.value.is_null() {
                match self.class_slot_needs_remembering(target, slot.value, header.class_object) {
                    Ok(false) => {}
                    Ok(true) => {
                        self.raise(
                            target,
                            Site::class(class, "Class ").slot(slot.address),
                            ErrorKind::RememberedSetOldObject,
                        );
                        return;
                    }
                    Err(kind) => {
                        self.raise(target, Site::class(class, "Class "), kind);
                        return;
                    }
                }
            }
        }

        if self.verify_class_statics(target, class).is_err() {
            return;
        }

        if !header.replaced_class.is_null() {
            let replaced_flags = match target.class_header(header.replaced_class) {
                Ok(replaced) => replaced.flags,
                Err(_) => {
                    self.raise(target, Site::class(class, "Class "), ErrorKind::CorruptData);
                    return;
                }
            };
            if !replaced_flags.contains(ClassFlags::HOT_SWAPPED_OUT) {
                self.raise(
                    target,
                    Site::class(class, "Class "),
                    ErrorKind::ReplacedClassHasNoHotswapFlag,
                );
                return;
            }
        }

        let class_slots = match target.class_pointer_slots(class) {
            Ok(slots) => slots,
            Err(_) => {
                self.raise(target, Site::class(class, "Class "), ErrorKind::CorruptData);
                return;
            }
        };
        for slot in &class_slots {
            if let Err(kind) = self.verify_class_pointer(target, slot.value, false) {
                self.raise(
                    target,
                    Site::class(class, slot.kind.element_name()).slot(slot.address),
                    kind,
                );
                return;
            }
        }

        self.push_previous(HeapElement::Class(class));
    }

    /// A class slot referencing a non-old object needs the class object
    /// to be remembered.
    fn class_slot_needs_remembering(
        &self,
        target: &dyn Target,
        value: Address,
        class_object: Address,
    ) -> Result<bool, ErrorKind> {
        if target.object_header(value)?.flags.contains(ObjectFlags::OLD) || class_object.is_null() {
            return Ok(false);
        }
        let remembered = target
            .object_header(class_object)?
            .flags
            .contains(ObjectFlags::REMEMBERED);
        Ok(!remembered)
    }

    /// Cross-check declared reference statics against the statics window.
    ///
    /// Every failure is reported; the result carries the last one.
    pub fn verify_class_statics(&mut self, target: &dyn Target, class: Address) -> Result<(), ErrorKind> {
        match self.check_statics(target, class) {
            Ok(result) => result,
            Err(_) => {
                self.raise(target, Site::class(class, "Class "), ErrorKind::CorruptData);
                Err(ErrorKind::CorruptData)
            }
        }
    }

    /// Outer `Err` is a read fault; inner result is what was reported.
    fn check_statics(
        &mut self,
        target: &dyn Target,
        class: Address,
    ) -> Result<Result<(), ErrorKind>, ErrorKind> {
        let header = target.class_header(class)?;
        let mut result = Ok(());
        let mut validate = true;

        if header.flags.contains(ClassFlags::HOT_SWAPPED_OUT) {
            if header.flags.contains(ClassFlags::ARRAY) {
                self.raise(target, Site::class(class, "Class "), ErrorKind::ClassHotSwappedForArray);
                result = Err(ErrorKind::ClassHotSwappedForArray);
                validate = false;
            }
            if header.statics.is_null() {
                if !self.config.extended_hot_swap && header.object_static_count != 0 && validate {
                    self.raise(target, Site::class(class, "Class "), ErrorKind::ClassHotSwapInconsistent);
                    result = Err(ErrorKind::ClassHotSwapInconsistent);
                }
                validate = false;
            }
            if header.flags.contains(ClassFlags::REUSED_STATICS) {
                validate = false;
            }
        }

        if !validate {
            return Ok(result);
        }

        let (start, end) = if header.object_static_count != 0 {
            (header.statics, header.statics.slot(header.object_static_count))
        } else {
            (Address::NULL, Address::NULL)
        };

        let mut references = 0u64;
        for field in target.static_fields(class)? {
            if !field.is_reference() {
                continue;
            }
            references += 1;

            if !(field.address >= start && field.address < end) {
                let kind = ErrorKind::ClassStaticsReferenceNotInScanningRange;
                self.raise(target, Site::class(class, "Class ").slot(field.address), kind);
                result = Err(kind);
            }

            let value = Address::new(target.read_word(field.address)?);
            if value.is_null() {
                continue;
            }
            // Unresolvable declared types cannot be checked.
            let Some(declared) = target.find_class(field.declared_class_name(), header.loader)? else {
                trace!(target: "gccheck", field = %field.name, "static field type not loaded");
                continue;
            };
            let instance_class = target.object_header(value)?.class;
            if !target.is_instance_of(instance_class, declared)? {
                let kind = ErrorKind::ClassStaticsFieldPointsWrongObject;
                self.raise(target, Site::class(class, "Class ").slot(field.address), kind);
                result = Err(kind);
            }
        }

        if references != header.object_static_count {
            let kind = ErrorKind::ClassStaticsWrongNumberOfReferences;
            self.raise(target, Site::class(class, "Class "), kind);
            result = Err(kind);
        }

        Ok(result)
    }
}
