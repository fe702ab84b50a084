//! Capability interfaces onto the runtime being verified.
//!
//! The verifier never owns the structures it checks. Everything it knows
//! about the target comes through these traits, and every query can fail
//! with a [`ReadFault`] because the data may already be corrupt. A live
//! runtime implements them over its own memory; [`crate::image::HeapImage`]
//! implements them over a post-mortem dump.

use bitflags::bitflags;

use crate::address::Address;
pub use crate::error::ReadFault;

/// Lazy, one-shot enumeration of a root set.
pub type Walk<'a, T> = Box<dyn Iterator<Item = Result<T, ReadFault>> + 'a>;

/// Eyecatcher stored in the first word of every class header.
pub const CLASS_EYECATCHER: u64 = 0x9966_9966;

/// Generation a heap region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    /// Young space, collected by the scavenger
    New,
    /// Tenured space
    Old,
    /// Non-generational heap
    #[default]
    Undifferentiated,
}

/// A heap region as reported by the region oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    /// Opaque region identifier
    pub id: u64,
    /// First address of the region
    pub start: Address,
    /// Size in bytes
    pub size: u64,
    /// Required object alignment; 0 means the region holds no objects
    pub object_alignment: u64,
    /// Generation kind
    pub generation: Generation,
}

impl RegionDescriptor {
    /// One past the last address
    pub fn end(&self) -> Address {
        self.start + self.size
    }

    /// `start <= address < end`
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end()
    }

    /// Does this region hold objects at all
    pub fn holds_objects(&self) -> bool {
        self.object_alignment != 0
    }
}

/// A class memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassSegment {
    /// First address of the segment
    pub start: Address,
    /// Live allocation boundary
    pub alloc: Address,
    /// Kept alive past unload
    pub undead: bool,
}

impl ClassSegment {
    /// `start <= address < alloc`
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.alloc
    }
}

bitflags! {
    /// Object header flag bits the verifier cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
    pub struct ObjectFlags: u32 {
        /// Object has been tenured
        const OLD = 1 << 0;
        /// Object is in the remembered set
        const REMEMBERED = 1 << 1;
        /// Header says this is an array
        const INDEXABLE = 1 << 2;
    }
}

bitflags! {
    /// Class flag bits the verifier cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
    pub struct ClassFlags: u32 {
        /// Class is being unloaded
        const DYING = 1 << 0;
        /// Class was replaced by a hot swap
        const HOT_SWAPPED_OUT = 1 << 1;
        /// Instances are ownable synchronizers
        const OWNABLE_SYNCHRONIZER = 1 << 2;
        /// Array class
        const ARRAY = 1 << 3;
        /// Statics were reused by the replacing class
        const REUSED_STATICS = 1 << 4;
    }
}

/// Instance layout of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassShape {
    /// Plain object with mixed fields
    #[default]
    Mixed,
    /// Array of references
    Pointers,
    /// Array of bytes / booleans
    Bytes,
    /// Array of 16 or 32-bit elements
    Words,
    /// Array of 64-bit integers
    Longs,
    /// Array of doubles
    Doubles,
}

impl ClassShape {
    /// Instances are arrays
    pub fn is_indexable(self) -> bool {
        !matches!(self, ClassShape::Mixed)
    }
}

/// Decoded object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Class pointer, flag bits stripped
    pub class: Address,
    /// Header flag bits
    pub flags: ObjectFlags,
}

/// What sits at a heap-walk position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapEntry {
    /// A live (or at least not freed) object
    Object,
    /// A dead span
    Hole(HoleInfo),
}

/// Dead span description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoleInfo {
    /// Recorded size in bytes
    pub size: u64,
    /// Next hole in the free list, or null
    pub next: Address,
    /// One-slot filler with no size or link
    pub single_slot: bool,
}

/// A reference slot inside an object or class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSlot {
    /// Where the slot lives
    pub address: Address,
    /// What it holds
    pub value: Address,
}

/// Array geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayInfo {
    /// Number of elements
    pub length: u64,
    /// Bytes per element
    pub element_size: u64,
    /// Address of element 0
    pub first_element: Address,
    /// Out-of-line data address, null when data is inline
    pub data_address: Address,
}

impl ArrayInfo {
    /// Address of element `index`
    pub fn element(&self, index: u64) -> Address {
        self.first_element + index.wrapping_mul(self.element_size)
    }
}

/// Intrusive object lists threaded through object fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Objects with pending finalizers
    Unfinalized,
    /// Objects ready for finalization
    Finalizable,
    /// Ownable synchronizers
    OwnableSynchronizer,
}

/// Decoded class header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassHeader {
    /// Must equal [`CLASS_EYECATCHER`]
    pub eyecatcher: u64,
    /// Class flags
    pub flags: ClassFlags,
    /// Instance shape
    pub shape: ClassShape,
    /// The `java.lang.Class` instance, or null
    pub class_object: Address,
    /// Class this one replaced in a hot swap, or null
    pub replaced_class: Address,
    /// Start of the statics window, or null
    pub statics: Address,
    /// Declared number of reference statics
    pub object_static_count: u64,
    /// Defining class loader
    pub loader: Address,
}

/// Which part of a class a reference slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassSlotKind {
    /// Static fields
    Statics,
    /// Constant pool
    ConstantPool,
    /// Other object slots (class object, loader object, ...)
    Slots,
    /// Call sites
    CallSite,
}

impl ClassSlotKind {
    /// Element name used in error reports
    pub fn element_name(self) -> &'static str {
        match self {
            ClassSlotKind::Statics => "static ",
            ClassSlotKind::ConstantPool => "constant ",
            ClassSlotKind::Slots => "slots ",
            ClassSlotKind::CallSite => "callsite ",
        }
    }
}

/// Which part of a class a class-pointer slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassPointerKind {
    /// Resolved class in the constant pool
    ConstantPool,
    /// Superclass chain
    Superclass,
    /// Implemented interfaces
    Interface,
    /// Array class of this class
    ArrayClass,
    /// Flattened class cache entries
    FlattenedClassCache,
}

impl ClassPointerKind {
    /// Element name used in error reports
    pub fn element_name(self) -> &'static str {
        match self {
            ClassPointerKind::ConstantPool => "constant ",
            ClassPointerKind::Superclass => "superclass ",
            ClassPointerKind::Interface => "interface ",
            ClassPointerKind::ArrayClass => "array class ",
            ClassPointerKind::FlattenedClassCache => "flattened class cache ",
        }
    }
}

/// A class-pointer slot inside a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassPointerSlot {
    /// Section of the class
    pub kind: ClassPointerKind,
    /// Where the slot lives
    pub address: Address,
    /// Class it points to
    pub value: Address,
}

/// A reference slot inside a class, tagged with its section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassReferenceSlot {
    /// Section of the class
    pub kind: ClassSlotKind,
    /// Where the slot lives
    pub address: Address,
    /// Object it points to
    pub value: Address,
}

/// A static field declared in the class's immutable field table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StaticField {
    /// Field name
    pub name: String,
    /// Type signature, e.g. `Ljava/lang/String;` or `[I`
    pub signature: String,
    /// Computed address of the field's storage
    pub address: Address,
}

impl StaticField {
    /// Object and array signatures hold references
    pub fn is_reference(&self) -> bool {
        self.signature.starts_with('L') || self.signature.starts_with('[')
    }

    /// Class name to resolve for an assignability check.
    ///
    /// `Lfoo/Bar;` becomes `foo/Bar`; array signatures are used as is.
    pub fn declared_class_name(&self) -> &str {
        match self.signature.strip_prefix('L') {
            Some(rest) => rest.strip_suffix(';').unwrap_or(rest),
            None => &self.signature,
        }
    }
}

/// A live thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Thread structure address
    pub address: Address,
    /// Lowest usable stack address
    pub stack_start: Address,
    /// One past the highest stack address
    pub stack_end: Address,
}

impl ThreadInfo {
    /// Does the thread's stack contain `address`
    pub fn stack_contains(&self, address: Address) -> bool {
        address >= self.stack_start && address < self.stack_end
    }
}

/// Which part of a thread structure a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadSlotKind {
    /// Saved registers and thread-local object fields
    Register,
    /// JNI local reference frames
    JniLocalReference,
    /// Owned monitor records; may point at stack-allocated objects
    MonitorRecord,
}

/// A slot inside a thread structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSlot {
    /// Section of the thread structure
    pub kind: ThreadSlotKind,
    /// Where the slot lives
    pub address: Address,
    /// Object it points to
    pub value: Address,
}

/// A reference slot found while walking a thread's stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSlot {
    /// Where the slot lives
    pub address: Address,
    /// Object it points to
    pub value: Address,
    /// Human description of the frame holding the slot
    pub frame: String,
}

/// A slot in a pool or table owned by some container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSlot {
    /// Container (class loader, pool, table)
    pub owner: Address,
    /// Where the slot lives
    pub address: Address,
    /// Object it points to
    pub value: Address,
}

/// Head of an intrusive object list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectList {
    /// List structure address
    pub address: Address,
    /// First object on the list, or null
    pub head: Address,
}

/// Static facts about the collector configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HeapConfiguration {
    /// A scavenger (generational collector) is active
    pub generational: bool,
    /// Standard (non-region) collector
    pub standard_gc: bool,
    /// Bytes in an object header
    pub object_header_size: u64,
    /// Bytes in a contiguous array header
    pub indexable_header_size: u64,
    /// Bytes in a class header
    pub class_header_size: u64,
    /// Large arrays keep their data out of line
    pub virtual_large_object_heap: bool,
    /// Extended hot-swap mode: replaced classes may drop their statics
    pub extended_hot_swap: bool,
}

impl Default for HeapConfiguration {
    fn default() -> Self {
        Self {
            generational: false,
            standard_gc: true,
            object_header_size: 16,
            indexable_header_size: 24,
            class_header_size: 64,
            virtual_large_object_heap: false,
            extended_hot_swap: false,
        }
    }
}

/// Raw memory access.
pub trait MemoryReader {
    /// Read one pointer-sized word
    fn read_word(&self, address: Address) -> Result<u64, ReadFault>;

    /// Read `count` consecutive words
    fn read_words(&self, address: Address, count: usize) -> Result<Vec<u64>, ReadFault> {
        (0..count as u64)
            .map(|index| self.read_word(address.slot(index)))
            .collect()
    }
}

/// Region and segment lookup.
pub trait RegionOracle {
    /// Heap region containing `address`
    fn find_region(&self, address: Address) -> Result<Option<RegionDescriptor>, ReadFault>;

    /// All heap regions that hold objects, in address order
    fn object_regions(&self) -> Walk<'_, RegionDescriptor>;

    /// Class segment containing `address`
    fn find_class_segment(&self, address: Address) -> Result<Option<ClassSegment>, ReadFault>;

    /// All class segments
    fn class_segments(&self) -> Walk<'_, ClassSegment>;
}

/// Object layout queries.
pub trait ObjectModel {
    /// What sits at a heap-walk position
    fn heap_entry(&self, address: Address) -> Result<HeapEntry, ReadFault>;

    /// Decoded header of the object at `address`
    fn object_header(&self, address: Address) -> Result<ObjectHeader, ReadFault>;

    /// Total size in bytes, header included
    fn object_size(&self, address: Address) -> Result<u64, ReadFault>;

    /// Every reference slot of the object
    fn object_slots(&self, address: Address) -> Result<Vec<ReferenceSlot>, ReadFault>;

    /// Forwarding target when the object has been copied mid-scavenge
    fn forwarded_address(&self, address: Address) -> Result<Option<Address>, ReadFault>;

    /// Geometry when the object is an array
    fn array_info(&self, address: Address) -> Result<Option<ArrayInfo>, ReadFault>;

    /// Large-object allocator's validity predicate for out-of-line data
    fn is_valid_data_address(&self, object: Address, data: Address) -> Result<bool, ReadFault>;

    /// Card state for `address`; `None` without a card table
    fn card_dirty(&self, address: Address) -> Result<Option<bool>, ReadFault>;

    /// Link field of `object` on list `kind`
    fn list_next(&self, object: Address, kind: ListKind) -> Result<Address, ReadFault>;

    /// Membership predicate for the ownable-synchronizer list
    fn is_in_ownable_synchronizer_list(&self, object: Address) -> Result<bool, ReadFault> {
        Ok(!self.list_next(object, ListKind::OwnableSynchronizer)?.is_null())
    }
}

/// Class metadata queries.
pub trait ClassModel {
    /// Decoded header of the class at `address`
    fn class_header(&self, address: Address) -> Result<ClassHeader, ReadFault>;

    /// Class name in internal form (`java/lang/String`)
    fn class_name(&self, address: Address) -> Result<String, ReadFault>;

    /// Object reference slots of the class
    fn class_reference_slots(&self, address: Address) -> Result<Vec<ClassReferenceSlot>, ReadFault>;

    /// Class pointer slots of the class
    fn class_pointer_slots(&self, address: Address) -> Result<Vec<ClassPointerSlot>, ReadFault>;

    /// Static fields from the immutable field table
    fn static_fields(&self, address: Address) -> Result<Vec<StaticField>, ReadFault>;

    /// Look up an already-loaded class by name in `loader`
    fn find_class(&self, name: &str, loader: Address) -> Result<Option<Address>, ReadFault>;

    /// Is `class` assignable to `target`
    fn is_instance_of(&self, class: Address, target: Address) -> Result<bool, ReadFault>;

    /// Classes allocated in `segment`, in address order
    fn classes_in_segment(&self, segment: &ClassSegment) -> Walk<'_, Address>;
}

/// Thread enumeration.
pub trait ThreadModel {
    /// Every live thread
    fn threads(&self) -> Walk<'_, ThreadInfo>;

    /// Slots of the thread structure
    fn thread_slots(&self, thread: &ThreadInfo) -> Walk<'_, ThreadSlot>;

    /// Reference slots on the thread's stack
    fn stack_slots(&self, thread: &ThreadInfo) -> Walk<'_, StackSlot>;
}

/// Root set enumeration.
pub trait RootSets {
    /// Remembered-set buckets with their entries
    fn remembered_set(&self) -> Walk<'_, RootSlot>;

    /// Unfinalized object lists
    fn unfinalized_lists(&self) -> Walk<'_, ObjectList>;

    /// Finalizable object lists
    fn finalizable_lists(&self) -> Walk<'_, ObjectList>;

    /// Ownable synchronizer lists
    fn ownable_synchronizer_lists(&self) -> Walk<'_, ObjectList>;

    /// Interned strings
    fn string_table(&self) -> Walk<'_, RootSlot>;

    /// Class loader object slots
    fn class_loaders(&self) -> Walk<'_, RootSlot>;

    /// JNI global references
    fn jni_global_refs(&self) -> Walk<'_, RootSlot>;

    /// JNI weak global references
    fn jni_weak_global_refs(&self) -> Walk<'_, RootSlot>;

    /// Tool tag tables
    fn tag_tables(&self) -> Walk<'_, RootSlot>;

    /// Inflated monitor table
    fn monitor_table(&self) -> Walk<'_, RootSlot>;

    /// Well-known class slots held by the VM
    fn vm_class_slots(&self) -> Walk<'_, RootSlot>;
}

/// Everything the verifier needs from a runtime.
pub trait Target: MemoryReader + RegionOracle + ObjectModel + ClassModel + ThreadModel + RootSets {
    /// Collector configuration
    fn configuration(&self) -> HeapConfiguration;

    /// Flush allocation caches so the heap is walkable
    fn walk_heap_start(&self) {}

    /// Heap walk finished
    fn walk_heap_end(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_contains() {
        let region = RegionDescriptor {
            id: 1,
            start: Address::new(0x1000),
            size: 0x100,
            object_alignment: 8,
            generation: Generation::Old,
        };
        assert!(region.contains(Address::new(0x1000)));
        assert!(region.contains(Address::new(0x10f8)));
        assert!(!region.contains(Address::new(0x1100)));
    }

    #[test]
    fn test_static_field_signature() {
        let field = StaticField {
            name: "cache".into(),
            signature: "Ljava/util/Map;".into(),
            address: Address::NULL,
        };
        assert!(field.is_reference());
        assert_eq!(field.declared_class_name(), "java/util/Map");

        let prim = StaticField {
            name: "count".into(),
            signature: "I".into(),
            address: Address::NULL,
        };
        assert!(!prim.is_reference());
    }
}
