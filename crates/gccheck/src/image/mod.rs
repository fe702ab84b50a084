//! Post-mortem heap images.
//!
//! A [`HeapImage`] is a serde model of everything the verifier can ask a
//! runtime: regions, class segments, classes, objects, holes, threads and
//! root sets, plus a sparse word map for raw memory. It implements every
//! capability trait in [`crate::target`], so a dump taken from a crashed
//! process can be checked out of process, and tests can build heaps with
//! [`ImageBuilder`] without any runtime at all.
//!
//! # Layout
//!
//! Objects are described by records; raw reads are synthesized from them:
//!
//! - word 0 of an object is its class pointer with the header flag bits
//!   in the low byte, word 1 its size;
//! - reference slot `i` sits at `base + header + 8 * i`, where `header` is
//!   the indexable header size for arrays;
//! - word 0 of a class is its eyecatcher, word 1 its flags;
//! - class reference slots start at `class + 0x40`, followed by the class
//!   pointer slots.
//!
//! Words in [`HeapImage::memory`] take precedence over synthesized ones.

mod builder;
mod runtime;

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;
use crate::target::{
    CLASS_EYECATCHER, ClassFlags, ClassPointerKind, ClassShape, ClassSlotKind, Generation, HeapConfiguration,
    ObjectFlags, RegionDescriptor, StaticField, ThreadSlotKind,
};

pub use builder::ImageBuilder;

/// Bytes covered by one card of the card table.
pub const CARD_SIZE: u64 = 512;

/// Offset of the first synthesized slot inside a class.
pub const CLASS_SLOTS_OFFSET: u64 = 0x40;

/// Heap image failures.
#[derive(Debug, Error)]
pub enum ImageError {
    /// File could not be read or written
    #[error("heap image I/O: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON
    #[error("heap image format: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_alignment() -> u64 {
    8
}

fn default_eyecatcher() -> u64 {
    CLASS_EYECATCHER
}

/// A heap region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    /// Region identifier
    pub id: u64,
    /// First address
    pub start: Address,
    /// Size in bytes
    pub size: u64,
    /// Object alignment; 0 for regions without objects
    #[serde(default = "default_alignment")]
    pub object_alignment: u64,
    /// Generation kind
    #[serde(default)]
    pub generation: Generation,
}

impl RegionRecord {
    /// Descriptor handed to the verifier
    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor {
            id: self.id,
            start: self.start,
            size: self.size,
            object_alignment: self.object_alignment,
            generation: self.generation,
        }
    }
}

/// A class memory segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// First address
    pub start: Address,
    /// Size in bytes
    pub size: u64,
    /// Live allocation boundary
    pub alloc: Address,
    /// Kept past unload
    #[serde(default)]
    pub undead: bool,
}

/// A reference slot of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassReferenceRecord {
    /// Section of the class
    pub kind: ClassSlotKind,
    /// Referenced object
    pub value: Address,
}

/// A class-pointer slot of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPointerRecord {
    /// Section of the class
    pub kind: ClassPointerKind,
    /// Referenced class
    pub value: Address,
}

/// A class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    /// Internal name, `java/lang/String`
    pub name: String,
    /// Header eyecatcher
    #[serde(default = "default_eyecatcher")]
    pub eyecatcher: u64,
    /// Class flags
    #[serde(default)]
    pub flags: ClassFlags,
    /// Instance shape
    #[serde(default)]
    pub shape: ClassShape,
    /// Reference fields per instance
    #[serde(default)]
    pub instance_slots: u64,
    /// Superclass, or null
    #[serde(default)]
    pub superclass: Address,
    /// Defining loader; null for the bootstrap loader
    #[serde(default)]
    pub loader: Address,
    /// `java.lang.Class` instance, or null
    #[serde(default)]
    pub class_object: Address,
    /// Class replaced by this one, or null
    #[serde(default)]
    pub replaced_class: Address,
    /// Statics window, or null
    #[serde(default)]
    pub statics: Address,
    /// Declared reference statics
    #[serde(default)]
    pub object_static_count: u64,
    /// Static field table
    #[serde(default)]
    pub static_fields: Vec<StaticField>,
    /// Object reference slots
    #[serde(default)]
    pub references: Vec<ClassReferenceRecord>,
    /// Class pointer slots other than the superclass
    #[serde(default)]
    pub pointers: Vec<ClassPointerRecord>,
}

impl ClassRecord {
    /// Plain class named `name`
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            eyecatcher: CLASS_EYECATCHER,
            flags: ClassFlags::empty(),
            shape: ClassShape::Mixed,
            instance_slots: 0,
            superclass: Address::NULL,
            loader: Address::NULL,
            class_object: Address::NULL,
            replaced_class: Address::NULL,
            statics: Address::NULL,
            object_static_count: 0,
            static_fields: Vec::new(),
            references: Vec::new(),
            pointers: Vec::new(),
        }
    }
}

/// Array geometry of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayRecord {
    /// Elements
    pub length: u64,
    /// Bytes per element
    pub element_size: u64,
    /// Out-of-line data, or null
    #[serde(default)]
    pub data_address: Address,
}

/// An object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Class pointer
    pub class: Address,
    /// Header flags
    #[serde(default)]
    pub flags: ObjectFlags,
    /// Total size in bytes
    pub size: u64,
    /// Reference slot values
    #[serde(default)]
    pub slots: Vec<Address>,
    /// Present for arrays
    #[serde(default)]
    pub array: Option<ArrayRecord>,
    /// Forwarded copy, mid-scavenge
    #[serde(default)]
    pub forwarded: Option<Address>,
    /// Unfinalized list link
    #[serde(default)]
    pub unfinalized_next: Address,
    /// Finalizable list link
    #[serde(default)]
    pub finalizable_next: Address,
    /// Ownable synchronizer list link
    #[serde(default)]
    pub ownable_next: Address,
}

/// A dead span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoleRecord {
    /// Size in bytes
    pub size: u64,
    /// Next free-list hole, or null
    #[serde(default)]
    pub next: Address,
    /// One-slot filler
    #[serde(default)]
    pub single_slot: bool,
}

/// A thread structure slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSlotRecord {
    /// Section
    pub kind: ThreadSlotKind,
    /// Referenced object
    pub value: Address,
}

/// A stack slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRecord {
    /// Frame description
    pub frame: String,
    /// Referenced object
    pub value: Address,
}

/// A thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// Thread structure address
    pub address: Address,
    /// Lowest stack address
    pub stack_start: Address,
    /// One past the highest stack address
    pub stack_end: Address,
    /// Thread structure slots
    #[serde(default)]
    pub slots: Vec<ThreadSlotRecord>,
    /// Stack slots, innermost frame first
    #[serde(default)]
    pub stack: Vec<StackRecord>,
}

/// An intrusive list head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRecord {
    /// List structure address
    pub address: Address,
    /// First member
    pub head: Address,
}

/// Slot tables held by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootPool {
    /// Interned strings
    StringTable,
    /// Class loader objects
    ClassLoaders,
    /// JNI global references
    JniGlobalRefs,
    /// JNI weak global references
    JniWeakGlobalRefs,
    /// Tool tag tables
    TagTables,
    /// Inflated monitors
    MonitorTable,
    /// Well-known classes
    VmClassSlots,
}

/// A slot table and its owner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolRecord {
    /// Container address; slot `i` lives at `owner + 8 * i`
    pub owner: Address,
    /// Slot values
    #[serde(default)]
    pub entries: Vec<Address>,
}

/// Every root set of the image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Roots {
    /// Remembered-set bucket
    pub remembered_set: PoolRecord,
    /// Unfinalized lists
    pub unfinalized: Vec<ListRecord>,
    /// Finalizable lists
    pub finalizable: Vec<ListRecord>,
    /// Ownable synchronizer lists
    pub ownable_synchronizer: Vec<ListRecord>,
    /// Tables and pools
    pub pools: BTreeMap<RootPool, PoolRecord>,
}

/// Read counters, for observing memoization.
#[derive(Debug, Clone, Default)]
pub struct ImageStats {
    /// Class header decodes
    pub class_header_reads: Cell<u64>,
    /// Object header decodes
    pub object_header_reads: Cell<u64>,
}

impl ImageStats {
    fn bump(counter: &Cell<u64>) {
        counter.set(counter.get() + 1);
    }
}

/// A complete heap image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapImage {
    /// Collector configuration
    pub configuration: HeapConfiguration,
    /// Heap regions, by start address
    pub regions: Vec<RegionRecord>,
    /// Class segments
    pub class_segments: Vec<SegmentRecord>,
    /// Classes by address
    pub classes: BTreeMap<Address, ClassRecord>,
    /// Objects by address, heap and stack alike
    pub objects: BTreeMap<Address, ObjectRecord>,
    /// Holes by address
    pub holes: BTreeMap<Address, HoleRecord>,
    /// Threads
    pub threads: Vec<ThreadRecord>,
    /// Root sets
    pub roots: Roots,
    /// Raw words overriding the synthesized layout
    pub memory: BTreeMap<Address, u64>,
    /// Objects marked live; `None` without a mark map
    pub mark_map: Option<BTreeSet<Address>>,
    /// Valid out-of-line array data addresses
    pub sparse_data: BTreeSet<Address>,
    /// Dirty card indices; `None` without a card table
    pub cards: Option<BTreeSet<u64>>,
    /// Read counters
    #[serde(skip)]
    pub stats: ImageStats,
}

impl HeapImage {
    /// Parse an image from JSON
    pub fn from_json(text: &str) -> Result<Self, ImageError> {
        let mut image: HeapImage = serde_json::from_str(text)?;
        image.regions.sort_by_key(|region| region.start);
        Ok(image)
    }

    /// Load an image file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Pretty JSON
    pub fn to_json(&self) -> Result<String, ImageError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the image to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Object record containing `address`, with its base
    fn object_containing(&self, address: Address) -> Option<(Address, &ObjectRecord)> {
        let (base, record) = self.objects.range(..=address).next_back()?;
        (address < *base + record.size.max(8)).then_some((*base, record))
    }

    fn first_slot(&self, base: Address, record: &ObjectRecord) -> Address {
        if record.array.is_some() {
            base + self.configuration.indexable_header_size
        } else {
            base + self.configuration.object_header_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Generation, MemoryReader};

    #[test]
    fn test_json_round_trip_keeps_layout() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let class = builder.class("Thing");
        builder.region(0x10_0000, 0x100, Generation::Old);
        let object = builder.object(class);
        let image = builder.build();

        let text = image.to_json().unwrap();
        assert!(text.contains("\"0x100000\""));
        let loaded = HeapImage::from_json(&text).unwrap();
        assert_eq!(loaded.objects, image.objects);
        assert_eq!(loaded.read_word(object).unwrap(), image.read_word(object).unwrap());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.json");
        let image = ImageBuilder::new().build();
        image.save(&path).unwrap();
        let loaded = HeapImage::load(&path).unwrap();
        assert_eq!(loaded.configuration, image.configuration);
    }
}
