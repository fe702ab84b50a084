//! Programmatic construction of heap images.

use std::collections::BTreeSet;

use crate::address::{Address, POINTER_SIZE};
use crate::target::{
    ClassFlags, ClassShape, ClassSlotKind, Generation, HeapConfiguration, ObjectFlags, StaticField, ThreadSlotKind,
};

use super::{
    ArrayRecord, ClassRecord, ClassReferenceRecord, HeapImage, HoleRecord, ListRecord, ObjectRecord, PoolRecord,
    RegionRecord, RootPool, SegmentRecord, StackRecord, ThreadRecord, ThreadSlotRecord,
};

/// Classes are laid out on this stride inside a segment.
const CLASS_STRIDE: u64 = 0x100;

const POOL_BASE: u64 = 0xC000_0000;
const POOL_STRIDE: u64 = 0x1000;
const REMEMBERED_SET_OWNER: u64 = 0xC100_0000;
const STATICS_BASE: u64 = 0xD000_0000;
const THREAD_BASE: u64 = 0xE000_0000;
const THREAD_STRIDE: u64 = 0x1_0000;
const LIST_BASE: u64 = 0xF000_0000;

fn round_up(value: u64) -> u64 {
    value.div_ceil(POINTER_SIZE) * POINTER_SIZE
}

fn pool_index(pool: RootPool) -> u64 {
    match pool {
        RootPool::StringTable => 0,
        RootPool::ClassLoaders => 1,
        RootPool::JniGlobalRefs => 2,
        RootPool::JniWeakGlobalRefs => 3,
        RootPool::TagTables => 4,
        RootPool::MonitorTable => 5,
        RootPool::VmClassSlots => 6,
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    start: Address,
    end: Address,
    next: Address,
    generation: Generation,
}

/// Bump allocator over a fresh [`HeapImage`].
///
/// Objects go into the most recently added region and classes into the
/// most recently added class segment. [`ImageBuilder::build`] closes every
/// region with a single hole covering its unallocated tail so that the
/// image is walkable.
#[derive(Debug)]
pub struct ImageBuilder {
    image: HeapImage,
    regions: Vec<Cursor>,
    current_region: usize,
    current_segment: usize,
    statics_next: u64,
    lists_next: u64,
    /// Next free stack byte per thread, growing up from `stack_start`
    stack_cursors: Vec<Address>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// Empty image with the default configuration
    pub fn new() -> Self {
        Self {
            image: HeapImage::default(),
            regions: Vec::new(),
            current_region: 0,
            current_segment: 0,
            statics_next: STATICS_BASE,
            lists_next: LIST_BASE,
            stack_cursors: Vec::new(),
        }
    }

    /// Replace the collector configuration
    pub fn with_configuration(&mut self, configuration: HeapConfiguration) -> &mut Self {
        self.image.configuration = configuration;
        self
    }

    /// Mutable collector configuration
    pub fn configuration_mut(&mut self) -> &mut HeapConfiguration {
        &mut self.image.configuration
    }

    /// Turn on the scavenger and an empty card table
    pub fn generational(&mut self) -> &mut Self {
        self.image.configuration.generational = true;
        self.image.cards.get_or_insert_with(BTreeSet::new);
        self
    }

    /// Add a class segment and allocate subsequent classes in it
    pub fn class_segment(&mut self, start: u64, size: u64) -> &mut Self {
        self.push_segment(start, size, false)
    }

    /// Add a segment kept alive past unload
    pub fn undead_class_segment(&mut self, start: u64, size: u64) -> &mut Self {
        self.push_segment(start, size, true)
    }

    fn push_segment(&mut self, start: u64, size: u64, undead: bool) -> &mut Self {
        let start = Address::new(start);
        self.image.class_segments.push(SegmentRecord {
            start,
            size,
            alloc: start,
            undead,
        });
        self.current_segment = self.image.class_segments.len() - 1;
        self
    }

    /// Allocate a plain class
    pub fn class(&mut self, name: &str) -> Address {
        self.class_with(name, ClassShape::Mixed, ClassFlags::empty())
    }

    /// Allocate a class with a given shape and flags.
    ///
    /// # Panics
    ///
    /// Without a class segment.
    pub fn class_with(&mut self, name: &str, shape: ClassShape, flags: ClassFlags) -> Address {
        let segment = &mut self.image.class_segments[self.current_segment];
        let address = segment.alloc;
        segment.alloc = address + CLASS_STRIDE;
        let mut record = ClassRecord::new(name);
        record.shape = shape;
        record.flags = flags;
        self.image.classes.insert(address, record);
        address
    }

    /// Mutable class record
    pub fn class_mut(&mut self, class: Address) -> Option<&mut ClassRecord> {
        self.image.classes.get_mut(&class)
    }

    /// Make `superclass` the superclass of `class`
    pub fn extends(&mut self, class: Address, superclass: Address) -> &mut Self {
        if let Some(record) = self.image.classes.get_mut(&class) {
            record.superclass = superclass;
        }
        self
    }

    /// Give `class` a statics window holding `fields`.
    ///
    /// Each field is `(name, signature, value)`. Reference fields are laid
    /// out first, one slot each, and the declared count matches them;
    /// primitives follow the window.
    pub fn statics(&mut self, class: Address, fields: &[(&str, &str, Address)]) -> Address {
        let window = Address::new(self.statics_next);
        let mut declared = Vec::new();
        let mut references = Vec::new();
        let mut primitives = Vec::new();
        for (name, signature, value) in fields {
            let field = StaticField {
                name: name.to_string(),
                signature: signature.to_string(),
                address: Address::NULL,
            };
            if field.is_reference() {
                references.push((field, *value));
            } else {
                primitives.push((field, *value));
            }
        }
        let count = references.len() as u64;
        for (index, (mut field, value)) in references.into_iter().chain(primitives).enumerate() {
            field.address = window.slot(index as u64);
            self.image.memory.insert(field.address, value.raw());
            declared.push((field, value));
        }
        self.statics_next = window.slot(declared.len() as u64 + 1).raw();

        if let Some(record) = self.image.classes.get_mut(&class) {
            record.statics = window;
            record.object_static_count = count;
            for (field, value) in &declared {
                if field.is_reference() {
                    record.references.push(ClassReferenceRecord {
                        kind: ClassSlotKind::Statics,
                        value: *value,
                    });
                }
            }
            record.static_fields = declared.into_iter().map(|(field, _)| field).collect();
        }
        window
    }

    /// Add a heap region and allocate subsequent objects in it
    pub fn region(&mut self, start: u64, size: u64, generation: Generation) -> &mut Self {
        let start = Address::new(start);
        let id = self.image.regions.len() as u64;
        self.image.regions.push(RegionRecord {
            id,
            start,
            size,
            object_alignment: POINTER_SIZE,
            generation,
        });
        self.regions.push(Cursor {
            start,
            end: start + size,
            next: start,
            generation,
        });
        self.current_region = self.regions.len() - 1;
        self
    }

    /// Add a region without objects
    pub fn metadata_region(&mut self, start: u64, size: u64) -> &mut Self {
        let id = self.image.regions.len() as u64;
        self.image.regions.push(RegionRecord {
            id,
            start: Address::new(start),
            size,
            object_alignment: 0,
            generation: Generation::Undifferentiated,
        });
        self
    }

    /// Allocate subsequent objects in the region starting at `start`
    pub fn select_region(&mut self, start: u64) -> &mut Self {
        if let Some(index) = self.regions.iter().position(|cursor| cursor.start.raw() == start) {
            self.current_region = index;
        }
        self
    }

    fn allocate(&mut self, size: u64) -> (Address, Generation) {
        let cursor = &mut self.regions[self.current_region];
        let address = cursor.next;
        cursor.next = address + round_up(size);
        (address, cursor.generation)
    }

    fn default_flags(generation: Generation) -> ObjectFlags {
        match generation {
            Generation::Old => ObjectFlags::OLD,
            Generation::New | Generation::Undifferentiated => ObjectFlags::empty(),
        }
    }

    fn insert_object(&mut self, class: Address, slots: Vec<Address>, array: Option<ArrayRecord>, size: u64) -> Address {
        let (address, generation) = self.allocate(size);
        let mut flags = Self::default_flags(generation);
        if array.is_some() {
            flags |= ObjectFlags::INDEXABLE;
        }
        self.image.objects.insert(
            address,
            ObjectRecord {
                class,
                flags,
                size: round_up(size),
                slots,
                array,
                forwarded: None,
                unfinalized_next: Address::NULL,
                finalizable_next: Address::NULL,
                ownable_next: Address::NULL,
            },
        );
        address
    }

    /// Allocate an instance with null reference fields.
    ///
    /// # Panics
    ///
    /// Without a region.
    pub fn object(&mut self, class: Address) -> Address {
        let count = self
            .image
            .classes
            .get(&class)
            .map_or(0, |record| record.instance_slots);
        self.object_with_slots(class, &vec![Address::NULL; count as usize])
    }

    /// Allocate an instance with the given reference fields
    pub fn object_with_slots(&mut self, class: Address, slots: &[Address]) -> Address {
        let size = self.image.configuration.object_header_size + POINTER_SIZE * slots.len() as u64;
        self.insert_object(class, slots.to_vec(), None, size)
    }

    /// Allocate an array; reference arrays get null elements
    pub fn array(&mut self, class: Address, length: u64, element_size: u64) -> Address {
        let pointers = self
            .image
            .classes
            .get(&class)
            .is_some_and(|record| record.shape == ClassShape::Pointers);
        let slots = if pointers {
            vec![Address::NULL; length as usize]
        } else {
            Vec::new()
        };
        let size = self.image.configuration.indexable_header_size + length * element_size;
        let array = ArrayRecord {
            length,
            element_size,
            data_address: Address::NULL,
        };
        self.insert_object(class, slots, Some(array), size)
    }

    /// Allocate a hole of `size` bytes
    pub fn hole(&mut self, size: u64) -> Address {
        let (address, _) = self.allocate(size);
        self.image.holes.insert(
            address,
            HoleRecord {
                size,
                next: Address::NULL,
                single_slot: size == POINTER_SIZE,
            },
        );
        address
    }

    /// Mutable object record
    pub fn object_mut(&mut self, object: Address) -> Option<&mut ObjectRecord> {
        self.image.objects.get_mut(&object)
    }

    /// Mark `object` live, creating the mark map on first use
    pub fn mark(&mut self, object: Address) -> &mut Self {
        self.image.mark_map.get_or_insert_with(BTreeSet::new).insert(object);
        self
    }

    /// Set REMEMBERED on `object` and add it to the remembered set
    pub fn remember(&mut self, object: Address) -> &mut Self {
        if let Some(record) = self.image.objects.get_mut(&object) {
            record.flags |= ObjectFlags::REMEMBERED;
        }
        self.remembered_entry(object.raw())
    }

    /// Append a raw remembered-set entry, tag bits included
    pub fn remembered_entry(&mut self, raw: u64) -> &mut Self {
        let set = &mut self.image.roots.remembered_set;
        set.owner = Address::new(REMEMBERED_SET_OWNER);
        set.entries.push(Address::new(raw));
        self
    }

    /// Mark the card covering `address` dirty
    pub fn dirty_card(&mut self, address: Address) -> &mut Self {
        self.image
            .cards
            .get_or_insert_with(BTreeSet::new)
            .insert(address.raw() / super::CARD_SIZE);
        self
    }

    /// Enable an empty card table
    pub fn card_table(&mut self) -> &mut Self {
        self.image.cards.get_or_insert_with(BTreeSet::new);
        self
    }

    /// Register a valid out-of-line array data address
    pub fn sparse_data(&mut self, data: Address) -> &mut Self {
        self.image.sparse_data.insert(data);
        self
    }

    /// Override a raw word
    pub fn write_word(&mut self, address: Address, value: u64) -> &mut Self {
        self.image.memory.insert(address, value);
        self
    }

    /// Append `value` to a root pool; returns the slot address
    pub fn root(&mut self, pool: RootPool, value: Address) -> Address {
        let owner = Address::new(POOL_BASE + pool_index(pool) * POOL_STRIDE);
        let record = self.image.roots.pools.entry(pool).or_insert_with(|| PoolRecord {
            owner,
            entries: Vec::new(),
        });
        record.entries.push(value);
        owner.slot(record.entries.len() as u64 - 1)
    }

    fn list(&mut self, members: &[Address]) -> ListRecord {
        let address = Address::new(self.lists_next);
        self.lists_next += POINTER_SIZE * 2;
        ListRecord {
            address,
            head: members.first().copied().unwrap_or(Address::NULL),
        }
    }

    fn link(&mut self, members: &[Address], link: fn(&mut ObjectRecord) -> &mut Address, self_terminated: bool) {
        for (index, member) in members.iter().enumerate() {
            let next = match members.get(index + 1) {
                Some(next) => *next,
                None if self_terminated => *member,
                None => Address::NULL,
            };
            if let Some(record) = self.image.objects.get_mut(member) {
                *link(record) = next;
            }
        }
    }

    /// Thread `members` onto a new unfinalized list
    pub fn unfinalized_list(&mut self, members: &[Address]) -> Address {
        self.link(members, |record| &mut record.unfinalized_next, false);
        let list = self.list(members);
        self.image.roots.unfinalized.push(list);
        list.address
    }

    /// Thread `members` onto a new finalizable list
    pub fn finalizable_list(&mut self, members: &[Address]) -> Address {
        self.link(members, |record| &mut record.finalizable_next, false);
        let list = self.list(members);
        self.image.roots.finalizable.push(list);
        list.address
    }

    /// Thread `members` onto a new ownable synchronizer list; the tail
    /// links to itself
    pub fn ownable_synchronizer_list(&mut self, members: &[Address]) -> Address {
        self.link(members, |record| &mut record.ownable_next, true);
        let list = self.list(members);
        self.image.roots.ownable_synchronizer.push(list);
        list.address
    }

    /// Add a thread with a stack of `stack_size` bytes
    pub fn thread(&mut self, stack_start: u64, stack_size: u64) -> Address {
        let address = Address::new(THREAD_BASE + self.image.threads.len() as u64 * THREAD_STRIDE);
        let stack_start = Address::new(stack_start);
        self.image.threads.push(ThreadRecord {
            address,
            stack_start,
            stack_end: stack_start + stack_size,
            slots: Vec::new(),
            stack: Vec::new(),
        });
        self.stack_cursors.push(stack_start);
        address
    }

    fn thread_index(&self, thread: Address) -> Option<usize> {
        self.image.threads.iter().position(|record| record.address == thread)
    }

    /// Add a slot to the thread structure
    pub fn thread_slot(&mut self, thread: Address, kind: ThreadSlotKind, value: Address) -> &mut Self {
        if let Some(index) = self.thread_index(thread) {
            self.image.threads[index].slots.push(ThreadSlotRecord { kind, value });
        }
        self
    }

    /// Add a stack slot in `frame`
    pub fn stack_slot(&mut self, thread: Address, frame: &str, value: Address) -> &mut Self {
        if let Some(index) = self.thread_index(thread) {
            self.image.threads[index].stack.push(StackRecord {
                frame: frame.to_string(),
                value,
            });
        }
        self
    }

    /// Allocate an instance on `thread`'s stack.
    ///
    /// `None` when `thread` was not added by this builder.
    pub fn stack_object(&mut self, thread: Address, class: Address) -> Option<Address> {
        let index = self.thread_index(thread)?;
        let count = self
            .image
            .classes
            .get(&class)
            .map_or(0, |record| record.instance_slots);
        let size = self.image.configuration.object_header_size + POINTER_SIZE * count;
        let address = self.stack_cursors[index];
        self.stack_cursors[index] = address + round_up(size);
        self.image.objects.insert(
            address,
            ObjectRecord {
                class,
                flags: ObjectFlags::empty(),
                size,
                slots: vec![Address::NULL; count as usize],
                array: None,
                forwarded: None,
                unfinalized_next: Address::NULL,
                finalizable_next: Address::NULL,
                ownable_next: Address::NULL,
            },
        );
        Some(address)
    }

    /// Close every region with a tail hole and hand out the image
    pub fn build(mut self) -> HeapImage {
        for cursor in &self.regions {
            if cursor.next < cursor.end {
                let size = cursor.end - cursor.next;
                self.image.holes.insert(
                    cursor.next,
                    HoleRecord {
                        size,
                        next: Address::NULL,
                        single_slot: size == POINTER_SIZE,
                    },
                );
            }
        }
        self.image.regions.sort_by_key(|region| region.start);
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ClassModel, MemoryReader};

    #[test]
    fn test_statics_window_layout() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let string = builder.class("java/lang/String");
        let holder = builder.class("Holder");
        builder.region(0x10_0000, 0x1000, Generation::Undifferentiated);
        let value = builder.object(string);
        let window = builder.statics(holder, &[("count", "I", Address::new(3)), ("name", "Ljava/lang/String;", value)]);
        let image = builder.build();

        let header = image.class_header(holder).unwrap();
        assert_eq!(header.statics, window);
        assert_eq!(header.object_static_count, 1);
        let fields = image.static_fields(holder).unwrap();
        assert_eq!(fields[0].name, "name");
        assert_eq!(image.read_word(fields[0].address).unwrap(), value.raw());
        assert_eq!(fields[1].address, window.slot(1));
    }

    #[test]
    fn test_old_region_objects_are_old() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let class = builder.class("Thing");
        builder.region(0x20_0000, 0x1000, Generation::Old);
        let old = builder.object(class);
        builder.region(0x10_0000, 0x1000, Generation::New);
        let young = builder.object(class);
        let image = builder.build();

        assert!(image.objects[&old].flags.contains(ObjectFlags::OLD));
        assert!(!image.objects[&young].flags.contains(ObjectFlags::OLD));
        assert_eq!(image.regions[0].start, Address::new(0x10_0000));
    }

    #[test]
    fn test_stack_object_needs_known_thread() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let class = builder.class("Thing");
        let thread = builder.thread(0x9000_0000, 0x1000);

        assert_eq!(builder.stack_object(Address::new(0x1234_0000), class), None);
        let first = builder.stack_object(thread, class);
        assert_eq!(first, Some(Address::new(0x9000_0000)));
        assert!(builder.stack_object(thread, class) > first);
    }
}
