//! Capability trait implementations over a [`HeapImage`].

use rustc_hash::FxHashSet;

use crate::address::{Address, POINTER_SIZE};
use crate::error::ReadFault;
use crate::fixer::HeapFixup;
use crate::target::{
    ArrayInfo, ClassHeader, ClassModel, ClassPointerKind, ClassPointerSlot, ClassReferenceSlot, ClassSegment,
    HeapConfiguration, HeapEntry, HoleInfo, ListKind, MemoryReader, ObjectHeader, ObjectList, ObjectModel,
    ReferenceSlot, RegionDescriptor, RegionOracle, RootSets, RootSlot, StackSlot, StaticField, Target, ThreadInfo,
    ThreadModel, ThreadSlot, Walk,
};

use super::{CARD_SIZE, CLASS_SLOTS_OFFSET, ClassRecord, HeapImage, HoleRecord, ImageStats, ObjectRecord, PoolRecord, RootPool};

const HOLE_SINGLE_SLOT: u64 = 0x1;
const HOLE_MULTI_SLOT: u64 = 0x3;

impl HeapImage {
    fn object(&self, address: Address) -> Result<&ObjectRecord, ReadFault> {
        self.objects.get(&address).ok_or(ReadFault::at(address))
    }

    fn class(&self, address: Address) -> Result<&ClassRecord, ReadFault> {
        self.classes.get(&address).ok_or(ReadFault::at(address))
    }

    fn thread(&self, info: &ThreadInfo) -> Option<&super::ThreadRecord> {
        self.threads.iter().find(|thread| thread.address == info.address)
    }

    fn pool_slots<'a>(&self, pool: Option<&'a PoolRecord>) -> Walk<'a, RootSlot> {
        let Some(pool) = pool else {
            return Box::new(std::iter::empty());
        };
        Box::new(pool.entries.iter().enumerate().map(|(index, value)| {
            Ok(RootSlot {
                owner: pool.owner,
                address: pool.owner.slot(index as u64),
                value: *value,
            })
        }))
    }

    fn pool(&self, pool: RootPool) -> Walk<'_, RootSlot> {
        self.pool_slots(self.roots.pools.get(&pool))
    }

    fn lists(lists: &[super::ListRecord]) -> Walk<'_, ObjectList> {
        Box::new(lists.iter().map(|list| {
            Ok(ObjectList {
                address: list.address,
                head: list.head,
            })
        }))
    }

    fn object_word(&self, address: Address) -> Option<u64> {
        let (base, record) = self.object_containing(address)?;
        if address == base {
            return Some(record.class.raw() | u64::from(record.flags.bits()));
        }
        if address == base + POINTER_SIZE {
            return Some(record.size);
        }
        let first = self.first_slot(base, record);
        if address < first || !address.is_aligned(POINTER_SIZE) {
            return None;
        }
        let index = (address - first) / POINTER_SIZE;
        record.slots.get(index as usize).map(|slot| slot.raw())
    }

    fn hole_word(&self, address: Address) -> Option<u64> {
        let (base, hole) = self.holes.range(..=address).next_back()?;
        let offset = address - *base;
        match offset {
            0 if hole.single_slot => Some(HOLE_SINGLE_SLOT),
            0 => Some(HOLE_MULTI_SLOT),
            8 if !hole.single_slot => Some(hole.size),
            16 if !hole.single_slot => Some(hole.next.raw()),
            _ => None,
        }
    }

    fn class_word(&self, address: Address) -> Option<u64> {
        let (base, class) = self.classes.range(..=address).next_back()?;
        let offset = address - *base;
        if offset == 0 {
            return Some(class.eyecatcher);
        }
        if offset == POINTER_SIZE {
            return Some(u64::from(class.flags.bits()));
        }
        if offset < CLASS_SLOTS_OFFSET || offset % POINTER_SIZE != 0 {
            return None;
        }
        let index = ((offset - CLASS_SLOTS_OFFSET) / POINTER_SIZE) as usize;
        let references = class.references.len();
        if index < references {
            return Some(class.references[index].value.raw());
        }
        self.class_pointers(class)
            .get(index - references)
            .map(|(_, value)| value.raw())
    }

    fn class_pointers(&self, class: &ClassRecord) -> Vec<(ClassPointerKind, Address)> {
        let superclass = (!class.superclass.is_null()).then_some((ClassPointerKind::Superclass, class.superclass));
        superclass
            .into_iter()
            .chain(class.pointers.iter().map(|pointer| (pointer.kind, pointer.value)))
            .collect()
    }
}

impl MemoryReader for HeapImage {
    fn read_word(&self, address: Address) -> Result<u64, ReadFault> {
        if let Some(word) = self.memory.get(&address) {
            return Ok(*word);
        }
        self.object_word(address)
            .or_else(|| self.hole_word(address))
            .or_else(|| self.class_word(address))
            .ok_or(ReadFault::at(address))
    }
}

impl RegionOracle for HeapImage {
    fn find_region(&self, address: Address) -> Result<Option<RegionDescriptor>, ReadFault> {
        Ok(self
            .regions
            .iter()
            .map(|region| region.descriptor())
            .find(|region| region.contains(address)))
    }

    fn object_regions(&self) -> Walk<'_, RegionDescriptor> {
        Box::new(
            self.regions
                .iter()
                .map(|region| region.descriptor())
                .filter(RegionDescriptor::holds_objects)
                .map(Ok),
        )
    }

    fn find_class_segment(&self, address: Address) -> Result<Option<ClassSegment>, ReadFault> {
        Ok(self
            .class_segments
            .iter()
            .find(|segment| address >= segment.start && address < segment.start + segment.size)
            .map(|segment| ClassSegment {
                start: segment.start,
                alloc: segment.alloc,
                undead: segment.undead,
            }))
    }

    fn class_segments(&self) -> Walk<'_, ClassSegment> {
        Box::new(self.class_segments.iter().map(|segment| {
            Ok(ClassSegment {
                start: segment.start,
                alloc: segment.alloc,
                undead: segment.undead,
            })
        }))
    }
}

impl ObjectModel for HeapImage {
    fn heap_entry(&self, address: Address) -> Result<HeapEntry, ReadFault> {
        if let Some(hole) = self.holes.get(&address) {
            return Ok(HeapEntry::Hole(HoleInfo {
                size: hole.size,
                next: hole.next,
                single_slot: hole.single_slot,
            }));
        }
        if self.objects.contains_key(&address) {
            return Ok(HeapEntry::Object);
        }
        Err(ReadFault::at(address))
    }

    fn object_header(&self, address: Address) -> Result<ObjectHeader, ReadFault> {
        let record = self.object(address)?;
        ImageStats::bump(&self.stats.object_header_reads);
        Ok(ObjectHeader {
            class: record.class,
            flags: record.flags,
        })
    }

    fn object_size(&self, address: Address) -> Result<u64, ReadFault> {
        Ok(self.object(address)?.size)
    }

    fn object_slots(&self, address: Address) -> Result<Vec<ReferenceSlot>, ReadFault> {
        let record = self.object(address)?;
        let first = self.first_slot(address, record);
        Ok(record
            .slots
            .iter()
            .enumerate()
            .map(|(index, value)| ReferenceSlot {
                address: first.slot(index as u64),
                value: *value,
            })
            .collect())
    }

    fn forwarded_address(&self, address: Address) -> Result<Option<Address>, ReadFault> {
        Ok(self.object(address)?.forwarded)
    }

    fn array_info(&self, address: Address) -> Result<Option<ArrayInfo>, ReadFault> {
        let record = self.object(address)?;
        Ok(record.array.map(|array| ArrayInfo {
            length: array.length,
            element_size: array.element_size,
            first_element: address + self.configuration.indexable_header_size,
            data_address: array.data_address,
        }))
    }

    fn is_valid_data_address(&self, _object: Address, data: Address) -> Result<bool, ReadFault> {
        Ok(data.is_null() || self.sparse_data.contains(&data))
    }

    fn card_dirty(&self, address: Address) -> Result<Option<bool>, ReadFault> {
        Ok(self
            .cards
            .as_ref()
            .map(|cards| cards.contains(&(address.raw() / CARD_SIZE))))
    }

    fn list_next(&self, object: Address, kind: ListKind) -> Result<Address, ReadFault> {
        let record = self.object(object)?;
        Ok(match kind {
            ListKind::Unfinalized => record.unfinalized_next,
            ListKind::Finalizable => record.finalizable_next,
            ListKind::OwnableSynchronizer => record.ownable_next,
        })
    }
}

impl ClassModel for HeapImage {
    fn class_header(&self, address: Address) -> Result<ClassHeader, ReadFault> {
        let class = self.class(address)?;
        ImageStats::bump(&self.stats.class_header_reads);
        Ok(ClassHeader {
            eyecatcher: class.eyecatcher,
            flags: class.flags,
            shape: class.shape,
            class_object: class.class_object,
            replaced_class: class.replaced_class,
            statics: class.statics,
            object_static_count: class.object_static_count,
            loader: class.loader,
        })
    }

    fn class_name(&self, address: Address) -> Result<String, ReadFault> {
        Ok(self.class(address)?.name.clone())
    }

    fn class_reference_slots(&self, address: Address) -> Result<Vec<ClassReferenceSlot>, ReadFault> {
        let class = self.class(address)?;
        let first = address + CLASS_SLOTS_OFFSET;
        Ok(class
            .references
            .iter()
            .enumerate()
            .map(|(index, reference)| ClassReferenceSlot {
                kind: reference.kind,
                address: first.slot(index as u64),
                value: reference.value,
            })
            .collect())
    }

    fn class_pointer_slots(&self, address: Address) -> Result<Vec<ClassPointerSlot>, ReadFault> {
        let class = self.class(address)?;
        let first = (address + CLASS_SLOTS_OFFSET).slot(class.references.len() as u64);
        Ok(self
            .class_pointers(class)
            .into_iter()
            .enumerate()
            .map(|(index, (kind, value))| ClassPointerSlot {
                kind,
                address: first.slot(index as u64),
                value,
            })
            .collect())
    }

    fn static_fields(&self, address: Address) -> Result<Vec<StaticField>, ReadFault> {
        Ok(self.class(address)?.static_fields.clone())
    }

    fn find_class(&self, name: &str, loader: Address) -> Result<Option<Address>, ReadFault> {
        Ok(self
            .classes
            .iter()
            .find(|(_, class)| class.name == name && (class.loader == loader || class.loader.is_null()))
            .map(|(address, _)| *address))
    }

    fn is_instance_of(&self, class: Address, target: Address) -> Result<bool, ReadFault> {
        let mut pending = vec![class];
        let mut seen = FxHashSet::default();
        while let Some(current) = pending.pop() {
            if current == target {
                return Ok(true);
            }
            if current.is_null() || !seen.insert(current) {
                continue;
            }
            let record = self.class(current)?;
            pending.push(record.superclass);
            pending.extend(
                record
                    .pointers
                    .iter()
                    .filter(|pointer| pointer.kind == ClassPointerKind::Interface)
                    .map(|pointer| pointer.value),
            );
        }
        Ok(false)
    }

    fn classes_in_segment(&self, segment: &ClassSegment) -> Walk<'_, Address> {
        Box::new(
            self.classes
                .range(segment.start..segment.alloc)
                .map(|(address, _)| Ok(*address)),
        )
    }
}

impl ThreadModel for HeapImage {
    fn threads(&self) -> Walk<'_, ThreadInfo> {
        Box::new(self.threads.iter().map(|thread| {
            Ok(ThreadInfo {
                address: thread.address,
                stack_start: thread.stack_start,
                stack_end: thread.stack_end,
            })
        }))
    }

    fn thread_slots(&self, thread: &ThreadInfo) -> Walk<'_, ThreadSlot> {
        let Some(record) = self.thread(thread) else {
            return Box::new(std::iter::once(Err(ReadFault::at(thread.address))));
        };
        let base = record.address;
        Box::new(record.slots.iter().enumerate().map(move |(index, slot)| {
            Ok(ThreadSlot {
                kind: slot.kind,
                address: base.slot(index as u64),
                value: slot.value,
            })
        }))
    }

    fn stack_slots(&self, thread: &ThreadInfo) -> Walk<'_, StackSlot> {
        let Some(record) = self.thread(thread) else {
            return Box::new(std::iter::once(Err(ReadFault::at(thread.address))));
        };
        let top = record.stack_end;
        Box::new(record.stack.iter().enumerate().map(move |(index, slot)| {
            Ok(StackSlot {
                address: Address::new(top.raw().saturating_sub(POINTER_SIZE * (index as u64 + 1))),
                value: slot.value,
                frame: slot.frame.clone(),
            })
        }))
    }
}

impl RootSets for HeapImage {
    fn remembered_set(&self) -> Walk<'_, RootSlot> {
        self.pool_slots(Some(&self.roots.remembered_set))
    }

    fn unfinalized_lists(&self) -> Walk<'_, ObjectList> {
        Self::lists(&self.roots.unfinalized)
    }

    fn finalizable_lists(&self) -> Walk<'_, ObjectList> {
        Self::lists(&self.roots.finalizable)
    }

    fn ownable_synchronizer_lists(&self) -> Walk<'_, ObjectList> {
        Self::lists(&self.roots.ownable_synchronizer)
    }

    fn string_table(&self) -> Walk<'_, RootSlot> {
        self.pool(RootPool::StringTable)
    }

    fn class_loaders(&self) -> Walk<'_, RootSlot> {
        self.pool(RootPool::ClassLoaders)
    }

    fn jni_global_refs(&self) -> Walk<'_, RootSlot> {
        self.pool(RootPool::JniGlobalRefs)
    }

    fn jni_weak_global_refs(&self) -> Walk<'_, RootSlot> {
        self.pool(RootPool::JniWeakGlobalRefs)
    }

    fn tag_tables(&self) -> Walk<'_, RootSlot> {
        self.pool(RootPool::TagTables)
    }

    fn monitor_table(&self) -> Walk<'_, RootSlot> {
        self.pool(RootPool::MonitorTable)
    }

    fn vm_class_slots(&self) -> Walk<'_, RootSlot> {
        self.pool(RootPool::VmClassSlots)
    }
}

impl Target for HeapImage {
    fn configuration(&self) -> HeapConfiguration {
        self.configuration
    }
}

impl HeapFixup for HeapImage {
    fn mark_map_available(&self) -> bool {
        self.mark_map.is_some()
    }

    fn is_marked(&self, object: Address) -> Result<bool, ReadFault> {
        Ok(self
            .mark_map
            .as_ref()
            .is_some_and(|marked| marked.contains(&object)))
    }

    fn make_dead(&mut self, address: Address, size: u64) -> Result<(), ReadFault> {
        let end = address.checked_add(size).ok_or(ReadFault::at(address))?;
        self.objects.retain(|base, _| *base < address || *base >= end);
        self.holes.retain(|base, _| *base < address || *base >= end);
        self.holes.insert(
            address,
            HoleRecord {
                size,
                next: Address::NULL,
                single_slot: size == POINTER_SIZE,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuilder;
    use crate::target::{CLASS_EYECATCHER, Generation};

    #[test]
    fn test_reads_follow_layout() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let class = builder.class("Node");
        builder.class_mut(class).unwrap().instance_slots = 2;
        builder.region(0x10_0000, 0x1000, Generation::Undifferentiated);
        let target = builder.object(class);
        let holder = builder.object_with_slots(class, &[target, Address::NULL]);
        let image = builder.build();

        assert_eq!(image.read_word(class).unwrap(), CLASS_EYECATCHER);
        assert_eq!(image.read_word(holder).unwrap(), class.raw());
        assert_eq!(image.read_word(holder + 16).unwrap(), target.raw());
        let slots = image.object_slots(holder).unwrap();
        assert_eq!(slots[0].address, holder + 16);
        assert!(image.read_word(Address::new(0x5000_0000)).is_err());
    }

    #[test]
    fn test_instance_of_walks_supertypes() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let base = builder.class("Base");
        let middle = builder.class("Middle");
        let leaf = builder.class("Leaf");
        builder.extends(middle, base);
        builder.extends(leaf, middle);
        let image = builder.build();

        assert!(image.is_instance_of(leaf, base).unwrap());
        assert!(!image.is_instance_of(base, leaf).unwrap());
        assert_eq!(image.find_class("Middle", Address::NULL).unwrap(), Some(middle));
    }
}
