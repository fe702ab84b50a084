//! Object heap and class heap walks.

use tracing::debug;

use crate::address::{Address, POINTER_SIZE};
use crate::engine::{CheckEngine, Site, SlotOutcome};
use crate::error::{EntityKind, ErrorKind, ReadFault};
use crate::reporter::ScanFormatter;
use crate::target::{HeapEntry, RegionDescriptor, Target};

/// One position of a region walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapWalkEntry {
    /// Where the entry starts
    pub address: Address,
    /// What sits there
    pub entry: HeapEntry,
    /// Bytes up to the next entry
    pub size: u64,
}

/// Why a region walk stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFault {
    /// An entry could not be read
    Read(ReadFault),
    /// An entry's size runs past the region end, or is zero
    Overrun {
        /// The offending entry
        address: Address,
    },
}

/// Linear walk of one object region, entry by entry.
///
/// Yields each entry before checking that its size lets the walk advance,
/// so the entry itself can still be verified; the overrun follows as the
/// next item and ends the walk.
pub struct HeapWalk<'a> {
    target: &'a dyn Target,
    region: RegionDescriptor,
    cursor: Address,
    pending: Option<WalkFault>,
    done: bool,
}

impl<'a> HeapWalk<'a> {
    /// Walk `region` from its start
    pub fn new(target: &'a dyn Target, region: RegionDescriptor) -> Self {
        Self {
            target,
            region,
            cursor: region.start,
            pending: None,
            done: false,
        }
    }

    fn entry_size(&self, entry: &HeapEntry) -> Result<u64, ReadFault> {
        match entry {
            HeapEntry::Hole(info) if info.single_slot => Ok(POINTER_SIZE),
            HeapEntry::Hole(info) => Ok(info.size),
            HeapEntry::Object => self.target.object_size(self.cursor),
        }
    }
}

impl Iterator for HeapWalk<'_> {
    type Item = Result<HeapWalkEntry, WalkFault>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(fault) = self.pending.take() {
            self.done = true;
            return Some(Err(fault));
        }
        if self.done || self.cursor >= self.region.end() {
            return None;
        }

        let address = self.cursor;
        let step = self
            .target
            .heap_entry(address)
            .and_then(|entry| Ok((entry, self.entry_size(&entry)?)));
        let (entry, size) = match step {
            Ok(step) => step,
            Err(fault) => {
                self.done = true;
                return Some(Err(WalkFault::Read(fault)));
            }
        };

        match address.checked_add(size) {
            Some(next) if size != 0 && next <= self.region.end() => self.cursor = next,
            _ => self.pending = Some(WalkFault::Overrun { address }),
        }
        Some(Ok(HeapWalkEntry { address, entry, size }))
    }
}

pub(super) fn check_object_heap(engine: &mut CheckEngine, target: &dyn Target) {
    let checking = engine.checking();
    let mut scan = engine
        .scanning()
        .then(|| ScanFormatter::new("objectHeap", Address::NULL));
    let mut visited = 0u64;

    'regions: for region in target.object_regions() {
        let region = match region {
            Ok(region) => region,
            Err(fault) => {
                engine.raise(target, Site::new(fault.address, EntityKind::None), ErrorKind::CorruptData);
                break;
            }
        };
        if let Some(scan) = scan.as_mut() {
            scan.section("region", region.start);
        }

        for step in HeapWalk::new(target, region) {
            match step {
                Ok(entry) => {
                    visited += 1;
                    if let (Some(scan), HeapEntry::Object) = (scan.as_mut(), entry.entry) {
                        scan.entry(entry.address);
                    }
                    if checking
                        && engine.check_object_heap_entry(target, entry.address, &entry.entry, &region)
                            == SlotOutcome::Unrecoverable
                    {
                        break 'regions;
                    }
                }
                Err(WalkFault::Overrun { address }) => {
                    if checking {
                        engine.raise_heap_walk_error(
                            target,
                            Site::object(address, "Object "),
                            ErrorKind::OverlapsSegmentBoundary,
                        );
                    }
                    break 'regions;
                }
                Err(WalkFault::Read(fault)) => {
                    if checking {
                        engine.raise_heap_walk_error(
                            target,
                            Site::object(fault.address, "Object "),
                            ErrorKind::CorruptData,
                        );
                    }
                    break 'regions;
                }
            }
        }
    }

    debug!(target: "gccheck", entries = visited, "object heap walked");
    if let Some(scan) = scan {
        for line in scan.finish() {
            engine.note(&line);
        }
    }
}

pub(super) fn check_class_heap(engine: &mut CheckEngine, target: &dyn Target) {
    let checking = engine.checking();
    let mut scan = engine
        .scanning()
        .then(|| ScanFormatter::new("classHeap", Address::NULL));

    'segments: for segment in target.class_segments() {
        let segment = match segment {
            Ok(segment) => segment,
            Err(fault) => {
                engine.raise(target, Site::new(fault.address, EntityKind::None), ErrorKind::CorruptData);
                break;
            }
        };
        if let Some(scan) = scan.as_mut() {
            scan.section("segment", segment.start);
        }
        for class in target.classes_in_segment(&segment) {
            let class = match class {
                Ok(class) => class,
                Err(fault) => {
                    engine.raise(target, Site::class(fault.address, "Class "), ErrorKind::CorruptData);
                    break 'segments;
                }
            };
            if let Some(scan) = scan.as_mut() {
                scan.entry(class);
            }
            if checking {
                engine.verify_class_heap_entry(target, class, &segment);
            }
        }
    }

    if let Some(scan) = scan {
        for line in scan.finish() {
            engine.note(&line);
        }
    }
}
