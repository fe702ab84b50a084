//! Dead-object fixer.
//!
//! A pre-pass that rewrites every unmarked heap span into a canonical hole
//! so that later walks, which may have no mark map, can tell intentional
//! holes from corruption. Adjacent dead spans are merged into one hole.

use thiserror::Error;
use tracing::{debug, info};

use crate::address::Address;
use crate::checks::{HeapWalk, RootSetKind, WalkFault};
use crate::cycle::Invocation;
use crate::engine::CheckEngine;
use crate::error::ReadFault;
use crate::options::CheckOptions;
use crate::target::{HeapEntry, RegionDescriptor, Target};

/// Mutation access needed by the fixer.
pub trait HeapFixup: Target {
    /// A mark map from the last marking phase exists
    fn mark_map_available(&self) -> bool;

    /// Was `object` marked live
    fn is_marked(&self, object: Address) -> Result<bool, ReadFault>;

    /// Rewrite `[address, address + size)` as a single hole
    fn make_dead(&mut self, address: Address, size: u64) -> Result<(), ReadFault>;
}

/// Fixer failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixupError {
    /// Liveness is unknown without a mark map
    #[error("no mark map available")]
    MarkMapUnavailable,
    /// The heap is not walkable
    #[error("heap walk stopped at {address}")]
    Walk {
        /// Entry the walk could not step over
        address: Address,
    },
    /// Target memory could not be read
    #[error(transparent)]
    Read(#[from] ReadFault),
}

/// What the fixer did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixupStats {
    /// Regions walked
    pub regions: u64,
    /// Marked objects kept
    pub live_objects: u64,
    /// Unmarked objects turned into holes
    pub dead_objects: u64,
    /// Holes written
    pub holes_written: u64,
    /// Bytes covered by written holes
    pub dead_bytes: u64,
    /// Errors raised verifying live objects
    pub errors: u64,
}

/// A run of dead entries.
#[derive(Debug, Clone, Copy)]
struct DeadSpan {
    start: Address,
    size: u64,
    entries: u64,
    /// The run is a single entry that is already a hole
    canonical: bool,
}

/// Live objects and dead spans of one region, in address order.
fn classify_region<T: HeapFixup>(
    target: &T,
    region: RegionDescriptor,
    stats: &mut FixupStats,
) -> Result<(Vec<Address>, Vec<DeadSpan>), FixupError> {
    let mut live = Vec::new();
    let mut dead: Vec<DeadSpan> = Vec::new();
    let mut open = false;

    for step in HeapWalk::new(target, region) {
        let entry = match step {
            Ok(entry) => entry,
            Err(WalkFault::Overrun { address }) => return Err(FixupError::Walk { address }),
            Err(WalkFault::Read(fault)) => return Err(fault.into()),
        };
        let is_live = match entry.entry {
            HeapEntry::Object => target.is_marked(entry.address)?,
            HeapEntry::Hole(_) => false,
        };
        if is_live {
            live.push(entry.address);
            open = false;
            continue;
        }
        if entry.entry == HeapEntry::Object {
            stats.dead_objects += 1;
        }
        let is_hole = matches!(entry.entry, HeapEntry::Hole(_));
        match dead.last_mut() {
            Some(span) if open => {
                span.size += entry.size;
                span.entries += 1;
                span.canonical = false;
            }
            _ => {
                dead.push(DeadSpan {
                    start: entry.address,
                    size: entry.size,
                    entries: 1,
                    canonical: is_hole,
                });
                open = true;
            }
        }
    }
    Ok((live, dead))
}

/// Canonicalize unmarked spans, optionally verifying live objects after.
///
/// Verification runs an object-heap pass of its own through `verify`,
/// restricted to the marked objects.
pub fn fix_dead_objects<T: HeapFixup>(
    target: &mut T,
    verify: Option<(&mut CheckEngine, &CheckOptions)>,
) -> Result<FixupStats, FixupError> {
    if !target.mark_map_available() {
        return Err(FixupError::MarkMapUnavailable);
    }

    let mut stats = FixupStats::default();
    let regions = target.object_regions().collect::<Result<Vec<_>, _>>()?;
    let mut survivors = Vec::new();
    let mut rewrites = Vec::new();

    for region in &regions {
        stats.regions += 1;
        let (live, dead) = classify_region(&*target, *region, &mut stats)?;
        stats.live_objects += live.len() as u64;
        survivors.extend(live.into_iter().map(|object| (object, *region)));
        rewrites.extend(dead.into_iter().filter(|span| !span.canonical));
    }

    for span in &rewrites {
        target.make_dead(span.start, span.size)?;
        stats.holes_written += 1;
        stats.dead_bytes += span.size;
        debug!(target: "gccheck", start = %span.start, size = span.size, entries = span.entries, "hole written");
    }

    if let Some((engine, options)) = verify {
        let target: &dyn Target = &*target;
        engine.start_check_cycle(target, options, Invocation::Unknown);
        engine.start_new_check(RootSetKind::ObjectHeap);
        for (object, region) in &survivors {
            engine.check_object_heap_entry(target, *object, &HeapEntry::Object, region);
        }
        stats.errors = engine.end_check_cycle(target);
    }

    info!(
        target: "gccheck",
        regions = stats.regions,
        live = stats.live_objects,
        dead = stats.dead_objects,
        holes = stats.holes_written,
        "dead objects fixed"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuilder;
    use crate::target::{Generation, ObjectModel};

    #[test]
    fn test_requires_mark_map() {
        let mut image = ImageBuilder::new().build();
        assert_eq!(fix_dead_objects(&mut image, None), Err(FixupError::MarkMapUnavailable));
    }

    #[test]
    fn test_adjacent_dead_objects_merge() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let class = builder.class("Thing");
        builder.region(0x10_0000, 0x100, Generation::Undifferentiated);
        let live = builder.object(class);
        let dead_a = builder.object(class);
        let _dead_b = builder.object(class);
        builder.mark(live);
        let mut image = builder.build();

        let stats = fix_dead_objects(&mut image, None).unwrap();
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.dead_objects, 2);
        assert_eq!(stats.holes_written, 1);
        match image.heap_entry(dead_a).unwrap() {
            HeapEntry::Hole(info) => assert_eq!(info.size, 0x100 - 16),
            HeapEntry::Object => panic!("expected a hole"),
        }
        assert_eq!(image.heap_entry(live).unwrap(), HeapEntry::Object);
    }
}
