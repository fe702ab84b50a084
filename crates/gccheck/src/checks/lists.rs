//! Finalization and ownable-synchronizer worklists.

use rustc_hash::FxHashSet;

use crate::address::Address;
use crate::engine::{CheckEngine, Site, SlotOutcome};
use crate::error::{EntityKind, ErrorKind, ReadFault};
use crate::reporter::ScanFormatter;
use crate::target::{ListKind, ObjectList, Target, Walk};

/// A list member and whatever holds the link to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListNode {
    /// The list structure for the head, otherwise the previous member
    pub holder: Address,
    /// The member
    pub object: Address,
}

/// Why a list traversal stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFault {
    /// `object` was reached a second time
    Circular {
        /// First revisited member
        object: Address,
    },
    /// A link could not be read
    Read(ReadFault),
}

/// Traversal of one intrusive object list.
///
/// Ownable-synchronizer lists end on a member linking to itself; the
/// others end on null.
pub struct ObjectListWalk<'a> {
    target: &'a dyn Target,
    kind: ListKind,
    holder: Address,
    current: Address,
    last: Option<Address>,
    visited: FxHashSet<Address>,
    done: bool,
}

impl<'a> ObjectListWalk<'a> {
    /// Walk `list` following `kind` links
    pub fn new(target: &'a dyn Target, list: &ObjectList, kind: ListKind) -> Self {
        Self {
            target,
            kind,
            holder: list.address,
            current: list.head,
            last: None,
            visited: FxHashSet::default(),
            done: false,
        }
    }

    fn advance(&mut self, from: Address) -> Result<(), ReadFault> {
        let next = self.target.list_next(from, self.kind)?;
        if self.kind == ListKind::OwnableSynchronizer && next == from {
            self.current = Address::NULL;
        } else {
            self.current = next;
        }
        self.holder = from;
        Ok(())
    }
}

impl Iterator for ObjectListWalk<'_> {
    type Item = Result<ListNode, ListFault>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(last) = self.last.take() {
            if let Err(fault) = self.advance(last) {
                self.done = true;
                return Some(Err(ListFault::Read(fault)));
            }
        }
        if self.current.is_null() {
            self.done = true;
            return None;
        }
        if !self.visited.insert(self.current) {
            self.done = true;
            return Some(Err(ListFault::Circular { object: self.current }));
        }
        self.last = Some(self.current);
        Some(Ok(ListNode {
            holder: self.holder,
            object: self.current,
        }))
    }
}

/// What differs between the three list checks.
struct ListCheck {
    name: &'static str,
    kind: ListKind,
    entity_kind: EntityKind,
    circular: ErrorKind,
    verify: fn(&mut CheckEngine, &dyn Target, Address, Address) -> SlotOutcome,
}

fn check_lists(engine: &mut CheckEngine, target: &dyn Target, lists: Walk<'_, ObjectList>, check: &ListCheck) {
    let checking = engine.checking();
    let mut scan = engine
        .scanning()
        .then(|| ScanFormatter::new(check.name, Address::NULL));

    for list in lists {
        let list = match list {
            Ok(list) => list,
            Err(fault) => {
                engine.raise(target, Site::new(fault.address, check.entity_kind), ErrorKind::CorruptData);
                break;
            }
        };
        if let Some(scan) = scan.as_mut() {
            scan.section("list", list.address);
        }

        for node in ObjectListWalk::new(target, &list, check.kind) {
            match node {
                Ok(node) => {
                    if let Some(scan) = scan.as_mut() {
                        scan.entry(node.object);
                    }
                    if checking {
                        (check.verify)(engine, target, node.holder, node.object);
                    }
                }
                Err(ListFault::Circular { object }) => {
                    if checking {
                        engine.raise(target, Site::new(list.address, check.entity_kind).slot(object), check.circular);
                    }
                }
                Err(ListFault::Read(fault)) => {
                    if checking {
                        engine.raise(
                            target,
                            Site::new(list.address, check.entity_kind).slot(fault.address),
                            ErrorKind::CorruptData,
                        );
                    }
                }
            }
        }
    }

    if let Some(scan) = scan {
        for line in scan.finish() {
            engine.note(&line);
        }
    }
}

pub(super) fn check_unfinalized(engine: &mut CheckEngine, target: &dyn Target) {
    let check = ListCheck {
        name: "unfinalized",
        kind: ListKind::Unfinalized,
        entity_kind: EntityKind::UnfinalizedList,
        circular: ErrorKind::ObjectListCircular,
        verify: CheckEngine::verify_slot_unfinalized,
    };
    check_lists(engine, target, target.unfinalized_lists(), &check);
}

pub(super) fn check_finalizable(engine: &mut CheckEngine, target: &dyn Target) {
    let check = ListCheck {
        name: "finalizable",
        kind: ListKind::Finalizable,
        entity_kind: EntityKind::FinalizableList,
        circular: ErrorKind::ObjectListCircular,
        verify: CheckEngine::verify_slot_finalizable,
    };
    check_lists(engine, target, target.finalizable_lists(), &check);
}

pub(super) fn check_ownable_synchronizer(engine: &mut CheckEngine, target: &dyn Target) {
    let check = ListCheck {
        name: "ownableSynchronizer",
        kind: ListKind::OwnableSynchronizer,
        entity_kind: EntityKind::OwnableSynchronizerList,
        circular: ErrorKind::OwnableSynchronizerListCircular,
        verify: CheckEngine::verify_slot_ownable_synchronizer,
    };
    check_lists(engine, target, target.ownable_synchronizer_lists(), &check);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuilder;
    use crate::target::{Generation, RootSets};

    fn members(image: &dyn Target, list: &ObjectList, kind: ListKind) -> Vec<Result<ListNode, ListFault>> {
        ObjectListWalk::new(image, list, kind).collect()
    }

    #[test]
    fn test_ownable_tail_links_to_itself() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let class = builder.class("Lock");
        builder.region(0x10_0000, 0x1000, Generation::Undifferentiated);
        let a = builder.object(class);
        let b = builder.object(class);
        builder.ownable_synchronizer_list(&[a, b]);
        let image = builder.build();

        let list = image.ownable_synchronizer_lists().next().unwrap().unwrap();
        let nodes = members(&image, &list, ListKind::OwnableSynchronizer);
        assert_eq!(
            nodes,
            vec![
                Ok(ListNode { holder: list.address, object: a }),
                Ok(ListNode { holder: a, object: b }),
            ]
        );
    }

    #[test]
    fn test_circular_list_stops() {
        let mut builder = ImageBuilder::new();
        builder.class_segment(0x80_0000, 0x1000);
        let class = builder.class("Finalizee");
        builder.region(0x10_0000, 0x1000, Generation::Undifferentiated);
        let a = builder.object(class);
        let b = builder.object(class);
        builder.unfinalized_list(&[a, b]);
        builder.object_mut(b).unwrap().unfinalized_next = a;
        let image = builder.build();

        let list = image.unfinalized_lists().next().unwrap().unwrap();
        let nodes = members(&image, &list, ListKind::Unfinalized);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2], Err(ListFault::Circular { object: a }));
    }
}
