//! Generational invariants: region flags, the remembered set and cards.

use gccheck::image::{HeapImage, ImageBuilder};
use gccheck::options::OptionOutcome;
use gccheck::reporter::{RecordingReporter, ReportHandle};
use gccheck::target::{Generation, ObjectFlags};
use gccheck::{Address, CheckCycle, CheckEngine, ErrorKind, Invocation, RootSetKind, ScanFlags, parse_options};

const NEW_SPACE: u64 = 0x10_0000;
const OLD_SPACE: u64 = 0x20_0000;

fn run(image: &HeapImage, text: &str) -> ReportHandle {
    let options = match parse_options(text) {
        Ok(OptionOutcome::Options(options)) => options,
        other => panic!("bad options {text:?}: {other:?}"),
    };
    let (reporter, handle) = RecordingReporter::new();
    let mut engine = CheckEngine::new(Box::new(reporter));
    CheckCycle::new(options).run(&mut engine, image, Invocation::LocalGcEnd, ScanFlags::all(), || {});
    handle
}

fn kinds(handle: &ReportHandle) -> Vec<ErrorKind> {
    handle.errors().iter().map(|error| error.kind).collect()
}

struct Heap {
    builder: ImageBuilder,
    class: Address,
    young: Address,
    old: Address,
}

/// One young object referenced from one old object.
fn heap() -> Heap {
    let mut builder = ImageBuilder::new();
    builder.generational();
    builder.class_segment(0x80_0000, 0x1000);
    let class = builder.class("app/Node");
    builder.class_mut(class).unwrap().instance_slots = 1;
    builder.region(NEW_SPACE, 0x1000, Generation::New);
    let young = builder.object(class);
    builder.region(OLD_SPACE, 0x1000, Generation::Old);
    let old = builder.object_with_slots(class, &[young]);
    Heap { builder, class, young, old }
}

#[test]
fn test_old_to_new_needs_remembering() {
    let heap = heap();
    let image = heap.builder.build();

    let handle = run(&image, "all:all:quiet");
    let errors = handle.errors();
    assert_eq!(kinds(&handle), vec![ErrorKind::NewPointerNotRemembered]);
    assert_eq!(errors[0].entity, heap.old);
    assert_eq!(errors[0].slot, Some(heap.old + 16));
}

#[test]
fn test_old_to_new_needs_dirty_card() {
    let mut heap = heap();
    heap.builder.remember(heap.old);
    let image = heap.builder.build();

    let handle = run(&image, "all:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::NewPointerCardNotDirty]);
}

#[test]
fn test_remembered_with_dirty_card_is_clean() {
    let mut heap = heap();
    heap.builder.remember(heap.old).dirty_card(heap.old + 16);
    let image = heap.builder.build();

    let handle = run(&image, "all:all:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_without_card_table_only_remembering_matters() {
    let mut heap = heap();
    heap.builder.remember(heap.old);
    let mut image = heap.builder.build();
    image.cards = None;

    let handle = run(&image, "all:all:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_old_region_object_without_old_flag() {
    let mut heap = heap();
    let stray = heap.builder.object(heap.class);
    heap.builder.object_mut(stray).unwrap().flags = ObjectFlags::empty();
    let image = heap.builder.build();

    let handle = run(&image, "objectheap:all:quiet");
    let errors = handle.errors();
    assert_eq!(kinds(&handle), vec![ErrorKind::NewPointerNotRemembered, ErrorKind::OldSegmentInvalidFlags]);
    assert_eq!(errors[1].entity, stray);
    assert_eq!(handle.snapshot().heap_walk_errors.len(), 1);
}

#[test]
fn test_new_region_object_with_old_flag() {
    let mut heap = heap();
    heap.builder.object_mut(heap.young).unwrap().flags = ObjectFlags::OLD;
    let image = heap.builder.build();

    let handle = run(&image, "objectheap:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::NewSegmentInvalidFlags]);
    assert_eq!(handle.errors()[0].entity, heap.young);
}

#[test]
fn test_old_object_referencing_non_old_object() {
    let mut heap = heap();
    let tenured_without_flag = heap.builder.object(heap.class);
    heap.builder.object_mut(tenured_without_flag).unwrap().flags = ObjectFlags::empty();
    let holder = heap.builder.object_with_slots(heap.class, &[tenured_without_flag]);
    heap.builder.remember(heap.old).dirty_card(heap.old + 16);
    let image = heap.builder.build();

    // Without flag checks the untenured object itself passes.
    let handle = run(&image, "objectheap:classslot:quiet");
    let errors = handle.errors();
    assert_eq!(kinds(&handle), vec![ErrorKind::RememberedSetOldObject]);
    assert_eq!(errors[0].entity, holder);
}

#[test]
fn test_remembered_set_entry_in_new_space() {
    let mut heap = heap();
    heap.builder.remember(heap.old).dirty_card(heap.old + 16);
    heap.builder.remembered_entry(heap.young.raw());
    let image = heap.builder.build();

    let handle = run(&image, "rememberedset:all:quiet");
    let errors = handle.errors();
    assert_eq!(kinds(&handle), vec![ErrorKind::RememberedSetWrongSegment]);
    assert_eq!(errors[0].check, Some(RootSetKind::RememberedSet));
    assert_eq!(errors[0].slot, Some(Address::new(0xC100_0000).slot(1)));
}

#[test]
fn test_remembered_set_entry_without_remembered_flag() {
    let mut heap = heap();
    heap.builder.remembered_entry(heap.old.raw());
    let image = heap.builder.build();

    let handle = run(&image, "rememberedset:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::RememberedSetFlags]);
    assert_eq!(handle.snapshot().header_dumps, vec![heap.old]);
}

#[test]
fn test_deferred_remove_tag_stripped_mid_scavenge() {
    let mut heap = heap();
    heap.builder.remember(heap.old).dirty_card(heap.old + 16);
    heap.builder.remembered_entry(heap.old.raw() | 1);
    let image = heap.builder.build();

    let handle = run(&image, "rememberedset:all:quiet,midscavenge");
    assert!(handle.errors().is_empty());

    let handle = run(&image, "rememberedset:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::Unaligned]);
}

#[test]
fn test_forwarded_pointer_followed_mid_scavenge() {
    let mut heap = heap();
    heap.builder.select_region(NEW_SPACE);
    let copy = heap.builder.object(heap.class);
    heap.builder.object_mut(heap.young).unwrap().forwarded = Some(copy);
    heap.builder.remember(heap.old).dirty_card(heap.old + 16);
    let image = heap.builder.build();

    let handle = run(&image, "objectheap:all:verbose,midscavenge");
    let log = handle.snapshot();
    assert!(log.errors.is_empty());
    assert_eq!(log.forwarded, vec![(heap.young, copy)]);

    // Outside a scavenge the forwarding word is ignored.
    let handle = run(&image, "objectheap:all:quiet");
    assert!(handle.snapshot().forwarded.is_empty());
}

#[test]
fn test_forward_to_unmapped_address_is_reported() {
    let mut heap = heap();
    heap.builder.object_mut(heap.young).unwrap().forwarded = Some(Address::new(0x7777_0000));
    heap.builder.remember(heap.old).dirty_card(heap.old + 16);
    let image = heap.builder.build();

    // The young region is walked first; the old slot must not reuse that result.
    let handle = run(&image, "objectheap:all:verbose,midscavenge");
    let log = handle.snapshot();
    assert_eq!(kinds(&handle), vec![ErrorKind::NotFound]);
    assert_eq!(log.errors[0].entity, heap.old);
    assert_eq!(log.errors[0].slot, Some(heap.old + 16));
    assert_eq!(log.forwarded, vec![(heap.young, Address::new(0x7777_0000))]);
}

#[test]
fn test_class_slot_to_young_object_needs_remembered_class_object() {
    let mut heap = heap();
    let java_lang_class = heap.builder.class("java/lang/Class");
    let holder = heap.builder.class("app/Holder");
    heap.builder.select_region(OLD_SPACE);
    let class_object = heap.builder.object(java_lang_class);
    heap.builder.remember(heap.old).dirty_card(heap.old + 16);
    {
        let record = heap.builder.class_mut(holder).unwrap();
        record.class_object = class_object;
        record.references.push(gccheck::image::ClassReferenceRecord {
            kind: gccheck::target::ClassSlotKind::Slots,
            value: heap.young,
        });
    }
    let image = heap.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    let errors = handle.errors();
    assert_eq!(kinds(&handle), vec![ErrorKind::RememberedSetOldObject]);
    assert_eq!(errors[0].entity, holder);
    assert_eq!(errors[0].slot, Some(holder + 0x40));
}

#[test]
fn test_class_object_must_be_java_lang_class() {
    let mut heap = heap();
    let holder = heap.builder.class("app/Holder");
    heap.builder.class_mut(holder).unwrap().class_object = heap.old;
    heap.builder.remember(heap.old).dirty_card(heap.old + 16);
    let image = heap.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::ClassObjectNotJavaLangClass]);
}
