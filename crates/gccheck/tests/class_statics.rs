//! Class heap: statics, hot swap, class pointer slots and the fixer.

use gccheck::image::{HeapImage, ImageBuilder, RootPool};
use gccheck::options::OptionOutcome;
use gccheck::reporter::{RecordingReporter, ReportHandle};
use gccheck::target::{ClassFlags, Generation};
use gccheck::{
    Address, CheckCycle, CheckEngine, CheckOptions, EntityKind, ErrorKind, Invocation, ScanFlags, fix_dead_objects,
    parse_options,
};

fn options(text: &str) -> CheckOptions {
    match parse_options(text) {
        Ok(OptionOutcome::Options(options)) => options,
        other => panic!("bad options {text:?}: {other:?}"),
    }
}

fn run(image: &HeapImage, text: &str) -> ReportHandle {
    let (reporter, handle) = RecordingReporter::new();
    let mut engine = CheckEngine::new(Box::new(reporter));
    CheckCycle::new(options(text)).run(&mut engine, image, Invocation::GlobalGcEnd, ScanFlags::all(), || {});
    handle
}

fn kinds(handle: &ReportHandle) -> Vec<ErrorKind> {
    handle.errors().iter().map(|error| error.kind).collect()
}

struct Classes {
    builder: ImageBuilder,
    holder: Address,
    node: Address,
    other: Address,
}

/// A holder class plus one instance each of two unrelated classes.
fn classes() -> Classes {
    let mut builder = ImageBuilder::new();
    builder.class_segment(0x80_0000, 0x2000);
    let node_class = builder.class("app/Node");
    let other_class = builder.class("app/Other");
    let holder = builder.class("app/Holder");
    builder.region(0x10_0000, 0x1000, Generation::Undifferentiated);
    let node = builder.object(node_class);
    let other = builder.object(other_class);
    Classes {
        builder,
        holder,
        node,
        other,
    }
}

#[test]
fn test_statics_matching_declarations_are_clean() {
    let mut fixture = classes();
    fixture.builder.statics(
        fixture.holder,
        &[
            ("count", "I", Address::new(5)),
            ("head", "Lapp/Node;", fixture.node),
            ("unset", "Lapp/Other;", Address::NULL),
            ("unloaded", "Lapp/Missing;", fixture.other),
        ],
    );
    let image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_static_pointing_at_wrong_type() {
    let mut fixture = classes();
    let window = fixture
        .builder
        .statics(fixture.holder, &[("head", "Lapp/Node;", fixture.other)]);
    let image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    let errors = handle.errors();
    assert_eq!(kinds(&handle), vec![ErrorKind::ClassStaticsFieldPointsWrongObject]);
    assert_eq!(errors[0].entity, fixture.holder);
    assert_eq!(errors[0].entity_kind, EntityKind::Class);
    assert_eq!(errors[0].slot, Some(window));
}

#[test]
fn test_static_outside_scanning_window() {
    let mut fixture = classes();
    let window = fixture
        .builder
        .statics(fixture.holder, &[("head", "Lapp/Node;", fixture.node)]);
    fixture.builder.class_mut(fixture.holder).unwrap().statics = window.slot(1);
    let image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::ClassStaticsReferenceNotInScanningRange]);
    assert_eq!(handle.errors()[0].slot, Some(window));
}

#[test]
fn test_declared_reference_count_mismatch() {
    let mut fixture = classes();
    fixture
        .builder
        .statics(fixture.holder, &[("head", "Lapp/Node;", fixture.node)]);
    fixture.builder.class_mut(fixture.holder).unwrap().object_static_count = 2;
    let image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::ClassStaticsWrongNumberOfReferences]);
    assert_eq!(handle.errors()[0].slot, None);
}

#[test]
fn test_hot_swapped_array_class() {
    let mut fixture = classes();
    fixture
        .builder
        .statics(fixture.holder, &[("head", "Lapp/Node;", fixture.node)]);
    fixture.builder.class_mut(fixture.holder).unwrap().flags = ClassFlags::HOT_SWAPPED_OUT | ClassFlags::ARRAY;
    let image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::ClassHotSwappedForArray]);
}

#[test]
fn test_hot_swapped_class_without_statics() {
    let mut fixture = classes();
    {
        let record = fixture.builder.class_mut(fixture.holder).unwrap();
        record.flags = ClassFlags::HOT_SWAPPED_OUT;
        record.object_static_count = 1;
    }
    let mut image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::ClassHotSwapInconsistent]);

    // Extended hot swap may drop the statics.
    image.configuration.extended_hot_swap = true;
    let handle = run(&image, "classheap:all:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_reused_statics_are_not_validated() {
    let mut fixture = classes();
    fixture
        .builder
        .statics(fixture.holder, &[("head", "Lapp/Node;", fixture.other)]);
    {
        let record = fixture.builder.class_mut(fixture.holder).unwrap();
        record.flags = ClassFlags::HOT_SWAPPED_OUT | ClassFlags::REUSED_STATICS;
        record.object_static_count = 3;
    }
    let image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_replaced_class_needs_hot_swap_flag() {
    let mut fixture = classes();
    let previous = fixture.builder.class("app/Holder");
    fixture.builder.class_mut(fixture.holder).unwrap().replaced_class = previous;
    let mut image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    let errors = handle.errors();
    assert_eq!(kinds(&handle), vec![ErrorKind::ReplacedClassHasNoHotswapFlag]);
    assert_eq!(errors[0].entity, fixture.holder);

    image.classes.get_mut(&previous).unwrap().flags = ClassFlags::HOT_SWAPPED_OUT;
    let handle = run(&image, "classheap:all:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_superclass_in_undead_segment() {
    let mut fixture = classes();
    fixture.builder.undead_class_segment(0x90_0000, 0x1000);
    let zombie = fixture.builder.class("app/Zombie");
    fixture.builder.extends(fixture.holder, zombie);
    let image = fixture.builder.build();

    let handle = run(&image, "classheap:all:quiet");
    let errors = handle.errors();
    assert_eq!(kinds(&handle), vec![ErrorKind::ClassIsUndead]);
    assert_eq!(errors[0].entity, fixture.holder);
    assert_eq!(errors[0].slot, Some(fixture.holder + 0x40));
}

#[test]
fn test_undead_class_allowed_for_live_objects() {
    let mut fixture = classes();
    fixture.builder.undead_class_segment(0x90_0000, 0x1000);
    let zombie = fixture.builder.class("app/Zombie");
    fixture.builder.select_region(0x10_0000);
    fixture.builder.object(zombie);
    let image = fixture.builder.build();

    let handle = run(&image, "objectheap:all:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_class_past_segment_allocation() {
    let mut fixture = classes();
    fixture.builder.root(RootPool::VmClassSlots, fixture.holder);
    let mut image = fixture.builder.build();
    image.class_segments[0].alloc = fixture.holder + 0x20;

    let handle = run(&image, "vmclassslots:all:quiet");
    assert_eq!(kinds(&handle), vec![ErrorKind::ClassInvalidRange]);

    // Range checking is optional.
    let handle = run(&image, "vmclassslots:classslot:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_class_verification_is_memoized_per_cycle() {
    let fixture = classes();
    let holder = fixture.holder;
    let image = fixture.builder.build();
    let options = options("all:all:quiet");
    let (reporter, handle) = RecordingReporter::new();
    let mut engine = CheckEngine::new(Box::new(reporter));

    engine.start_check_cycle(&image, &options, Invocation::Manual(0));
    let before = image.stats.class_header_reads.get();
    assert_eq!(engine.verify_class_pointer(&image, holder, false), Ok(()));
    let after_first = image.stats.class_header_reads.get();
    assert_eq!(engine.verify_class_pointer(&image, holder, false), Ok(()));
    assert_eq!(after_first, before + 1);
    assert_eq!(image.stats.class_header_reads.get(), after_first);

    // The undead policy is part of the key.
    assert_eq!(engine.verify_class_pointer(&image, holder, true), Ok(()));
    assert_eq!(image.stats.class_header_reads.get(), after_first + 1);
    engine.end_check_cycle(&image);

    engine.start_check_cycle(&image, &options, Invocation::Manual(0));
    assert_eq!(engine.verify_class_pointer(&image, holder, false), Ok(()));
    assert_eq!(image.stats.class_header_reads.get(), after_first + 2);
    assert!(handle.errors().is_empty());
}

#[test]
fn test_fixer_then_full_cycle() {
    let mut builder = ImageBuilder::new();
    builder.class_segment(0x80_0000, 0x1000);
    let class = builder.class("app/Node");
    builder.class_mut(class).unwrap().instance_slots = 1;
    builder.region(0x10_0000, 0x1000, Generation::Undifferentiated);
    let kept = builder.object(class);
    let garbage = builder.object(class);
    let survivor = builder.object_with_slots(class, &[kept]);
    builder.mark(kept).mark(survivor);
    // Unmarked and corrupt: only the fixer makes this heap walkable.
    builder.object_mut(garbage).unwrap().class = Address::new(0x7000_0000);
    let mut image = builder.build();

    let (reporter, handle) = RecordingReporter::new();
    let mut engine = CheckEngine::new(Box::new(reporter));
    let stats = fix_dead_objects(&mut image, Some((&mut engine, &options("all:all:quiet")))).unwrap();
    assert_eq!(stats.live_objects, 2);
    assert_eq!(stats.dead_objects, 1);
    assert_eq!(stats.errors, 0);
    assert!(handle.errors().is_empty());

    let handle = run(&image, "all:all:quiet");
    assert!(handle.errors().is_empty());
}

#[test]
fn test_fixer_verification_finds_reference_to_dead_object() {
    let mut builder = ImageBuilder::new();
    builder.class_segment(0x80_0000, 0x1000);
    let class = builder.class("app/Node");
    builder.class_mut(class).unwrap().instance_slots = 1;
    builder.region(0x10_0000, 0x1000, Generation::Undifferentiated);
    let dropped = builder.object(class);
    let holder = builder.object_with_slots(class, &[dropped]);
    builder.mark(holder);
    let mut image = builder.build();

    let (reporter, handle) = RecordingReporter::new();
    let mut engine = CheckEngine::new(Box::new(reporter));
    let stats = fix_dead_objects(&mut image, Some((&mut engine, &options("all:all:quiet")))).unwrap();
    assert_eq!(stats.errors, 1);
    let errors = handle.errors();
    assert_eq!(errors[0].kind, ErrorKind::CorruptData);
    assert_eq!(errors[0].entity, holder);
    assert_eq!(errors[0].slot, Some(holder + 16));
}
