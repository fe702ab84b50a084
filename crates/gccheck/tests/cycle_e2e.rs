//! Full check cycles over built heap images.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use gccheck::image::{HeapImage, ImageBuilder};
use gccheck::options::OptionOutcome;
use gccheck::reporter::{RecordingReporter, ReportHandle, TextReporter};
use gccheck::target::Generation;
use gccheck::{
    Address, CheckCycle, CheckEngine, ErrorKind, GcCheckContext, Invocation, RootSetKind, ScanFlags, parse_options,
};
use parking_lot::Mutex;

fn options(text: &str) -> gccheck::CheckOptions {
    match parse_options(text) {
        Ok(OptionOutcome::Options(options)) => options,
        other => panic!("bad options {text:?}: {other:?}"),
    }
}

fn run(image: &HeapImage, text: &str) -> (gccheck::CycleSummary, ReportHandle) {
    let (reporter, handle) = RecordingReporter::new();
    let mut engine = CheckEngine::new(Box::new(reporter));
    let mut cycle = CheckCycle::new(options(text));
    let summary = cycle.run(&mut engine, image, Invocation::Manual(1), ScanFlags::all(), || {});
    (summary, handle)
}

/// Three plain objects, one referencing the next.
fn small_heap() -> (ImageBuilder, Address, Vec<Address>) {
    let mut builder = ImageBuilder::new();
    builder.class_segment(0x80_0000, 0x1000);
    let class = builder.class("app/Node");
    builder.class_mut(class).unwrap().instance_slots = 1;
    builder.region(0x10_0000, 0x1000, Generation::Undifferentiated);
    let c = builder.object(class);
    let b = builder.object_with_slots(class, &[c]);
    let a = builder.object_with_slots(class, &[b]);
    (builder, class, vec![a, b, c])
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_clean_heap_has_no_errors() {
    let (builder, _, _) = small_heap();
    let image = builder.build();

    let (summary, handle) = run(&image, "all:all:quiet");
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.checks_run, 15);
    assert!(!summary.aborted);
    assert!(handle.errors().is_empty());
}

#[test]
fn test_clean_heap_with_default_options() {
    let (builder, _, _) = small_heap();
    let image = builder.build();

    let (summary, handle) = run(&image, "");
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.checks_run, 15);
    assert!(handle.errors().is_empty());

    // Defaults are verbose: one banner pair per check plus the cycle banners.
    let notes = handle.notes();
    assert_eq!(notes.first().map(String::as_str), Some("checking heap (manual invocation 1)"));
    assert_eq!(
        notes.last().map(String::as_str),
        Some("done checking (manual invocation 1): 15 checks, 0 errors")
    );
    assert_eq!(notes.iter().filter(|note| note.starts_with("start of ")).count(), 15);
    assert_eq!(notes.iter().filter(|note| note.starts_with("end of ")).count(), 15);
}

#[test]
fn test_misaligned_class_pointer_stops_only_object_heap() {
    let (mut builder, class, objects) = small_heap();
    builder.object_mut(objects[1]).unwrap().class = class + 8;
    let image = builder.build();

    let (summary, handle) = run(&image, "all:all:quiet");
    let errors = handle.errors();
    assert_eq!(summary.errors, 1);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::ClassPointerUnaligned);
    assert_eq!(errors[0].check, Some(RootSetKind::ObjectHeap));
    assert_eq!(errors[0].entity, objects[1]);
    // The later checks still ran.
    assert_eq!(summary.checks_run, 15);

    let log = handle.snapshot();
    assert_eq!(log.heap_walk_errors.len(), 1);
}

#[test]
fn test_dangling_slot_is_reported_with_slot_address() {
    let (mut builder, _, objects) = small_heap();
    builder.object_mut(objects[0]).unwrap().slots[0] = Address::new(0x7000_0000);
    let image = builder.build();

    let (summary, handle) = run(&image, "heap:all:quiet");
    let errors = handle.errors();
    assert_eq!(summary.errors, 1);
    assert_eq!(errors[0].kind, ErrorKind::NotFound);
    assert_eq!(errors[0].entity, objects[0]);
    assert_eq!(errors[0].slot, Some(objects[0] + 16));
}

#[test]
fn test_unaligned_hole_ends_walk() {
    let (mut builder, class, _) = small_heap();
    let hole = builder.hole(24);
    let after = builder.object(class);
    let mut image = builder.build();
    image.holes.get_mut(&hole).unwrap().size = 20;
    image.objects.get_mut(&after).unwrap().class = Address::NULL;

    let (summary, handle) = run(&image, "objectheap:all:quiet");
    let errors = handle.errors();
    assert_eq!(summary.errors, 1);
    assert_eq!(errors[0].kind, ErrorKind::DeadObjectSizeNotAligned);
    assert_eq!(handle.snapshot().heap_walk_errors.len(), 1);
}

#[test]
fn test_bad_hole_link_is_recoverable() {
    let (mut builder, class, objects) = small_heap();
    let hole = builder.hole(32);
    let after = builder.object(class);
    let mut image = builder.build();
    image.holes.get_mut(&hole).unwrap().next = objects[0];
    image.objects.get_mut(&after).unwrap().class = Address::NULL;

    let (summary, handle) = run(&image, "objectheap:all:quiet");
    let kinds: Vec<_> = handle.errors().iter().map(|error| error.kind).collect();
    // The walk went on past the hole and found the null class.
    assert_eq!(kinds, vec![ErrorKind::DeadObjectNextIsNotHole, ErrorKind::NullClassPointer]);
    assert_eq!(summary.errors, 2);
}

#[test]
fn test_unloaded_class_does_not_stop_walk() {
    let (mut builder, _, _) = small_heap();
    let dying = builder.class("app/Dying");
    builder.class_mut(dying).unwrap().flags |= gccheck::target::ClassFlags::DYING;
    let zombie = builder.object(dying);
    let broken = builder.object_with_slots(dying, &[]);
    let mut image = builder.build();
    image.objects.get_mut(&broken).unwrap().class = Address::new(0x7100_0000);

    let (_, handle) = run(&image, "objectheap:all:quiet");
    let errors = handle.errors();
    assert_eq!(errors[0].kind, ErrorKind::ClassIsUnloaded);
    assert_eq!(errors[0].entity, zombie);
    assert_eq!(errors[1].kind, ErrorKind::ClassNotFound);
    assert_eq!(errors[1].entity, broken);
}

#[test]
fn test_read_fault_becomes_corrupt_data() {
    let (builder, _, _) = small_heap();
    let mut image = builder.build();
    image.roots.pools.insert(
        gccheck::image::RootPool::JniGlobalRefs,
        gccheck::image::PoolRecord {
            owner: Address::new(0xC000_2000),
            entries: vec![Address::new(0x10_0ff8)],
        },
    );

    let (_, handle) = run(&image, "jniglobalrefs:all:quiet");
    let errors = handle.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::CorruptData);
    assert_eq!(errors[0].slot, Some(Address::new(0xC000_2000)));
}

#[test]
fn test_max_errors_limits_rendering_not_counting() {
    let (mut builder, _, objects) = small_heap();
    builder.object_mut(objects[0]).unwrap().slots[0] = Address::new(0x7000_0000);
    builder.object_mut(objects[1]).unwrap().slots[0] = Address::new(0x7000_1000);
    let image = builder.build();

    let buffer = SharedBuffer::default();
    let mut engine = CheckEngine::new(Box::new(TextReporter::new(buffer.clone())));
    let mut cycle = CheckCycle::new(options("objectheap:all:quiet,maxerrors=1"));
    let summary = cycle.run(&mut engine, &image, Invocation::GlobalGcStart, ScanFlags::all(), || {});

    assert_eq!(summary.errors, 2);
    let text = buffer.text();
    assert_eq!(text.matches("<gc check (").count(), 1);
    assert!(text.contains("start of global GC: objectHeap: Object "));
    assert!(text.contains("pointer not found in any region"));
}

#[test]
fn test_verbose_and_scan_notes() {
    let (builder, _, objects) = small_heap();
    let image = builder.build();

    let (_, handle) = run(&image, "objectheap:all:verbose,scan");
    let notes = handle.notes();
    assert!(notes.iter().any(|note| note.starts_with("checking heap")));
    assert!(notes.iter().any(|note| note == "start of objectHeap"));
    assert!(notes.iter().any(|note| note.contains(&format!("{:x}", objects[0].raw()))));
    assert!(notes.iter().any(|note| note.starts_with("done checking")));
}

#[test]
fn test_nocheck_reports_nothing() {
    let (mut builder, _, objects) = small_heap();
    builder.object_mut(objects[0]).unwrap().slots[0] = Address::new(0x7000_0000);
    let image = builder.build();

    let (summary, _) = run(&image, "all:all:quiet,nocheck");
    assert_eq!(summary.errors, 0);
}

#[test]
fn test_global_interval_through_hooks() {
    let (builder, _, _) = small_heap();
    let image = builder.build();
    let (reporter, _handle) = RecordingReporter::new();
    let mut ctx = GcCheckContext::initialize("all:all:quiet,globalinterval=2", Box::new(reporter)).unwrap();

    let ran: Vec<bool> = (0..4).map(|_| ctx.on_global_gc_start(&image).is_some()).collect();
    assert_eq!(ran, vec![false, true, false, true]);
    assert_eq!(ctx.counters().global, 4);
}

#[test]
fn test_manual_invocation_runs_its_own_options() {
    let (builder, _, _) = small_heap();
    let image = builder.build();
    let (reporter, _handle) = RecordingReporter::new();
    let mut ctx = GcCheckContext::initialize("all:all:manual", Box::new(reporter)).unwrap();

    assert!(ctx.on_global_gc_start(&image).is_none());
    assert!(ctx.on_local_gc_end(&image).is_none());

    let summary = ctx.invoke_manual(&image, "heap:all:quiet", 3).unwrap();
    assert_eq!(summary.invoked_by, Invocation::Manual(3));
    assert_eq!(summary.checks_run, 2);
    assert_eq!(summary.errors, 0);
}

static ABORTED: AtomicBool = AtomicBool::new(false);

fn record_abort() {
    ABORTED.store(true, Ordering::SeqCst);
}

#[test]
fn test_abort_handler_called_on_errors() {
    let (mut builder, _, objects) = small_heap();
    builder.object_mut(objects[0]).unwrap().slots[0] = Address::new(0x7000_0000);
    let image = builder.build();
    let (reporter, _handle) = RecordingReporter::new();
    let mut ctx = GcCheckContext::initialize("all:all:quiet,abort", Box::new(reporter)).unwrap();
    ctx.set_abort_handler(record_abort);

    let summary = ctx.on_global_gc_end(&image).unwrap();
    assert!(summary.aborted);
    assert_eq!(summary.invoked_by, Invocation::GlobalGcEnd);
    assert!(ABORTED.load(Ordering::SeqCst));
}

#[test]
fn test_concurrent_scavenge_abort_blocks_until_global_end() {
    let (builder, _, _) = small_heap();
    let image = builder.build();
    let (reporter, _handle) = RecordingReporter::new();
    let mut ctx = GcCheckContext::initialize("all:all:quiet", Box::new(reporter)).unwrap();

    ctx.on_concurrent_scavenge_abort();
    assert!(ctx.on_local_gc_start(&image).is_none());
    assert!(ctx.on_global_gc_start(&image).is_none());
    assert!(ctx.on_global_gc_end(&image).is_some());
    assert!(ctx.on_local_gc_start(&image).is_some());
}

#[test]
fn test_remembered_set_overflow_skips_remembered_set() {
    let (builder, _, _) = small_heap();
    let image = builder.build();
    let (reporter, _handle) = RecordingReporter::new();
    let mut ctx = GcCheckContext::initialize("all:all:quiet", Box::new(reporter)).unwrap();

    ctx.on_remembered_set_overflow();
    let summary = ctx.on_local_gc_end(&image).unwrap();
    assert_eq!(summary.invoked_by, Invocation::RememberedSetOverflow);
    assert_eq!(summary.checks_run, 14);
    assert!(!ctx.counters().remembered_set_overflow);
}
