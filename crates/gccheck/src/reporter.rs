//! Error & report sink.
//!
//! A [`Reporter`] receives every [`CheckError`] the engine raises, plus a
//! few auxiliary events (heap walk failures, forwarded pointers, notes).
//! [`TextReporter`] renders the classic one-line-per-error format to any
//! [`Write`]; [`RecordingReporter`] keeps structured records for callers
//! that want to inspect a cycle programmatically.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::Address;
use crate::engine::HeapElement;
use crate::error::CheckError;
use crate::target::Target;

/// Words printed when dumping an entity's header.
pub const HEADER_DUMP_WORDS: usize = 4;

/// Sink for check errors and cycle notes.
pub trait Reporter {
    /// Render one error
    fn report(&mut self, error: &CheckError, target: &dyn Target);

    /// An error that ended a structural walk; `previous` holds the last
    /// successfully visited entities, most recent first
    fn report_heap_walk_error(&mut self, error: &CheckError, previous: &[HeapElement], target: &dyn Target);

    /// A pointer was followed to its forwarded copy
    fn report_forwarded_object(&mut self, from: Address, to: Address);

    /// Dump the header of an object related to `error`
    fn report_object_header(&mut self, error: &CheckError, object: Address, target: &dyn Target);

    /// Informational line
    fn note(&mut self, message: &str);

    /// Errors numbered past this are not rendered
    fn set_max_errors(&mut self, max_errors: Option<u64>);
}

fn within_limit(max_errors: Option<u64>, error: &CheckError) -> bool {
    max_errors.is_none_or(|max| error.number <= max)
}

/// Render the one-line form of `error`.
pub fn format_error(error: &CheckError) -> String {
    let mut line = format!("  <gc check ({}): {}: ", error.number, error.invoked_by);
    if let Some(check) = error.check {
        line.push_str(check.name());
        line.push_str(": ");
    }
    if error.element.is_empty() {
        let label = error.entity_kind.label();
        if !label.is_empty() {
            line.push_str(label);
            line.push(' ');
        }
    } else {
        line.push_str(error.element);
    }
    if !error.entity.is_null() {
        line.push_str(&error.entity.to_string());
    }
    if let Some(slot) = error.slot {
        line.push_str(&format!(" slot {slot}"));
    }
    if let Some(frame) = &error.stack_location {
        line.push_str(&format!(" [{frame}]"));
    }
    line.push_str(&format!(": {}>", error.kind));
    line
}

/// Raw words at `address`, or a marker when unreadable.
pub fn format_header_dump(label: &str, address: Address, target: &dyn Target) -> String {
    match target.read_words(address, HEADER_DUMP_WORDS) {
        Ok(words) => {
            let words: Vec<String> = words.iter().map(|word| format!("{word:#018x}")).collect();
            format!("  <gc check: {label} {address} header: {}>", words.join(" "))
        }
        Err(fault) => format!("  <gc check: {label} {address} header: <unreadable: {fault}>>"),
    }
}

fn element_label(element: &HeapElement) -> (&'static str, Address) {
    match *element {
        HeapElement::Object(address) => ("object", address),
        HeapElement::Class(address) => ("class", address),
    }
}

/// Plain-text reporter over any writer.
///
/// Write failures are ignored; the reporter must never disturb the
/// cycle it is observing.
pub struct TextReporter<W: Write> {
    out: W,
    max_errors: Option<u64>,
}

impl<W: Write> TextReporter<W> {
    /// Reporter writing to `out`
    pub fn new(out: W) -> Self {
        Self { out, max_errors: None }
    }

    /// Give back the writer
    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }
}

impl TextReporter<std::io::Stderr> {
    /// Reporter on standard error
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write> Reporter for TextReporter<W> {
    fn report(&mut self, error: &CheckError, target: &dyn Target) {
        if !within_limit(self.max_errors, error) {
            return;
        }
        self.line(&format_error(error));
        if error.entity_kind.has_header_dump() && !error.entity.is_null() {
            let dump = format_header_dump(error.entity_kind.label(), error.entity, target);
            self.line(&dump);
        }
    }

    fn report_heap_walk_error(&mut self, error: &CheckError, previous: &[HeapElement], target: &dyn Target) {
        if !within_limit(self.max_errors, error) {
            return;
        }
        self.line("  <gc check: heap walk stopped; previous entries follow>");
        for element in previous {
            let (label, address) = element_label(element);
            let dump = format_header_dump(label, address, target);
            self.line(&dump);
        }
    }

    fn report_forwarded_object(&mut self, from: Address, to: Address) {
        self.line(&format!("  <gc check: found forwarded pointer {from} -> {to}>"));
    }

    fn report_object_header(&mut self, error: &CheckError, object: Address, target: &dyn Target) {
        if !within_limit(self.max_errors, error) {
            return;
        }
        let dump = format_header_dump("object", object, target);
        self.line(&dump);
    }

    fn note(&mut self, message: &str) {
        self.line(&format!("<gc check: {message}>"));
    }

    fn set_max_errors(&mut self, max_errors: Option<u64>) {
        self.max_errors = max_errors;
    }
}

/// A heap walk failure with its anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapWalkFailure {
    /// The error that stopped the walk
    pub error: CheckError,
    /// Last visited entities, most recent first
    pub previous: Vec<HeapElement>,
}

/// Everything a [`RecordingReporter`] captured.
#[derive(Debug, Clone, Default)]
pub struct ReportLog {
    /// Errors within the max-errors cutoff, in order
    pub errors: Vec<CheckError>,
    /// Every error raised, including the ones past the cutoff
    pub raised: u64,
    /// Notes, verbatim
    pub notes: Vec<String>,
    /// Heap walk failures
    pub heap_walk_errors: Vec<HeapWalkFailure>,
    /// Forwarded pointers followed, as `(from, to)`
    pub forwarded: Vec<(Address, Address)>,
    /// Objects whose headers were dumped
    pub header_dumps: Vec<Address>,
}

/// Shared handle onto a [`RecordingReporter`]'s log.
#[derive(Debug, Clone, Default)]
pub struct ReportHandle {
    log: Arc<Mutex<ReportLog>>,
}

impl ReportHandle {
    /// Copy of the log so far
    pub fn snapshot(&self) -> ReportLog {
        self.log.lock().clone()
    }

    /// Errors so far
    pub fn errors(&self) -> Vec<CheckError> {
        self.log.lock().errors.clone()
    }

    /// Notes so far
    pub fn notes(&self) -> Vec<String> {
        self.log.lock().notes.clone()
    }

    /// Forget everything recorded
    pub fn clear(&self) {
        *self.log.lock() = ReportLog::default();
    }
}

/// Reporter keeping structured records.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    log: Arc<Mutex<ReportLog>>,
    max_errors: Option<u64>,
}

impl RecordingReporter {
    /// Reporter plus a handle to read what it records
    pub fn new() -> (Self, ReportHandle) {
        let reporter = Self::default();
        let handle = ReportHandle {
            log: Arc::clone(&reporter.log),
        };
        (reporter, handle)
    }
}

impl Reporter for RecordingReporter {
    fn report(&mut self, error: &CheckError, _target: &dyn Target) {
        let mut log = self.log.lock();
        log.raised += 1;
        if within_limit(self.max_errors, error) {
            log.errors.push(error.clone());
        }
    }

    fn report_heap_walk_error(&mut self, error: &CheckError, previous: &[HeapElement], _target: &dyn Target) {
        self.log.lock().heap_walk_errors.push(HeapWalkFailure {
            error: error.clone(),
            previous: previous.to_vec(),
        });
    }

    fn report_forwarded_object(&mut self, from: Address, to: Address) {
        self.log.lock().forwarded.push((from, to));
    }

    fn report_object_header(&mut self, _error: &CheckError, object: Address, _target: &dyn Target) {
        self.log.lock().header_dumps.push(object);
    }

    fn note(&mut self, message: &str) {
        self.log.lock().notes.push(message.to_string());
    }

    fn set_max_errors(&mut self, max_errors: Option<u64>) {
        self.max_errors = max_errors;
    }
}

/// Prints root-set entries in scan mode, a few per line.
pub struct ScanFormatter {
    title: String,
    pending: Vec<String>,
    per_line: usize,
    lines: Vec<String>,
    empty: bool,
}

impl ScanFormatter {
    /// Entries per output line
    pub const ENTRIES_PER_LINE: usize = 4;

    /// Start a section named `title`
    pub fn new(title: &str, owner: Address) -> Self {
        let opening = if owner.is_null() {
            format!("<{title}>")
        } else {
            format!("<{title} {owner}>")
        };
        Self {
            title: title.to_string(),
            pending: Vec::new(),
            per_line: Self::ENTRIES_PER_LINE,
            lines: vec![opening],
            empty: true,
        }
    }

    /// Add one entry
    pub fn entry(&mut self, address: Address) {
        self.empty = false;
        self.pending.push(address.to_string());
        if self.pending.len() == self.per_line {
            self.flush();
        }
    }

    /// Add a labelled section boundary, e.g. a new list or thread
    pub fn section(&mut self, label: &str, address: Address) {
        self.flush();
        self.lines.push(format!("  <{label} {address}>"));
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.lines.push(format!("  {}", self.pending.join(" ")));
            self.pending.clear();
        }
    }

    /// Close the section and return its lines
    pub fn finish(mut self) -> Vec<String> {
        self.flush();
        if self.empty {
            self.lines.push("  <empty>".to_string());
        }
        self.lines.push(format!("<end of {}>", self.title));
        self.lines
    }
}
