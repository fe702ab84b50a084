//! GC lifecycle hooks and trigger admission.
//!
//! [`GcCheckContext`] is the long-lived state a host creates once, from
//! the `-Xcheck:gc` option string, and hands to every lifecycle hook. It
//! owns the engine, the parsed cycle and the collection counters; there is
//! no global state.

use tracing::{debug, info};

use crate::cycle::{AbortHandler, CheckCycle, CycleSummary, Invocation};
use crate::engine::CheckEngine;
use crate::options::{CheckOptions, HELP_TEXT, MiscFlags, OptionError, OptionOutcome, ScanFlags, parse_options};
use crate::reporter::Reporter;
use crate::target::Target;

/// Kind of collection a hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Full collection
    Global,
    /// Scavenge
    Local,
}

/// Lifecycle event delivered to [`GcCheckContext::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcEvent {
    /// A global collection is starting
    GlobalGcStart,
    /// A global collection finished
    GlobalGcEnd,
    /// A local collection is starting
    LocalGcStart,
    /// A local collection finished
    LocalGcEnd,
    /// The scavenger backed out
    ScavengerBackout,
    /// The remembered set overflowed
    RememberedSetOverflow,
    /// A concurrent scavenge was aborted
    ConcurrentScavengeAbort,
}

/// Collection counters and pending-event flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcCounters {
    /// Global collections started
    pub global: u64,
    /// Local collections started
    pub local: u64,
    /// A scavenger backout happened since the last check
    pub scavenger_backout: bool,
    /// The remembered set overflowed since the last check
    pub remembered_set_overflow: bool,
    /// A concurrent scavenge aborted; cleared when the next global GC ends
    pub concurrent_scavenge_aborted: bool,
}

impl GcCounters {
    fn count(&self, kind: GcKind) -> u64 {
        match kind {
            GcKind::Global => self.global,
            GcKind::Local => self.local,
        }
    }

    fn total(&self) -> u64 {
        self.global + self.local
    }
}

/// Process-wide checker state.
pub struct GcCheckContext {
    engine: CheckEngine,
    cycle: CheckCycle,
    counters: GcCounters,
    abort: AbortHandler,
}

impl GcCheckContext {
    /// Parse `text` and build the long-lived cycle.
    ///
    /// `help` is an error here: the host prints [`HELP_TEXT`] and exits.
    /// Malformed text is reported with [`HELP_TEXT`] as a note.
    pub fn initialize(text: &str, mut reporter: Box<dyn Reporter>) -> Result<Self, OptionError> {
        match parse_options(text) {
            Ok(OptionOutcome::Help) => Err(OptionError::HelpRequested),
            Ok(OptionOutcome::Options(options)) => Ok(Self::with_options(options, reporter)),
            Err(err) => {
                if err.wants_help() {
                    reporter.note(HELP_TEXT);
                }
                Err(err)
            }
        }
    }

    /// Context for already-parsed options
    pub fn with_options(options: CheckOptions, reporter: Box<dyn Reporter>) -> Self {
        debug!(target: "gccheck", scan = ?options.scan, check = ?options.check, misc = ?options.misc, "gc check initialized");
        Self {
            engine: CheckEngine::new(reporter),
            cycle: CheckCycle::new(options),
            counters: GcCounters::default(),
            abort: || std::process::abort(),
        }
    }

    /// Replace the fatal abort path
    pub fn set_abort_handler(&mut self, abort: AbortHandler) {
        self.abort = abort;
    }

    /// Options of the long-lived cycle
    pub fn options(&self) -> &CheckOptions {
        self.cycle.options()
    }

    /// Counters so far
    pub fn counters(&self) -> GcCounters {
        self.counters
    }

    /// The long-lived cycle
    pub fn cycle(&self) -> &CheckCycle {
        &self.cycle
    }

    /// Should a check run for a collection of `kind`.
    ///
    /// Evaluated with the counters as they stand; the start hooks count
    /// the collection before asking.
    pub fn admit(&self, kind: GcKind) -> bool {
        let options = self.cycle.options();
        let misc = options.misc;

        if misc.contains(MiscFlags::MANUAL) {
            return false;
        }
        let suppressed = match kind {
            GcKind::Global => misc.contains(MiscFlags::SUPPRESS_GLOBAL),
            GcKind::Local => misc.contains(MiscFlags::SUPPRESS_LOCAL),
        };
        if suppressed {
            return false;
        }
        if misc.contains(MiscFlags::REMEMBERED_SET_OVERFLOW) && !self.counters.remembered_set_overflow {
            return false;
        }
        if misc.contains(MiscFlags::SCAVENGER_BACKOUT) && !self.counters.scavenger_backout {
            return false;
        }
        // The young generation is not walkable until the compensating
        // global collection completes.
        if self.counters.concurrent_scavenge_aborted {
            return false;
        }

        let specific = match kind {
            GcKind::Global => options.global_interval,
            GcKind::Local => options.local_interval,
        };
        let sampled = if specific != 0 {
            self.counters.count(kind) % specific == 0
        } else if options.interval != 0 {
            self.counters.total() % options.interval == 0
        } else {
            true
        };
        sampled && self.counters.total() >= options.start_index
    }

    /// Count a collection start and decide whether to check it.
    pub fn admit_gc_start(&mut self, kind: GcKind) -> bool {
        match kind {
            GcKind::Global => self.counters.global += 1,
            GcKind::Local => self.counters.local += 1,
        }
        let admitted = self.admit(kind);
        debug!(target: "gccheck", ?kind, count = self.counters.count(kind), admitted, "gc start admission");
        admitted
    }

    fn run_automatic(&mut self, target: &dyn Target, invoked_by: Invocation) -> CycleSummary {
        let mut filter = ScanFlags::all();
        let mut invoked_by = invoked_by;
        if self.counters.remembered_set_overflow {
            // An overflowed remembered set is not walkable.
            filter.remove(ScanFlags::REMEMBERED_SET);
            invoked_by = Invocation::RememberedSetOverflow;
        }
        if self.counters.scavenger_backout {
            invoked_by = Invocation::ScavengerBackout;
        }
        let summary = self
            .cycle
            .run(&mut self.engine, target, invoked_by, filter, self.abort);
        self.counters.remembered_set_overflow = false;
        self.counters.scavenger_backout = false;
        summary
    }

    /// Hook: global collection starting
    pub fn on_global_gc_start(&mut self, target: &dyn Target) -> Option<CycleSummary> {
        self.admit_gc_start(GcKind::Global)
            .then(|| self.run_automatic(target, Invocation::GlobalGcStart))
    }

    /// Hook: global collection finished
    pub fn on_global_gc_end(&mut self, target: &dyn Target) -> Option<CycleSummary> {
        if self.counters.concurrent_scavenge_aborted {
            info!(target: "gccheck", "heap walkable again after concurrent scavenge abort");
            self.counters.concurrent_scavenge_aborted = false;
        }
        self.admit(GcKind::Global)
            .then(|| self.run_automatic(target, Invocation::GlobalGcEnd))
    }

    /// Hook: local collection starting
    pub fn on_local_gc_start(&mut self, target: &dyn Target) -> Option<CycleSummary> {
        self.admit_gc_start(GcKind::Local)
            .then(|| self.run_automatic(target, Invocation::LocalGcStart))
    }

    /// Hook: local collection finished
    pub fn on_local_gc_end(&mut self, target: &dyn Target) -> Option<CycleSummary> {
        self.admit(GcKind::Local)
            .then(|| self.run_automatic(target, Invocation::LocalGcEnd))
    }

    /// Hook: scavenger backed out; checked at the end of the collection
    pub fn on_scavenger_backout(&mut self) {
        self.counters.scavenger_backout = true;
    }

    /// Hook: remembered set overflowed; checked at the end of the collection
    pub fn on_remembered_set_overflow(&mut self) {
        self.counters.remembered_set_overflow = true;
    }

    /// Hook: concurrent scavenge aborted
    pub fn on_concurrent_scavenge_abort(&mut self) {
        self.counters.concurrent_scavenge_aborted = true;
    }

    /// Dispatch one lifecycle event.
    pub fn handle(&mut self, event: GcEvent, target: &dyn Target) -> Option<CycleSummary> {
        match event {
            GcEvent::GlobalGcStart => self.on_global_gc_start(target),
            GcEvent::GlobalGcEnd => self.on_global_gc_end(target),
            GcEvent::LocalGcStart => self.on_local_gc_start(target),
            GcEvent::LocalGcEnd => self.on_local_gc_end(target),
            GcEvent::ScavengerBackout => {
                self.on_scavenger_backout();
                None
            }
            GcEvent::RememberedSetOverflow => {
                self.on_remembered_set_overflow();
                None
            }
            GcEvent::ConcurrentScavengeAbort => {
                self.on_concurrent_scavenge_abort();
                None
            }
        }
    }

    /// Run a one-shot cycle with its own options, outside the schedule.
    pub fn invoke_manual(&mut self, target: &dyn Target, text: &str, id: u64) -> Result<CycleSummary, OptionError> {
        let options = match parse_options(text) {
            Ok(OptionOutcome::Help) => return Err(OptionError::HelpRequested),
            Ok(OptionOutcome::Options(options)) => options,
            Err(err) => {
                if err.wants_help() {
                    self.engine.note(HELP_TEXT);
                }
                return Err(err);
            }
        };
        let mut cycle = CheckCycle::new(options);
        Ok(cycle.run(
            &mut self.engine,
            target,
            Invocation::Manual(id),
            ScanFlags::all(),
            self.abort,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::RecordingReporter;

    fn context(text: &str) -> GcCheckContext {
        let (reporter, _handle) = RecordingReporter::new();
        match GcCheckContext::initialize(text, Box::new(reporter)) {
            Ok(context) => context,
            Err(err) => panic!("bad options {text:?}: {err}"),
        }
    }

    #[test]
    fn test_global_interval_sampling() {
        let mut ctx = context("all:all:globalinterval=3");
        let admitted: Vec<bool> = (0..6).map(|_| ctx.admit_gc_start(GcKind::Global)).collect();
        assert_eq!(admitted, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_manual_excludes_automatic() {
        let mut ctx = context("all:all:manual");
        assert!(!ctx.admit_gc_start(GcKind::Global));
        assert!(!ctx.admit_gc_start(GcKind::Local));
    }

    #[test]
    fn test_suppression_per_kind() {
        let mut ctx = context("all:all:suppresslocal");
        assert!(ctx.admit_gc_start(GcKind::Global));
        assert!(!ctx.admit_gc_start(GcKind::Local));
    }

    #[test]
    fn test_backout_mode_waits_for_backout() {
        let mut ctx = context("all:all:scavengerbackout");
        assert!(!ctx.admit_gc_start(GcKind::Local));
        ctx.on_scavenger_backout();
        assert!(ctx.admit(GcKind::Local));
    }

    #[test]
    fn test_concurrent_abort_blocks_until_global_end() {
        let mut ctx = context("");
        ctx.on_concurrent_scavenge_abort();
        assert!(!ctx.admit_gc_start(GcKind::Local));
        assert!(!ctx.admit_gc_start(GcKind::Global));
        assert!(ctx.counters().concurrent_scavenge_aborted);
    }

    #[test]
    fn test_start_index() {
        let mut ctx = context("all:all:startindex=2");
        assert!(!ctx.admit_gc_start(GcKind::Local));
        assert!(ctx.admit_gc_start(GcKind::Global));
    }

    #[test]
    fn test_help_is_an_error() {
        let (reporter, handle) = RecordingReporter::new();
        let result = GcCheckContext::initialize("help", Box::new(reporter));
        assert!(matches!(result, Err(OptionError::HelpRequested)));
        assert!(handle.notes().is_empty());
    }

    #[test]
    fn test_unknown_token_prints_help() {
        let (reporter, handle) = RecordingReporter::new();
        let result = GcCheckContext::initialize("bogus", Box::new(reporter));
        assert!(matches!(result, Err(OptionError::UnknownToken { .. })));
        assert_eq!(handle.notes(), vec![HELP_TEXT.to_string()]);
    }

    #[test]
    fn test_manual_invocation_with_bad_number_prints_help() {
        let (reporter, handle) = RecordingReporter::new();
        let mut ctx = match GcCheckContext::initialize("", Box::new(reporter)) {
            Ok(context) => context,
            Err(err) => panic!("default options rejected: {err}"),
        };
        let image = crate::image::ImageBuilder::new().build();
        let result = ctx.invoke_manual(&image, "all:all:maxerrors=lots", 1);
        assert!(matches!(result, Err(OptionError::InvalidNumber { .. })));
        assert_eq!(handle.notes(), vec![HELP_TEXT.to_string()]);
    }
}
