//! One check cycle: the selected variants run in registry order.

use std::fmt;

use tracing::{error, info};

use crate::checks::{Check, generate_check_list};
use crate::engine::CheckEngine;
use crate::options::{CheckOptions, MiscFlags, ScanFlags};
use crate::target::Target;

/// Called when a cycle with `abort` set found errors.
pub type AbortHandler = fn();

/// What triggered a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Invocation {
    /// Start of a global collection
    GlobalGcStart,
    /// End of a global collection
    GlobalGcEnd,
    /// Start of a local (scavenge) collection
    LocalGcStart,
    /// End of a local collection
    LocalGcEnd,
    /// Scavenger backed out
    ScavengerBackout,
    /// Remembered set overflowed
    RememberedSetOverflow,
    /// Manual invocation with caller-chosen id
    Manual(u64),
    /// Unknown trigger
    Unknown,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::GlobalGcStart => f.write_str("start of global GC"),
            Invocation::GlobalGcEnd => f.write_str("end of global GC"),
            Invocation::LocalGcStart => f.write_str("start of local GC"),
            Invocation::LocalGcEnd => f.write_str("end of local GC"),
            Invocation::ScavengerBackout => f.write_str("scavenger backout"),
            Invocation::RememberedSetOverflow => f.write_str("remembered set overflow"),
            Invocation::Manual(id) => write!(f, "manual invocation {id}"),
            Invocation::Unknown => f.write_str("unknown"),
        }
    }
}

/// Lifecycle of a [`CheckCycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No options yet
    Unparsed,
    /// Options parsed, variants instantiated
    Parsed,
    /// Variants executing
    Running,
    /// Last run finished
    Complete,
}

/// Result of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    /// Trigger
    pub invoked_by: Invocation,
    /// Variants executed
    pub checks_run: usize,
    /// Errors found
    pub errors: u64,
    /// The abort handler was called
    pub aborted: bool,
}

/// Parsed options plus the ordered variants they select.
#[derive(Debug, Clone)]
pub struct CheckCycle {
    options: CheckOptions,
    checks: Vec<Check>,
    invoked_by: Invocation,
    error_count: u64,
    state: CycleState,
}

impl Default for CheckCycle {
    fn default() -> Self {
        Self {
            options: CheckOptions::default(),
            checks: Vec::new(),
            invoked_by: Invocation::Unknown,
            error_count: 0,
            state: CycleState::Unparsed,
        }
    }
}

impl CheckCycle {
    /// Cycle running the variants `options` selects
    pub fn new(options: CheckOptions) -> Self {
        let checks = generate_check_list(options.scan);
        Self {
            options,
            checks,
            invoked_by: Invocation::Unknown,
            error_count: 0,
            state: CycleState::Parsed,
        }
    }

    /// Options the cycle was built from
    pub fn options(&self) -> &CheckOptions {
        &self.options
    }

    /// Instantiated variants, in execution order
    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    /// Lifecycle state
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Errors found by the last run
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Trigger of the last run
    pub fn invoked_by(&self) -> Invocation {
        self.invoked_by
    }

    /// Run every variant whose scan bit is in `filter`.
    ///
    /// Individual check outcomes never stop the cycle. With `abort` set
    /// and errors found, `abort` is called after the engine is told the
    /// cycle ended.
    pub fn run(
        &mut self,
        engine: &mut CheckEngine,
        target: &dyn Target,
        invoked_by: Invocation,
        filter: ScanFlags,
        abort: AbortHandler,
    ) -> CycleSummary {
        self.state = CycleState::Running;
        self.invoked_by = invoked_by;
        engine.start_check_cycle(target, &self.options, invoked_by);

        let verbose = self.options.has(MiscFlags::VERBOSE);
        if verbose {
            engine.note(&format!("checking heap ({invoked_by})"));
        }

        let mut checks_run = 0;
        for check in self.checks.iter().filter(|check| filter.contains(check.kind.scan_flag())) {
            engine.start_new_check(check.kind);
            if verbose {
                engine.note(&format!("start of {}", check.kind));
            }
            check.run(engine, target);
            if verbose {
                engine.note(&format!("end of {}", check.kind));
            }
            checks_run += 1;
        }

        if !engine.reconcile_ownable_synchronizer_counts() {
            engine.report_ownable_synchronizer_mismatch(target);
        }

        self.error_count = engine.end_check_cycle(target);
        if verbose {
            engine.note(&format!(
                "done checking ({invoked_by}): {} checks, {} errors",
                checks_run, self.error_count
            ));
        }
        self.state = CycleState::Complete;
        info!(target: "gccheck", %invoked_by, checks = checks_run, errors = self.error_count, "check cycle complete");

        let aborted = self.options.has(MiscFlags::ABORT) && self.error_count > 0;
        if aborted {
            error!(target: "gccheck", errors = self.error_count, "aborting after check errors");
            abort();
        }

        CycleSummary {
            invoked_by,
            checks_run,
            errors: self.error_count,
            aborted,
        }
    }
}
