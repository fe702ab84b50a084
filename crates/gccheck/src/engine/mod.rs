//! The verification engine.
//!
//! Pointer, object and class checks plus the slot adapters every root-set
//! walk feeds into. The engine holds no state across cycles except its
//! reporter: the memo tables, the region cache, the previous-entry ring and
//! the ownable-synchronizer counters are all reset by
//! [`CheckEngine::start_check_cycle`].
//!
//! Every verification function returns `Result<_, ErrorKind>`. Target reads
//! that fault come back as [`ErrorKind::CorruptData`] through `?`.

mod class;
mod object;
mod slots;

use tracing::{debug, trace};

use crate::address::Address;
use crate::cache::{RegionCache, VerificationCache};
use crate::checks::RootSetKind;
use crate::cycle::Invocation;
use crate::error::{CheckError, EntityKind, ErrorKind};
use crate::options::{CheckFlags, CheckOptions, MiscFlags};
use crate::reporter::Reporter;
use crate::target::{HeapConfiguration, RegionDescriptor, Target};

pub use class::CLASS_ALIGNMENT_MASK;
pub use slots::DEFERRED_REMOVE_TAG;
pub use object::{ON_STACK_ALIGNMENT_MASK, ResolvedPointer};

/// Outcome of verifying one heap entry or slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Nothing wrong
    Ok,
    /// Errors were reported; keep walking
    Recoverable,
    /// The walk cannot safely continue
    Unrecoverable,
}

/// A heap entity recently visited by a structural walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapElement {
    /// An object
    Object(Address),
    /// A class
    Class(Address),
}

/// Ring of the last three successfully visited heap entities.
#[derive(Debug, Clone, Default)]
struct PreviousEntries {
    entries: [Option<HeapElement>; 3],
}

impl PreviousEntries {
    fn push(&mut self, element: HeapElement) {
        self.entries.rotate_right(1);
        self.entries[0] = Some(element);
    }

    fn clear(&mut self) {
        self.entries = [None; 3];
    }

    /// Most recent first
    fn to_vec(&self) -> Vec<HeapElement> {
        self.entries.iter().flatten().copied().collect()
    }
}

/// Flags and counters of the cycle in progress.
#[derive(Debug, Clone)]
struct CycleContext {
    check: CheckFlags,
    misc: MiscFlags,
    invoked_by: Invocation,
    errors: u64,
}

impl Default for CycleContext {
    fn default() -> Self {
        let options = CheckOptions::default();
        Self {
            check: options.check,
            misc: options.misc,
            invoked_by: Invocation::Unknown,
            errors: 0,
        }
    }
}

/// Where a failure was found; everything a [`CheckError`] needs except
/// the cycle context.
#[derive(Debug, Clone)]
pub(crate) struct Site {
    entity: Address,
    slot: Option<Address>,
    stack_location: Option<String>,
    element: &'static str,
    entity_kind: EntityKind,
}

impl Site {
    pub(crate) fn new(entity: Address, entity_kind: EntityKind) -> Self {
        Self {
            entity,
            slot: None,
            stack_location: None,
            element: "",
            entity_kind,
        }
    }

    pub(crate) fn object(entity: Address, element: &'static str) -> Self {
        Self::new(entity, EntityKind::Object).element(element)
    }

    pub(crate) fn class(entity: Address, element: &'static str) -> Self {
        Self::new(entity, EntityKind::Class).element(element)
    }

    pub(crate) fn slot(mut self, slot: Address) -> Self {
        self.slot = Some(slot);
        self
    }

    pub(crate) fn element(mut self, element: &'static str) -> Self {
        self.element = element;
        self
    }

    pub(crate) fn stack_location(mut self, frame: &str) -> Self {
        self.stack_location = Some(frame.to_string());
        self
    }
}

/// Pointer, object and class verifier.
pub struct CheckEngine {
    reporter: Box<dyn Reporter>,
    cache: VerificationCache,
    region_cache: RegionCache,
    context: CycleContext,
    config: HeapConfiguration,
    current_check: Option<RootSetKind>,
    previous: PreviousEntries,
    ownable_synchronizers_on_heap: Option<u64>,
    ownable_synchronizers_on_list: Option<u64>,
}

impl CheckEngine {
    /// Engine rendering through `reporter`
    pub fn new(reporter: Box<dyn Reporter>) -> Self {
        Self {
            reporter,
            cache: VerificationCache::new(),
            region_cache: RegionCache::default(),
            context: CycleContext::default(),
            config: HeapConfiguration::default(),
            current_check: None,
            previous: PreviousEntries::default(),
            ownable_synchronizers_on_heap: None,
            ownable_synchronizers_on_list: None,
        }
    }

    /// Reset all cycle-local state and flush the target's allocation caches.
    pub fn start_check_cycle(
        &mut self,
        target: &dyn Target,
        options: &CheckOptions,
        invoked_by: Invocation,
    ) {
        self.context = CycleContext {
            check: options.check,
            misc: options.misc,
            invoked_by,
            errors: 0,
        };
        self.config = target.configuration();
        self.current_check = None;
        self.previous.clear();
        self.region_cache.clear();
        self.cache.clear();
        self.ownable_synchronizers_on_heap = None;
        self.ownable_synchronizers_on_list = None;
        self.reporter.set_max_errors(options.max_errors);
        debug!(target: "gccheck", %invoked_by, "check cycle started");
        target.walk_heap_start();
    }

    /// Close the cycle; returns the number of errors found.
    pub fn end_check_cycle(&mut self, target: &dyn Target) -> u64 {
        target.walk_heap_end();
        self.region_cache.clear();
        self.cache.clear();
        self.current_check = None;
        debug!(target: "gccheck", errors = self.context.errors, "check cycle ended");
        self.context.errors
    }

    /// Move on to the next root set.
    pub fn start_new_check(&mut self, kind: RootSetKind) {
        self.current_check = Some(kind);
        self.previous.clear();
        match kind {
            RootSetKind::OwnableSynchronizer => {
                self.ownable_synchronizers_on_list = Some(0);
            }
            // Only count on the heap when the lists were counted too.
            RootSetKind::ObjectHeap if self.ownable_synchronizers_on_list.is_some() => {
                self.ownable_synchronizers_on_heap = Some(0);
            }
            _ => {}
        }
        trace!(target: "gccheck", check = kind.name(), "check started");
    }

    /// `true` unless both counters were taken this cycle and differ.
    pub fn reconcile_ownable_synchronizer_counts(&self) -> bool {
        match (
            self.ownable_synchronizers_on_heap,
            self.ownable_synchronizers_on_list,
        ) {
            (Some(on_heap), Some(on_list)) => on_heap == on_list,
            _ => true,
        }
    }

    /// Counters as `(on_heap, on_list)`; `None` when not taken this cycle
    pub fn ownable_synchronizer_counts(&self) -> (Option<u64>, Option<u64>) {
        (
            self.ownable_synchronizers_on_heap,
            self.ownable_synchronizers_on_list,
        )
    }

    /// Report a heap/list count mismatch as a standalone inconsistency.
    pub fn report_ownable_synchronizer_mismatch(&mut self, target: &dyn Target) {
        let (on_heap, on_list) = self.ownable_synchronizer_counts();
        self.reporter.note(&format!(
            "found count={} of OwnableSynchronizerObjects on Heap doesn't match count={} on lists",
            on_heap.unwrap_or(0),
            on_list.unwrap_or(0)
        ));
        self.current_check = None;
        self.raise(
            target,
            Site::new(Address::NULL, EntityKind::None),
            ErrorKind::OwnableSynchronizerCountMismatch,
        );
    }

    /// Errors found so far in this cycle
    pub fn error_count(&self) -> u64 {
        self.context.errors
    }

    /// Misc flags of the cycle in progress
    pub fn misc_flags(&self) -> MiscFlags {
        self.context.misc
    }

    /// Check flags of the cycle in progress
    pub fn check_flags(&self) -> CheckFlags {
        self.context.check
    }

    /// Root set being walked
    pub fn current_check(&self) -> Option<RootSetKind> {
        self.current_check
    }

    /// Print entries instead of, or as well as, checking them
    pub fn scanning(&self) -> bool {
        self.context.misc.contains(MiscFlags::SCAN)
    }

    /// Verify entries
    pub fn checking(&self) -> bool {
        self.context.misc.contains(MiscFlags::CHECK)
    }

    /// Verbose banners and notes
    pub fn verbose(&self) -> bool {
        self.context.misc.contains(MiscFlags::VERBOSE)
    }

    /// Thread stacks are printed even without errors
    pub fn is_stack_dump_always_displayed(&self) -> bool {
        self.context.misc.contains(MiscFlags::ALWAYS_DUMP_STACK)
    }

    /// Informational line through the reporter
    pub fn note(&mut self, message: &str) {
        self.reporter.note(message);
    }

    /// Region containing `address`, through the one-slot cache.
    pub(crate) fn find_region(
        &mut self,
        target: &dyn Target,
        address: Address,
    ) -> Result<Option<RegionDescriptor>, ErrorKind> {
        if let Some(region) = self.region_cache.lookup(address) {
            return Ok(Some(region));
        }
        let found = target.find_region(address)?;
        if let Some(region) = found {
            self.region_cache.store(region);
        }
        Ok(found)
    }

    fn next_error(&mut self, site: Site, kind: ErrorKind) -> CheckError {
        self.context.errors += 1;
        CheckError {
            entity: site.entity,
            slot: site.slot,
            stack_location: site.stack_location,
            invoked_by: self.context.invoked_by,
            check: self.current_check,
            element: site.element,
            kind,
            number: self.context.errors,
            entity_kind: site.entity_kind,
        }
    }

    /// Build, count and report one error.
    pub(crate) fn raise(&mut self, target: &dyn Target, site: Site, kind: ErrorKind) -> CheckError {
        let error = self.next_error(site, kind);
        trace!(target: "gccheck", number = error.number, kind = ?error.kind, entity = %error.entity, "check error");
        self.reporter.report(&error, target);
        error
    }

    /// Report an error that ends a structural walk, with the previous entries.
    pub(crate) fn raise_heap_walk_error(&mut self, target: &dyn Target, site: Site, kind: ErrorKind) {
        let error = self.raise(target, site, kind);
        let previous = self.previous.to_vec();
        self.reporter.report_heap_walk_error(&error, &previous, target);
    }

    pub(crate) fn push_previous(&mut self, element: HeapElement) {
        self.previous.push(element);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_ring_keeps_three() {
        let mut ring = PreviousEntries::default();
        for raw in 1..=4u64 {
            ring.push(HeapElement::Object(Address::new(raw * 8)));
        }
        assert_eq!(
            ring.to_vec(),
            vec![
                HeapElement::Object(Address::new(32)),
                HeapElement::Object(Address::new(24)),
                HeapElement::Object(Address::new(16)),
            ]
        );
        ring.clear();
        assert!(ring.to_vec().is_empty());
    }
}
