//! # GC Check
//!
//! Heap and class-metadata verifier for garbage-collected virtual machines,
//! driven by the `-Xcheck:gc` option grammar.
//!
//! ## Design
//!
//! - **Capability traits**: the verifier reads the runtime only through
//!   [`target::Target`]; every read is fallible
//! - **Engine**: [`CheckEngine`] holds the per-cycle memo caches and the
//!   error counter, and implements the object, class and slot checks
//! - **Variants**: fifteen root-set checks run in a fixed order per cycle
//! - **Controller**: [`GcCheckContext`] decides which collections get
//!   checked and owns all long-lived state
//! - **Images**: [`image::HeapImage`] implements the capability traits over
//!   a serialized dump for out-of-process checking

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod cache;
pub mod checks;
pub mod controller;
pub mod cycle;
pub mod engine;
pub mod error;
pub mod fixer;
pub mod image;
pub mod options;
pub mod reporter;
pub mod target;

pub use address::{Address, POINTER_SIZE};
pub use checks::{Check, RootSetKind, generate_check_list};
pub use controller::{GcCheckContext, GcCounters, GcEvent, GcKind};
pub use cycle::{AbortHandler, CheckCycle, CycleState, CycleSummary, Invocation};
pub use engine::{CheckEngine, HeapElement, SlotOutcome};
pub use error::{CheckError, EntityKind, ErrorKind, ReadFault};
pub use fixer::{FixupError, FixupStats, HeapFixup, fix_dead_objects};
pub use image::{HeapImage, ImageBuilder, ImageError};
pub use options::{CheckFlags, CheckOptions, MiscFlags, OptionError, OptionOutcome, ScanFlags, parse_options};
pub use reporter::{RecordingReporter, ReportHandle, Reporter, TextReporter};
pub use target::Target;
