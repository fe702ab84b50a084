//! Verification error codes and error records

use thiserror::Error;

use crate::address::Address;
use crate::checks::RootSetKind;
use crate::cycle::Invocation;

/// A failed read of target memory.
///
/// The only failure a capability query may produce. The engine turns it
/// into [`ErrorKind::CorruptData`] for the entity being examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot read target memory at {address}")]
pub struct ReadFault {
    /// Address that could not be read
    pub address: Address,
}

impl ReadFault {
    /// Fault at `address`
    pub fn at(address: Address) -> Self {
        Self { address }
    }
}

/// Every condition the verifier can detect.
///
/// The `Display` text is the human string rendered in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    // Generic pointer errors
    /// Pointer is not aligned to its region's object alignment
    #[error("pointer not aligned")]
    Unaligned,
    /// First or last element of a double array is not 8-byte aligned
    #[error("double array elements not aligned")]
    DoubleArrayUnaligned,
    /// Pointer lies in a heap region that does not hold objects
    #[error("pointer not in an object region")]
    NotInObjectRegion,
    /// Pointer is not in any known region
    #[error("pointer not found in any region")]
    NotFound,
    /// Heap walk stepped past the end of its region
    #[error("object overlaps segment boundary")]
    OverlapsSegmentBoundary,
    /// Pointer refers to an object allocated on a thread stack
    #[error("pointer is a stack-allocated object")]
    StackObject,
    /// Object slot holds a pointer to class metadata
    #[error("object slot points to a class")]
    ObjectSlotPointsToClass,
    /// Object does not fit in its region
    #[error("object does not fit in its region")]
    InvalidRange,
    /// Out-of-line array data address is not valid
    #[error("invalid indexable data address")]
    InvalidIndexableDataAddress,
    /// Target memory could not be read
    #[error("corrupt data: target memory unreadable")]
    CorruptData,

    // Class pointer errors
    /// Class pointer is null
    #[error("null class pointer")]
    NullClassPointer,
    /// Class pointer is not aligned
    #[error("class pointer not aligned")]
    ClassPointerUnaligned,
    /// Class pointer not found in any class segment
    #[error("class not found in any class segment")]
    ClassNotFound,
    /// Class header does not fit in its segment
    #[error("class does not fit in its segment")]
    ClassInvalidRange,
    /// Class object is not an instance of java/lang/Class
    #[error("class object is not a java/lang/Class instance")]
    ClassObjectNotJavaLangClass,
    /// Class pointer lies on a thread stack
    #[error("class pointer is on a thread stack")]
    ClassPointerOnStack,
    /// Class lives in an undead segment where that is not allowed
    #[error("class is undead")]
    ClassIsUndead,
    /// Class is marked as unloaded
    #[error("class is unloaded")]
    ClassIsUnloaded,
    /// Class header eyecatcher is wrong
    #[error("class header invalid")]
    ClassHeaderInvalid,

    // Flags consistency errors
    /// Indexable bit disagrees with the class shape
    #[error("invalid object flags")]
    InvalidFlags,
    /// Object in an old region without the old bit
    #[error("object in old segment has invalid flags")]
    OldSegmentInvalidFlags,
    /// Object in a new region with the old bit
    #[error("object in new segment has invalid flags")]
    NewSegmentInvalidFlags,

    // Heap hole errors
    /// Dead object size is zero or larger than the rest of the region
    #[error("dead object has invalid size")]
    DeadObjectSize,
    /// Dead object size is not object-aligned
    #[error("dead object size not aligned")]
    DeadObjectSizeNotAligned,
    /// Next link of a dead object is not a hole
    #[error("dead object next link is not a hole")]
    DeadObjectNextIsNotHole,
    /// Next link of a dead object leaves its region
    #[error("dead object next link is not in the region")]
    DeadObjectNextIsNotInRegion,
    /// Next link of a dead object points inside it
    #[error("dead object next link points inside the hole")]
    DeadObjectNextIsPointedInside,

    // Remembered set errors
    /// Remembered set holds a new-space object
    #[error("remembered set entry in wrong segment")]
    RememberedSetWrongSegment,
    /// Remembered set entry is not old and remembered
    #[error("remembered set entry has invalid flags")]
    RememberedSetFlags,
    /// Old object references a new-space object but is not remembered
    #[error("new pointer not remembered")]
    NewPointerNotRemembered,
    /// Old object (or class) references a non-old object but is not remembered
    #[error("old object references non-old object but is not remembered")]
    RememberedSetOldObject,
    /// Old object references a new-space object on a clean card
    #[error("new pointer on clean card")]
    NewPointerCardNotDirty,

    // Class statics errors
    /// Static field references an object of the wrong type
    #[error("static field points to object of wrong type")]
    ClassStaticsFieldPointsWrongObject,
    /// Static field address outside the statics scan range
    #[error("static field address outside scanning range")]
    ClassStaticsReferenceNotInScanningRange,
    /// Number of reference statics does not match the declared count
    #[error("wrong number of static references")]
    ClassStaticsWrongNumberOfReferences,
    /// Hot-swapped class state is inconsistent
    #[error("hot-swapped class is inconsistent")]
    ClassHotSwapInconsistent,
    /// An array class was hot swapped
    #[error("array class cannot be hot swapped")]
    ClassHotSwappedForArray,
    /// Replaced class lacks the hot-swapped-out flag
    #[error("replaced class has no hot-swapped-out flag")]
    ReplacedClassHasNoHotswapFlag,

    // Ownable synchronizer errors
    /// List member is not an ownable synchronizer
    #[error("ownable synchronizer has invalid class")]
    OwnableSynchronizerInvalidClass,
    /// Ownable synchronizer found on the heap is not on any list
    #[error("ownable synchronizer is not attached to a list")]
    OwnableSynchronizerNotAttached,
    /// Ownable synchronizer list loops
    #[error("ownable synchronizer list has a circular reference")]
    OwnableSynchronizerListCircular,
    /// Heap and list counts of ownable synchronizers differ
    #[error("ownable synchronizer heap count does not match list count")]
    OwnableSynchronizerCountMismatch,

    /// Unfinalized or finalizable list loops
    #[error("object list has a circular reference")]
    ObjectListCircular,
}

impl ErrorKind {
    /// Errors that do not stop a heap walk.
    pub fn is_recoverable_in_heap_walk(self) -> bool {
        matches!(
            self,
            ErrorKind::ClassIsUnloaded
                | ErrorKind::DeadObjectNextIsNotHole
                | ErrorKind::DeadObjectNextIsNotInRegion
                | ErrorKind::DeadObjectNextIsPointedInside
        )
    }

    /// Errors still reported when the heap may contain dark matter.
    pub fn survives_dark_matter(self) -> bool {
        matches!(
            self,
            ErrorKind::Unaligned | ErrorKind::StackObject | ErrorKind::NotFound
        )
    }
}

impl From<ReadFault> for ErrorKind {
    fn from(_: ReadFault) -> Self {
        ErrorKind::CorruptData
    }
}

/// What kind of entity a [`CheckError`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A heap object
    Object,
    /// Class metadata
    Class,
    /// A VM thread
    Thread,
    /// A remembered-set bucket
    RememberedSetBucket,
    /// An unfinalized object list
    UnfinalizedList,
    /// A finalizable object list
    FinalizableList,
    /// An ownable synchronizer list
    OwnableSynchronizerList,
    /// Any other container: pools, tables, VM slots
    Other,
    /// No entity: cycle-wide inconsistencies
    None,
}

impl EntityKind {
    /// Label used in rendered reports
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Object => "object",
            EntityKind::Class => "class",
            EntityKind::Thread => "thread",
            EntityKind::RememberedSetBucket => "remembered set bucket",
            EntityKind::UnfinalizedList => "unfinalized list",
            EntityKind::FinalizableList => "finalizable list",
            EntityKind::OwnableSynchronizerList => "ownable synchronizer list",
            EntityKind::Other => "slot owner",
            EntityKind::None => "",
        }
    }

    /// Whether reporters dump the entity's raw header
    pub fn has_header_dump(self) -> bool {
        matches!(self, EntityKind::Object | EntityKind::Class)
    }
}

/// One detected failure, with the full context of where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckError {
    /// The offending entity (object, class, thread, container)
    pub entity: Address,
    /// The slot holding the bad pointer, when there is one
    pub slot: Option<Address>,
    /// Originating frame, for thread stack slots
    pub stack_location: Option<String>,
    /// What triggered the owning cycle
    pub invoked_by: Invocation,
    /// Check variant that found the error
    pub check: Option<RootSetKind>,
    /// Element description, e.g. `"Object "` or `"static "`
    pub element: &'static str,
    /// The failure
    pub kind: ErrorKind,
    /// Sequence number within the cycle, starting at 1
    pub number: u64,
    /// What `entity` is
    pub entity_kind: EntityKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_fault_maps_to_corrupt_data() {
        let kind: ErrorKind = ReadFault::at(Address::new(0x40)).into();
        assert_eq!(kind, ErrorKind::CorruptData);
    }

    #[test]
    fn test_dark_matter_filter() {
        assert!(ErrorKind::NotFound.survives_dark_matter());
        assert!(!ErrorKind::ClassNotFound.survives_dark_matter());
    }

    #[test]
    fn test_error_strings() {
        assert_eq!(ErrorKind::ClassPointerUnaligned.to_string(), "class pointer not aligned");
        assert_eq!(
            ReadFault::at(Address::new(0x10)).to_string(),
            "cannot read target memory at 0x0000000000000010"
        );
    }
}
