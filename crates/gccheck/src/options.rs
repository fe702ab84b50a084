//! `-Xcheck:gc` option grammar.
//!
//! ```text
//! -Xcheck:gc[:<scan>[,<scan>...]][:<verify>[,...]][:<misc>[,...]]
//! ```
//!
//! Sections are positional and may be empty. An empty scan or verify set
//! after parsing means "all"; misc starts out as `verbose,check`.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Root sets to walk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScanFlags: u32 {
        /// Every object in the heap
        const OBJECT_HEAP = 1 << 0;
        /// Every class in the class segments
        const CLASS_HEAP = 1 << 1;
        /// Generational remembered set
        const REMEMBERED_SET = 1 << 2;
        /// Unfinalized object lists
        const UNFINALIZED = 1 << 3;
        /// Finalizable object lists
        const FINALIZABLE = 1 << 4;
        /// Ownable synchronizer lists
        const OWNABLE_SYNCHRONIZER = 1 << 5;
        /// Interned string table
        const STRING_TABLE = 1 << 6;
        /// Class loader table
        const CLASS_LOADERS = 1 << 7;
        /// JNI global reference pool
        const JNI_GLOBAL_REFS = 1 << 8;
        /// JNI weak global reference pool
        const JNI_WEAK_GLOBAL_REFS = 1 << 9;
        /// Tool object tag tables
        const TAG_TABLES = 1 << 10;
        /// Inflated monitor table
        const MONITOR_TABLE = 1 << 11;
        /// Well-known VM class slots
        const VM_CLASS_SLOTS = 1 << 12;
        /// Thread structures
        const VM_THREADS = 1 << 13;
        /// Thread stacks
        const THREAD_STACKS = 1 << 14;
    }
}

bitflags! {
    /// Invariants to verify.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CheckFlags: u32 {
        /// Follow and verify class pointers
        const CLASS_SLOT = 1 << 0;
        /// Objects and classes fit their region
        const RANGE = 1 << 1;
        /// Header flag coherence
        const FLAGS = 1 << 2;
    }
}

bitflags! {
    /// Behaviour switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MiscFlags: u32 {
        /// Banners and notes
        const VERBOSE = 1 << 0;
        /// Only run on manual invocation
        const MANUAL = 1 << 1;
        /// Print root set contents
        const SCAN = 1 << 2;
        /// Verify root set contents
        const CHECK = 1 << 3;
        /// Heap may contain dark matter
        const DARKMATTER = 1 << 4;
        /// Heap may contain forwarded objects
        const MIDSCAVENGE = 1 << 5;
        /// Abort the process after a cycle with errors
        const ABORT = 1 << 6;
        /// Always dump thread stacks
        const ALWAYS_DUMP_STACK = 1 << 7;
        /// Only run after a scavenger backout
        const SCAVENGER_BACKOUT = 1 << 8;
        /// Never run for local collections
        const SUPPRESS_LOCAL = 1 << 9;
        /// Never run for global collections
        const SUPPRESS_GLOBAL = 1 << 10;
        /// Only run after a remembered-set overflow
        const REMEMBERED_SET_OVERFLOW = 1 << 11;
    }
}

/// Section of the option string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// First section
    Scan,
    /// Second section
    Verify,
    /// Third section
    Misc,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Section::Scan => "scan",
            Section::Verify => "verify",
            Section::Misc => "misc",
        })
    }
}

/// Option grammar failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    /// Token not recognized in its section
    #[error("unrecognized {section} option '{token}'")]
    UnknownToken {
        /// Section the token appeared in
        section: Section,
        /// Offending token
        token: String,
    },
    /// `name=N` with a bad number
    #[error("invalid numeric value in '{token}'")]
    InvalidNumber {
        /// Offending token
        token: String,
    },
    /// More than three colon-separated sections
    #[error("too many option sections in '{0}'")]
    TooManySections(String),
    /// Argument does not start with `-Xcheck:gc`
    #[error("'{0}' is not a -Xcheck:gc option")]
    NotGcCheck(String),
    /// `help` given where options were required
    #[error("help requested")]
    HelpRequested,
}

impl OptionError {
    /// Malformed option text; callers print [`HELP_TEXT`] alongside.
    pub fn wants_help(&self) -> bool {
        matches!(
            self,
            OptionError::UnknownToken { .. } | OptionError::InvalidNumber { .. } | OptionError::TooManySections(_)
        )
    }
}

/// Parsed options for one check cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOptions {
    /// Root sets to walk
    pub scan: ScanFlags,
    /// Invariants to verify
    pub check: CheckFlags,
    /// Behaviour switches
    pub misc: MiscFlags,
    /// Stop reporting after this many errors
    pub max_errors: Option<u64>,
    /// Run every Nth collection of either kind; 0 disables
    pub interval: u64,
    /// Run every Nth global collection; 0 disables
    pub global_interval: u64,
    /// Run every Nth local collection; 0 disables
    pub local_interval: u64,
    /// Skip collections before this one
    pub start_index: u64,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            scan: ScanFlags::all(),
            check: CheckFlags::all(),
            misc: MiscFlags::VERBOSE | MiscFlags::CHECK,
            max_errors: None,
            interval: 0,
            global_interval: 0,
            local_interval: 0,
            start_index: 0,
        }
    }
}

impl CheckOptions {
    /// Misc flag helper
    pub fn has(&self, flag: MiscFlags) -> bool {
        self.misc.contains(flag)
    }
}

/// Result of parsing an option string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionOutcome {
    /// `help` was requested; print [`HELP_TEXT`] and stop
    Help,
    /// Options to run with
    Options(CheckOptions),
}

/// Usage text printed for `help` and after a parse failure.
pub const HELP_TEXT: &str = "\
gc check usage:
  -Xcheck:gc[:<scan options>][:<verify options>][:<misc options>]

  scan options (default is all):
    all                    all object and VM slots
    none
    heap                   object heap and class heap
    objectheap
    classheap
    rememberedset
    unfinalized
    finalizable
    ownablesynchronizer
    stringtable
    classloaders
    jniglobalrefs
    jniweakglobalrefs
    tagtables
    monitortable
    vmclassslots
    vmthreads
    novmthreads
    threadstacks

  verify options (default is all):
    all
    none
    classslot              verify class pointers
    range                  verify objects fit their region
    flags                  verify header flags

  misc options (default is verbose,check):
    verbose | quiet
    manual                 only run when invoked manually
    scan | noscan          print root set contents
    check | nocheck        verify root set contents
    maxerrors=<n>
    darkmatter             tolerate dark matter in the heap
    midscavenge            tolerate forwarded objects
    abort | noabort        abort the process when errors are found
    dumpstack | nodumpstack
    interval=<n>
    globalinterval=<n>
    localinterval=<n>
    startindex=<n>
    scavengerbackout       only check after a scavenger backout
    suppresslocal          never check local collections
    suppressglobal         never check global collections
    rememberedsetoverflow  only check after a remembered set overflow
";

const XCHECK_PREFIX: &str = "-Xcheck:gc";

/// Scan token for a single root set.
fn scan_token(token: &str) -> Option<ScanFlags> {
    let flag = match token {
        "objectheap" => ScanFlags::OBJECT_HEAP,
        "classheap" => ScanFlags::CLASS_HEAP,
        "rememberedset" => ScanFlags::REMEMBERED_SET,
        "unfinalized" => ScanFlags::UNFINALIZED,
        "finalizable" => ScanFlags::FINALIZABLE,
        "ownablesynchronizer" => ScanFlags::OWNABLE_SYNCHRONIZER,
        "stringtable" => ScanFlags::STRING_TABLE,
        "classloaders" => ScanFlags::CLASS_LOADERS,
        "jniglobalrefs" => ScanFlags::JNI_GLOBAL_REFS,
        "jniweakglobalrefs" => ScanFlags::JNI_WEAK_GLOBAL_REFS,
        "tagtables" => ScanFlags::TAG_TABLES,
        "monitortable" => ScanFlags::MONITOR_TABLE,
        "vmclassslots" => ScanFlags::VM_CLASS_SLOTS,
        "vmthreads" => ScanFlags::VM_THREADS,
        "threadstacks" => ScanFlags::THREAD_STACKS,
        _ => return None,
    };
    Some(flag)
}

fn parse_scan(tokens: &str, scan: &mut ScanFlags) -> Result<(), OptionError> {
    for token in split_tokens(tokens) {
        match token.as_str() {
            "all" => *scan = ScanFlags::all(),
            "none" => *scan = ScanFlags::empty(),
            "heap" => *scan |= ScanFlags::OBJECT_HEAP | ScanFlags::CLASS_HEAP,
            "novmthreads" => scan.remove(ScanFlags::VM_THREADS),
            other => match scan_token(other) {
                Some(flag) => *scan |= flag,
                None => {
                    return Err(OptionError::UnknownToken {
                        section: Section::Scan,
                        token,
                    });
                }
            },
        }
    }
    Ok(())
}

fn parse_verify(tokens: &str, check: &mut CheckFlags) -> Result<(), OptionError> {
    for token in split_tokens(tokens) {
        match token.as_str() {
            "all" => *check = CheckFlags::all(),
            "none" => *check = CheckFlags::empty(),
            "classslot" => *check |= CheckFlags::CLASS_SLOT,
            "range" => *check |= CheckFlags::RANGE,
            "flags" => *check |= CheckFlags::FLAGS,
            _ => {
                return Err(OptionError::UnknownToken {
                    section: Section::Verify,
                    token,
                });
            }
        }
    }
    Ok(())
}

fn parse_number(token: &str, value: &str) -> Result<u64, OptionError> {
    value.trim().parse().map_err(|_| OptionError::InvalidNumber {
        token: token.to_string(),
    })
}

fn parse_misc(tokens: &str, options: &mut CheckOptions) -> Result<(), OptionError> {
    for token in split_tokens(tokens) {
        if let Some((name, value)) = token.split_once('=') {
            let number = parse_number(&token, value)?;
            match name {
                "maxerrors" => options.max_errors = Some(number),
                "interval" => options.interval = number,
                "globalinterval" => options.global_interval = number,
                "localinterval" => options.local_interval = number,
                "startindex" => options.start_index = number,
                _ => {
                    return Err(OptionError::UnknownToken {
                        section: Section::Misc,
                        token,
                    });
                }
            }
            continue;
        }

        let misc = &mut options.misc;
        match token.as_str() {
            "verbose" => misc.insert(MiscFlags::VERBOSE),
            "quiet" => misc.remove(MiscFlags::VERBOSE),
            "manual" => misc.insert(MiscFlags::MANUAL),
            "scan" => misc.insert(MiscFlags::SCAN),
            "noscan" => misc.remove(MiscFlags::SCAN),
            "check" => misc.insert(MiscFlags::CHECK),
            "nocheck" => misc.remove(MiscFlags::CHECK),
            "darkmatter" => misc.insert(MiscFlags::DARKMATTER),
            "midscavenge" => misc.insert(MiscFlags::MIDSCAVENGE),
            "abort" => misc.insert(MiscFlags::ABORT),
            "noabort" => misc.remove(MiscFlags::ABORT),
            "dumpstack" => misc.insert(MiscFlags::ALWAYS_DUMP_STACK),
            "nodumpstack" => misc.remove(MiscFlags::ALWAYS_DUMP_STACK),
            "scavengerbackout" => misc.insert(MiscFlags::SCAVENGER_BACKOUT),
            "suppresslocal" => misc.insert(MiscFlags::SUPPRESS_LOCAL),
            "suppressglobal" => misc.insert(MiscFlags::SUPPRESS_GLOBAL),
            "rememberedsetoverflow" => misc.insert(MiscFlags::REMEMBERED_SET_OVERFLOW),
            _ => {
                return Err(OptionError::UnknownToken {
                    section: Section::Misc,
                    token,
                });
            }
        }
    }
    Ok(())
}

fn split_tokens(section: &str) -> impl Iterator<Item = String> + '_ {
    section
        .split(',')
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
}

/// Parse the part after `-Xcheck:gc:`.
pub fn parse_options(text: &str) -> Result<OptionOutcome, OptionError> {
    let text = text.trim();
    if text
        .split([':', ','])
        .any(|token| token.trim().eq_ignore_ascii_case("help"))
    {
        return Ok(OptionOutcome::Help);
    }

    let sections: Vec<&str> = if text.is_empty() {
        Vec::new()
    } else {
        text.split(':').collect()
    };
    if sections.len() > 3 {
        return Err(OptionError::TooManySections(text.to_string()));
    }

    let mut options = CheckOptions {
        scan: ScanFlags::empty(),
        check: CheckFlags::empty(),
        ..CheckOptions::default()
    };

    if let Some(scan) = sections.first() {
        parse_scan(scan, &mut options.scan)?;
    }
    if let Some(verify) = sections.get(1) {
        parse_verify(verify, &mut options.check)?;
    }
    if let Some(misc) = sections.get(2) {
        parse_misc(misc, &mut options)?;
    }

    // An empty set cannot be told apart from "nothing requested".
    if options.scan.is_empty() {
        options.scan = ScanFlags::all();
    }
    if options.check.is_empty() {
        options.check = CheckFlags::all();
    }

    Ok(OptionOutcome::Options(options))
}

/// Parse a full `-Xcheck:gc[:...]` argument.
pub fn parse_xcheck_argument(argument: &str) -> Result<OptionOutcome, OptionError> {
    let argument = argument.trim();
    let Some(rest) = argument.strip_prefix(XCHECK_PREFIX) else {
        return Err(OptionError::NotGcCheck(argument.to_string()));
    };
    if rest.is_empty() {
        return parse_options("");
    }
    match rest.strip_prefix(':') {
        Some(body) => parse_options(body),
        None => Err(OptionError::NotGcCheck(argument.to_string())),
    }
}
