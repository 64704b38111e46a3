//! # Import Resolver
//!
//! Rebuilds the import table of the protected module from a [`MemorySnapshot`].
//!
//! The protector replaces every IAT slot with a pointer to a wrapper stub that
//! eventually jumps to the real API. Resolution works in three stages:
//!
//! 1. [`scanner`] finds the slots original code references and extends them
//!    to their contiguous runs (the candidate thunks).
//! 2. Each thunk is resolved by the cheapest method that works: direct
//!    (already an export or a single unconditional transfer), emulated (a
//!    [`StubSession`] runs the stub), or a profile signature match.
//! 3. Targets are mapped to `(module, symbol)` through the [`ExportIndex`].
//!
//! Every candidate ends up in the table; thunks nothing could resolve carry a
//! diagnostic instead of a symbol. Resolution only reads immutable data, so
//! the order thunks are processed in does not matter.

pub mod scanner;
pub mod stub;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info, warn};

pub use scanner::{CandidateThunk, IatReference, ReferenceKind};

use crate::emulator::{StubExit, StubSession};
use crate::exports::{ExportIndex, ResolvedSymbol};
use crate::oep::ImageLayout;
use crate::profile::ProtectorProfile;
use crate::snapshot::MemorySnapshot;
use crate::types::Address;

/// How a thunk was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionMethod
{
    /// The slot held an export, or the stub jumps straight to one.
    Direct,
    /// The stub was executed in a stub session.
    Emulated,
    /// A known wrapper shape was decoded.
    Signature,
    /// Nothing worked.
    Unresolved,
}

impl fmt::Display for ResolutionMethod
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Emulated => write!(f, "emulated"),
            Self::Signature => write!(f, "signature"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// How much a resolution can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Confidence
{
    /// Unresolved, or resolved under a low-confidence profile by a weak method.
    Low,
    /// Resolved indirectly (signature, decoys skipped, no-return API).
    Medium,
    /// Resolved by direct lookup or a clean emulation.
    High,
}

/// One resolved (or not) IAT slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry
{
    /// Address of the slot.
    pub thunk: Address,
    /// Value the slot held at the OEP.
    pub original: Address,
    /// The API, if resolved.
    pub symbol: Option<ResolvedSymbol>,
    /// Resolution method.
    pub method: ResolutionMethod,
    /// Trust in the result.
    pub confidence: Confidence,
    /// Diagnostic: which signature matched, or why resolution failed.
    pub reason: Option<String>,
}

impl ImportEntry
{
    /// Whether the entry names an API.
    #[must_use]
    pub fn is_resolved(&self) -> bool
    {
        self.symbol.is_some()
    }

    /// Address of the resolved API.
    #[must_use]
    pub fn target(&self) -> Option<Address>
    {
        self.symbol.as_ref().map(|symbol| symbol.address)
    }
}

/// Append-only collection of entries keyed by thunk address
#[derive(Debug, Clone, Default)]
pub struct ImportTableBuilder
{
    entries: BTreeMap<u64, ImportEntry>,
}

impl ImportTableBuilder
{
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Add an entry. The first entry for a thunk wins; returns `false` for duplicates.
    pub fn push(&mut self, entry: ImportEntry) -> bool
    {
        if self.entries.contains_key(&entry.thunk.value()) {
            return false;
        }
        self.entries.insert(entry.thunk.value(), entry);
        true
    }

    /// Number of entries so far.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    /// Check whether nothing was added.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    /// Freeze the table.
    #[must_use]
    pub fn finish(self) -> ImportTable
    {
        ImportTable { entries: self.entries }
    }
}

/// Immutable import table, ordered by thunk address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportTable
{
    entries: BTreeMap<u64, ImportEntry>,
}

impl ImportTable
{
    /// Table with no entries (imports skipped).
    #[must_use]
    pub fn empty() -> Self
    {
        Self::default()
    }

    /// Entry for a thunk.
    #[must_use]
    pub fn get(&self, thunk: Address) -> Option<&ImportEntry>
    {
        self.entries.get(&thunk.value())
    }

    /// Entries in thunk order.
    pub fn iter(&self) -> impl Iterator<Item = &ImportEntry>
    {
        self.entries.values()
    }

    /// Resolved entries.
    pub fn resolved(&self) -> impl Iterator<Item = &ImportEntry>
    {
        self.iter().filter(|entry| entry.is_resolved())
    }

    /// Unresolved entries.
    pub fn unresolved(&self) -> impl Iterator<Item = &ImportEntry>
    {
        self.iter().filter(|entry| !entry.is_resolved())
    }

    /// `module!symbol` of every resolved entry.
    #[must_use]
    pub fn symbols(&self) -> BTreeSet<String>
    {
        self.resolved()
            .filter_map(|entry| entry.symbol.as_ref().map(ToString::to_string))
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    /// Check whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

/// Resolve the imports of the snapshot's target
///
/// Never fails: when the target header cannot be read or no thunk is found the
/// table is simply empty.
#[must_use]
pub fn resolve(snapshot: &MemorySnapshot, profile: &ProtectorProfile) -> ImportTable
{
    let exports = ExportIndex::build(&snapshot.modules);
    let Some(layout) = ImageLayout::read(snapshot, snapshot.target.base, profile) else {
        warn!("Target header unreadable in snapshot; no imports resolved");
        return ImportTable::empty();
    };
    let references = scanner::find_references(snapshot, &layout);
    let candidates = scanner::candidate_thunks(snapshot, &layout, &exports, &references);
    resolve_candidates(snapshot, profile, &exports, &candidates)
}

/// Resolve an explicit candidate list
///
/// The returned table holds exactly one entry per distinct candidate slot.
#[must_use]
pub fn resolve_candidates(
    snapshot: &MemorySnapshot,
    profile: &ProtectorProfile,
    exports: &ExportIndex,
    candidates: &[CandidateThunk],
) -> ImportTable
{
    let mut builder = ImportTableBuilder::new();
    let mut emulated = 0usize;

    for candidate in candidates {
        let entry = resolve_thunk(snapshot, profile, exports, candidate, &mut emulated);
        match &entry.symbol {
            Some(symbol) => debug!("{} -> {symbol} ({}, {:?})", entry.thunk, entry.method, entry.confidence),
            None => debug!(
                "{} -> unresolved: {}",
                entry.thunk,
                entry.reason.as_deref().unwrap_or_default()
            ),
        }
        builder.push(entry);
    }

    let table = builder.finish();
    let unresolved = table.unresolved().count();
    info!(
        "Resolved {} of {} import thunks ({emulated} emulated)",
        table.len() - unresolved,
        table.len()
    );
    if unresolved > 0 {
        warn!("{unresolved} import thunks could not be resolved");
    }
    table
}

fn resolve_thunk(
    snapshot: &MemorySnapshot,
    profile: &ProtectorProfile,
    exports: &ExportIndex,
    candidate: &CandidateThunk,
    emulated: &mut usize,
) -> ImportEntry
{
    let mut entry = ImportEntry {
        thunk: candidate.slot,
        original: candidate.value,
        symbol: None,
        method: ResolutionMethod::Unresolved,
        confidence: Confidence::Low,
        reason: None,
    };
    let mut failures = Vec::new();

    if let Some(symbol) = stub::resolve_direct(snapshot, exports, candidate.value) {
        return finish(entry, profile, symbol, ResolutionMethod::Direct, Confidence::High, None);
    }

    if *emulated < profile.max_emulated {
        *emulated += 1;
        let mut session = StubSession::new(snapshot, exports, profile.stub_instruction_limit);
        if let Some(return_address) = candidate.return_address {
            session = session.with_return_address(return_address);
        }
        match session.run(candidate.value) {
            Ok(outcome) => {
                let (confidence, reason) = match (outcome.exit, outcome.decoys) {
                    (StubExit::Returned, 0) => (Confidence::High, None),
                    (StubExit::Returned, decoys) => (Confidence::Medium, Some(format!("{decoys} decoy calls skipped"))),
                    (StubExit::NoReturn, _) => (Confidence::Medium, Some("no-return API".to_string())),
                };
                return finish(entry, profile, outcome.symbol, ResolutionMethod::Emulated, confidence, reason);
            }
            Err(failure) => failures.push(format!("emulation: {failure}")),
        }
    } else {
        failures.push("emulation cap reached".to_string());
    }

    if let Some((symbol, name)) = stub::resolve_signature(snapshot, exports, &profile.stub_signatures, candidate.value) {
        return finish(
            entry,
            profile,
            symbol,
            ResolutionMethod::Signature,
            Confidence::Medium,
            Some(format!("signature {name}")),
        );
    }
    failures.push("no signature matched".to_string());

    entry.reason = Some(failures.join("; "));
    entry
}

fn finish(
    mut entry: ImportEntry,
    profile: &ProtectorProfile,
    symbol: ResolvedSymbol,
    method: ResolutionMethod,
    confidence: Confidence,
    reason: Option<String>,
) -> ImportEntry
{
    entry.symbol = Some(symbol);
    entry.method = method;
    entry.confidence = if profile.low_confidence {
        confidence.min(Confidence::Medium)
    } else {
        confidence
    };
    entry.reason = reason;
    entry
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn entry(thunk: u64, resolved: bool) -> ImportEntry
    {
        ImportEntry {
            thunk: Address::new(thunk),
            original: Address::new(0x1000),
            symbol: resolved.then(|| ResolvedSymbol {
                module: "kernel32.dll".to_string(),
                name: Some(format!("Api{thunk:x}")),
                ordinal: 1,
                address: Address::new(0x7700_0000 + thunk),
            }),
            method: if resolved {
                ResolutionMethod::Direct
            } else {
                ResolutionMethod::Unresolved
            },
            confidence: Confidence::High,
            reason: None,
        }
    }

    #[test]
    fn test_builder_is_append_only()
    {
        let mut builder = ImportTableBuilder::new();
        assert!(builder.push(entry(0x40_2004, true)));
        assert!(builder.push(entry(0x40_2000, false)));
        assert!(!builder.push(entry(0x40_2004, false)));

        let table = builder.finish();
        assert_eq!(table.len(), 2);
        assert!(table.get(Address::new(0x40_2004)).unwrap().is_resolved());
        let order: Vec<_> = table.iter().map(|e| e.thunk.value()).collect();
        assert_eq!(order, vec![0x40_2000, 0x40_2004]);
        assert_eq!(table.unresolved().count(), 1);
        assert_eq!(table.symbols().len(), 1);
    }

    #[test]
    fn test_confidence_order()
    {
        assert!(Confidence::High > Confidence::Medium);
        assert_eq!(Confidence::High.min(Confidence::Medium), Confidence::Medium);
    }
}
