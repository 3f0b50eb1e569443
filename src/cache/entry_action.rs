//! Registry decision logic for the connection cache.
//!
//! This module extracts the pure decisions made under the registry lock by
//! `Cache::acquire` and the install step of a dial round, so they can be
//! unit tested without dialing anything.

/// What the registry currently holds for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Occupant {
    /// A registered connection that reports itself alive
    Healthy,
    /// A registered connection that reports itself broken
    Broken,
}

impl Occupant {
    pub(super) fn from_broken(broken: bool) -> Self {
        if broken { Occupant::Broken } else { Occupant::Healthy }
    }
}

/// Action to take when a caller asks for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LookupAction {
    /// Lease the registered connection
    ReturnExisting,
    /// Remove the registered connection, then dial
    EvictAndDial,
    /// Nothing registered; dial
    Dial,
}

/// Decide what to do with the registry slot for a requested key.
///
/// - `None`: nothing registered → Dial
/// - `Healthy`: → ReturnExisting
/// - `Broken`: the connection silently died → EvictAndDial
pub(super) fn decide_lookup(occupant: Option<Occupant>) -> LookupAction {
    match occupant {
        None => LookupAction::Dial,
        Some(Occupant::Healthy) => LookupAction::ReturnExisting,
        Some(Occupant::Broken) => LookupAction::EvictAndDial,
    }
}

/// Action to take when a dial round completes successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum InstallAction {
    /// Slot is vacant; register the new connection
    Insert,
    /// Slot holds a broken connection; swap in the new one and release the old
    Replace,
    /// Slot holds a healthy connection installed by someone else; keep it
    /// and discard the new one. Rounds for a key never overlap and re-check
    /// the registry before dialing, so a round only gets here if something
    /// registered the key outside of a round.
    KeepExisting,
}

/// Decide how to install a freshly dialed connection.
///
/// Never clobbers a healthy occupant, so two live connections for one key
/// cannot both stay registered.
pub(super) fn decide_install(occupant: Option<Occupant>) -> InstallAction {
    match occupant {
        None => InstallAction::Insert,
        Some(Occupant::Broken) => InstallAction::Replace,
        Some(Occupant::Healthy) => InstallAction::KeepExisting,
    }
}
