//! Respawning: lazily compiling branches nobody has taken yet, by
//! replaying emission from the nearest compiled ancestor
//! (`spec.md` §4.7).

use crate::entities::{BytecodeOffset, CodeBufferRef, ProxyRef};
use crate::snapshot::Snapshot;
use cranelift_entity::PrimaryMap;
use log::trace;

/// A frozen branch nobody has taken yet. The first real arrival at this
/// bytecode position triggers a replay from `respawned_from`'s origin
/// (or straight from the function entry, if `None`) up to `frozen_state`,
/// then continues compiling forward for real.
#[derive(Debug, Clone)]
pub struct CodingPauseProxy {
    pub bytecode_offset: BytecodeOffset,
    pub frozen_state: Snapshot,
    /// Ties this proxy back to the common ancestor replay must start
    /// from (`spec.md` §4.7 "The proxy chain (`respawned_from`) ties
    /// child proxies back to a common ancestor").
    pub respawned_from: Option<ProxyRef>,
    /// Set once the proxy has fired for real and been replaced by
    /// compiled code; a fired proxy is kept around (rather than removed)
    /// so other proxies chained off it can still find their origin.
    pub fired: Option<CodeBufferRef>,
}

/// Owns every coding-pause proxy for one compile.
#[derive(Debug, Default)]
pub struct ProxyTable {
    proxies: PrimaryMap<ProxyRef, CodingPauseProxy>,
}

impl ProxyTable {
    pub fn new() -> Self {
        ProxyTable {
            proxies: PrimaryMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        bytecode_offset: BytecodeOffset,
        frozen_state: Snapshot,
        respawned_from: Option<ProxyRef>,
    ) -> ProxyRef {
        self.proxies.push(CodingPauseProxy {
            bytecode_offset,
            frozen_state,
            respawned_from,
            fired: None,
        })
    }

    pub fn get(&self, r: ProxyRef) -> &CodingPauseProxy {
        &self.proxies[r]
    }

    pub fn mark_fired(&mut self, r: ProxyRef, at: CodeBufferRef) {
        self.proxies[r].fired = Some(at);
    }

    /// Find an installed-but-not-yet-fired proxy parked at `offset`, if
    /// any. A `compile_from` call landing exactly here is a respawn
    /// (`spec.md` §4.7 "Detection"), not a fresh compile.
    pub fn find_unfired_at(&self, offset: BytecodeOffset) -> Option<ProxyRef> {
        self.proxies
            .iter()
            .find(|(_, proxy)| proxy.bytecode_offset == offset && proxy.fired.is_none())
            .map(|(r, _)| r)
    }

    /// Walk `respawned_from` links up to the nearest already-compiled
    /// ancestor (or the root, if none of the chain has fired yet),
    /// returning the chain in replay order (ancestor first).
    pub fn replay_chain(&self, start: ProxyRef) -> Vec<ProxyRef> {
        let mut chain = vec![start];
        let mut cur = start;
        while let Some(parent) = self.proxies[cur].respawned_from {
            chain.push(parent);
            cur = parent;
            if self.proxies[cur].fired.is_some() {
                break;
            }
        }
        chain.reverse();
        chain
    }
}

/// Tracks whether the compiler is currently replaying frozen history
/// toward a proxy's position, and how many more steps remain.
///
/// `spec.md` §4.7 "Detection": `respawn_count` is a negative countdown
/// while replaying; reaching zero signals "we are now at the proxy."
#[derive(Debug, Clone, Copy, Default)]
pub struct RespawnCursor {
    count: i64,
}

impl RespawnCursor {
    pub fn idle() -> Self {
        RespawnCursor { count: 0 }
    }

    /// Begin a replay that must execute exactly `steps` operations before
    /// reaching the proxy's frozen position.
    pub fn begin(steps: u32) -> Self {
        debug_assert!(steps > 0, "a zero-length replay is not a replay");
        RespawnCursor { count: -(steps as i64) }
    }

    /// `spec.md` §4.7 "side-effectful operations... must be suppressed
    /// via the `is_respawning()` predicate".
    pub fn is_respawning(&self) -> bool {
        self.count < 0
    }

    /// Advance one step of replay. Returns `true` exactly when this call
    /// brings the cursor to zero: the proxy's position has now been
    /// reached and the compiler should switch from replay to real
    /// forward compilation.
    pub fn step(&mut self) -> bool {
        if self.count < 0 {
            self.count += 1;
        }
        trace!("respawn cursor at {}", self.count);
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_suppresses_side_effects_until_it_reaches_zero() {
        let mut cursor = RespawnCursor::begin(3);
        assert!(cursor.is_respawning());
        assert!(!cursor.step());
        assert!(!cursor.step());
        assert!(cursor.step());
        assert!(!cursor.is_respawning());
    }

    #[test]
    fn find_unfired_at_ignores_proxies_that_have_already_fired() {
        let mut table = ProxyTable::new();
        let fired = table.insert(BytecodeOffset(5), Snapshot::empty(), None);
        table.mark_fired(fired, CodeBufferRef::from_u32(0));
        let pending = table.insert(BytecodeOffset(10), Snapshot::empty(), None);

        assert_eq!(table.find_unfired_at(BytecodeOffset(5)), None);
        assert_eq!(table.find_unfired_at(BytecodeOffset(10)), Some(pending));
        assert_eq!(table.find_unfired_at(BytecodeOffset(99)), None);
    }

    #[test]
    fn replay_chain_stops_at_nearest_fired_ancestor() {
        let mut table = ProxyTable::new();
        let settings_snapshot = Snapshot::empty();
        let root = table.insert(BytecodeOffset(0), settings_snapshot.clone(), None);
        table.mark_fired(root, CodeBufferRef::from_u32(0));
        let mid = table.insert(BytecodeOffset(10), settings_snapshot.clone(), Some(root));
        let leaf = table.insert(BytecodeOffset(20), settings_snapshot, Some(mid));

        let chain = table.replay_chain(leaf);
        assert_eq!(chain, vec![root, mid, leaf]);
    }
}
