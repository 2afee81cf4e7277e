//! Ruleset tables.
//!
//! The engine consumes these as opaque data: role catalogue, night order,
//! and the seat-count distribution. Rule text lives here as flags on role
//! definitions; the engine never hardcodes a role name outside this module
//! except where a command is itself role-shaped (slayer_shot).

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand::SeedableRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Townsfolk,
    Outsider,
    Minion,
    Demon,
}

impl RoleKind {
    pub fn is_evil(&self) -> bool {
        matches!(self, RoleKind::Minion | RoleKind::Demon)
    }
}

/// One role in the catalogue. Behavioral flags, not prose.
#[derive(Debug, Clone)]
pub struct RoleDef {
    pub id: &'static str,
    pub kind: RoleKind,
    /// Position in the first-night wake order; `None` never wakes then.
    pub first_night_order: Option<u32>,
    /// Position in the every-other-night wake order.
    pub other_night_order: Option<u32>,
    /// Needs a target when acting at night.
    pub night_targets: usize,
    /// Ability usable once per game at night (e.g. the ravenkeeper trigger
    /// is handled separately; this covers virgin-like one-shots).
    pub once_per_game: bool,
    /// May only vote yes after their chosen master has voted yes.
    pub vote_locked_to_master: bool,
    /// Carries a one-shot public day ability resolved by `slayer_shot`.
    pub day_shot: bool,
    /// A red-herring decoy is selected for this role at setup.
    pub wants_red_herring: bool,
}

const fn role(
    id: &'static str,
    kind: RoleKind,
    first_night_order: Option<u32>,
    other_night_order: Option<u32>,
    night_targets: usize,
) -> RoleDef {
    RoleDef {
        id,
        kind,
        first_night_order,
        other_night_order,
        night_targets,
        once_per_game: false,
        vote_locked_to_master: false,
        day_shot: false,
        wants_red_herring: false,
    }
}

/// Seat-count distribution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Distribution {
    pub townsfolk: usize,
    pub outsiders: usize,
    pub minions: usize,
    pub demons: usize,
}

/// A complete consumable ruleset.
#[derive(Debug, Clone)]
pub struct Ruleset {
    pub id: &'static str,
    roles: Vec<RoleDef>,
}

impl Ruleset {
    /// The bundled script. Others would load the same tables from data.
    pub fn trouble_brewing() -> Self {
        let mut roles = vec![
            role("washerwoman", RoleKind::Townsfolk, Some(32), None, 0),
            role("librarian", RoleKind::Townsfolk, Some(33), None, 0),
            role("investigator", RoleKind::Townsfolk, Some(34), None, 0),
            role("chef", RoleKind::Townsfolk, Some(35), None, 0),
            role("empath", RoleKind::Townsfolk, Some(36), Some(53), 0),
            role("fortune_teller", RoleKind::Townsfolk, Some(37), Some(54), 2),
            role("undertaker", RoleKind::Townsfolk, None, Some(55), 0),
            role("monk", RoleKind::Townsfolk, None, Some(12), 1),
            role("ravenkeeper", RoleKind::Townsfolk, None, None, 1),
            role("virgin", RoleKind::Townsfolk, None, None, 0),
            role("slayer", RoleKind::Townsfolk, None, None, 0),
            role("soldier", RoleKind::Townsfolk, None, None, 0),
            role("mayor", RoleKind::Townsfolk, None, None, 0),
            role("butler", RoleKind::Outsider, Some(38), Some(56), 1),
            role("drunk", RoleKind::Outsider, None, None, 0),
            role("recluse", RoleKind::Outsider, None, None, 0),
            role("saint", RoleKind::Outsider, None, None, 0),
            role("poisoner", RoleKind::Minion, Some(17), Some(7), 1),
            role("spy", RoleKind::Minion, Some(48), Some(68), 0),
            role("scarlet_woman", RoleKind::Minion, None, Some(19), 0),
            role("baron", RoleKind::Minion, None, None, 0),
            role("imp", RoleKind::Demon, None, Some(24), 1),
        ];
        for r in roles.iter_mut() {
            match r.id {
                "butler" => r.vote_locked_to_master = true,
                "slayer" => {
                    r.day_shot = true;
                    r.once_per_game = true;
                }
                "virgin" => r.once_per_game = true,
                "fortune_teller" => r.wants_red_herring = true,
                _ => {}
            }
        }
        Self {
            id: "trouble_brewing",
            roles,
        }
    }

    pub fn role(&self, id: &str) -> Option<&RoleDef> {
        self.roles.iter().find(|r| r.id == id)
    }

    pub fn roles_of(&self, kind: RoleKind) -> Vec<&RoleDef> {
        self.roles.iter().filter(|r| r.kind == kind).collect()
    }

    /// Standard table by seated player count. `None` if the table cannot
    /// host that many players.
    pub fn distribution(&self, players: usize) -> Option<Distribution> {
        let (townsfolk, outsiders, minions) = match players {
            5 => (3, 0, 1),
            6 => (3, 1, 1),
            7 => (5, 0, 1),
            8 => (5, 1, 1),
            9 => (5, 2, 1),
            10 => (7, 0, 2),
            11 => (7, 1, 2),
            12 => (7, 2, 2),
            13 => (9, 0, 3),
            14 => (9, 1, 3),
            15 => (9, 2, 3),
            _ => return None,
        };
        Some(Distribution {
            townsfolk,
            outsiders,
            minions,
            demons: 1,
        })
    }

    /// Deal roles for `players` seats. Returns the dealt role ids in seat
    /// order plus three out-of-play good roles as demon bluffs. Entirely
    /// driven by the seeded RNG so a given seed always deals the same game.
    pub fn deal(&self, players: usize, seed: u64) -> Option<Deal> {
        let dist = self.distribution(players)?;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut picked: Vec<&'static str> = Vec::with_capacity(players);
        let mut leftover_good: Vec<&'static str> = Vec::new();
        for (kind, count) in [
            (RoleKind::Townsfolk, dist.townsfolk),
            (RoleKind::Outsider, dist.outsiders),
            (RoleKind::Minion, dist.minions),
            (RoleKind::Demon, dist.demons),
        ] {
            let mut pool: Vec<&'static str> =
                self.roles_of(kind).iter().map(|r| r.id).collect();
            pool.shuffle(&mut rng);
            if pool.len() < count {
                return None;
            }
            picked.extend(pool.drain(..count));
            if !kind.is_evil() {
                leftover_good.extend(pool);
            }
        }

        picked.shuffle(&mut rng);
        leftover_good.shuffle(&mut rng);
        let bluffs = leftover_good.into_iter().take(3).collect();

        Some(Deal {
            roles: picked,
            bluffs,
        })
    }

    /// Uniform pick used for rule-determined random choices (replacement
    /// demon on starpass, red herring).
    pub fn pick<'a, T>(&self, candidates: &'a [T], seed: u64) -> Option<&'a T> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let idx = rng.gen_range(0..candidates.len());
        candidates.get(idx)
    }
}

/// Output of one setup deal.
#[derive(Debug, Clone)]
pub struct Deal {
    /// Role ids in seat order.
    pub roles: Vec<&'static str>,
    /// Out-of-play good roles shown to the demon.
    pub bluffs: Vec<&'static str>,
}
