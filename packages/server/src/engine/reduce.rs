//! Pure event reduction.
//!
//! `reduce` folds one event into a copy of the state. It must hold the
//! replay invariant: folding the whole log over a fresh state reproduces
//! the state any snapshot-plus-tail would. Unknown event types (from
//! `write_event`) advance `last_seq` and change nothing else.
//!
//! Liveness is monotone: no branch ever sets a dead player alive again.

use super::event::{event_types as et, EventRecord};
use super::state::{GameState, Nomination, Phase, Player, SubPhase, Team};
use crate::common::UserId;

pub fn reduce(state: &GameState, event: &EventRecord) -> GameState {
    let mut next = state.clone();
    apply(&mut next, event);
    if event.seq > next.last_seq {
        next.last_seq = event.seq;
    }
    next
}

fn apply(state: &mut GameState, event: &EventRecord) {
    match event.event_type.as_str() {
        et::PLAYER_JOINED => {
            let Some(user_id) = event.field("user_id").map(UserId::from) else {
                return;
            };
            let display_name = event
                .field("display_name")
                .unwrap_or(user_id.as_str())
                .to_string();
            let storyteller = event.field("storyteller") == Some("true");
            state
                .players
                .entry(user_id.clone())
                .or_insert_with(|| Player::new(user_id, display_name, storyteller));
        }
        et::PLAYER_LEFT => {
            let Some(user_id) = event.field("user_id").map(UserId::from) else {
                return;
            };
            state.players.remove(&user_id);
            state.seat_order.retain(|id| *id != user_id);
        }
        et::SEAT_CLAIMED => {
            let Some(user_id) = event.field("user_id").map(UserId::from) else {
                return;
            };
            let Some(seat) = event.field("seat").and_then(|s| s.parse::<u32>().ok()) else {
                return;
            };
            if let Some(player) = state.players.get_mut(&user_id) {
                player.seat = Some(seat);
            }
            rebuild_seat_order(state);
        }
        et::GAME_STARTED => {
            if let Some(ruleset) = event.field("ruleset") {
                state.ruleset_id = ruleset.to_string();
            }
        }
        et::SETUP_COMPLETED => {
            state.demon_id = event.field("demon").map(UserId::from);
            state.minion_ids = parse_id_list(event.field("minions"));
            state.bluffs = parse_str_list(event.field("bluffs"));
            state.red_herring = event
                .field("red_herring")
                .filter(|s| !s.is_empty())
                .map(UserId::from);
        }
        et::ROLE_ASSIGNED => {
            let Some(user_id) = event.field("user_id").map(UserId::from) else {
                return;
            };
            let role = event.field("true_role").map(str::to_string);
            let is_demon = event.field("is_demon") == Some("true");
            let is_minion = event.field("is_minion") == Some("true");
            let team = match event.field("team") {
                Some("evil") => Some(Team::Evil),
                Some("good") => Some(Team::Good),
                _ => None,
            };
            if let Some(player) = state.players.get_mut(&user_id) {
                player.role = role;
                player.team = team;
            }
            if is_demon {
                // Promotion (starpass, scarlet woman) moves the mantle.
                if state.demon_id.as_ref() != Some(&user_id) {
                    state.minion_ids.retain(|id| *id != user_id);
                    state.demon_id = Some(user_id);
                }
            } else if is_minion && !state.minion_ids.contains(&user_id) {
                state.minion_ids.push(user_id);
            }
        }
        et::PHASE_CHANGED => {
            let Some(to) = event.field("to").and_then(|s| s.parse::<Phase>().ok()) else {
                return;
            };
            state.phase = to;
            match to {
                Phase::FirstNight | Phase::Night => {
                    state.sub_phase = SubPhase::Idle;
                    state.night_number += 1;
                    state.protected_tonight = None;
                    state.poisoned_tonight = None;
                    state.acted_tonight.clear();
                    state.nomination = None;
                }
                Phase::Day => {
                    state.sub_phase = SubPhase::Discussion;
                    state.day_number += 1;
                    state.nominators_today.clear();
                    state.nominees_today.clear();
                    state.highest_vote_today = 0;
                    state.executed_today = None;
                    state.nomination = None;
                }
                Phase::Nomination => {
                    state.sub_phase = SubPhase::NominationOpen;
                }
                Phase::Voting => {
                    state.sub_phase = SubPhase::Voting;
                }
                Phase::Lobby | Phase::Ended => {
                    state.sub_phase = SubPhase::Idle;
                }
            }
        }
        et::PUBLIC_CHAT => {}
        et::WHISPER_SENT => {}
        et::NOMINATION_CREATED => {
            let (Some(nominator), Some(nominee)) = (
                event.field("nominator").map(UserId::from),
                event.field("nominee").map(UserId::from),
            ) else {
                return;
            };
            state.nominators_today.insert(nominator.clone());
            state.nominees_today.insert(nominee.clone());
            state.nomination = Some(Nomination::new(nominator, nominee));
            state.phase = Phase::Nomination;
            state.sub_phase = SubPhase::Defense;
        }
        et::DEFENSE_ENDED => {
            state.phase = Phase::Voting;
            state.sub_phase = SubPhase::Voting;
        }
        et::VOTE_CAST => {
            let Some(voter) = event.field("voter").map(UserId::from) else {
                return;
            };
            let yes = event.field("vote") == Some("yes");
            let ghost = event.field("ghost") == Some("true");
            if let Some(nomination) = state.nomination.as_mut() {
                nomination.votes.insert(voter.clone(), yes);
            }
            if ghost {
                if let Some(player) = state.players.get_mut(&voter) {
                    player.ghost_vote_used = true;
                }
            }
        }
        et::NOMINATION_RESOLVED => {
            let yes_count = event
                .field("yes_count")
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(0);
            if yes_count > state.highest_vote_today {
                state.highest_vote_today = yes_count;
            }
            if let Some(nomination) = state.nomination.as_mut() {
                nomination.resolved = true;
            }
            // Back to the floor; an execution or game end may follow in the
            // same batch and override.
            if state.phase == Phase::Voting {
                state.phase = Phase::Nomination;
                state.sub_phase = SubPhase::NominationOpen;
            }
        }
        et::EXECUTION_RESOLVED => {
            if let Some(user_id) = event.field("user_id").map(UserId::from) {
                state.executed_today = Some(user_id.clone());
                state.last_executed = Some(user_id);
            }
        }
        et::PLAYER_DIED => {
            let Some(user_id) = event.field("user_id").map(UserId::from) else {
                return;
            };
            if let Some(player) = state.players.get_mut(&user_id) {
                player.alive = false;
            }
            state.pending_deaths.retain(|id| *id != user_id);
            if state.protected_tonight.as_ref() == Some(&user_id) {
                state.protected_tonight = None;
            }
        }
        et::GAME_ENDED => {
            state.phase = Phase::Ended;
            state.sub_phase = SubPhase::Idle;
            state.nomination = None;
            state.winner = match event.field("winner") {
                Some("good") => Some(Team::Good),
                Some("evil") => Some(Team::Evil),
                _ => None,
            };
        }
        et::ABILITY_USED => {
            let Some(user_id) = event.field("user_id").map(UserId::from) else {
                return;
            };
            state.acted_tonight.insert(user_id.clone());
            let targets = parse_id_list(event.field("targets"));
            match event.field("role") {
                Some("poisoner") => {
                    state.poisoned_tonight = targets.first().cloned();
                }
                Some("monk") => {
                    state.protected_tonight = targets.first().cloned();
                }
                Some("butler") => {
                    if let Some(player) = state.players.get_mut(&user_id) {
                        player.master = targets.first().cloned();
                    }
                }
                Some("virgin") => {
                    if let Some(player) = state.players.get_mut(&user_id) {
                        player.once_ability_used = true;
                    }
                }
                Some("imp") => {
                    if let Some(victim) = targets.first() {
                        let protected = state.protected_tonight.as_ref() == Some(victim);
                        let poisoned_demon = state.poisoned(&user_id);
                        let soldier = state
                            .players
                            .get(victim)
                            .map(|p| p.role.as_deref() == Some("soldier"))
                            .unwrap_or(false);
                        let already_dead = state
                            .players
                            .get(victim)
                            .map(|p| !p.alive)
                            .unwrap_or(true);
                        if !protected && !poisoned_demon && !soldier && !already_dead {
                            if !state.pending_deaths.contains(victim) {
                                state.pending_deaths.push(victim.clone());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        et::NIGHT_INFO => {
            let Some(user_id) = event.field("user_id").map(UserId::from) else {
                return;
            };
            if let Some(player) = state.players.get_mut(&user_id) {
                if let Some(info) = event.field("info") {
                    player.night_info.push(info.to_string());
                }
            }
        }
        et::SLAYER_SHOT => {
            if let Some(shooter) = event.field("shooter").map(UserId::from) {
                if let Some(player) = state.players.get_mut(&shooter) {
                    player.day_shot_used = true;
                }
            }
        }
        // write_event types and future vocabulary: advance last_seq only.
        _ => {}
    }
}

fn rebuild_seat_order(state: &mut GameState) {
    let mut seated: Vec<(u32, UserId)> = state
        .players
        .values()
        .filter(|p| !p.is_storyteller)
        .filter_map(|p| p.seat.map(|s| (s, p.user_id.clone())))
        .collect();
    seated.sort();
    state.seat_order = seated.into_iter().map(|(_, id)| id).collect();
}

fn parse_id_list(field: Option<&str>) -> Vec<UserId> {
    field
        .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .map(|v| v.into_iter().map(UserId::from).collect())
        .unwrap_or_default()
}

fn parse_str_list(field: Option<&str>) -> Vec<String> {
    field
        .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RoomId;
    use crate::engine::event::{payload, Payload};

    fn ev(event_type: &str, seq: i64, pairs: Payload) -> EventRecord {
        let mut event = EventRecord::draft(event_type, UserId::system(), "cmd-1", pairs);
        event.seq = seq;
        event
    }

    #[test]
    fn join_and_seat() {
        let state = GameState::new(RoomId::from("r"));
        let state = reduce(
            &state,
            &ev(
                et::PLAYER_JOINED,
                1,
                payload([
                    ("user_id", "alice".to_string()),
                    ("display_name", "Alice".to_string()),
                    ("storyteller", "false".to_string()),
                ]),
            ),
        );
        let state = reduce(
            &state,
            &ev(
                et::SEAT_CLAIMED,
                2,
                payload([("user_id", "alice".to_string()), ("seat", "0".to_string())]),
            ),
        );
        assert_eq!(state.last_seq, 2);
        assert_eq!(state.seat_order, vec![UserId::from("alice")]);
        assert_eq!(state.player(&UserId::from("alice")).unwrap().seat, Some(0));
    }

    #[test]
    fn liveness_is_monotone() {
        let mut state = GameState::new(RoomId::from("r"));
        let alice = UserId::from("alice");
        state
            .players
            .insert(alice.clone(), Player::new(alice.clone(), "Alice".into(), false));

        let state = reduce(
            &state,
            &ev(et::PLAYER_DIED, 1, payload([("user_id", "alice".to_string())])),
        );
        assert!(!state.player(&alice).unwrap().alive);

        // No event type resurrects.
        let state = reduce(
            &state,
            &ev(
                et::ROLE_ASSIGNED,
                2,
                payload([
                    ("user_id", "alice".to_string()),
                    ("true_role", "imp".to_string()),
                    ("is_demon", "true".to_string()),
                ]),
            ),
        );
        assert!(!state.player(&alice).unwrap().alive);
    }

    #[test]
    fn unknown_event_type_only_advances_seq() {
        let state = GameState::new(RoomId::from("r"));
        let next = reduce(&state, &ev("storyteller.note", 7, Payload::new()));
        assert_eq!(next.last_seq, 7);
        assert_eq!(next.players.len(), 0);
        assert_eq!(next.phase, Phase::Lobby);
    }

    #[test]
    fn last_seq_never_regresses() {
        let state = GameState::new(RoomId::from("r"));
        let state = reduce(&state, &ev("a.b", 5, Payload::new()));
        let state = reduce(&state, &ev("a.b", 0, Payload::new()));
        assert_eq!(state.last_seq, 5);
    }

    #[test]
    fn imp_kill_respects_protection() {
        let mut state = GameState::new(RoomId::from("r"));
        for name in ["imp", "monk", "victim"] {
            let uid = UserId::from(name);
            let mut p = Player::new(uid.clone(), name.to_string(), false);
            p.seat = Some(state.seat_order.len() as u32);
            p.role = Some(name.to_string());
            state.players.insert(uid.clone(), p);
            state.seat_order.push(uid);
        }
        state.protected_tonight = Some(UserId::from("victim"));

        let state = reduce(
            &state,
            &ev(
                et::ABILITY_USED,
                1,
                payload([
                    ("user_id", "imp".to_string()),
                    ("role", "imp".to_string()),
                    ("targets", "[\"victim\"]".to_string()),
                ]),
            ),
        );
        assert!(state.pending_deaths.is_empty());
    }
}
