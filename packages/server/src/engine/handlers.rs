//! Pure command handling.
//!
//! `handle_command` inspects the command type and the current state and
//! either returns the event list it legalises or an [`EngineError`] saying
//! why the command is illegal. No I/O, no clocks; randomness only through
//! the seed on [`EngineContext`], so identical inputs give identical events.
//!
//! Consequence chains (a vote that resolves a nomination that kills the
//! demon that ends the game) are built by reducing each emitted event into
//! a scratch state and deciding the next event against that.

use serde_json::Value;
use thiserror::Error;

use crate::common::UserId;

use super::command::{CommandEnvelope, CommandType};
use super::event::{event_types as et, payload, EventRecord, Payload};
use super::reduce::reduce;
use super::ruleset::{RoleKind, Ruleset};
use super::state::{GameState, Phase, SubPhase, Team};

/// Why the engine refused a command. The display string becomes the
/// `command_result.reason` the client sees.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown command type")]
    UnknownCommand,
    #[error("not a member of this room")]
    NotMember,
    #[error("privilege required")]
    PrivilegeRequired,
    #[error("illegal in current phase: {0}")]
    WrongPhase(String),
    #[error("already acted: {0}")]
    AlreadyActed(String),
    #[error("illegal target: {0}")]
    IllegalTarget(String),
    #[error("bad payload: {0}")]
    BadPayload(String),
}

/// Caller-supplied inputs the pure engine is allowed to consume.
pub struct EngineContext<'a> {
    /// Seed for every rule-determined random choice this command makes.
    pub rng_seed: u64,
    pub ruleset: &'a Ruleset,
}

/// Scratch accumulator: every pushed event is immediately reduced so later
/// decisions see the intermediate state.
struct Chain<'a> {
    state: GameState,
    events: Vec<EventRecord>,
    cmd: &'a CommandEnvelope,
}

impl<'a> Chain<'a> {
    fn new(state: &GameState, cmd: &'a CommandEnvelope) -> Self {
        Self {
            state: state.clone(),
            events: Vec::new(),
            cmd,
        }
    }

    fn push(&mut self, event_type: &str, actor: UserId, payload: Payload) {
        let event = EventRecord::draft(event_type, actor, &self.cmd.command_id, payload);
        self.state = reduce(&self.state, &event);
        self.events.push(event);
    }

    fn push_actor(&mut self, event_type: &str, payload: Payload) {
        self.push(event_type, self.cmd.actor_user_id.clone(), payload);
    }
}

/// Entry point: `state × command → events | error`.
pub fn handle_command(
    state: &GameState,
    cmd: &CommandEnvelope,
    ctx: &EngineContext,
) -> Result<Vec<EventRecord>, EngineError> {
    let mut chain = Chain::new(state, cmd);
    match cmd.command_type {
        CommandType::Join => join(&mut chain)?,
        CommandType::Leave => leave(&mut chain)?,
        CommandType::ClaimSeat => claim_seat(&mut chain)?,
        CommandType::StartGame => start_game(&mut chain, ctx)?,
        CommandType::PublicChat => public_chat(&mut chain)?,
        CommandType::Whisper => whisper(&mut chain)?,
        CommandType::Nominate => nominate(&mut chain)?,
        CommandType::EndDefense => end_defense(&mut chain)?,
        CommandType::Vote => vote(&mut chain, ctx)?,
        CommandType::ResolveNomination => resolve_nomination_cmd(&mut chain)?,
        CommandType::UseAbility => use_ability(&mut chain, ctx)?,
        CommandType::AdvancePhase => advance_phase(&mut chain)?,
        CommandType::WriteEvent => write_event(&mut chain)?,
        CommandType::SlayerShot => slayer_shot(&mut chain, ctx)?,
    }
    debug_assert!(!chain.events.is_empty());
    Ok(chain.events)
}

// =============================================================================
// Shared checks
// =============================================================================

fn require_member(chain: &Chain) -> Result<(), EngineError> {
    let actor = &chain.cmd.actor_user_id;
    // The reserved actors speak in every room they observe.
    if actor.is_ai() || actor.is_system() || chain.state.is_member(actor) {
        Ok(())
    } else {
        Err(EngineError::NotMember)
    }
}

fn require_privileged(chain: &Chain) -> Result<(), EngineError> {
    if chain.state.is_privileged(&chain.cmd.actor_user_id) {
        Ok(())
    } else {
        Err(EngineError::PrivilegeRequired)
    }
}

fn required_str<'a>(cmd: &'a CommandEnvelope, key: &str) -> Result<&'a str, EngineError> {
    cmd.str_field(key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::BadPayload(format!("missing field: {}", key)))
}

fn json_list(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

// =============================================================================
// Lobby commands
// =============================================================================

fn join(chain: &mut Chain) -> Result<(), EngineError> {
    let cmd = chain.cmd;
    if chain.state.is_member(&cmd.actor_user_id) {
        return Err(EngineError::AlreadyActed("already a member".to_string()));
    }
    let storyteller = cmd
        .payload
        .get("storyteller")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if chain.state.phase.is_started() && !storyteller {
        return Err(EngineError::WrongPhase(
            "players can only join before the game starts".to_string(),
        ));
    }
    let display_name = cmd
        .str_field("display_name")
        .unwrap_or(cmd.actor_user_id.as_str())
        .to_string();
    chain.push_actor(
        et::PLAYER_JOINED,
        payload([
            ("user_id", cmd.actor_user_id.to_string()),
            ("display_name", display_name),
            ("storyteller", storyteller.to_string()),
        ]),
    );
    Ok(())
}

fn leave(chain: &mut Chain) -> Result<(), EngineError> {
    require_member(chain)?;
    let actor = chain.cmd.actor_user_id.clone();
    let is_storyteller = chain
        .state
        .player(&actor)
        .map(|p| p.is_storyteller)
        .unwrap_or(false);
    if chain.state.phase.is_started() && !is_storyteller {
        return Err(EngineError::WrongPhase(
            "seated players cannot leave a running game".to_string(),
        ));
    }
    chain.push_actor(et::PLAYER_LEFT, payload([("user_id", actor.to_string())]));
    Ok(())
}

fn claim_seat(chain: &mut Chain) -> Result<(), EngineError> {
    require_member(chain)?;
    if chain.state.phase != Phase::Lobby {
        return Err(EngineError::WrongPhase(
            "seats are claimed in the lobby".to_string(),
        ));
    }
    let actor = chain.cmd.actor_user_id.clone();
    if chain
        .state
        .player(&actor)
        .map(|p| p.is_storyteller)
        .unwrap_or(false)
    {
        return Err(EngineError::IllegalTarget(
            "the storyteller does not take a seat".to_string(),
        ));
    }
    let seat = chain
        .cmd
        .payload
        .get("seat")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| EngineError::BadPayload("missing field: seat".to_string()))?;
    let taken = chain
        .state
        .players
        .values()
        .any(|p| !p.is_storyteller && p.user_id != actor && p.seat == Some(seat as u32));
    if taken {
        return Err(EngineError::IllegalTarget(format!("seat {} is taken", seat)));
    }
    chain.push_actor(
        et::SEAT_CLAIMED,
        payload([
            ("user_id", actor.to_string()),
            ("seat", seat.to_string()),
        ]),
    );
    Ok(())
}

// =============================================================================
// Setup
// =============================================================================

fn start_game(chain: &mut Chain, ctx: &EngineContext) -> Result<(), EngineError> {
    require_privileged(chain)?;
    if chain.state.phase != Phase::Lobby {
        return Err(EngineError::WrongPhase("game already started".to_string()));
    }
    let unseated = chain
        .state
        .players
        .values()
        .filter(|p| !p.is_storyteller && p.seat.is_none())
        .count();
    if unseated > 0 {
        return Err(EngineError::BadPayload(format!(
            "{} players have not claimed a seat",
            unseated
        )));
    }
    let seats: Vec<UserId> = chain
        .state
        .seat_order
        .iter()
        .cloned()
        .collect();
    let deal = ctx
        .ruleset
        .deal(seats.len(), ctx.rng_seed)
        .ok_or_else(|| {
            EngineError::BadPayload(format!(
                "ruleset {} cannot seat {} players",
                ctx.ruleset.id,
                seats.len()
            ))
        })?;

    chain.push_actor(
        et::GAME_STARTED,
        payload([
            ("ruleset", ctx.ruleset.id.to_string()),
            ("player_count", seats.len().to_string()),
        ]),
    );

    let mut demon: Option<UserId> = None;
    let mut minions: Vec<UserId> = Vec::new();
    let mut good_players: Vec<UserId> = Vec::new();
    let mut fortune_teller_dealt = false;
    for (user_id, role_id) in seats.iter().zip(deal.roles.iter()) {
        let def = ctx
            .ruleset
            .role(role_id)
            .ok_or_else(|| EngineError::BadPayload(format!("unknown role {}", role_id)))?;
        match def.kind {
            RoleKind::Demon => demon = Some(user_id.clone()),
            RoleKind::Minion => minions.push(user_id.clone()),
            _ => good_players.push(user_id.clone()),
        }
        if def.wants_red_herring {
            fortune_teller_dealt = true;
        }
        chain.push(
            et::ROLE_ASSIGNED,
            UserId::system(),
            payload([
                ("user_id", user_id.to_string()),
                ("true_role", role_id.to_string()),
                ("is_demon", (def.kind == RoleKind::Demon).to_string()),
                ("is_minion", (def.kind == RoleKind::Minion).to_string()),
                (
                    "team",
                    if def.kind.is_evil() { "evil" } else { "good" }.to_string(),
                ),
            ]),
        );
    }
    let demon = demon.ok_or_else(|| EngineError::BadPayload("deal produced no demon".to_string()))?;

    let red_herring = if fortune_teller_dealt {
        ctx.ruleset
            .pick(&good_players, ctx.rng_seed.wrapping_add(1))
            .cloned()
    } else {
        None
    };

    let minions_json =
        serde_json::to_string(&minions.iter().map(|m| m.to_string()).collect::<Vec<_>>())
            .unwrap_or_default();
    let bluffs_json = serde_json::to_string(&deal.bluffs).unwrap_or_default();
    chain.push(
        et::SETUP_COMPLETED,
        UserId::system(),
        payload([
            ("demon", demon.to_string()),
            ("minions", minions_json.clone()),
            ("bluffs", bluffs_json.clone()),
            (
                "red_herring",
                red_herring.map(|r| r.to_string()).unwrap_or_default(),
            ),
        ]),
    );

    // Evil info: the demon learns its minions and three bluffs, minions
    // learn their demon and each other.
    chain.push(
        et::NIGHT_INFO,
        UserId::system(),
        payload([
            ("user_id", demon.to_string()),
            (
                "info",
                format!("Your minions: {}. Out-of-play bluffs: {}.", minions_json, bluffs_json),
            ),
        ]),
    );
    for minion in &minions {
        let others: Vec<String> = minions
            .iter()
            .filter(|m| *m != minion)
            .map(|m| m.to_string())
            .collect();
        chain.push(
            et::NIGHT_INFO,
            UserId::system(),
            payload([
                ("user_id", minion.to_string()),
                (
                    "info",
                    format!(
                        "The demon is {}. Fellow minions: {}.",
                        demon,
                        serde_json::to_string(&others).unwrap_or_default()
                    ),
                ),
            ]),
        );
    }

    chain.push(
        et::PHASE_CHANGED,
        UserId::system(),
        payload([
            ("from", Phase::Lobby.to_string()),
            ("to", Phase::FirstNight.to_string()),
        ]),
    );
    Ok(())
}

// =============================================================================
// Chat
// =============================================================================

fn public_chat(chain: &mut Chain) -> Result<(), EngineError> {
    require_member(chain)?;
    let message = required_str(chain.cmd, "message")?;
    if message.len() > 2000 {
        return Err(EngineError::BadPayload("message too long".to_string()));
    }
    let message = message.to_string();
    chain.push_actor(
        et::PUBLIC_CHAT,
        payload([
            ("user_id", chain.cmd.actor_user_id.to_string()),
            ("message", message),
        ]),
    );
    Ok(())
}

fn whisper(chain: &mut Chain) -> Result<(), EngineError> {
    require_member(chain)?;
    let to = UserId::from(required_str(chain.cmd, "to_user_id")?);
    let message = required_str(chain.cmd, "message")?.to_string();
    if to == chain.cmd.actor_user_id {
        return Err(EngineError::IllegalTarget("cannot whisper yourself".to_string()));
    }
    let recipient = chain
        .state
        .player(&to)
        .ok_or_else(|| EngineError::IllegalTarget(format!("{} is not in this room", to)))?;
    if !recipient.alive && !recipient.is_storyteller {
        return Err(EngineError::IllegalTarget(format!("{} is dead", to)));
    }
    chain.push_actor(
        et::WHISPER_SENT,
        payload([
            ("from", chain.cmd.actor_user_id.to_string()),
            ("to", to.to_string()),
            ("message", message),
        ]),
    );
    Ok(())
}

// =============================================================================
// Nominations and voting
// =============================================================================

fn nominate(chain: &mut Chain) -> Result<(), EngineError> {
    require_member(chain)?;
    if !matches!(chain.state.phase, Phase::Day | Phase::Nomination) {
        return Err(EngineError::WrongPhase(
            "nominations happen during the day".to_string(),
        ));
    }
    if chain
        .state
        .nomination
        .as_ref()
        .map(|n| !n.resolved)
        .unwrap_or(false)
    {
        return Err(EngineError::WrongPhase(
            "another nomination is still open".to_string(),
        ));
    }
    let nominator = chain.cmd.actor_user_id.clone();
    let nominator_player = chain
        .state
        .player(&nominator)
        .ok_or(EngineError::NotMember)?;
    if nominator_player.is_storyteller {
        return Err(EngineError::IllegalTarget(
            "the storyteller does not nominate".to_string(),
        ));
    }
    if !nominator_player.alive {
        return Err(EngineError::IllegalTarget("dead players cannot nominate".to_string()));
    }
    if chain.state.nominators_today.contains(&nominator) {
        return Err(EngineError::AlreadyActed(
            "you have already nominated today".to_string(),
        ));
    }
    let nominee = UserId::from(required_str(chain.cmd, "nominee")?);
    let nominee_player = chain
        .state
        .player(&nominee)
        .ok_or_else(|| EngineError::IllegalTarget(format!("{} is not in this room", nominee)))?;
    if nominee_player.is_storyteller || nominee_player.seat.is_none() {
        return Err(EngineError::IllegalTarget("nominee is not seated".to_string()));
    }
    if !nominee_player.alive {
        return Err(EngineError::IllegalTarget("nominee is dead".to_string()));
    }
    if chain.state.nominees_today.contains(&nominee) {
        return Err(EngineError::AlreadyActed(
            "that player was already nominated today".to_string(),
        ));
    }
    chain.push_actor(
        et::NOMINATION_CREATED,
        payload([
            ("nominator", nominator.to_string()),
            ("nominee", nominee.to_string()),
        ]),
    );

    // Virgin: nominating an undrunk virgin executes the nominator, once
    // per game. A poisoned trigger fizzles without spending the ability.
    let virgin_triggers = {
        let nominee_player = chain.state.player(&nominee);
        nominee_player
            .map(|p| p.role.as_deref() == Some("virgin") && !p.once_ability_used)
            .unwrap_or(false)
            && !chain.state.poisoned(&nominee)
    };
    if virgin_triggers {
        chain.push(
            et::ABILITY_USED,
            UserId::system(),
            payload([
                ("user_id", nominee.to_string()),
                ("role", "virgin".to_string()),
                ("targets", format!("[\"{}\"]", nominator)),
            ]),
        );
        death_chain(chain, &nominator, "virgin");
    }
    Ok(())
}

fn end_defense(chain: &mut Chain) -> Result<(), EngineError> {
    require_member(chain)?;
    if chain.state.phase != Phase::Nomination {
        return Err(EngineError::WrongPhase("no nomination to close".to_string()));
    }
    let nomination = chain
        .state
        .nomination
        .clone()
        .filter(|n| !n.resolved)
        .ok_or_else(|| EngineError::WrongPhase("no open nomination".to_string()))?;
    let actor = &chain.cmd.actor_user_id;
    let allowed = *actor == nomination.nominator
        || *actor == nomination.nominee
        || chain.state.is_privileged(actor);
    if !allowed {
        return Err(EngineError::PrivilegeRequired);
    }
    chain.push_actor(
        et::DEFENSE_ENDED,
        payload([("nominee", nomination.nominee.to_string())]),
    );
    Ok(())
}

fn vote(chain: &mut Chain, ctx: &EngineContext) -> Result<(), EngineError> {
    require_member(chain)?;
    if chain.state.phase != Phase::Voting || chain.state.sub_phase != SubPhase::Voting {
        return Err(EngineError::WrongPhase("voting is not open".to_string()));
    }
    let nomination = chain
        .state
        .nomination
        .clone()
        .filter(|n| !n.resolved)
        .ok_or_else(|| EngineError::WrongPhase("no open nomination".to_string()))?;
    let voter = chain.cmd.actor_user_id.clone();
    let player = chain.state.player(&voter).ok_or(EngineError::NotMember)?;
    if player.is_storyteller || player.seat.is_none() {
        return Err(EngineError::IllegalTarget("only seated players vote".to_string()));
    }
    if nomination.votes.contains_key(&voter) {
        return Err(EngineError::AlreadyActed("you already voted".to_string()));
    }
    let ghost = !player.alive;
    if ghost && player.ghost_vote_used {
        return Err(EngineError::IllegalTarget(
            "your ghost vote is spent".to_string(),
        ));
    }
    let yes = chain
        .cmd
        .payload
        .get("vote")
        .and_then(|v| v.as_str())
        .map(|s| s == "yes")
        .ok_or_else(|| EngineError::BadPayload("vote must be \"yes\" or \"no\"".to_string()))?;

    // Some roles may only raise their hand after their chosen master has.
    if yes {
        let locked = player
            .role
            .as_deref()
            .and_then(|r| ctx.ruleset.role(r))
            .map(|def| def.vote_locked_to_master)
            .unwrap_or(false);
        if locked {
            let master_voted_yes = player
                .master
                .as_ref()
                .and_then(|m| nomination.votes.get(m))
                .copied()
                .unwrap_or(false);
            if !master_voted_yes {
                return Err(EngineError::IllegalTarget(
                    "your master has not voted yes".to_string(),
                ));
            }
        }
    }

    let yes_count_after = nomination.yes_count() + if yes { 1 } else { 0 };
    chain.push_actor(
        et::VOTE_CAST,
        payload([
            ("voter", voter.to_string()),
            ("vote", if yes { "yes" } else { "no" }.to_string()),
            ("ghost", ghost.to_string()),
            ("yes_count", yes_count_after.to_string()),
        ]),
    );

    // Implicit resolution once every eligible voter has spoken.
    let outstanding = chain
        .state
        .nomination
        .as_ref()
        .map(|n| {
            chain
                .state
                .seated_players()
                .filter(|p| p.can_vote() && !n.votes.contains_key(&p.user_id))
                .count()
        })
        .unwrap_or(0);
    if outstanding == 0 {
        resolution_chain(chain);
    }
    Ok(())
}

fn resolve_nomination_cmd(chain: &mut Chain) -> Result<(), EngineError> {
    require_privileged(chain)?;
    if chain.state.phase != Phase::Voting {
        return Err(EngineError::WrongPhase("no vote in progress".to_string()));
    }
    if chain
        .state
        .nomination
        .as_ref()
        .map(|n| n.resolved)
        .unwrap_or(true)
    {
        return Err(EngineError::WrongPhase("no open nomination".to_string()));
    }
    resolution_chain(chain);
    Ok(())
}

/// Shared tail: resolve the open nomination on the scratch state, executing
/// on a strict-majority that also beats the day's previous best.
fn resolution_chain(chain: &mut Chain) {
    let Some(nomination) = chain.state.nomination.clone().filter(|n| !n.resolved) else {
        return;
    };
    let yes = nomination.yes_count();
    let threshold = chain.state.execution_threshold();
    let executed = yes >= threshold && yes > chain.state.highest_vote_today;
    chain.push(
        et::NOMINATION_RESOLVED,
        UserId::system(),
        payload([
            ("nominee", nomination.nominee.to_string()),
            (
                "result",
                if executed { "executed" } else { "not_executed" }.to_string(),
            ),
            ("yes_count", yes.to_string()),
            ("threshold", threshold.to_string()),
        ]),
    );
    if executed {
        chain.push(
            et::EXECUTION_RESOLVED,
            UserId::system(),
            payload([("user_id", nomination.nominee.to_string())]),
        );
        // Executing a saint hands evil the game before the death chain can
        // run its own end checks.
        let is_saint = chain
            .state
            .player(&nomination.nominee)
            .and_then(|p| p.role.as_deref())
            .map(|r| r == "saint")
            .unwrap_or(false);
        death_chain(chain, &nomination.nominee, "execution");
        if is_saint && chain.state.phase != Phase::Ended {
            chain.push(
                et::GAME_ENDED,
                UserId::system(),
                payload([
                    ("winner", "evil".to_string()),
                    ("reason", "the saint was executed".to_string()),
                ]),
            );
        }
    }
}

/// Kill `victim`, promote a scarlet woman if the demon just died with five
/// or more players alive, then run the game-end predicate.
fn death_chain(chain: &mut Chain, victim: &UserId, cause: &str) {
    if chain
        .state
        .player(victim)
        .map(|p| !p.alive)
        .unwrap_or(true)
    {
        return;
    }
    // The inheritance rule counts the table as it stood at the moment of
    // death, victim included.
    let alive_at_death = chain.state.alive_count();
    chain.push(
        et::PLAYER_DIED,
        UserId::system(),
        payload([
            ("user_id", victim.to_string()),
            ("cause", cause.to_string()),
        ]),
    );

    let demon_died = chain.state.demon_id.as_ref() == Some(victim);
    if demon_died && alive_at_death >= 5 {
        let scarlet_woman = chain
            .state
            .seated_players()
            .find(|p| p.alive && p.role.as_deref() == Some("scarlet_woman"))
            .map(|p| p.user_id.clone());
        if let Some(heir) = scarlet_woman {
            chain.push(
                et::ROLE_ASSIGNED,
                UserId::system(),
                payload([
                    ("user_id", heir.to_string()),
                    ("true_role", "imp".to_string()),
                    ("is_demon", "true".to_string()),
                    ("is_minion", "false".to_string()),
                    ("team", "evil".to_string()),
                    ("promoted_from", "scarlet_woman".to_string()),
                ]),
            );
        }
    }

    if let Some((winner, reason)) = game_end(&chain.state) {
        if chain.state.phase != Phase::Ended {
            chain.push(
                et::GAME_ENDED,
                UserId::system(),
                payload([
                    ("winner", winner.to_string()),
                    ("reason", reason),
                ]),
            );
        }
    }
}

/// The end-of-game predicate over the authoritative state.
fn game_end(state: &GameState) -> Option<(&'static str, String)> {
    let demon_alive = state
        .demon_id
        .as_ref()
        .and_then(|d| state.player(d))
        .map(|p| p.alive)
        .unwrap_or(false);
    if state.phase.is_started() && state.demon_id.is_some() && !demon_alive {
        return Some(("good", "the demon is dead".to_string()));
    }
    if demon_alive && state.alive_count() <= 2 {
        return Some(("evil", "evil outnumbers the town".to_string()));
    }
    None
}

// =============================================================================
// Night abilities
// =============================================================================

fn use_ability(chain: &mut Chain, ctx: &EngineContext) -> Result<(), EngineError> {
    require_member(chain)?;
    if !chain.state.phase.is_night() {
        return Err(EngineError::WrongPhase(
            "abilities are used at night".to_string(),
        ));
    }
    let actor = chain.cmd.actor_user_id.clone();
    let player = chain.state.player(&actor).ok_or(EngineError::NotMember)?;
    if !player.alive {
        return Err(EngineError::IllegalTarget("dead players do not wake".to_string()));
    }
    let role_id = player
        .role
        .clone()
        .ok_or_else(|| EngineError::WrongPhase("no role assigned".to_string()))?;
    let def = ctx
        .ruleset
        .role(&role_id)
        .ok_or_else(|| EngineError::BadPayload(format!("unknown role {}", role_id)))?;

    let first_night = chain.state.phase == Phase::FirstNight;
    let wakes = if first_night {
        def.first_night_order.is_some()
    } else {
        def.other_night_order.is_some()
    };
    if !wakes {
        return Err(EngineError::WrongPhase(format!(
            "{} does not act tonight",
            role_id
        )));
    }
    if chain.state.acted_tonight.contains(&actor) {
        return Err(EngineError::AlreadyActed("you already acted tonight".to_string()));
    }

    let targets: Vec<UserId> = chain
        .cmd
        .payload
        .get("targets")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(UserId::from)
                .collect()
        })
        .unwrap_or_default();
    if targets.len() != def.night_targets {
        return Err(EngineError::BadPayload(format!(
            "{} takes {} target(s)",
            role_id, def.night_targets
        )));
    }
    for target in &targets {
        let t = chain
            .state
            .player(target)
            .ok_or_else(|| EngineError::IllegalTarget(format!("{} is not in this room", target)))?;
        if t.seat.is_none() {
            return Err(EngineError::IllegalTarget(format!("{} is not seated", target)));
        }
        // The demon may sink its knife into anyone, including itself
        // (starpass); everyone else targets the living.
        if !t.alive && role_id != "imp" {
            return Err(EngineError::IllegalTarget(format!("{} is dead", target)));
        }
    }
    if role_id == "monk" && targets.first() == Some(&actor) {
        return Err(EngineError::IllegalTarget("the monk cannot protect himself".to_string()));
    }

    let targets_json = serde_json::to_string(
        &targets.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
    )
    .unwrap_or_default();
    chain.push_actor(
        et::ABILITY_USED,
        payload([
            ("user_id", actor.to_string()),
            ("role", role_id.clone()),
            ("targets", targets_json),
        ]),
    );

    let poisoned = chain.state.poisoned(&actor);
    if let Some(info) = night_info_for(chain, ctx, &actor, &role_id, &targets, poisoned) {
        chain.push(
            et::NIGHT_INFO,
            UserId::system(),
            payload([("user_id", actor.to_string()), ("info", info)]),
        );
    }

    // The imp pointing at itself passes the mantle to a minion.
    if role_id == "imp" && targets.first() == Some(&actor) && !poisoned {
        let candidates: Vec<UserId> = chain
            .state
            .seated_players()
            .filter(|p| p.alive && p.team == Some(Team::Evil) && p.user_id != actor)
            .map(|p| p.user_id.clone())
            .collect();
        if let Some(heir) = ctx.ruleset.pick(&candidates, ctx.rng_seed).cloned() {
            chain.push(
                et::ROLE_ASSIGNED,
                UserId::system(),
                payload([
                    ("user_id", heir.to_string()),
                    ("true_role", "imp".to_string()),
                    ("is_demon", "true".to_string()),
                    ("is_minion", "false".to_string()),
                    ("team", "evil".to_string()),
                    ("promoted_from", "starpass".to_string()),
                ]),
            );
        }
    }
    Ok(())
}

/// Information a waking role learns, or `None` for act-only roles. Poisoned
/// players get plausible nonsense derived from the same seed.
fn night_info_for(
    chain: &Chain,
    ctx: &EngineContext,
    actor: &UserId,
    role_id: &str,
    targets: &[UserId],
    poisoned: bool,
) -> Option<String> {
    let state = &chain.state;
    match role_id {
        "empath" => {
            let count = if poisoned {
                (ctx.rng_seed % 3) as u32
            } else {
                alive_neighbors(state, actor)
                    .into_iter()
                    .filter(|n| {
                        state.player(n).and_then(|p| p.team) == Some(Team::Evil)
                    })
                    .count() as u32
            };
            Some(format!("{} of your living neighbors are evil.", count))
        }
        "chef" => {
            let count = if poisoned {
                (ctx.rng_seed % 2) as u32
            } else {
                adjacent_evil_pairs(state)
            };
            Some(format!("There are {} pairs of neighboring evil players.", count))
        }
        "fortune_teller" => {
            let hit = !poisoned
                && targets.iter().any(|t| {
                    state.demon_id.as_ref() == Some(t)
                        || state.red_herring.as_ref() == Some(t)
                });
            let hit = if poisoned { ctx.rng_seed % 2 == 0 } else { hit };
            Some(
                if hit {
                    "Yes, one of them registers as the demon."
                } else {
                    "No, neither registers as the demon."
                }
                .to_string(),
            )
        }
        "undertaker" => {
            let learned = if poisoned {
                "a role you cannot be sure of".to_string()
            } else {
                state
                    .last_executed
                    .as_ref()
                    .and_then(|e| state.player(e))
                    .and_then(|p| p.role.clone())
                    .unwrap_or_else(|| "nobody was executed".to_string())
            };
            Some(format!("The executed player was: {}.", learned))
        }
        "spy" => {
            let grimoire: Vec<String> = state
                .seated_players()
                .map(|p| {
                    format!(
                        "{}={}",
                        p.user_id,
                        p.role.as_deref().unwrap_or("?")
                    )
                })
                .collect();
            Some(format!("The grimoire: {}.", grimoire.join(", ")))
        }
        _ => None,
    }
}

fn alive_neighbors(state: &GameState, of: &UserId) -> Vec<UserId> {
    let alive: Vec<UserId> = state
        .seat_order
        .iter()
        .filter(|id| *id == of || state.player(id).map(|p| p.alive).unwrap_or(false))
        .cloned()
        .collect();
    let n = alive.len();
    if n < 2 {
        return Vec::new();
    }
    let Some(pos) = alive.iter().position(|id| id == of) else {
        return Vec::new();
    };
    let left = alive[(pos + n - 1) % n].clone();
    let right = alive[(pos + 1) % n].clone();
    if left == right {
        vec![left]
    } else {
        vec![left, right]
    }
}

fn adjacent_evil_pairs(state: &GameState) -> u32 {
    let seats: Vec<&UserId> = state.seat_order.iter().collect();
    let n = seats.len();
    if n < 2 {
        return 0;
    }
    let mut pairs = 0;
    for i in 0..n {
        let a = state.player(seats[i]).and_then(|p| p.team);
        let b = state.player(seats[(i + 1) % n]).and_then(|p| p.team);
        if a == Some(Team::Evil) && b == Some(Team::Evil) {
            pairs += 1;
        }
    }
    pairs
}

// =============================================================================
// Phase control
// =============================================================================

fn advance_phase(chain: &mut Chain) -> Result<(), EngineError> {
    require_privileged(chain)?;
    let target: Phase = required_str(chain.cmd, "target")?
        .parse()
        .map_err(|e: anyhow::Error| EngineError::BadPayload(e.to_string()))?;
    let from = chain.state.phase;
    let legal = matches!(
        (from, target),
        (Phase::FirstNight, Phase::Day)
            | (Phase::Night, Phase::Day)
            | (Phase::Day, Phase::Nomination)
            | (Phase::Day, Phase::Night)
            | (Phase::Nomination, Phase::Night)
            | (Phase::Nomination, Phase::Day)
    );
    if !legal {
        return Err(EngineError::WrongPhase(format!(
            "cannot advance from {} to {}",
            from, target
        )));
    }
    if from == Phase::Nomination
        && chain
            .state
            .nomination
            .as_ref()
            .map(|n| !n.resolved)
            .unwrap_or(false)
    {
        return Err(EngineError::WrongPhase(
            "resolve the open nomination first".to_string(),
        ));
    }

    let dawn_deaths = if target == Phase::Day {
        chain.state.pending_deaths.clone()
    } else {
        Vec::new()
    };

    chain.push_actor(
        et::PHASE_CHANGED,
        payload([("from", from.to_string()), ("to", target.to_string())]),
    );

    // Dawn: the night's deaths become public and may end the game.
    for victim in dawn_deaths {
        death_chain(chain, &victim, "died in the night");
        if chain.state.phase == Phase::Ended {
            break;
        }
    }
    Ok(())
}

fn write_event(chain: &mut Chain) -> Result<(), EngineError> {
    let actor = &chain.cmd.actor_user_id;
    if !(actor.is_ai() || chain.state.is_privileged(actor)) {
        return Err(EngineError::PrivilegeRequired);
    }
    let event_type = required_str(chain.cmd, "event_type")?;
    if RESERVED_EVENT_TYPES.contains(&event_type) {
        return Err(EngineError::BadPayload(format!(
            "{} is a reserved event type",
            event_type
        )));
    }
    let event_type = event_type.to_string();
    let mut map = Payload::new();
    if let Some(data) = chain.cmd.payload.get("data").and_then(|v| v.as_object()) {
        for (k, v) in data {
            let value = match v {
                Value::String(s) => s.clone(),
                other => json_list(other),
            };
            map.insert(k.clone(), value);
        }
    }
    chain.push_actor(&event_type, map);
    Ok(())
}

/// Types `write_event` may not forge because the reducer or projection give
/// them semantics.
const RESERVED_EVENT_TYPES: &[&str] = &[
    et::PLAYER_JOINED,
    et::PLAYER_LEFT,
    et::SEAT_CLAIMED,
    et::GAME_STARTED,
    et::SETUP_COMPLETED,
    et::ROLE_ASSIGNED,
    et::PHASE_CHANGED,
    et::PUBLIC_CHAT,
    et::WHISPER_SENT,
    et::NOMINATION_CREATED,
    et::DEFENSE_ENDED,
    et::VOTE_CAST,
    et::NOMINATION_RESOLVED,
    et::EXECUTION_RESOLVED,
    et::PLAYER_DIED,
    et::GAME_ENDED,
    et::ABILITY_USED,
    et::NIGHT_INFO,
    et::SLAYER_SHOT,
    // confirmation.requested is deliberately absent: it has no reducer
    // semantics and is exactly what write_event exists for.
];

fn slayer_shot(chain: &mut Chain, _ctx: &EngineContext) -> Result<(), EngineError> {
    require_member(chain)?;
    if !matches!(chain.state.phase, Phase::Day | Phase::Nomination) {
        return Err(EngineError::WrongPhase(
            "the slayer fires in daylight".to_string(),
        ));
    }
    let shooter = chain.cmd.actor_user_id.clone();
    let player = chain.state.player(&shooter).ok_or(EngineError::NotMember)?;
    if !player.alive {
        return Err(EngineError::IllegalTarget("dead players cannot shoot".to_string()));
    }
    if player.day_shot_used {
        return Err(EngineError::AlreadyActed("the shot is spent".to_string()));
    }
    let claims_slayer = player.role.as_deref() == Some("slayer");
    let target = UserId::from(required_str(chain.cmd, "target")?);
    let target_player = chain
        .state
        .player(&target)
        .ok_or_else(|| EngineError::IllegalTarget(format!("{} is not in this room", target)))?;
    if !target_player.alive || target_player.seat.is_none() {
        return Err(EngineError::IllegalTarget("target is not a living player".to_string()));
    }

    let unimpaired = claims_slayer && !chain.state.poisoned(&shooter);
    let hit = unimpaired && chain.state.demon_id.as_ref() == Some(&target);
    chain.push_actor(
        et::SLAYER_SHOT,
        payload([
            ("shooter", shooter.to_string()),
            ("target", target.to_string()),
            ("hit", hit.to_string()),
        ]),
    );
    if hit {
        death_chain(chain, &target, "slain");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RoomId;
    use crate::engine::state::{Nomination, Player};
    use serde_json::json;

    fn ruleset() -> Ruleset {
        Ruleset::trouble_brewing()
    }

    fn run(
        state: &GameState,
        cmd: &CommandEnvelope,
    ) -> Result<(GameState, Vec<EventRecord>), EngineError> {
        let ruleset = ruleset();
        let ctx = EngineContext {
            rng_seed: 42,
            ruleset: &ruleset,
        };
        let events = handle_command(state, cmd, &ctx)?;
        let mut next = state.clone();
        let base = next.last_seq;
        for (offset, event) in events.iter().enumerate() {
            let mut sealed = event.clone();
            sealed.seq = base + offset as i64 + 1;
            next = reduce(&next, &sealed);
        }
        Ok((next, events))
    }

    fn cmd(actor: &str, command_type: CommandType, payload: serde_json::Value) -> CommandEnvelope {
        CommandEnvelope::new(
            RoomId::from("r"),
            command_type,
            UserId::from(actor),
            payload,
        )
    }

    fn lobby_with_five() -> GameState {
        let mut state = GameState::new(RoomId::from("r"));
        let dm = UserId::from("dm");
        state
            .players
            .insert(dm.clone(), Player::new(dm, "dm".to_string(), true));
        for (seat, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let uid = UserId::from(*name);
            let mut player = Player::new(uid.clone(), name.to_string(), false);
            player.seat = Some(seat as u32);
            state.players.insert(uid.clone(), player);
            state.seat_order.push(uid);
        }
        state
    }

    /// Hand-built mid-game state with full role control.
    fn game_with_roles(roles: &[(&str, &str)]) -> GameState {
        let mut state = GameState::new(RoomId::from("r"));
        let dm = UserId::from("dm");
        state
            .players
            .insert(dm.clone(), Player::new(dm, "dm".to_string(), true));
        let ruleset = ruleset();
        for (seat, (name, role)) in roles.iter().enumerate() {
            let uid = UserId::from(*name);
            let mut player = Player::new(uid.clone(), name.to_string(), false);
            player.seat = Some(seat as u32);
            player.role = Some(role.to_string());
            let def = ruleset.role(role).expect("role exists");
            player.team = Some(if def.kind.is_evil() {
                Team::Evil
            } else {
                Team::Good
            });
            if def.kind == RoleKind::Demon {
                state.demon_id = Some(uid.clone());
            }
            if def.kind == RoleKind::Minion {
                state.minion_ids.push(uid.clone());
            }
            state.players.insert(uid.clone(), player);
            state.seat_order.push(uid);
        }
        state.phase = Phase::Day;
        state.sub_phase = SubPhase::Discussion;
        state.day_number = 1;
        state.night_number = 1;
        state.last_seq = 50;
        state
    }

    #[test]
    fn join_then_started_game_is_closed() {
        let mut state = GameState::new(RoomId::from("r"));
        let (next, events) = run(
            &state,
            &cmd("alice", CommandType::Join, json!({"display_name": "Alice"})),
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert!(next.is_member(&UserId::from("alice")));

        state.phase = Phase::Day;
        let err = run(
            &state,
            &cmd("bob", CommandType::Join, json!({"display_name": "Bob"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::WrongPhase(_)));
    }

    #[test]
    fn seat_uniqueness_is_enforced() {
        let mut state = GameState::new(RoomId::from("r"));
        for name in ["a", "b"] {
            let uid = UserId::from(name);
            state
                .players
                .insert(uid.clone(), Player::new(uid, name.to_string(), false));
        }
        let (state, _) = run(&state, &cmd("a", CommandType::ClaimSeat, json!({"seat": 3}))).unwrap();
        let err = run(&state, &cmd("b", CommandType::ClaimSeat, json!({"seat": 3}))).unwrap_err();
        assert!(matches!(err, EngineError::IllegalTarget(_)));
    }

    #[test]
    fn start_game_deals_and_enters_first_night() {
        let state = lobby_with_five();
        let (next, events) = run(&state, &cmd("dm", CommandType::StartGame, json!({}))).unwrap();

        assert_eq!(next.phase, Phase::FirstNight);
        assert!(next.demon_id.is_some());
        assert_eq!(next.minion_ids.len(), 1);
        assert_eq!(next.bluffs.len(), 3);

        let assignments = events
            .iter()
            .filter(|e| e.event_type == et::ROLE_ASSIGNED)
            .count();
        assert_eq!(assignments, 5);
        // Everyone got a role and a team.
        for player in next.seated_players() {
            assert!(player.role.is_some());
            assert!(player.team.is_some());
        }
    }

    #[test]
    fn start_game_requires_privilege_and_seats() {
        let state = lobby_with_five();
        let err = run(&state, &cmd("a", CommandType::StartGame, json!({}))).unwrap_err();
        assert!(matches!(err, EngineError::PrivilegeRequired));

        let mut unseated = state.clone();
        unseated
            .players
            .get_mut(&UserId::from("a"))
            .unwrap()
            .seat = None;
        unseated.seat_order.retain(|id| id != &UserId::from("a"));
        let err = run(&unseated, &cmd("dm", CommandType::StartGame, json!({}))).unwrap_err();
        assert!(matches!(err, EngineError::BadPayload(_)));
    }

    #[test]
    fn start_is_deterministic_for_a_seed() {
        let state = lobby_with_five();
        let envelope = cmd("dm", CommandType::StartGame, json!({}));
        let (a, _) = run(&state, &envelope).unwrap();
        let (b, _) = run(&state, &envelope).unwrap();
        assert_eq!(a.demon_id, b.demon_id);
        assert_eq!(a.bluffs, b.bluffs);
    }

    #[test]
    fn whisper_requires_living_recipient() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("poisoner", "poisoner"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        state.players.get_mut(&UserId::from("chef")).unwrap().alive = false;

        let err = run(
            &state,
            &cmd("empath", CommandType::Whisper, json!({"to_user_id": "chef", "message": "hi"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTarget(_)));

        let ok = run(
            &state,
            &cmd("empath", CommandType::Whisper, json!({"to_user_id": "monk", "message": "hi"})),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn nomination_rules() {
        let state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);

        let (after, _) = run(
            &state,
            &cmd("empath", CommandType::Nominate, json!({"nominee": "chef"})),
        )
        .unwrap();
        assert_eq!(after.phase, Phase::Nomination);
        assert_eq!(after.sub_phase, SubPhase::Defense);
        assert!(after.nomination.is_some());

        // Second nomination while one is open.
        let err = run(
            &after,
            &cmd("monk", CommandType::Nominate, json!({"nominee": "imp"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::WrongPhase(_)));

        // Same nominator twice in a day.
        let mut resolved = after.clone();
        resolved.nomination.as_mut().unwrap().resolved = true;
        resolved.phase = Phase::Nomination;
        let err = run(
            &resolved,
            &cmd("empath", CommandType::Nominate, json!({"nominee": "monk"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActed(_)));

        // Same nominee twice in a day.
        let err = run(
            &resolved,
            &cmd("monk", CommandType::Nominate, json!({"nominee": "chef"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActed(_)));
    }

    #[test]
    fn nominating_the_virgin_executes_the_nominator_once_per_game() {
        let state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("virgin", "virgin"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        let (after, events) = run(
            &state,
            &cmd("chef", CommandType::Nominate, json!({"nominee": "virgin"})),
        )
        .unwrap();
        assert!(events.iter().any(|e| e.event_type == et::PLAYER_DIED));
        assert!(!after.player(&UserId::from("chef")).unwrap().alive);
        assert!(after.player(&UserId::from("virgin")).unwrap().once_ability_used);

        // A later day: the spent ability does not fire again.
        let mut next_day = after.clone();
        next_day.nomination = None;
        next_day.nominators_today.clear();
        next_day.nominees_today.clear();
        next_day.phase = Phase::Day;
        next_day.sub_phase = SubPhase::Discussion;

        let (again, events) = run(
            &next_day,
            &cmd("monk", CommandType::Nominate, json!({"nominee": "virgin"})),
        )
        .unwrap();
        assert_eq!(events.len(), 1, "only the nomination itself");
        assert!(again.player(&UserId::from("monk")).unwrap().alive);
    }

    #[test]
    fn butler_votes_only_behind_the_master() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("butler", "butler"),
            ("chef", "chef"),
            ("monk", "monk"),
            ("empath", "empath"),
        ]);
        state.phase = Phase::Voting;
        state.sub_phase = SubPhase::Voting;
        let mut nomination = Nomination::new(UserId::from("chef"), UserId::from("monk"));
        nomination.votes.insert(UserId::from("chef"), true);
        state.nomination = Some(nomination);
        state
            .players
            .get_mut(&UserId::from("butler"))
            .unwrap()
            .master = Some(UserId::from("empath"));

        // Master has not voted yes yet.
        let err = run(
            &state,
            &cmd("butler", CommandType::Vote, json!({"vote": "yes"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTarget(_)));

        // Voting no is always allowed.
        assert!(run(
            &state,
            &cmd("butler", CommandType::Vote, json!({"vote": "no"})),
        )
        .is_ok());

        // After the master's yes, the butler may follow.
        state
            .nomination
            .as_mut()
            .unwrap()
            .votes
            .insert(UserId::from("empath"), true);
        assert!(run(
            &state,
            &cmd("butler", CommandType::Vote, json!({"vote": "yes"})),
        )
        .is_ok());
    }

    #[test]
    fn ghost_vote_is_single_use() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        state.phase = Phase::Voting;
        state.sub_phase = SubPhase::Voting;
        state.nomination = Some(Nomination::new(UserId::from("chef"), UserId::from("monk")));
        let dead = UserId::from("empath");
        state.players.get_mut(&dead).unwrap().alive = false;

        let (after, events) = run(
            &state,
            &cmd("empath", CommandType::Vote, json!({"vote": "yes"})),
        )
        .unwrap();
        let vote = events
            .iter()
            .find(|e| e.event_type == et::VOTE_CAST)
            .unwrap();
        assert_eq!(vote.field("ghost"), Some("true"));
        assert!(after.player(&dead).unwrap().ghost_vote_used);

        // Spent: a later nomination refuses the ghost.
        let mut later = after.clone();
        later.nomination = Some(Nomination::new(UserId::from("monk"), UserId::from("chef")));
        let err = run(
            &later,
            &cmd("empath", CommandType::Vote, json!({"vote": "yes"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTarget(_)));
    }

    #[test]
    fn execution_kills_demon_and_good_wins() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        state.phase = Phase::Voting;
        state.sub_phase = SubPhase::Voting;
        let mut nomination = Nomination::new(UserId::from("chef"), UserId::from("imp"));
        for voter in ["chef", "empath", "monk"] {
            nomination.votes.insert(UserId::from(voter), true);
        }
        nomination.votes.insert(UserId::from("baron"), false);
        state.nomination = Some(nomination);

        // The imp's own vote completes the electorate and auto-resolves.
        let (after, events) = run(
            &state,
            &cmd("imp", CommandType::Vote, json!({"vote": "no"})),
        )
        .unwrap();
        assert!(events.iter().any(|e| e.event_type == et::GAME_ENDED));
        assert_eq!(after.phase, Phase::Ended);
        assert_eq!(after.winner, Some(Team::Good));
    }

    #[test]
    fn scarlet_woman_inherits_the_mantle() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("sw", "scarlet_woman"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        state.phase = Phase::Voting;
        state.sub_phase = SubPhase::Voting;
        let mut nomination = Nomination::new(UserId::from("chef"), UserId::from("imp"));
        for voter in ["chef", "empath", "monk", "sw"] {
            nomination.votes.insert(UserId::from(voter), true);
        }
        state.nomination = Some(nomination);

        let (after, _) = run(
            &state,
            &cmd("imp", CommandType::Vote, json!({"vote": "no"})),
        )
        .unwrap();
        // Five players were alive when the demon died: the scarlet woman
        // becomes the imp and the game continues.
        assert_eq!(after.phase, Phase::Nomination);
        assert_eq!(after.demon_id, Some(UserId::from("sw")));
        assert_eq!(
            after.player(&UserId::from("sw")).unwrap().role.as_deref(),
            Some("imp")
        );
        assert!(after.winner.is_none());
    }

    #[test]
    fn imp_kill_lands_at_dawn() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        state.phase = Phase::Night;
        state.sub_phase = SubPhase::Idle;
        state.night_number = 2;

        let (night, _) = run(
            &state,
            &cmd("imp", CommandType::UseAbility, json!({"targets": ["chef"]})),
        )
        .unwrap();
        assert_eq!(night.pending_deaths, vec![UserId::from("chef")]);
        assert!(night.player(&UserId::from("chef")).unwrap().alive, "not dead until dawn");

        let (dawn, events) = run(
            &night,
            &cmd("dm", CommandType::AdvancePhase, json!({"target": "day"})),
        )
        .unwrap();
        assert!(events.iter().any(|e| e.event_type == et::PLAYER_DIED));
        assert!(!dawn.player(&UserId::from("chef")).unwrap().alive);
        assert!(dawn.pending_deaths.is_empty());
    }

    #[test]
    fn monk_protection_blocks_the_kill() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        state.phase = Phase::Night;
        state.night_number = 2;

        let (protected, _) = run(
            &state,
            &cmd("monk", CommandType::UseAbility, json!({"targets": ["chef"]})),
        )
        .unwrap();
        let (after_kill, _) = run(
            &protected,
            &cmd("imp", CommandType::UseAbility, json!({"targets": ["chef"]})),
        )
        .unwrap();
        assert!(after_kill.pending_deaths.is_empty());
    }

    #[test]
    fn starpass_promotes_a_minion() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        state.phase = Phase::Night;
        state.night_number = 2;

        let (night, _) = run(
            &state,
            &cmd("imp", CommandType::UseAbility, json!({"targets": ["imp"]})),
        )
        .unwrap();
        assert_eq!(night.demon_id, Some(UserId::from("baron")));
        assert_eq!(night.pending_deaths, vec![UserId::from("imp")]);

        let (dawn, _) = run(
            &night,
            &cmd("dm", CommandType::AdvancePhase, json!({"target": "day"})),
        )
        .unwrap();
        // The old imp is dead, the new one keeps evil in the game.
        assert!(!dawn.player(&UserId::from("imp")).unwrap().alive);
        assert!(dawn.winner.is_none());
    }

    #[test]
    fn slayer_shot_hits_only_the_demon() {
        let state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("slayer", "slayer"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);

        // A miss burns the shot.
        let (missed, events) = run(
            &state,
            &cmd("slayer", CommandType::SlayerShot, json!({"target": "chef"})),
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field("hit"), Some("false"));
        assert!(missed.player(&UserId::from("chef")).unwrap().alive);
        assert!(missed.player(&UserId::from("slayer")).unwrap().day_shot_used);

        let err = run(
            &missed,
            &cmd("slayer", CommandType::SlayerShot, json!({"target": "imp"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActed(_)));

        // A fresh slayer hitting the demon ends the game.
        let (ended, events) = run(
            &state,
            &cmd("slayer", CommandType::SlayerShot, json!({"target": "imp"})),
        )
        .unwrap();
        assert!(events.iter().any(|e| e.event_type == et::GAME_ENDED));
        assert_eq!(ended.winner, Some(Team::Good));

        // A non-slayer bluffing the shot misses.
        let (_, events) = run(
            &state,
            &cmd("chef", CommandType::SlayerShot, json!({"target": "imp"})),
        )
        .unwrap();
        assert_eq!(events[0].field("hit"), Some("false"));
    }

    #[test]
    fn write_event_is_privileged_and_reserved_types_are_blocked() {
        let state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);

        let err = run(
            &state,
            &cmd(
                "chef",
                CommandType::WriteEvent,
                json!({"event_type": "storyteller.note", "data": {"note": "x"}}),
            ),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::PrivilegeRequired));

        let err = run(
            &state,
            &cmd(
                "dm",
                CommandType::WriteEvent,
                json!({"event_type": "player.died", "data": {"user_id": "chef"}}),
            ),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::BadPayload(_)));

        let (_, events) = run(
            &state,
            &cmd(
                "ai",
                CommandType::WriteEvent,
                json!({"event_type": "confirmation.requested", "data": {"user_id": "chef", "question": "ready?"}}),
            ),
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "confirmation.requested");
    }

    #[test]
    fn phase_machine_rejects_illegal_edges() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("baron", "baron"),
            ("empath", "empath"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);

        // day -> day is not an edge.
        let err = run(
            &state,
            &cmd("dm", CommandType::AdvancePhase, json!({"target": "day"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::WrongPhase(_)));

        // day -> nomination and nomination -> night are edges.
        let (nomination, _) = run(
            &state,
            &cmd("dm", CommandType::AdvancePhase, json!({"target": "nomination"})),
        )
        .unwrap();
        assert_eq!(nomination.phase, Phase::Nomination);
        let (night, _) = run(
            &nomination,
            &cmd("dm", CommandType::AdvancePhase, json!({"target": "night"})),
        )
        .unwrap();
        assert_eq!(night.phase, Phase::Night);

        // Players cannot drive the phase machine.
        state.phase = Phase::Day;
        let err = run(
            &state,
            &cmd("chef", CommandType::AdvancePhase, json!({"target": "night"})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::PrivilegeRequired));
    }

    #[test]
    fn empath_counts_evil_neighbors() {
        let mut state = game_with_roles(&[
            ("imp", "imp"),
            ("empath", "empath"),
            ("baron", "baron"),
            ("chef", "chef"),
            ("monk", "monk"),
        ]);
        state.phase = Phase::Night;
        state.night_number = 2;

        // Seated imp - empath - baron: both neighbors evil.
        let (_, events) = run(
            &state,
            &cmd("empath", CommandType::UseAbility, json!({"targets": []})),
        )
        .unwrap();
        let info = events
            .iter()
            .find(|e| e.event_type == et::NIGHT_INFO)
            .unwrap();
        assert!(info.field("info").unwrap().starts_with("2 "));
    }
}
