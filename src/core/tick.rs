//! Per-tick wire types exchanged with the simulation transport.
//!
//! Each tick the environment reports, for every living unit, the observation
//! produced by its last action and the reward that action earned. An empty
//! state vector on the first record marks the end of the episode.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::error::ProtocolError;
use super::player::PlayerId;

/// Actions returned for one tick, positionally aligned with the request.
pub type ActionList = SmallVec<[usize; 8]>;

/// One live unit's report for the current tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Stable key for the unit within an episode.
    pub unit_id: i64,

    /// Observation features. Empty means the episode is over.
    pub state: Vec<f64>,

    /// Reward earned by the unit's previous action.
    pub last_action_reward: f64,
}

impl TickRecord {
    /// Create a new record.
    pub fn new(unit_id: i64, state: Vec<f64>, last_action_reward: f64) -> Self {
        Self {
            unit_id,
            state,
            last_action_reward,
        }
    }

    /// A terminal record: empty state, final reward.
    pub fn terminal(unit_id: i64, last_action_reward: f64) -> Self {
        Self::new(unit_id, Vec::new(), last_action_reward)
    }
}

/// A full tick request for one side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickRequest {
    /// Which side's agent should act.
    pub player_id: i32,

    /// One record per live unit, in the order actions must be returned.
    pub records: Vec<TickRecord>,
}

impl TickRequest {
    /// Create a new request.
    pub fn new(player_id: i32, records: Vec<TickRecord>) -> Self {
        Self { player_id, records }
    }

    /// Whether this request is the end-of-episode signal.
    ///
    /// Only the first record is inspected.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.records.first().is_some_and(|r| r.state.is_empty())
    }
}

/// Response to a tick.
///
/// `NoAction` is distinct from `Actions` with an empty list: it tells the
/// transport the episode is over and nothing should be routed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickResponse {
    /// One action code per input record, in input order.
    Actions(ActionList),
    /// The episode has ended.
    NoAction,
}

impl TickResponse {
    /// Borrow the action list, if any.
    #[must_use]
    pub fn actions(&self) -> Option<&[usize]> {
        match self {
            TickResponse::Actions(actions) => Some(actions.as_slice()),
            TickResponse::NoAction => None,
        }
    }

    /// Whether this is the end-of-episode sentinel.
    #[must_use]
    pub fn is_no_action(&self) -> bool {
        matches!(self, TickResponse::NoAction)
    }
}

/// Result of a finished match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOutcome {
    Winner(PlayerId),
    Draw,
}

impl MatchOutcome {
    /// Wire code reserved for a draw.
    pub const DRAW_CODE: i32 = 2;

    /// Decode a wire-level winner code.
    pub fn from_wire(winner: i32) -> Result<Self, ProtocolError> {
        match winner {
            Self::DRAW_CODE => Ok(MatchOutcome::Draw),
            0 | 1 => Ok(MatchOutcome::Winner(PlayerId::new(winner as u8))),
            _ => Err(ProtocolError::InvalidWinner { winner }),
        }
    }

    /// Encode back to the wire code.
    #[must_use]
    pub fn to_wire(self) -> i32 {
        match self {
            MatchOutcome::Winner(player) => player.index() as i32,
            MatchOutcome::Draw => Self::DRAW_CODE,
        }
    }

    /// Whether `player` won.
    #[must_use]
    pub fn is_win_for(self, player: PlayerId) -> bool {
        self == MatchOutcome::Winner(player)
    }
}

/// End-of-match notification, delivered once per side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Side this notification is addressed to.
    pub player_id: i32,
    /// Winner code; see [`MatchOutcome::DRAW_CODE`].
    pub winner: i32,
}

impl MatchResult {
    /// Create a new notification.
    pub fn new(player_id: i32, winner: i32) -> Self {
        Self { player_id, winner }
    }

    /// Decode the outcome.
    pub fn outcome(&self) -> Result<MatchOutcome, ProtocolError> {
        MatchOutcome::from_wire(self.winner)
    }
}
