//! Sides of a match and per-side storage.
//!
//! Two sides share one tick stream when training by self-play. Side 0 is
//! always the learner; side 1 is either the scripted environment enemy or a
//! frozen snapshot of the learner.

use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// Side whose units a tick request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u8);

impl PlayerId {
    pub const LEARNER: PlayerId = PlayerId(0);
    pub const OPPONENT: PlayerId = PlayerId(1);

    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Wire ids arrive as plain integers; anything outside `0..sides` is rejected.
    #[must_use]
    pub fn from_wire(raw: i32, sides: usize) -> Option<Self> {
        let id = u8::try_from(raw).ok()?;
        (usize::from(id) < sides).then_some(Self(id))
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::LEARNER => write!(f, "learner"),
            Self::OPPONENT => write!(f, "opponent"),
            Self(other) => write!(f, "side {other}"),
        }
    }
}

/// One value per side, indexed by [`PlayerId`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerMap<T> {
    data: Vec<T>,
}

impl<T: Clone> PlayerMap<T> {
    pub fn with_value(sides: usize, value: T) -> Self {
        Self {
            data: vec![value; sides],
        }
    }

    /// Overwrite every side's entry.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }
}

impl<T> PlayerMap<T> {
    #[must_use]
    pub fn sides(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn get(&self, player: PlayerId) -> Option<&T> {
        self.data.get(player.index())
    }

    pub fn get_mut(&mut self, player: PlayerId) -> Option<&mut T> {
        self.data.get_mut(player.index())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }
}

impl<T> Index<PlayerId> for PlayerMap<T> {
    type Output = T;

    fn index(&self, player: PlayerId) -> &Self::Output {
        &self.data[player.index()]
    }
}

impl<T> IndexMut<PlayerId> for PlayerMap<T> {
    fn index_mut(&mut self, player: PlayerId) -> &mut Self::Output {
        &mut self.data[player.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_sides() {
        assert_eq!(PlayerId::LEARNER.to_string(), "learner");
        assert_eq!(PlayerId::OPPONENT.to_string(), "opponent");
        assert_eq!(PlayerId::new(4).to_string(), "side 4");
    }

    #[test]
    fn test_from_wire() {
        assert_eq!(PlayerId::from_wire(0, 2), Some(PlayerId::LEARNER));
        assert_eq!(PlayerId::from_wire(1, 2), Some(PlayerId::OPPONENT));
        assert_eq!(PlayerId::from_wire(1, 1), None);
        assert_eq!(PlayerId::from_wire(2, 2), None);
        assert_eq!(PlayerId::from_wire(-1, 2), None);
        assert_eq!(PlayerId::from_wire(300, 400), None);
    }

    #[test]
    fn test_map_access_and_fill() {
        let mut wins: PlayerMap<u64> = PlayerMap::with_value(2, 0);
        wins[PlayerId::LEARNER] += 3;
        *wins.get_mut(PlayerId::OPPONENT).unwrap() += 1;
        assert!(wins.get(PlayerId::new(2)).is_none());
        assert_eq!(wins.values().sum::<u64>(), 4);

        wins.fill(0);
        assert_eq!(wins.sides(), 2);
        assert_eq!(wins[PlayerId::LEARNER], 0);
    }

    #[test]
    fn test_map_serde() {
        let mut map: PlayerMap<i32> = PlayerMap::with_value(2, 1);
        map[PlayerId::OPPONENT] = -1;
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(serde_json::from_str::<PlayerMap<i32>>(&json).unwrap(), map);
    }
}
