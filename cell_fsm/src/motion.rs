//! Motion safety validator.
//!
//! Robot motions are named by integer ids. A subset of them are
//! *waypoints* (HOME, every rack-floor front, the gauge, tester and scrap
//! station fronts); the rest are intra-station positions reachable only
//! along fixed chains:
//!
//! | Station | Chain |
//! |---------|-------|
//! | Rack floor `f` | `F → F+1 → F` with `F = 1000 + 10·f` |
//! | Gauge place | `2000 → 2001 → 2000` |
//! | Gauge pick | `2000 → 2002 → 2000` |
//! | Tester load | `4000 → 4001 → 4002 → 4000` |
//! | Tester unload | `4000 → 4003 → 4004 → 4000` |
//! | Scrap bin | `5000 → 5001 → 5000` |
//!
//! A move is allowed between any two waypoints or along one chain edge.
//! [`MotionSafety`] tracks where the robot is from acknowledged motions
//! only and refuses everything while the position is not known.

use cell_common::consts::{HOME_MOTION_ID, MAX_RACK_FLOORS};
use std::fmt;
use tracing::{debug, warn};

/// HOME waypoint.
pub const HOME: i64 = HOME_MOTION_ID;
/// Gauge station front.
pub const GAUGE_FRONT: i64 = 2000;
/// Specimen placed on the gauge table.
pub const GAUGE_PLACE: i64 = 2001;
/// Specimen picked from the gauge table.
pub const GAUGE_PICK: i64 = 2002;
/// Tester station front.
pub const TESTER_FRONT: i64 = 4000;
/// Tester load approach.
pub const TESTER_LOAD_APPROACH: i64 = 4001;
/// Specimen in the tester grips.
pub const TESTER_LOAD: i64 = 4002;
/// Tester unload approach.
pub const TESTER_UNLOAD_APPROACH: i64 = 4003;
/// Specimen taken from the tester grips.
pub const TESTER_UNLOAD: i64 = 4004;
/// Scrap bin front.
pub const SCRAP_FRONT: i64 = 5000;
/// Specimen dropped into the scrap bin.
pub const SCRAP_DROP: i64 = 5001;

const STATION_EDGES: [(i64, i64); 12] = [
    (GAUGE_FRONT, GAUGE_PLACE),
    (GAUGE_PLACE, GAUGE_FRONT),
    (GAUGE_FRONT, GAUGE_PICK),
    (GAUGE_PICK, GAUGE_FRONT),
    (TESTER_FRONT, TESTER_LOAD_APPROACH),
    (TESTER_LOAD_APPROACH, TESTER_LOAD),
    (TESTER_LOAD, TESTER_FRONT),
    (TESTER_FRONT, TESTER_UNLOAD_APPROACH),
    (TESTER_UNLOAD_APPROACH, TESTER_UNLOAD),
    (TESTER_UNLOAD, TESTER_FRONT),
    (SCRAP_FRONT, SCRAP_DROP),
    (SCRAP_DROP, SCRAP_FRONT),
];

/// Rack-floor front motion id.
#[inline]
pub const fn rack_front(floor: u8) -> i64 {
    HOME + 10 * floor as i64
}

/// Rack-floor pick motion id.
#[inline]
pub const fn rack_pick(floor: u8) -> i64 {
    rack_front(floor) + 1
}

// ─── Catalogue ──────────────────────────────────────────────────────

/// Static waypoint graph for a rack of `rack_floors` floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionCatalogue {
    rack_floors: u8,
}

impl MotionCatalogue {
    /// Catalogue for `rack_floors` floors (clamped to the addressable range).
    pub fn new(rack_floors: u8) -> Self {
        Self {
            rack_floors: rack_floors.min(MAX_RACK_FLOORS),
        }
    }

    /// Number of rack floors.
    pub fn rack_floors(&self) -> u8 {
        self.rack_floors
    }

    /// Whether `floor` exists.
    pub fn has_floor(&self, floor: i64) -> bool {
        (1..=i64::from(self.rack_floors)).contains(&floor)
    }

    fn rack_floor_of(&self, id: i64) -> Option<(u8, bool)> {
        let offset = id.checked_sub(HOME)?;
        if offset < 10 {
            return None;
        }
        let (floor, leaf) = (offset / 10, offset % 10);
        if !self.has_floor(floor) || leaf > 1 {
            return None;
        }
        u8::try_from(floor).ok().map(|f| (f, leaf == 1))
    }

    /// Whether `id` is a waypoint.
    pub fn is_waypoint(&self, id: i64) -> bool {
        matches!(id, HOME | GAUGE_FRONT | TESTER_FRONT | SCRAP_FRONT)
            || matches!(self.rack_floor_of(id), Some((_, false)))
    }

    /// Whether `id` names any position of the catalogue.
    pub fn is_known(&self, id: i64) -> bool {
        self.is_waypoint(id)
            || self.rack_floor_of(id).is_some()
            || STATION_EDGES.iter().any(|&(a, b)| a == id || b == id)
    }

    /// Whether a direct move `from → to` is allowed.
    pub fn is_allowed(&self, from: i64, to: i64) -> bool {
        if self.is_waypoint(from) && self.is_waypoint(to) {
            return true;
        }
        if STATION_EDGES.contains(&(from, to)) {
            return true;
        }
        match (self.rack_floor_of(from), self.rack_floor_of(to)) {
            (Some((a, pick_a)), Some((b, pick_b))) => a == b && pick_a != pick_b,
            _ => false,
        }
    }

    /// The only allowed move out of an intra-station position.
    pub fn chain_exit(&self, id: i64) -> Option<i64> {
        if self.is_waypoint(id) {
            return None;
        }
        if let Some((floor, true)) = self.rack_floor_of(id) {
            return Some(rack_front(floor));
        }
        STATION_EDGES
            .iter()
            .find(|&&(from, _)| from == id)
            .map(|&(_, to)| to)
    }

    /// Moves leading from `id` back to the nearest waypoint.
    pub fn path_to_waypoint(&self, id: i64) -> Vec<i64> {
        let mut path = Vec::new();
        let mut at = id;
        while let Some(next) = self.chain_exit(at) {
            path.push(next);
            at = next;
            if path.len() > 4 {
                break;
            }
        }
        path
    }
}

// ─── Position tracking ──────────────────────────────────────────────

/// What the cell knows about the robot position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// At a catalogue position.
    Known(i64),
    /// Acknowledged motion in progress.
    InTransit {
        /// Last known position
        from: i64,
        /// Acknowledged target
        to: i64,
    },
    /// Not resolvable.
    Unknown,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(id) => write!(f, "{id}"),
            Self::InTransit { from, to } => write!(f, "{from}->{to}"),
            Self::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Validator plus current-position tracker.
#[derive(Debug, Clone)]
pub struct MotionSafety {
    catalogue: MotionCatalogue,
    position: Position,
}

impl MotionSafety {
    /// Tracker with an unknown position.
    pub fn new(catalogue: MotionCatalogue) -> Self {
        Self {
            catalogue,
            position: Position::Unknown,
        }
    }

    /// Waypoint graph.
    pub fn catalogue(&self) -> &MotionCatalogue {
        &self.catalogue
    }

    /// Tracked position.
    #[inline]
    pub fn position(&self) -> Position {
        self.position
    }

    /// Known position id.
    pub fn current(&self) -> Option<i64> {
        match self.position {
            Position::Known(id) => Some(id),
            _ => None,
        }
    }

    /// Whether `(current_position, requested)` is an allowed edge.
    pub fn is_safe_to_move(&self, requested: i64) -> bool {
        let safe = match self.position {
            Position::Known(from) => self.catalogue.is_allowed(from, requested),
            Position::InTransit { .. } | Position::Unknown => false,
        };
        if !safe {
            warn!(
                from = %self.position,
                to = requested,
                "Motion rejected by safety validator"
            );
        }
        safe
    }

    /// The controller acknowledged `cmd`.
    pub fn on_ack(&mut self, cmd: i64) {
        if let Position::Known(from) = self.position {
            self.position = Position::InTransit { from, to: cmd };
            debug!(from, to = cmd, "Motion acknowledged");
        }
    }

    /// The controller reported `cmd` complete.
    pub fn on_done(&mut self, cmd: i64) {
        match self.position {
            Position::InTransit { to, .. } if to == cmd => {
                self.position = Position::Known(cmd);
                debug!(position = cmd, "Motion complete");
            }
            other => {
                warn!(position = %other, done = cmd, "Completion for an untracked motion");
                self.position = Position::Unknown;
            }
        }
    }

    /// An acknowledged motion was interrupted.
    pub fn abort_motion(&mut self) {
        if let Position::InTransit { from, to } = self.position {
            warn!(from, to, "Motion interrupted, position unknown");
            self.position = Position::Unknown;
        }
    }

    /// Set the position from an external reading. Ids outside the
    /// catalogue make it unknown.
    pub fn resolve(&mut self, id: Option<i64>) -> Position {
        self.position = match id {
            Some(id) if self.catalogue.is_known(id) => Position::Known(id),
            _ => Position::Unknown,
        };
        self.position
    }
}
