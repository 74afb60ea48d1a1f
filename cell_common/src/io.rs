//! Named digital I/O roles.
//!
//! The I/O rack is addressed by integer index; the cell refers to points by
//! functional role. Role names double as the leaf of their Shared Store key
//! (`io/di/<name>`, `io/do/<name>`).

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::consts::{DI_COUNT, DO_COUNT};

// ─── Digital inputs ─────────────────────────────────────────────────

/// Functional role of a digital input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiRole {
    /// Emergency-stop circuit open (true = stop requested).
    EmergencyStop,
    /// Cell door closed and latched.
    DoorClosed,
    /// Main air pressure within range.
    AirPressureOk,
    /// Operator reset push-button.
    ResetButton,
    /// Operator start push-button.
    StartButton,
    /// Specimen present on the gauge table.
    SpecimenOnGauge,
    /// Tester grips closed.
    TesterGripClosed,
}

impl DiRole {
    /// All input roles.
    pub const ALL: [Self; 7] = [
        Self::EmergencyStop,
        Self::DoorClosed,
        Self::AirPressureOk,
        Self::ResetButton,
        Self::StartButton,
        Self::SpecimenOnGauge,
        Self::TesterGripClosed,
    ];

    /// Physical input index.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::EmergencyStop => 0,
            Self::DoorClosed => 1,
            Self::AirPressureOk => 2,
            Self::ResetButton => 3,
            Self::StartButton => 4,
            Self::SpecimenOnGauge => 8,
            Self::TesterGripClosed => 9,
        }
    }

    /// Role name used in store keys and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::EmergencyStop => "emergency_stop",
            Self::DoorClosed => "door_closed",
            Self::AirPressureOk => "air_pressure_ok",
            Self::ResetButton => "reset_button",
            Self::StartButton => "start_button",
            Self::SpecimenOnGauge => "specimen_on_gauge",
            Self::TesterGripClosed => "tester_grip_closed",
        }
    }
}

impl fmt::Display for DiRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DiRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| format!("unknown DI role: {s:?}"))
    }
}

// ─── Digital outputs ────────────────────────────────────────────────

/// Functional role of a digital output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoRole {
    /// Tower lamp red.
    LampRed,
    /// Tower lamp yellow.
    LampYellow,
    /// Tower lamp green.
    LampGreen,
    /// Alarm buzzer.
    Buzzer,
    /// Gauge table clamp.
    GaugeClamp,
    /// Tester safety door unlock.
    TesterDoorUnlock,
}

impl DoRole {
    /// All output roles.
    pub const ALL: [Self; 6] = [
        Self::LampRed,
        Self::LampYellow,
        Self::LampGreen,
        Self::Buzzer,
        Self::GaugeClamp,
        Self::TesterDoorUnlock,
    ];

    /// Physical output index.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::LampRed => 0,
            Self::LampYellow => 1,
            Self::LampGreen => 2,
            Self::Buzzer => 3,
            Self::GaugeClamp => 8,
            Self::TesterDoorUnlock => 9,
        }
    }

    /// Role name used in store keys and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::LampRed => "lamp_red",
            Self::LampYellow => "lamp_yellow",
            Self::LampGreen => "lamp_green",
            Self::Buzzer => "buzzer",
            Self::GaugeClamp => "gauge_clamp",
            Self::TesterDoorUnlock => "tester_door_unlock",
        }
    }

    /// Whether the output is part of the tower lamp / alarm group, which
    /// stays driven while the cell is stopped.
    #[inline]
    pub const fn is_indicator(self) -> bool {
        matches!(self, Self::LampRed | Self::LampYellow | Self::LampGreen | Self::Buzzer)
    }
}

impl fmt::Display for DoRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DoRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| format!("unknown DO role: {s:?}"))
    }
}

/// Highest DI index used by any role (inclusive).
pub fn max_di_index() -> usize {
    DiRole::ALL.iter().map(|r| r.index()).max().unwrap_or(0)
}

/// Highest DO index used by any role (inclusive).
pub fn max_do_index() -> usize {
    DoRole::ALL.iter().map(|r| r.index()).max().unwrap_or(0)
}
