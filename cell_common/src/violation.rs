//! Violation bit flags shared by every FSM context.
//!
//! A violation bitmask is recomputed from scratch on every check from the
//! currently sensed inputs; each set bit names one independent fault
//! condition scoped to a subsystem. Subsystems own disjoint byte ranges of
//! the `u32`, checked at compile time below.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use std::fmt;

/// Bit range owned by safety inputs (bits 0–7).
pub const SAFETY_RANGE: u32 = 0x0000_00FF;
/// Bit range owned by the robot subsystem (bits 8–15).
pub const ROBOT_RANGE: u32 = 0x0000_FF00;
/// Bit range owned by the device subsystem (bits 16–23).
pub const DEVICE_RANGE: u32 = 0x00FF_0000;
/// Bit range owned by the logic sequencer (bits 24–31).
pub const LOGIC_RANGE: u32 = 0xFF00_0000;

bitflags! {
    /// Named fault conditions.
    ///
    /// Communication bits (`*_COMM`) are the ones RECOVERING attempts to
    /// clear by reconnecting; every other bit clears only when the sensed
    /// condition goes away.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Violation: u32 {
        // ── Safety ──────────────────────────────
        /// Emergency-stop input active.
        const EMERGENCY_STOP         = 0x0000_0001;
        /// Cell door interlock open.
        const DOOR_OPEN              = 0x0000_0002;
        /// Main air supply below threshold.
        const AIR_PRESSURE_LOW       = 0x0000_0004;

        // ── Robot ───────────────────────────────
        /// Robot controller RPC failures crossed the threshold.
        const ROBOT_COMM             = 0x0000_0100;
        /// Servo power is off while it should be on.
        const ROBOT_SERVO_OFF        = 0x0000_0200;
        /// Controller reports a collision.
        const ROBOT_COLLISION        = 0x0000_0400;
        /// Controller reports an alarm code.
        const ROBOT_CONTROLLER_ALARM = 0x0000_0800;
        /// CMD was never acknowledged with CMD + ACK_OFFSET.
        const ROBOT_ACK_TIMEOUT      = 0x0000_1000;
        /// Acknowledged motion never reported CMD + DONE_OFFSET.
        const ROBOT_DONE_TIMEOUT     = 0x0000_2000;
        /// Robot position could not be resolved to a known motion id.
        const ROBOT_POSITION_UNKNOWN = 0x0000_4000;

        // ── Device ──────────────────────────────
        /// Digital I/O refresh failures crossed the threshold.
        const IO_COMM                = 0x0001_0000;
        /// Thickness gauge failures crossed the threshold.
        const GAUGE_COMM             = 0x0002_0000;
        /// QR reader failures crossed the threshold.
        const QR_COMM                = 0x0004_0000;
        /// Tester link failures crossed the threshold.
        const TESTER_COMM            = 0x0008_0000;
        /// Tester sent a malformed or unexpected message.
        const TESTER_PROTOCOL        = 0x0010_0000;
        /// Tester reported a state code outside the known-good set.
        const TESTER_STATE           = 0x0020_0000;

        // ── Logic ───────────────────────────────
        /// A command step failed beyond its retry budget.
        const COMMAND_FAILED         = 0x0100_0000;
        /// A strategy returned an error or panicked.
        const INTERNAL_FAULT         = 0x0200_0000;
    }
}

impl Violation {
    /// All safety bits.
    pub const SAFETY: Self = Self::from_bits_truncate(
        Self::EMERGENCY_STOP.bits() | Self::DOOR_OPEN.bits() | Self::AIR_PRESSURE_LOW.bits(),
    );

    /// All robot bits.
    pub const ROBOT: Self = Self::from_bits_truncate(
        Self::ROBOT_COMM.bits()
            | Self::ROBOT_SERVO_OFF.bits()
            | Self::ROBOT_COLLISION.bits()
            | Self::ROBOT_CONTROLLER_ALARM.bits()
            | Self::ROBOT_ACK_TIMEOUT.bits()
            | Self::ROBOT_DONE_TIMEOUT.bits()
            | Self::ROBOT_POSITION_UNKNOWN.bits(),
    );

    /// All device bits.
    pub const DEVICE: Self = Self::from_bits_truncate(
        Self::IO_COMM.bits()
            | Self::GAUGE_COMM.bits()
            | Self::QR_COMM.bits()
            | Self::TESTER_COMM.bits()
            | Self::TESTER_PROTOCOL.bits()
            | Self::TESTER_STATE.bits(),
    );

    /// All logic bits.
    pub const LOGIC: Self =
        Self::from_bits_truncate(Self::COMMAND_FAILED.bits() | Self::INTERNAL_FAULT.bits());

    /// Communication bits that RECOVERING answers with a reconnect.
    pub const COMM_MASK: Self = Self::from_bits_truncate(
        Self::ROBOT_COMM.bits()
            | Self::IO_COMM.bits()
            | Self::GAUGE_COMM.bits()
            | Self::QR_COMM.bits()
            | Self::TESTER_COMM.bits(),
    );

    /// Communication bits that are set.
    #[inline]
    pub const fn comm_bits(self) -> Self {
        self.intersection(Self::COMM_MASK)
    }

    /// Bits belonging to one subsystem.
    #[inline]
    pub const fn of(self, subsystem: Subsystem) -> Self {
        Self::from_bits_truncate(self.bits() & subsystem.range())
    }

    /// Subsystem owning a single flag. `None` for empty or multi-subsystem masks.
    pub fn subsystem(self) -> Option<Subsystem> {
        Subsystem::ALL
            .into_iter()
            .find(|s| !self.is_empty() && self.bits() & !s.range() == 0)
    }

    /// Names of all set bits, in bit order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        self.iter_names().map(|(name, _)| name)
    }
}

impl Default for Violation {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for name in self.names() {
            if !first {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

// Subsystem ranges are disjoint and cover the whole word.
const_assert_eq!(SAFETY_RANGE & ROBOT_RANGE, 0);
const_assert_eq!(SAFETY_RANGE & DEVICE_RANGE, 0);
const_assert_eq!(SAFETY_RANGE & LOGIC_RANGE, 0);
const_assert_eq!(ROBOT_RANGE & DEVICE_RANGE, 0);
const_assert_eq!(ROBOT_RANGE & LOGIC_RANGE, 0);
const_assert_eq!(DEVICE_RANGE & LOGIC_RANGE, 0);
const_assert_eq!(SAFETY_RANGE | ROBOT_RANGE | DEVICE_RANGE | LOGIC_RANGE, u32::MAX);

// Every flag sits inside the range of the subsystem that declares it.
const_assert_eq!(Violation::SAFETY.bits() & !SAFETY_RANGE, 0);
const_assert_eq!(Violation::ROBOT.bits() & !ROBOT_RANGE, 0);
const_assert_eq!(Violation::DEVICE.bits() & !DEVICE_RANGE, 0);
const_assert_eq!(Violation::LOGIC.bits() & !LOGIC_RANGE, 0);
const_assert_eq!(
    Violation::SAFETY.bits() | Violation::ROBOT.bits() | Violation::DEVICE.bits() | Violation::LOGIC.bits(),
    Violation::all().bits()
);

/// Subsystem scope of a violation bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// Cell safety inputs.
    Safety,
    /// Robot arm and controller.
    Robot,
    /// I/O rack, gauge, QR reader, tester.
    Device,
    /// Batch sequencing.
    Logic,
}

impl Subsystem {
    /// All subsystems in bit order.
    pub const ALL: [Self; 4] = [Self::Safety, Self::Robot, Self::Device, Self::Logic];

    /// Bit range owned by the subsystem.
    #[inline]
    pub const fn range(self) -> u32 {
        match self {
            Self::Safety => SAFETY_RANGE,
            Self::Robot => ROBOT_RANGE,
            Self::Device => DEVICE_RANGE,
            Self::Logic => LOGIC_RANGE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_mask_only_selects_comm_bits() {
        let v = Violation::ROBOT_COMM | Violation::ROBOT_COLLISION | Violation::TESTER_COMM;
        assert_eq!(v.comm_bits(), Violation::ROBOT_COMM | Violation::TESTER_COMM);
        assert!(Violation::EMERGENCY_STOP.comm_bits().is_empty());
    }

    #[test]
    fn subsystem_of_single_flags() {
        assert_eq!(Violation::DOOR_OPEN.subsystem(), Some(Subsystem::Safety));
        assert_eq!(Violation::ROBOT_DONE_TIMEOUT.subsystem(), Some(Subsystem::Robot));
        assert_eq!(Violation::QR_COMM.subsystem(), Some(Subsystem::Device));
        assert_eq!(Violation::INTERNAL_FAULT.subsystem(), Some(Subsystem::Logic));
        assert_eq!(Violation::empty().subsystem(), None);
        assert_eq!(
            (Violation::DOOR_OPEN | Violation::QR_COMM).subsystem(),
            None,
            "mixed masks have no single owner"
        );
    }

    #[test]
    fn of_filters_by_subsystem() {
        let v = Violation::EMERGENCY_STOP | Violation::ROBOT_COMM | Violation::GAUGE_COMM;
        assert_eq!(v.of(Subsystem::Device), Violation::GAUGE_COMM);
        assert_eq!(v.of(Subsystem::Logic), Violation::empty());
    }

    #[test]
    fn names_follow_bit_order() {
        let v = Violation::TESTER_STATE | Violation::EMERGENCY_STOP | Violation::ROBOT_SERVO_OFF;
        let names: Vec<_> = v.names().collect();
        assert_eq!(names, ["EMERGENCY_STOP", "ROBOT_SERVO_OFF", "TESTER_STATE"]);
    }

    #[test]
    fn display_joins_names() {
        assert_eq!(Violation::empty().to_string(), "NONE");
        assert_eq!(
            (Violation::IO_COMM | Violation::DOOR_OPEN).to_string(),
            "DOOR_OPEN | IO_COMM"
        );
    }

    #[test]
    fn every_flag_has_exactly_one_owner() {
        for (name, flag) in Violation::all().iter_names() {
            assert!(flag.subsystem().is_some(), "{name} has no subsystem");
        }
    }
}
