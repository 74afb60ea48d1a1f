//! Process catalogue of the command channels.
//!
//! A command record names its action in the `process` field. The Robot and
//! Device machines each accept a fixed set; anything else is failed back to
//! the producer.

use std::fmt;
use std::str::FromStr;

use crate::error::FsmError;

/// Parameter: rack floor of a rack motion.
pub const TARGET_FLOOR: &str = "target_floor";
/// Parameter: specimen name sent to the tester.
pub const TPNAME: &str = "TPNAME";
/// Parameter: scanned QR code sent to the tester.
pub const QR: &str = "QR";
/// Parameter: measured thickness sent to the tester [mm].
pub const THICKNESS: &str = "THICKNESS";
/// Parameter: output index of `SET_OUTPUT`.
pub const INDEX: &str = "index";
/// Parameter: output role name of `SET_OUTPUT`.
pub const ROLE: &str = "role";
/// Parameter: output value of `SET_OUTPUT`.
pub const VALUE: &str = "value";

macro_rules! process_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every process, in catalogue order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Wire name.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = FsmError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|p| p.as_str() == s)
                    .ok_or_else(|| FsmError::invalid(s, "unknown process"))
            }
        }
    };
}

process_enum! {
    /// Processes served by the Robot FSM.
    RobotProcess {
        /// Return to HOME through the nearest waypoint.
        MoveToHome => "MOVE_TO_HOME",
        /// Go to the front of a rack floor.
        MoveToRack => "MOVE_TO_RACK",
        /// Pick a specimen from a rack floor.
        PickFromRack => "PICK_FROM_RACK",
        /// Place the held specimen on the gauge.
        PlaceToGauge => "PLACE_TO_GAUGE",
        /// Pick the specimen from the gauge.
        PickFromGauge => "PICK_FROM_GAUGE",
        /// Load the held specimen into the tester grips.
        LoadTester => "LOAD_TESTER",
        /// Take the broken specimen out of the tester.
        UnloadTester => "UNLOAD_TESTER",
        /// Drop the held specimen into the scrap bin.
        DiscardScrap => "DISCARD_SCRAP",
    }
}

process_enum! {
    /// Processes served by the Device FSM.
    DeviceProcess {
        /// One gauge reading, result `{thickness}`.
        MeasureThickness => "MEASURE_THICKNESS",
        /// One QR read, result `{code}`.
        ReadQr => "READ_QR",
        /// `ARE_YOU_THERE` → `I_AM_HERE`.
        CheckTester => "CHECK_TESTER",
        /// `ASK_REGISTER` → `REGISTER_OK` / `REGISTER_NG`.
        RegisterSpecimen => "REGISTER_SPECIMEN",
        /// `START_TEST` → `TEST_RESULT`.
        StartTest => "START_TEST",
        /// Write one digital output.
        SetOutput => "SET_OUTPUT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for p in RobotProcess::ALL {
            assert_eq!(p.as_str().parse::<RobotProcess>().unwrap(), *p);
        }
        for p in DeviceProcess::ALL {
            assert_eq!(p.to_string().parse::<DeviceProcess>().unwrap(), *p);
        }
    }

    #[test]
    fn catalogues_are_disjoint() {
        for p in RobotProcess::ALL {
            assert!(p.as_str().parse::<DeviceProcess>().is_err());
        }
    }

    #[test]
    fn unknown_process_is_invalid_params() {
        let err = "FLY".parse::<RobotProcess>().unwrap_err();
        assert!(matches!(err, FsmError::InvalidParams { .. }));
        assert!(err.to_string().contains("FLY"));
    }
}
