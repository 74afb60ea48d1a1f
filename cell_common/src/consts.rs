//! System-wide constants for the cell workspace.
//!
//! Single source of truth for I/O widths, protocol offsets and loop
//! defaults. Imported by all crates - no duplication permitted.

use std::time::Duration;

/// Number of digital inputs on the deployed I/O rack.
pub const DI_COUNT: usize = 48;

/// Number of digital outputs on the deployed I/O rack.
pub const DO_COUNT: usize = 32;

/// Offset the robot controller adds to `CMD` when acknowledging a motion.
pub const ACK_OFFSET: i32 = 500;

/// Offset the robot controller adds to `CMD` when a motion has completed.
pub const DONE_OFFSET: i32 = 10_000;

/// Motion id of the robot's HOME waypoint.
pub const HOME_MOTION_ID: i64 = 1000;

/// Default FSM tick interval in milliseconds (sub-10ms polling).
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 5;

/// Default FSM tick interval as Duration.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(DEFAULT_TICK_INTERVAL_MS);

/// Default number of CMD writes before an ACK timeout is declared.
pub const DEFAULT_ACK_RETRIES: u32 = 3;

/// Default wait for ACK per attempt, in milliseconds.
pub const DEFAULT_ACK_RETRY_INTERVAL_MS: u64 = 200;

/// Default wait for DONE after ACK, in milliseconds.
pub const DEFAULT_DONE_TIMEOUT_MS: u64 = 30_000;

/// Default settle delay between reconnect and re-check, in milliseconds.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

/// Default wait for a tester reply, in milliseconds.
pub const DEFAULT_TESTER_REPLY_TIMEOUT_MS: u64 = 5_000;

/// Default wait for a tensile test to finish, in milliseconds.
pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 600_000;

/// Consecutive communication failures before a comm violation is raised.
pub const DEFAULT_COMM_ERROR_THRESHOLD: u32 = 3;

/// Default number of floors in the specimen rack.
pub const DEFAULT_RACK_FLOORS: u8 = 10;

/// Highest rack floor the motion id catalogue can address.
pub const MAX_RACK_FLOORS: u8 = 99;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cell/cell.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_do_not_collide() {
        // ACK values must never be mistaken for DONE values and vice versa.
        assert!(ACK_OFFSET > 0);
        assert!(DONE_OFFSET > ACK_OFFSET * 2);
    }

    #[test]
    fn tick_interval_is_sub_10ms() {
        assert!(DEFAULT_TICK_INTERVAL < Duration::from_millis(10));
    }

    #[test]
    fn rack_floors_fit_motion_catalogue() {
        assert!(DEFAULT_RACK_FLOORS <= MAX_RACK_FLOORS);
        // Rack fronts are 1000 + 10·floor and must stay below the gauge block (2000).
        assert!(1000 + 10 * i32::from(MAX_RACK_FLOORS) + 1 < 2000);
    }
}
