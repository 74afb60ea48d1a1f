//! Simulated digital I/O rack.
//!
//! The `SimIo` rack manages:
//! - Digital inputs, settable from tests through [`SimIoHandle`]
//! - Digital outputs as written by the cell
//! - Linked reactions: an output edge schedules an input change a number
//!   of refreshes later (e.g. unlocking the tester door opens its sensor)

use cell_common::io::DiRole;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::driver::{DigitalIo, HalError, HalResult};

/// Output edge that drives an input after a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedInput {
    /// Output whose rising edge triggers the reaction.
    pub do_index: usize,
    /// Input that follows.
    pub di_index: usize,
    /// Value the input takes.
    pub value: bool,
    /// Refreshes until the input changes.
    pub delay_refreshes: u32,
}

#[derive(Debug, Clone, Copy)]
struct PendingDiChange {
    remaining: u32,
    di_index: usize,
    value: bool,
}

#[derive(Debug)]
struct IoSim {
    connected: bool,
    comm_down: bool,
    di: Vec<bool>,
    do_: Vec<bool>,
    do_prev: Vec<bool>,
    links: Vec<LinkedInput>,
    pending: VecDeque<PendingDiChange>,
    refreshes: u64,
}

impl IoSim {
    fn check_link(&self) -> HalResult<()> {
        if self.comm_down {
            return Err(HalError::CommunicationError("I/O fieldbus timeout".into()));
        }
        if !self.connected {
            return Err(HalError::NotConnected("io"));
        }
        Ok(())
    }

    fn refresh(&mut self) {
        self.refreshes += 1;

        for (idx, (&now, prev)) in self.do_.iter().zip(self.do_prev.iter_mut()).enumerate() {
            if now && !*prev {
                for link in self.links.iter().filter(|l| l.do_index == idx) {
                    self.pending.push_back(PendingDiChange {
                        remaining: link.delay_refreshes,
                        di_index: link.di_index,
                        value: link.value,
                    });
                }
            }
            *prev = now;
        }

        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(mut change) = self.pending.pop_front() {
            if change.remaining == 0 {
                if let Some(slot) = self.di.get_mut(change.di_index) {
                    *slot = change.value;
                    debug!(di = change.di_index, value = change.value, "Linked DI applied");
                }
            } else {
                change.remaining -= 1;
                still_pending.push_back(change);
            }
        }
        self.pending = still_pending;
    }
}

/// Shared handle for driving a [`SimIo`] from tests.
#[derive(Debug, Clone)]
pub struct SimIoHandle(Arc<Mutex<IoSim>>);

impl SimIoHandle {
    /// Set an input by index.
    pub fn set_di(&self, index: usize, value: bool) {
        if let Some(slot) = self.0.lock().di.get_mut(index) {
            *slot = value;
        }
    }

    /// Set an input by role.
    pub fn set_role(&self, role: DiRole, value: bool) {
        self.set_di(role.index(), value);
    }

    /// Output by index.
    pub fn output(&self, index: usize) -> bool {
        self.0.lock().do_.get(index).copied().unwrap_or(false)
    }

    /// Make every call fail.
    pub fn set_comm_down(&self, down: bool) {
        self.0.lock().comm_down = down;
    }

    /// Number of successful refreshes.
    pub fn refreshes(&self) -> u64 {
        self.0.lock().refreshes
    }
}

/// Simulated I/O rack.
#[derive(Debug)]
pub struct SimIo {
    sim: Arc<Mutex<IoSim>>,
    di_count: usize,
    do_count: usize,
}

impl SimIo {
    /// Rack with the door closed and air pressure in range.
    pub fn new(di_count: usize, do_count: usize, links: Vec<LinkedInput>) -> (Self, SimIoHandle) {
        let mut di = vec![false; di_count];
        for role in [DiRole::DoorClosed, DiRole::AirPressureOk] {
            if let Some(slot) = di.get_mut(role.index()) {
                *slot = true;
            }
        }
        let sim = Arc::new(Mutex::new(IoSim {
            connected: false,
            comm_down: false,
            di,
            do_: vec![false; do_count],
            do_prev: vec![false; do_count],
            links,
            pending: VecDeque::new(),
            refreshes: 0,
        }));
        debug!("SimIo initialized: {} DI, {} DO", di_count, do_count);
        (
            Self {
                sim: Arc::clone(&sim),
                di_count,
                do_count,
            },
            SimIoHandle(sim),
        )
    }
}

impl DigitalIo for SimIo {
    fn connect(&mut self) -> HalResult<()> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::CommunicationError("I/O coupler unreachable".into()));
        }
        sim.connected = true;
        Ok(())
    }

    fn di_count(&self) -> usize {
        self.di_count
    }

    fn do_count(&self) -> usize {
        self.do_count
    }

    fn refresh(&mut self) -> HalResult<()> {
        let mut sim = self.sim.lock();
        sim.check_link()?;
        sim.refresh();
        Ok(())
    }

    fn get_di(&self, index: usize) -> HalResult<bool> {
        let sim = self.sim.lock();
        sim.check_link()?;
        sim.di.get(index).copied().ok_or(HalError::IndexOutOfRange {
            index,
            width: self.di_count,
        })
    }

    fn get_do(&self, index: usize) -> HalResult<bool> {
        let sim = self.sim.lock();
        sim.check_link()?;
        sim.do_.get(index).copied().ok_or(HalError::IndexOutOfRange {
            index,
            width: self.do_count,
        })
    }

    fn set_do(&mut self, index: usize, value: bool) -> HalResult<()> {
        let mut sim = self.sim.lock();
        sim.check_link()?;
        let width = self.do_count;
        let slot = sim
            .do_
            .get_mut(index)
            .ok_or(HalError::IndexOutOfRange { index, width })?;
        *slot = value;
        Ok(())
    }
}
