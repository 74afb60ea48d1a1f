//! Simulated station instruments: thickness gauge, QR reader and tester.

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::driver::{HalError, HalResult, QrReader, TesterLink, ThicknessGauge};
use crate::tester::{FrameDecoder, TesterMessage};

// ─── Gauge ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct GaugeSim {
    connected: bool,
    comm_down: bool,
    thickness_mm: f64,
    measurements: u64,
}

/// Shared handle for a [`SimGauge`].
#[derive(Debug, Clone)]
pub struct SimGaugeHandle(Arc<Mutex<GaugeSim>>);

impl SimGaugeHandle {
    /// Value returned by subsequent measurements.
    pub fn set_thickness(&self, mm: f64) {
        self.0.lock().thickness_mm = mm;
    }

    /// Make every call fail.
    pub fn set_comm_down(&self, down: bool) {
        self.0.lock().comm_down = down;
    }

    /// Measurements taken so far.
    pub fn measurements(&self) -> u64 {
        self.0.lock().measurements
    }
}

/// Simulated thickness gauge.
#[derive(Debug)]
pub struct SimGauge {
    sim: Arc<Mutex<GaugeSim>>,
}

impl SimGauge {
    /// Gauge that always reads `thickness_mm`.
    pub fn new(thickness_mm: f64) -> (Self, SimGaugeHandle) {
        let sim = Arc::new(Mutex::new(GaugeSim {
            connected: false,
            comm_down: false,
            thickness_mm,
            measurements: 0,
        }));
        (Self { sim: Arc::clone(&sim) }, SimGaugeHandle(sim))
    }
}

impl ThicknessGauge for SimGauge {
    fn connect(&mut self) -> HalResult<()> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::CommunicationError("gauge serial port closed".into()));
        }
        sim.connected = true;
        Ok(())
    }

    fn measure(&mut self) -> HalResult<f64> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::Timeout("gauge did not answer".into()));
        }
        if !sim.connected {
            return Err(HalError::NotConnected("gauge"));
        }
        sim.measurements += 1;
        Ok(sim.thickness_mm)
    }
}

// ─── QR reader ──────────────────────────────────────────────────────

#[derive(Debug)]
struct QrSim {
    connected: bool,
    comm_down: bool,
    prefix: String,
    next: u32,
    queued: VecDeque<String>,
}

/// Shared handle for a [`SimQr`].
#[derive(Debug, Clone)]
pub struct SimQrHandle(Arc<Mutex<QrSim>>);

impl SimQrHandle {
    /// Code returned by the next read, ahead of generated ones.
    pub fn queue_code(&self, code: impl Into<String>) {
        self.0.lock().queued.push_back(code.into());
    }

    /// Make every call fail.
    pub fn set_comm_down(&self, down: bool) {
        self.0.lock().comm_down = down;
    }
}

/// Simulated QR reader producing `<prefix>-0001`, `<prefix>-0002`, …
#[derive(Debug)]
pub struct SimQr {
    sim: Arc<Mutex<QrSim>>,
}

impl SimQr {
    /// Reader with a code prefix.
    pub fn new(prefix: impl Into<String>) -> (Self, SimQrHandle) {
        let sim = Arc::new(Mutex::new(QrSim {
            connected: false,
            comm_down: false,
            prefix: prefix.into(),
            next: 1,
            queued: VecDeque::new(),
        }));
        (Self { sim: Arc::clone(&sim) }, SimQrHandle(sim))
    }
}

impl QrReader for SimQr {
    fn connect(&mut self) -> HalResult<()> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::CommunicationError("QR reader socket refused".into()));
        }
        sim.connected = true;
        Ok(())
    }

    fn read_code(&mut self) -> HalResult<String> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::Timeout("QR reader did not answer".into()));
        }
        if !sim.connected {
            return Err(HalError::NotConnected("qr"));
        }
        if let Some(code) = sim.queued.pop_front() {
            return Ok(code);
        }
        let code = format!("{}-{:04}", sim.prefix, sim.next);
        sim.next += 1;
        Ok(code)
    }
}

// ─── Tester ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct TesterSim {
    connected: bool,
    comm_down: bool,
    decoder: FrameDecoder,
    outbox: VecDeque<(u32, Vec<u8>)>,
    test_polls: u32,
    state_code: i64,
    rejected: Vec<String>,
    registered: Vec<String>,
    received: Vec<TesterMessage>,
    corrupt_next: bool,
}

impl TesterSim {
    fn queue(&mut self, delay: u32, message: TesterMessage) {
        match message.encode() {
            Ok(frame) => self.outbox.push_back((delay, frame.into_bytes())),
            Err(e) => warn!(error = %e, "Sim tester cannot encode reply"),
        }
    }

    fn handle(&mut self, message: TesterMessage) {
        debug!(kind = %message.kind, "Sim tester received");
        match message.kind.as_str() {
            "ARE_YOU_THERE" => {
                self.queue(0, TesterMessage::new("I_AM_HERE").with("STATE", self.state_code));
            }
            "ASK_REGISTER" => {
                let name = message.get_str("TPNAME").unwrap_or_default().to_string();
                let reply = if name.is_empty() || self.rejected.contains(&name) {
                    TesterMessage::new("REGISTER_NG").with("TPNAME", name)
                } else {
                    self.registered.push(name.clone());
                    TesterMessage::new("REGISTER_OK").with("TPNAME", name)
                };
                self.queue(0, reply);
            }
            "START_TEST" => {
                let name = self.registered.last().cloned().unwrap_or_default();
                let result = TesterMessage::new("TEST_RESULT")
                    .with("TPNAME", name)
                    .with("MAX_LOAD", json!(12.5))
                    .with("ELONGATION", json!(3.2))
                    .with("STATE", self.state_code);
                self.queue(self.test_polls, result);
            }
            other => {
                self.queue(0, TesterMessage::new("UNKNOWN").with("REQUEST", Value::from(other)));
            }
        }
        self.received.push(message);
    }
}

/// Shared handle for a [`SimTester`].
#[derive(Debug, Clone)]
pub struct SimTesterHandle(Arc<Mutex<TesterSim>>);

impl SimTesterHandle {
    /// Make every call fail.
    pub fn set_comm_down(&self, down: bool) {
        self.0.lock().comm_down = down;
    }

    /// Answer `REGISTER_NG` for this specimen name.
    pub fn reject(&self, name: impl Into<String>) {
        self.0.lock().rejected.push(name.into());
    }

    /// State code reported in replies.
    pub fn set_state_code(&self, code: i64) {
        self.0.lock().state_code = code;
    }

    /// Send a garbled frame before the next reply.
    pub fn corrupt_next_reply(&self) {
        self.0.lock().corrupt_next = true;
    }

    /// Message types received so far.
    pub fn received_kinds(&self) -> Vec<String> {
        self.0.lock().received.iter().map(|m| m.kind.clone()).collect()
    }
}

/// Simulated tester speaking the framed text protocol.
#[derive(Debug)]
pub struct SimTester {
    sim: Arc<Mutex<TesterSim>>,
}

impl SimTester {
    /// Tester that reports TEST_RESULT `test_polls` reads after START_TEST.
    pub fn new(test_polls: u32) -> (Self, SimTesterHandle) {
        let sim = Arc::new(Mutex::new(TesterSim {
            connected: false,
            comm_down: false,
            decoder: FrameDecoder::new(),
            outbox: VecDeque::new(),
            test_polls,
            state_code: 0,
            rejected: Vec::new(),
            registered: Vec::new(),
            received: Vec::new(),
            corrupt_next: false,
        }));
        (Self { sim: Arc::clone(&sim) }, SimTesterHandle(sim))
    }
}

impl TesterLink for SimTester {
    fn connect(&mut self) -> HalResult<()> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::CommunicationError("tester link refused".into()));
        }
        sim.connected = true;
        sim.outbox.clear();
        sim.decoder = FrameDecoder::new();
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> HalResult<()> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::CommunicationError("tester link write failed".into()));
        }
        if !sim.connected {
            return Err(HalError::NotConnected("tester"));
        }
        sim.decoder.push(bytes);
        while let Some(frame) = sim.decoder.next_frame() {
            match frame {
                Ok(message) => sim.handle(message),
                Err(e) => warn!(error = %e, "Sim tester dropped malformed request"),
            }
        }
        Ok(())
    }

    fn read_available(&mut self) -> HalResult<Vec<u8>> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::Timeout("tester link read timed out".into()));
        }
        if !sim.connected {
            return Err(HalError::NotConnected("tester"));
        }
        let mut out = Vec::new();
        if sim.corrupt_next && !sim.outbox.is_empty() {
            sim.corrupt_next = false;
            out.extend_from_slice(b"\x02GARBLED@NOVALUE\x03");
        }
        let mut held = VecDeque::with_capacity(sim.outbox.len());
        while let Some((delay, bytes)) = sim.outbox.pop_front() {
            if delay == 0 {
                out.extend_from_slice(&bytes);
            } else {
                held.push_back((delay - 1, bytes));
            }
        }
        sim.outbox = held;
        Ok(out)
    }
}
