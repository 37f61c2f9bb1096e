//! Flat per-transmission event log.

use serde::{Deserialize, Serialize};
use std::io::Write;

/// One row per `TxStart` (result `pending`) and per `TxEnd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogRow {
    /// Transmission id.
    pub event_id: u64,
    /// Transmitting node.
    pub node_id: u64,
    /// Spreading factor.
    pub sf: u8,
    /// Start time in seconds.
    pub start_time: f64,
    /// End time in seconds.
    pub end_time: f64,
    /// Carrier frequency in Hz.
    pub frequency: u32,
    /// `pending`, `success`, `collision_loss` or `no_coverage`.
    pub result: String,
    /// Gateway that decoded the frame best, if any.
    pub gateway_id: Option<u64>,
    /// RSSI at that gateway in dBm.
    pub rssi: Option<f64>,
    /// SNIR at that gateway in dB.
    pub snr: Option<f64>,
}

/// In-memory event log.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    rows: Vec<EventLogRow>,
}

impl EventLog {
    /// Append a row.
    pub fn push(&mut self, row: EventLogRow) {
        self.rows.push(row);
    }

    /// All rows in dispatch order.
    pub fn rows(&self) -> &[EventLogRow] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the rows as a JSON array.
    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), serde_json::Error> {
        serde_json::to_writer_pretty(writer, &self.rows)
    }
}
