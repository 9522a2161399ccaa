//! The adaptive register scanner: splits scan ranges into MTU-sized chunks, bisects
//! on failure to localize unreadable registers, and persists every determination
//! through a `ResultStore`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::ble::{Client, MAX_REGISTERS_PER_REQUEST};
use crate::error::Result;
use crate::store::{RegisterResult, ResultStore};

/// A half-open `[start, end)` range over register addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    pub start: u16,
    pub end: u16,
}

/// Emitted after every fully-resolved chunk: `scanned` out of `total` registers
/// across the scan's original ranges have a final determination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub scanned: usize,
    pub total: usize,
}

/// Discovers per-register readability over `ranges`, bisecting chunks that fail as
/// a whole until individual unreadable registers are isolated.
pub struct Scanner {
    client: Client,
    device_id: String,
    store: Arc<dyn ResultStore>,
    stack: Vec<(u16, u16)>,
    total: usize,
    scanned: usize,
    progress_tx: mpsc::UnboundedSender<Progress>,
}

impl Scanner {
    /// Builds a scanner and its progress channel. `ranges` are split into chunks of
    /// at most `MAX_REGISTERS_PER_REQUEST` registers and pushed onto a stack so
    /// that subdivisions from a failed chunk are processed before the rest of the
    /// original ranges (depth-first around trouble spots, breadth-first otherwise).
    pub fn new(
        client: Client,
        device_id: String,
        ranges: Vec<ScanRange>,
        store: Arc<dyn ResultStore>,
    ) -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let total = ranges
            .iter()
            .map(|r| (r.end - r.start) as usize)
            .sum();
        let stack = build_stack(&ranges);

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let scanner = Self {
            client,
            device_id,
            store,
            stack,
            total,
            scanned: 0,
            progress_tx,
        };
        (scanner, progress_rx)
    }

    /// Runs until the stack is drained or `abort` is observed set.
    pub async fn run(&mut self, abort: Option<&AtomicBool>) -> Result<()> {
        while self.step(abort).await? {}
        Ok(())
    }

    /// Processes one chunk off the stack. Returns `Ok(true)` if a chunk was
    /// processed (or the scan was cancelled) and the caller should call again,
    /// `Ok(false)` once the stack is empty.
    pub async fn step(&mut self, abort: Option<&AtomicBool>) -> Result<bool> {
        if let Some(flag) = abort {
            if flag.load(Ordering::SeqCst) {
                self.emit_progress();
                return Ok(false);
            }
        }

        let Some((start, end)) = self.stack.pop() else {
            return Ok(false);
        };
        let count = end - start;

        match self.client.read_registers(start, count, None).await {
            Ok(bytes) => {
                for i in 0..count {
                    let address = start + i;
                    let offset = (2 * i) as usize;
                    let value = [bytes[offset], bytes[offset + 1]];
                    self.store
                        .upsert(
                            &self.device_id,
                            address,
                            RegisterResult {
                                readable: true,
                                scanned_at: Utc::now(),
                                value: Some(value),
                            },
                        )
                        .await?;
                }
                self.scanned += count as usize;
            }
            Err(_) if count == 1 => {
                self.store
                    .upsert(
                        &self.device_id,
                        start,
                        RegisterResult {
                            readable: false,
                            scanned_at: Utc::now(),
                            value: None,
                        },
                    )
                    .await?;
                self.scanned += 1;
            }
            Err(_) => {
                let mid = start + count / 2;
                // Push right half first so the left half is processed next (LIFO).
                self.stack.push((mid, end));
                self.stack.push((start, mid));
            }
        }

        self.emit_progress();
        Ok(true)
    }

    fn emit_progress(&self) {
        let _ = self.progress_tx.send(Progress {
            scanned: self.scanned,
            total: self.total,
        });
    }
}

/// Splits `ranges` into `MAX_REGISTERS_PER_REQUEST`-sized chunks and lays them onto
/// a stack so that popping yields chunks in their original left-to-right order.
/// Subdivisions pushed later by a failed chunk then sit on top, ahead of the rest.
fn build_stack(ranges: &[ScanRange]) -> Vec<(u16, u16)> {
    let mut stack = Vec::new();
    for range in ranges.iter().rev() {
        let mut chunks = Vec::new();
        let mut start = range.start;
        while start < range.end {
            let end = (start + MAX_REGISTERS_PER_REQUEST).min(range.end);
            chunks.push((start, end));
            start = end;
        }
        stack.extend(chunks.into_iter().rev());
    }
    stack
}

/// The default scan range for a given MODBUS protocol version.
pub fn default_range(protocol_version: u32) -> ScanRange {
    if protocol_version < 2000 {
        ScanRange { start: 0, end: 8000 }
    } else {
        ScanRange { start: 0, end: 20000 }
    }
}

/// The minimal contiguous ranges within `[start, end)` whose addresses do not
/// appear in `scanned_sorted` (which must already be sorted ascending).
pub fn calculate_pending_ranges(start: u16, end: u16, scanned_sorted: &[u16]) -> Vec<ScanRange> {
    let mut ranges = Vec::new();
    let mut cursor = start;
    for &address in scanned_sorted {
        if address < start || address >= end {
            continue;
        }
        if address > cursor {
            ranges.push(ScanRange { start: cursor, end: address });
        }
        cursor = cursor.max(address + 1);
    }
    if cursor < end {
        ranges.push(ScanRange { start: cursor, end });
    }
    ranges
}
