use std::time::{Duration, Instant};

use chunkline_contract::ChunkLayout;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Uploading,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    Uploading,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSnapshot {
    pub state: TransferState,
    pub chunks: Vec<ChunkState>,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub resumed_bytes: u64,
    pub elapsed: Duration,
    pub throughput_bps: f64,
    pub eta: Option<Duration>,
}

impl TransferSnapshot {
    pub fn idle() -> Self {
        Self {
            state: TransferState::Idle,
            chunks: Vec::new(),
            total_bytes: 0,
            uploaded_bytes: 0,
            resumed_bytes: 0,
            elapsed: Duration::ZERO,
            throughput_bps: 0.0,
            eta: None,
        }
    }

    pub fn count(&self, state: ChunkState) -> usize {
        self.chunks.iter().filter(|chunk| **chunk == state).count()
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.uploaded_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

#[derive(Debug)]
pub(crate) struct ProgressBoard {
    layout: ChunkLayout,
    chunks: Vec<ChunkState>,
    state: TransferState,
    started: Instant,
    uploaded_bytes: u64,
    resumed_bytes: u64,
}

impl ProgressBoard {
    pub(crate) fn new(layout: ChunkLayout, started: Instant) -> Self {
        let total = usize::try_from(layout.total_chunks()).unwrap_or(usize::MAX);
        Self {
            layout,
            chunks: vec![ChunkState::Pending; total],
            state: TransferState::Uploading,
            started,
            uploaded_bytes: 0,
            resumed_bytes: 0,
        }
    }

    pub(crate) fn mark_resumed(&mut self, index: u64) {
        if self.chunk_state(index) == Some(ChunkState::Success) {
            return;
        }
        if self.set(index, ChunkState::Success) {
            let len = self.len_of(index);
            self.uploaded_bytes += len;
            self.resumed_bytes += len;
        }
    }

    pub(crate) fn mark(&mut self, index: u64, state: ChunkState) {
        let was_success = self.chunk_state(index) == Some(ChunkState::Success);
        if !self.set(index, state) {
            return;
        }
        let len = self.len_of(index);
        match (was_success, state == ChunkState::Success) {
            (false, true) => self.uploaded_bytes += len,
            (true, false) => self.uploaded_bytes -= len,
            _ => {}
        }
    }

    pub(crate) fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    pub(crate) fn chunk_state(&self, index: u64) -> Option<ChunkState> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.chunks.get(index))
            .copied()
    }

    pub(crate) fn pending(&self) -> Vec<u64> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != ChunkState::Success)
            .map(|(index, _)| index as u64)
            .collect()
    }

    pub(crate) fn all_succeeded(&self) -> bool {
        self.chunks.iter().all(|state| *state == ChunkState::Success)
    }

    pub(crate) fn snapshot(&self, now: Instant) -> TransferSnapshot {
        let elapsed = now.saturating_duration_since(self.started);
        let sent_this_run = self.uploaded_bytes - self.resumed_bytes;
        let seconds = elapsed.as_secs_f64();
        let throughput_bps = if seconds > 0.0 {
            sent_this_run as f64 / seconds
        } else {
            0.0
        };
        let remaining = self.layout.total_size() - self.uploaded_bytes;
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if throughput_bps > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / throughput_bps))
        } else {
            None
        };

        TransferSnapshot {
            state: self.state,
            chunks: self.chunks.clone(),
            total_bytes: self.layout.total_size(),
            uploaded_bytes: self.uploaded_bytes,
            resumed_bytes: self.resumed_bytes,
            elapsed,
            throughput_bps,
            eta,
        }
    }

    fn len_of(&self, index: u64) -> u64 {
        self.layout.chunk_len(index).unwrap_or(0)
    }

    fn set(&mut self, index: u64, state: ChunkState) -> bool {
        match usize::try_from(index)
            .ok()
            .and_then(|index| self.chunks.get_mut(index))
        {
            Some(slot) => {
                *slot = state;
                true
            }
            None => false,
        }
    }
}
