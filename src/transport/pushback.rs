//! FIFO of bytes already read from the inbox but not yet consumed.

use std::collections::VecDeque;

/// Pushback buffer.
///
/// Scans that stop mid-chunk park the tail here; every wait drains it before
/// looking at the inbox, so byte order is preserved across waits.
#[derive(Debug, Default, Clone)]
pub struct PushbackBuffer {
    bytes: VecDeque<u8>,
}

impl PushbackBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Append bytes that arrived after everything already buffered.
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend(data);
    }

    /// Return bytes to the front, ahead of everything buffered.
    pub fn unread(&mut self, data: &[u8]) {
        for byte in data.iter().rev() {
            self.bytes.push_front(*byte);
        }
    }

    /// Remove and return up to `n` bytes from the front.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n).collect()
    }

    /// Remove and return everything.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.bytes.drain(..).collect()
    }

    /// Consume through the first occurrence of `byte`.
    ///
    /// Returns the number of bytes discarded before the match, or `None`
    /// (leaving the buffer untouched) if `byte` is not buffered.
    pub fn consume_through(&mut self, byte: u8) -> Option<usize> {
        let index = self.bytes.iter().position(|b| *b == byte)?;
        self.bytes.drain(..=index);
        Some(index)
    }

    /// Drop every leading occurrence of `byte`; returns how many were dropped.
    pub fn discard_leading(&mut self, byte: u8) -> usize {
        let mut dropped = 0;
        while self.bytes.front() == Some(&byte) {
            self.bytes.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
