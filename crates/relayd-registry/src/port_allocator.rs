//! Cyclic cursor-based port allocation over a configured TCP port range.

use crate::registry::Registry;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortAllocatorError {
    #[error("no free port in the configured range")]
    Exhausted,
    #[error("requested port {0} is outside the configured range")]
    OutOfRange(u16),
    #[error("requested port {0} is already in use")]
    PortInUse(u16),
}

/// Allocates from `[start, end]` inclusive, scanning forward from an internal cursor
/// and wrapping once at `end`. Spreads load across the range and avoids immediately
/// reusing a just-released port, which matters for TCP `TIME_WAIT`.
pub struct PortAllocator {
    start: u16,
    end: u16,
    next: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end, "port range start must not exceed end");
        Self {
            start,
            end,
            next: Mutex::new(start),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// If `requested` is `Some` and in range and free, honors it directly and does
    /// not advance the cursor. Otherwise scans up to `end - start + 1` candidates
    /// starting at the cursor, wrapping at `end`, returning the first free port and
    /// advancing the cursor to just past it.
    pub fn allocate(
        &self,
        registry: &Registry,
        requested: Option<u16>,
    ) -> Result<u16, PortAllocatorError> {
        if let Some(port) = requested {
            if !self.contains(port) {
                return Err(PortAllocatorError::OutOfRange(port));
            }
            return if registry.get_by_port(port).is_none() {
                Ok(port)
            } else {
                Err(PortAllocatorError::PortInUse(port))
            };
        }

        let span = (self.end - self.start) as u32 + 1;
        let mut cursor = self.next.lock().unwrap();
        let start_offset = (*cursor - self.start) as u32;

        for offset in 0..span {
            let candidate_offset = (start_offset + offset) % span;
            let candidate = self.start + candidate_offset as u16;
            if registry.get_by_port(candidate).is_none() {
                *cursor = if candidate == self.end {
                    self.start
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
        }

        Err(PortAllocatorError::Exhausted)
    }
}
