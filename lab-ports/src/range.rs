use crate::{PortError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn parse(range_str: &str) -> Result<Self> {
        let parts: Vec<&str> = range_str.trim().split('-').collect();
        if parts.len() != 2 {
            return Err(PortError::InvalidFormat(range_str.to_string()));
        }

        let start: u16 = parts[0]
            .trim()
            .parse()
            .map_err(|_| PortError::InvalidFormat(range_str.to_string()))?;
        let end: u16 = parts[1]
            .trim()
            .parse()
            .map_err(|_| PortError::InvalidFormat(range_str.to_string()))?;

        Self::new(start, end)
    }

    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(PortError::InvalidRange { start, end });
        }
        Ok(PortRange { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn size(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
