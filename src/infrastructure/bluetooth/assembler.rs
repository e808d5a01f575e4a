//! Response line assembly
//!
//! Notifications arrive in MTU sized fragments with no framing. Lines are
//! rebuilt by buffering fragments and splitting on CRLF; the trailing
//! segment is carried over to the next fragment.

use crate::infrastructure::bluetooth::protocol::{clean_line, decode_fragment, LINE_TERMINATOR};

#[derive(Debug, Default)]
pub struct LineAssembler {
    carry: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment and return the complete, cleaned lines it closed.
    /// Lines that are empty after cleaning are dropped.
    pub fn feed(&mut self, fragment: &[u8]) -> Vec<String> {
        self.carry.push_str(&decode_fragment(fragment));

        let Some(last) = self.carry.rfind(LINE_TERMINATOR) else {
            return Vec::new();
        };
        let rest = self.carry.split_off(last + LINE_TERMINATOR.len());
        let complete = std::mem::replace(&mut self.carry, rest);

        complete
            .split(LINE_TERMINATOR)
            .map(clean_line)
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Partial line waiting for its terminator
    pub fn pending(&self) -> &str {
        &self.carry
    }

    pub fn reset(&mut self) {
        self.carry.clear();
    }
}
