// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for wire-level error text.
//!
//! Message framing failures in [`crate::base::codec`] embed a dump of the
//! offending bytes so the flow can be matched against a packet capture. The
//! undecoded buffer can be arbitrarily large, so the dump is capped and the
//! remainder summarized instead of flooding the error message.

use pretty_hex::PrettyHex;

/// Formats at most `max_bytes` of `inner` via `pretty-hex`, noting how much
/// was left out.
pub struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.inner[..self.inner.len().min(self.max_bytes)];
        writeln!(f, "{} bytes:", self.inner.len())?;
        write!(
            f,
            "{:?}",
            shown.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(omitted) = self.inner.len().checked_sub(self.max_bytes) {
            if omitted > 0 {
                write!(f, "\n({} more bytes omitted)", omitted)?;
            }
        }
        Ok(())
    }
}
