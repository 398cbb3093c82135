// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interleaved channel bookkeeping for TCP sessions.
//!
//! Channel ids are constrained: a track's RTP flows on the even channel
//! `2 * track_id` and its RTCP on the odd successor. The table records
//! accepted claims, rejects collisions, and answers inbound-data lookups.

use std::num::NonZeroU8;

use smallvec::SmallVec;

use crate::StreamType;

/// Outcome of a rejected claim.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClaimError {
    /// The pair is not `[2k, 2k+1]` for the track being set up.
    BadShape,
    /// The pair is already claimed.
    Busy { id: u8 },
}

/// Mapping of interleaved channel pairs to track ids. Entry `i` covers
/// channels `2i` and `2i+1`; the stored value is the track id plus one.
#[derive(Default)]
pub(crate) struct ChannelTable(SmallVec<[Option<NonZeroU8>; 16]>);

impl ChannelTable {
    /// Validates a claim without recording it.
    ///
    /// Track 127 (channels 254/255) is the last pair that fits in the
    /// one-byte channel field.
    pub(crate) fn check(&self, interleaved: (u8, u8), track_id: usize) -> Result<(), ClaimError> {
        let (a, b) = interleaved;
        if a & 1 != 0 || b != a + 1 || usize::from(a >> 1) != track_id || track_id >= 128 {
            return Err(ClaimError::BadShape);
        }
        let i = usize::from(a >> 1);
        if self.0.get(i).copied().flatten().is_some() {
            return Err(ClaimError::Busy { id: a });
        }
        Ok(())
    }

    /// Claims a channel pair for a track, or explains why not.
    pub(crate) fn claim(
        &mut self,
        interleaved: (u8, u8),
        track_id: usize,
    ) -> Result<(), ClaimError> {
        self.check(interleaved, track_id)?;
        let i = usize::from(interleaved.0 >> 1);
        if i >= self.0.len() {
            self.0.resize(i + 1, None);
        }
        self.0[i] = Some(NonZeroU8::new((track_id + 1) as u8).expect("track_id + 1 is non-zero"));
        Ok(())
    }

    /// Looks up the track and stream type an inbound channel id addresses.
    pub(crate) fn lookup(&self, channel_id: u8) -> Option<(usize, StreamType)> {
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            return None;
        }
        self.0[i].map(|v| {
            (
                usize::from(v.get() - 1),
                if channel_id & 1 == 0 {
                    StreamType::Rtp
                } else {
                    StreamType::Rtcp
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_lookup() {
        let mut table = ChannelTable::default();
        assert_eq!(table.lookup(0), None);
        table.claim((0, 1), 0).unwrap();
        assert_eq!(table.lookup(0), Some((0, StreamType::Rtp)));
        assert_eq!(table.lookup(1), Some((0, StreamType::Rtcp)));
        table.claim((4, 5), 2).unwrap();
        assert_eq!(table.lookup(5), Some((2, StreamType::Rtcp)));
        assert_eq!(table.lookup(2), None);
    }

    #[test]
    fn last_pair_in_channel_space_accepted() {
        let mut table = ChannelTable::default();
        table.claim((254, 255), 127).unwrap();
        assert_eq!(table.lookup(254), Some((127, StreamType::Rtp)));
        assert_eq!(table.lookup(255), Some((127, StreamType::Rtcp)));
        // one past the channel space
        assert_eq!(table.check((0, 1), 128), Err(ClaimError::BadShape));
    }

    #[test]
    fn shape_enforced() {
        let mut table = ChannelTable::default();
        // odd first id
        assert_eq!(table.claim((1, 2), 0), Err(ClaimError::BadShape));
        // non-consecutive
        assert_eq!(table.claim((0, 2), 0), Err(ClaimError::BadShape));
        // channel pair of a different track
        assert_eq!(table.claim((2, 3), 0), Err(ClaimError::BadShape));
    }

    #[test]
    fn collisions_rejected() {
        let mut table = ChannelTable::default();
        table.claim((2, 3), 1).unwrap();
        assert_eq!(table.claim((2, 3), 1), Err(ClaimError::Busy { id: 2 }));
    }
}
