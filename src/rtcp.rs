// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-track RTCP accumulator, as described in
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6).
//!
//! Each configured track owns one [`RtcpSession`]. Frames flowing through
//! the connection are fed to [`RtcpSession::process_frame`]; a periodic tick
//! (see [`crate::RTCP_REPORT_PERIOD`]) calls [`RtcpSession::report`] and
//! routes any produced sender or receiver report over the track's
//! negotiated transport.

use std::time::{Instant, SystemTime};

use bytes::{Buf, Bytes};
use log::trace;
use rtp::extension::abs_send_time_extension::unix2ntp;
use webrtc_util::marshal::{Marshal, Unmarshal};

use crate::StreamType;

/// Number of packets tracked per u64 entry in the receive bitmap.
const PACKETS_PER_ENTRY: usize = 64;
const BITMAP_SIZE: usize = 128;

/// Accumulates statistics from one track's packet flow and produces periodic
/// sender or receiver reports.
pub struct RtcpSession(Inner);

enum Inner {
    Sender(SenderState),
    Receiver(ReceiverState),
}

impl RtcpSession {
    /// A session that publishes media on this track and reports SRs.
    pub fn new_sender(clock_rate: u32) -> Self {
        RtcpSession(Inner::Sender(SenderState {
            ssrc: None,
            clock_rate: f64::from(clock_rate),
            last_rtp_time_rtp: 0,
            last_rtp_time_time: None,
            packets: 0,
            octets: 0,
        }))
    }

    /// A session that receives media on this track and reports RRs.
    pub fn new_receiver(clock_rate: u32) -> Self {
        RtcpSession(Inner::Receiver(ReceiverState {
            ssrc: None,
            receiver_ssrc: rand::random::<u32>(),
            clock_rate: f64::from(clock_rate),
            bitmap: vec![0u64; BITMAP_SIZE],
            started: false,
            seq_cycles: 0,
            last_seq: 0,
            last_report_seq: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: None,
            jitter: 0.0,
            last_sender_report: 0,
            last_sender_report_time: None,
            total_lost: 0,
        }))
    }

    /// Observes one outgoing (sender) or incoming (receiver) packet.
    ///
    /// Unparseable packets update nothing; media keeps flowing regardless of
    /// what the statistics layer can make of it.
    pub fn process_frame(&mut self, now: Instant, stream_type: StreamType, payload: &[u8]) {
        match (&mut self.0, stream_type) {
            (Inner::Sender(s), StreamType::Rtp) => s.process_rtp(now, payload),
            (Inner::Sender(_), StreamType::Rtcp) => {}
            (Inner::Receiver(r), StreamType::Rtp) => r.process_rtp(now, payload),
            (Inner::Receiver(r), StreamType::Rtcp) => r.process_rtcp(now, payload),
        }
    }

    /// Returns a serialized SR or RR if one is due, i.e. if any packet flow
    /// has been observed since the session was created.
    pub fn report(&mut self, now: Instant) -> Option<Bytes> {
        let pkt = match &mut self.0 {
            Inner::Sender(s) => s.generate_report(now)?.marshal(),
            Inner::Receiver(r) => r.generate_report(now)?.marshal(),
        };
        match pkt {
            Ok(b) => Some(b),
            Err(e) => {
                trace!("failed to marshal RTCP report: {}", e);
                None
            }
        }
    }
}

struct SenderState {
    ssrc: Option<u32>,
    clock_rate: f64,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Option<Instant>,
    packets: u32,
    octets: u32,
}

impl SenderState {
    fn process_rtp(&mut self, now: Instant, payload: &[u8]) {
        let mut buf = payload;
        let header = match rtp::header::Header::unmarshal(&mut buf) {
            Ok(h) => h,
            Err(e) => {
                trace!("ignoring unparseable outgoing RTP packet: {}", e);
                return;
            }
        };
        self.ssrc = Some(header.ssrc);
        self.last_rtp_time_rtp = header.timestamp;
        self.last_rtp_time_time = Some(now);
        self.packets = self.packets.wrapping_add(1);
        self.octets = self
            .octets
            .wrapping_add(buf.remaining().try_into().unwrap_or(u32::MAX));
    }

    fn generate_report(&mut self, now: Instant) -> Option<rtcp::sender_report::SenderReport> {
        let ssrc = self.ssrc?;
        let last_time = self.last_rtp_time_time?;
        Some(rtcp::sender_report::SenderReport {
            ssrc,
            ntp_time: unix2ntp(SystemTime::now()),
            rtp_time: self.last_rtp_time_rtp.wrapping_add(
                (now.duration_since(last_time).as_secs_f64() * self.clock_rate) as u32,
            ),
            packet_count: self.packets,
            octet_count: self.octets,
            ..Default::default()
        })
    }
}

struct ReceiverState {
    /// The remote sender's SSRC, learned from the first received packet.
    ssrc: Option<u32>,
    receiver_ssrc: u32,
    clock_rate: f64,

    /// Receipt bitmap; each u64 tracks 64 sequence numbers.
    bitmap: Vec<u64>,
    started: bool,
    seq_cycles: u16,
    last_seq: u16,
    last_report_seq: u16,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Option<Instant>,
    jitter: f64,
    last_sender_report: u32,
    last_sender_report_time: Option<Instant>,
    total_lost: u32,
}

impl ReceiverState {
    fn set_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        self.bitmap[pos / PACKETS_PER_ENTRY] |= 1 << (pos % PACKETS_PER_ENTRY);
    }

    fn del_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        self.bitmap[pos / PACKETS_PER_ENTRY] &= !(1u64 << (pos % PACKETS_PER_ENTRY));
    }

    fn get_received(&self, seq: u16) -> bool {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        (self.bitmap[pos / PACKETS_PER_ENTRY] & (1 << (pos % PACKETS_PER_ENTRY))) != 0
    }

    fn process_rtp(&mut self, now: Instant, payload: &[u8]) {
        let mut buf = payload;
        let header = match rtp::header::Header::unmarshal(&mut buf) {
            Ok(h) => h,
            Err(e) => {
                trace!("ignoring unparseable incoming RTP packet: {}", e);
                return;
            }
        };
        self.ssrc = Some(header.ssrc);
        let seq = header.sequence_number;

        if !self.started {
            self.started = true;
            self.set_received(seq);
            self.last_seq = seq;
            self.last_report_seq = seq.wrapping_sub(1);
            self.last_rtp_time_rtp = header.timestamp;
            self.last_rtp_time_time = Some(now);
            return;
        }

        self.set_received(seq);

        // u16 arithmetic handles wraparound; diff in (0, 2^15) means in-order.
        let diff = seq.wrapping_sub(self.last_seq);
        if diff > 0 && diff < (1 << 15) {
            if seq < self.last_seq {
                self.seq_cycles = self.seq_cycles.wrapping_add(1);
            }

            // mark intervening sequence numbers as missing
            let mut i = self.last_seq.wrapping_add(1);
            while i != seq {
                self.del_received(i);
                i = i.wrapping_add(1);
            }

            self.last_seq = seq;
        }

        // interarrival jitter, https://tools.ietf.org/html/rfc3550#page-39
        if let Some(last_time) = self.last_rtp_time_time {
            let d = now.duration_since(last_time).as_secs_f64() * self.clock_rate
                - (header.timestamp as f64 - self.last_rtp_time_rtp as f64);
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last_rtp_time_rtp = header.timestamp;
        self.last_rtp_time_time = Some(now);
    }

    fn process_rtcp(&mut self, now: Instant, payload: &[u8]) {
        let mut buf = payload;
        let pkts = match rtcp::packet::unmarshal(&mut buf) {
            Ok(pkts) => pkts,
            Err(e) => {
                trace!("ignoring unparseable incoming RTCP packet: {}", e);
                return;
            }
        };
        for pkt in pkts {
            if let Some(sr) = pkt
                .as_any()
                .downcast_ref::<rtcp::sender_report::SenderReport>()
            {
                // LSR is the middle 32 bits of the SR's NTP timestamp.
                self.last_sender_report = (sr.ntp_time >> 16) as u32;
                self.last_sender_report_time = Some(now);
            }
        }
    }

    fn generate_report(&mut self, now: Instant) -> Option<rtcp::receiver_report::ReceiverReport> {
        if !self.started {
            return None;
        }
        let ssrc = self.ssrc?;

        let total_since_report = self.last_seq.wrapping_sub(self.last_report_seq);
        let mut lost_since_report = {
            if self.last_seq == self.last_report_seq {
                0u32
            } else {
                let mut ret = 0u32;
                let mut i = self.last_report_seq.wrapping_add(1);
                while i != self.last_seq {
                    if !self.get_received(i) {
                        ret += 1;
                    }
                    i = i.wrapping_add(1);
                }
                ret
            }
        };

        self.total_lost = self.total_lost.saturating_add(lost_since_report);

        // both counters are 24-bit on the wire
        if lost_since_report > 0xFF_FFFF {
            lost_since_report = 0xFF_FFFF;
        }
        if self.total_lost > 0xFF_FFFF {
            self.total_lost = 0xFF_FFFF;
        }

        let delay = match self.last_sender_report_time {
            Some(t) => (now.duration_since(t).as_secs_f64() * 65536.0) as u32,
            None => 0,
        };

        let fraction_lost = if total_since_report > 0 {
            ((lost_since_report * 256) as f64 / total_since_report as f64) as u8
        } else {
            0
        };

        let report = rtcp::receiver_report::ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![rtcp::reception_report::ReceptionReport {
                ssrc,
                last_sequence_number: (u32::from(self.seq_cycles) << 16)
                    | u32::from(self.last_seq),
                last_sender_report: self.last_sender_report,
                fraction_lost,
                total_lost: self.total_lost,
                delay,
                jitter: self.jitter as u32,
            }],
            ..Default::default()
        };

        self.last_report_seq = self.last_seq;

        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn rtp_packet(seq: u16, timestamp: u32) -> Vec<u8> {
        let pkt = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp,
                ssrc: 0xbc5e_9a40,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        };
        pkt.marshal().unwrap().to_vec()
    }

    fn parse_rr(raw: &[u8]) -> rtcp::receiver_report::ReceiverReport {
        let mut buf = raw;
        rtcp::receiver_report::ReceiverReport::unmarshal(&mut buf).unwrap()
    }

    fn parse_sr(raw: &[u8]) -> rtcp::sender_report::SenderReport {
        let mut buf = raw;
        rtcp::sender_report::SenderReport::unmarshal(&mut buf).unwrap()
    }

    #[test]
    fn no_report_before_any_packet() {
        let now = Instant::now();
        assert!(RtcpSession::new_sender(90_000).report(now).is_none());
        assert!(RtcpSession::new_receiver(90_000).report(now).is_none());
    }

    #[test]
    fn sender_counts_packets_and_octets() {
        let mut s = RtcpSession::new_sender(90_000);
        let now = Instant::now();
        for i in 0..10u16 {
            s.process_frame(now, StreamType::Rtp, &rtp_packet(i, 1000));
        }
        let sr = parse_sr(&s.report(now).unwrap());
        assert_eq!(sr.ssrc, 0xbc5e_9a40);
        assert_eq!(sr.packet_count, 10);
        assert_eq!(sr.octet_count, 40);
    }

    #[test]
    fn sender_extrapolates_rtp_time() {
        let mut s = RtcpSession::new_sender(90_000);
        let now = Instant::now();
        s.process_frame(now, StreamType::Rtp, &rtp_packet(1, 10_000));
        let sr = parse_sr(&s.report(now + Duration::from_secs(1)).unwrap());
        assert_eq!(sr.rtp_time, 10_000 + 90_000);
    }

    #[test]
    fn receiver_tracks_loss() {
        let mut r = RtcpSession::new_receiver(90_000);
        let now = Instant::now();
        r.process_frame(now, StreamType::Rtp, &rtp_packet(1, 0));
        r.process_frame(now, StreamType::Rtp, &rtp_packet(3, 0));
        let rr = parse_rr(&r.report(now).unwrap());
        assert_eq!(rr.reports.len(), 1);
        assert_eq!(rr.reports[0].ssrc, 0xbc5e_9a40);
        assert_eq!(rr.reports[0].last_sequence_number, 3);
        assert_eq!(rr.reports[0].total_lost, 1);
        assert_eq!(rr.reports[0].fraction_lost, (256u32 / 3) as u8);
    }

    #[test]
    fn receiver_handles_wraparound() {
        let mut r = RtcpSession::new_receiver(90_000);
        let now = Instant::now();
        r.process_frame(now, StreamType::Rtp, &rtp_packet(0xffff, 0));
        r.process_frame(now, StreamType::Rtp, &rtp_packet(0x0000, 0));
        r.process_frame(now, StreamType::Rtp, &rtp_packet(0xfffe, 0)); // out of order
        let rr = parse_rr(&r.report(now).unwrap());
        assert_eq!(rr.reports[0].last_sequence_number, 1 << 16);
        assert_eq!(rr.reports[0].total_lost, 0);
    }

    #[test]
    fn receiver_reordering_is_not_loss() {
        let mut r = RtcpSession::new_receiver(90_000);
        let now = Instant::now();
        for seq in [1u16, 3, 2, 4] {
            r.process_frame(now, StreamType::Rtp, &rtp_packet(seq, 0));
        }
        let rr = parse_rr(&r.report(now).unwrap());
        assert_eq!(rr.reports[0].total_lost, 0);
        assert_eq!(rr.reports[0].fraction_lost, 0);
    }

    #[test]
    fn receiver_jitter() {
        let mut r = RtcpSession::new_receiver(90_000);
        let t0 = Instant::now();
        r.process_frame(t0, StreamType::Rtp, &rtp_packet(1, 42_378_934));
        // one second later but the RTP clock only advanced 60000 of 90000
        r.process_frame(
            t0 + Duration::from_secs(1),
            StreamType::Rtp,
            &rtp_packet(2, 42_378_934 + 60_000),
        );
        let rr = parse_rr(&r.report(t0 + Duration::from_secs(1)).unwrap());
        assert_eq!(rr.reports[0].jitter, 30_000 / 16);
    }

    #[test]
    fn receiver_dlsr_from_sender_report() {
        let mut r = RtcpSession::new_receiver(90_000);
        let t0 = Instant::now();
        r.process_frame(t0, StreamType::Rtp, &rtp_packet(1, 0));
        let sr = rtcp::sender_report::SenderReport {
            ssrc: 0xbc5e_9a40,
            ntp_time: 0x1234_5678_0000_0000,
            rtp_time: 0,
            packet_count: 0,
            octet_count: 0,
            ..Default::default()
        };
        r.process_frame(t0, StreamType::Rtcp, &sr.marshal().unwrap());
        let rr = parse_rr(&r.report(t0 + Duration::from_secs(1)).unwrap());
        assert_eq!(rr.reports[0].last_sender_report, 0x5678_0000);
        assert_eq!(rr.reports[0].delay, 65_536);
    }

    #[test]
    fn cumulative_loss_accumulates_across_reports() {
        let mut r = RtcpSession::new_receiver(90_000);
        let now = Instant::now();
        r.process_frame(now, StreamType::Rtp, &rtp_packet(1, 0));
        r.process_frame(now, StreamType::Rtp, &rtp_packet(3, 0));
        assert_eq!(parse_rr(&r.report(now).unwrap()).reports[0].total_lost, 1);
        r.process_frame(now, StreamType::Rtp, &rtp_packet(4, 0));
        r.process_frame(now, StreamType::Rtp, &rtp_packet(6, 0));
        assert_eq!(parse_rr(&r.report(now).unwrap()).reports[0].total_lost, 2);
    }
}
