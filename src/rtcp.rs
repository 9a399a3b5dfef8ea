//! Per-track RTCP accounting and packet building (RFC 3550 §6).
//!
//! Every track of a session owns one [`RtcpContext`]. Reader (player)
//! sessions run it in [`RtcpFlavor::Send`] mode and emit SRs; publisher
//! sessions run [`RtcpFlavor::Recv`] and emit RRs. The 5-second cadence
//! and the forced report before the first RTP are enforced by the
//! session, not here.
//!
//! ```text
//! SR:   V=2 P RC | PT=200 | length | SSRC | NTP msw/lsw | RTP ts | pkts | octets
//! RR:   V=2 P RC | PT=201 | length | SSRC | report block (24 bytes)
//! SDES: V=2 P SC | PT=202 | length | SSRC | CNAME item | 0 | pad
//! ```

use std::time::Instant;

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01 (Unix epoch).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;

/// Which reports this context produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpFlavor {
    /// Reader side: counts outbound RTP, produces SR.
    Send,
    /// Publisher side: counts inbound RTP, produces RR.
    Recv,
}

/// (RTP timestamp ↔ NTP wall clock) pair taken from a peer's SR, the
/// anchor players use for A/V sync.
#[derive(Debug, Clone, Copy)]
pub struct SrAnchor {
    pub rtp_ts: u32,
    pub ntp_ms: u64,
}

/// Per-track packet/byte/sequence/jitter accumulator.
pub struct RtcpContext {
    pub flavor: RtcpFlavor,
    packets: u32,
    octets: u32,
    first_seq: Option<u16>,
    seq_max: u16,
    seq_cycles: u16,
    jitter: f64,
    last_transit: Option<i64>,
    expected_prior: u32,
    received_prior: u32,
    last_rtp_ts: u32,
    last_ntp_ms: u64,
    /// Last SR received from the peer: middle 32 NTP bits + arrival time
    /// (for LSR/DLSR) and the sync anchor.
    peer_sr_mid: u32,
    peer_sr_at: Option<Instant>,
    anchor: Option<SrAnchor>,
}

impl RtcpContext {
    pub fn new(flavor: RtcpFlavor) -> Self {
        RtcpContext {
            flavor,
            packets: 0,
            octets: 0,
            first_seq: None,
            seq_max: 0,
            seq_cycles: 0,
            jitter: 0.0,
            last_transit: None,
            expected_prior: 0,
            received_prior: 0,
            last_rtp_ts: 0,
            last_ntp_ms: 0,
            peer_sr_mid: 0,
            peer_sr_at: None,
            anchor: None,
        }
    }

    /// Account one RTP packet (inbound for Recv, outbound for Send).
    pub fn on_rtp(&mut self, seq: u16, rtp_ts: u32, ntp_ms: u64, sample_rate: u32, payload_size: usize) {
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(payload_size as u32);
        self.last_rtp_ts = rtp_ts;
        self.last_ntp_ms = ntp_ms;

        match self.first_seq {
            None => {
                self.first_seq = Some(seq);
                self.seq_max = seq;
            }
            Some(_) => {
                // Wrap detection: a much smaller sequence after a high one
                // means a new 16-bit cycle.
                if seq < self.seq_max && self.seq_max - seq > 0x8000 {
                    self.seq_cycles += 1;
                    self.seq_max = seq;
                } else if seq > self.seq_max || self.seq_max - seq > 0x8000 {
                    self.seq_max = seq;
                }
            }
        }

        // Interarrival jitter, RFC 3550 §A.8, in clock-rate units.
        if sample_rate > 0 {
            let arrival = (ntp_ms as i64) * (sample_rate as i64) / 1000;
            let transit = arrival - rtp_ts as i64;
            if let Some(last) = self.last_transit {
                let d = (transit - last).abs() as f64;
                self.jitter += (d - self.jitter) / 16.0;
            }
            self.last_transit = Some(transit);
        }
    }

    /// Digest an inbound RTCP compound packet. Every SR found updates the
    /// LSR bookkeeping and the A/V sync anchor.
    pub fn on_rtcp(&mut self, data: &[u8]) {
        let mut rest = data;
        while rest.len() >= 8 {
            let len = ((u16::from_be_bytes([rest[2], rest[3]]) as usize) + 1) * 4;
            if len > rest.len() {
                break;
            }
            if rest[1] == RTCP_SR && len >= 28 {
                let ntp_sec = u32::from_be_bytes([rest[8], rest[9], rest[10], rest[11]]) as u64;
                let ntp_frac = u32::from_be_bytes([rest[12], rest[13], rest[14], rest[15]]) as u64;
                let rtp_ts = u32::from_be_bytes([rest[16], rest[17], rest[18], rest[19]]);
                let unix_ms = ntp_sec.saturating_sub(NTP_UNIX_OFFSET) * 1000 + ntp_frac * 1000 / (1u64 << 32);

                self.peer_sr_mid = (((ntp_sec << 32) | ntp_frac) >> 16) as u32;
                self.peer_sr_at = Some(Instant::now());
                self.anchor = Some(SrAnchor { rtp_ts, ntp_ms: unix_ms });
            }
            rest = &rest[len..];
        }
    }

    /// The (RTP ↔ NTP) pair from the most recent peer SR, if any.
    pub fn sr_anchor(&self) -> Option<SrAnchor> {
        self.anchor
    }

    pub fn packets(&self) -> u32 {
        self.packets
    }

    /// Build a sender report (28 bytes, no report blocks).
    pub fn create_sr(&self, ssrc: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);
        buf.push(0x80);
        buf.push(RTCP_SR);
        buf.extend_from_slice(&6u16.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());

        let ntp_sec = (self.last_ntp_ms / 1000 + NTP_UNIX_OFFSET) as u32;
        let ntp_frac = ((self.last_ntp_ms % 1000) << 32) / 1000;
        buf.extend_from_slice(&ntp_sec.to_be_bytes());
        buf.extend_from_slice(&(ntp_frac as u32).to_be_bytes());
        buf.extend_from_slice(&self.last_rtp_ts.to_be_bytes());
        buf.extend_from_slice(&self.packets.to_be_bytes());
        buf.extend_from_slice(&self.octets.to_be_bytes());
        buf
    }

    /// Build a receiver report with one report block (32 bytes).
    pub fn create_rr(&mut self, self_ssrc: u32, peer_ssrc: u32) -> Vec<u8> {
        let extended_max = ((self.seq_cycles as u32) << 16) | self.seq_max as u32;
        let expected = match self.first_seq {
            Some(first) => extended_max.wrapping_sub(first as u32).wrapping_add(1),
            None => 0,
        };
        let lost_total = expected.saturating_sub(self.packets);

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.packets.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.packets;
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction = if expected_interval == 0 {
            0u8
        } else {
            ((lost_interval * 256 / expected_interval).min(255)) as u8
        };

        let dlsr = match self.peer_sr_at {
            Some(at) => (at.elapsed().as_secs_f64() * 65536.0) as u32,
            None => 0,
        };

        let mut buf = Vec::with_capacity(32);
        buf.push(0x81);
        buf.push(RTCP_RR);
        buf.extend_from_slice(&7u16.to_be_bytes());
        buf.extend_from_slice(&self_ssrc.to_be_bytes());
        buf.extend_from_slice(&peer_ssrc.to_be_bytes());
        buf.push(fraction);
        let cum = lost_total.min(0x00ff_ffff);
        buf.extend_from_slice(&[(cum >> 16) as u8, (cum >> 8) as u8, cum as u8]);
        buf.extend_from_slice(&extended_max.to_be_bytes());
        buf.extend_from_slice(&(self.jitter as u32).to_be_bytes());
        buf.extend_from_slice(&self.peer_sr_mid.to_be_bytes());
        buf.extend_from_slice(&dlsr.to_be_bytes());
        buf
    }
}

/// Build an SDES packet carrying one CNAME chunk, padded to 32 bits.
pub fn create_sdes(ssrc: u32, cname: &str) -> Vec<u8> {
    let cname = &cname.as_bytes()[..cname.len().min(255)];
    // chunk: ssrc + item(type, len, text) + terminator, padded.
    let item_len = 4 + 2 + cname.len() + 1;
    let padded = (item_len + 3) & !3;
    let words = (4 + padded) / 4 - 1;

    let mut buf = Vec::with_capacity(4 + padded);
    buf.push(0x81);
    buf.push(RTCP_SDES);
    buf.extend_from_slice(&(words as u16).to_be_bytes());
    buf.extend_from_slice(&ssrc.to_be_bytes());
    buf.push(1); // CNAME
    buf.push(cname.len() as u8);
    buf.extend_from_slice(cname);
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sr_layout() {
        let mut ctx = RtcpContext::new(RtcpFlavor::Send);
        ctx.on_rtp(10, 90_000, 1_000, 90_000, 1200);
        ctx.on_rtp(11, 93_000, 1_033, 90_000, 800);

        let sr = ctx.create_sr(0xDEAD_BEEF);
        assert_eq!(sr.len(), 28);
        assert_eq!(sr[0], 0x80);
        assert_eq!(sr[1], RTCP_SR);
        assert_eq!(u16::from_be_bytes([sr[2], sr[3]]), 6);
        assert_eq!(u32::from_be_bytes([sr[4], sr[5], sr[6], sr[7]]), 0xDEAD_BEEF);
        // RTP timestamp mirrors the last packet.
        assert_eq!(u32::from_be_bytes([sr[16], sr[17], sr[18], sr[19]]), 93_000);
        // Packet and octet counters.
        assert_eq!(u32::from_be_bytes([sr[20], sr[21], sr[22], sr[23]]), 2);
        assert_eq!(u32::from_be_bytes([sr[24], sr[25], sr[26], sr[27]]), 2000);
    }

    #[test]
    fn sr_ntp_is_after_unix_epoch() {
        let mut ctx = RtcpContext::new(RtcpFlavor::Send);
        ctx.on_rtp(1, 0, 1_700_000_000_000, 90_000, 100);
        let sr = ctx.create_sr(1);
        let ntp_sec = u32::from_be_bytes([sr[8], sr[9], sr[10], sr[11]]) as u64;
        assert_eq!(ntp_sec, 1_700_000_000 + NTP_UNIX_OFFSET);
    }

    #[test]
    fn rr_counts_loss() {
        let mut ctx = RtcpContext::new(RtcpFlavor::Recv);
        // Sequences 100..110 with 105 missing: 10 received, 11 expected.
        for seq in (100u16..111).filter(|s| *s != 105) {
            ctx.on_rtp(seq, seq as u32 * 3000, seq as u64, 90_000, 1000);
        }

        let rr = ctx.create_rr(0x01, 0x02);
        assert_eq!(rr.len(), 32);
        assert_eq!(rr[0], 0x81);
        assert_eq!(rr[1], RTCP_RR);
        assert_eq!(u32::from_be_bytes([rr[4], rr[5], rr[6], rr[7]]), 0x01);
        assert_eq!(u32::from_be_bytes([rr[8], rr[9], rr[10], rr[11]]), 0x02);
        let cum = u32::from_be_bytes([0, rr[13], rr[14], rr[15]]);
        assert_eq!(cum, 1, "one packet lost");
        let ext = u32::from_be_bytes([rr[16], rr[17], rr[18], rr[19]]);
        assert_eq!(ext, 110);
    }

    #[test]
    fn seq_wrap_extends_cycles() {
        let mut ctx = RtcpContext::new(RtcpFlavor::Recv);
        ctx.on_rtp(65_534, 0, 0, 90_000, 100);
        ctx.on_rtp(65_535, 0, 0, 90_000, 100);
        ctx.on_rtp(0, 0, 0, 90_000, 100);
        ctx.on_rtp(1, 0, 0, 90_000, 100);

        let rr = ctx.create_rr(1, 2);
        let ext = u32::from_be_bytes([rr[16], rr[17], rr[18], rr[19]]);
        assert_eq!(ext, 65_536 + 1);
    }

    #[test]
    fn on_rtcp_records_sr_anchor() {
        let mut sender = RtcpContext::new(RtcpFlavor::Send);
        sender.on_rtp(1, 180_000, 1_700_000_000_123, 90_000, 100);
        let sr = sender.create_sr(0xABCD);

        let mut recv = RtcpContext::new(RtcpFlavor::Recv);
        recv.on_rtcp(&sr);
        let anchor = recv.sr_anchor().expect("anchor recorded");
        assert_eq!(anchor.rtp_ts, 180_000);
        // Millisecond rounding through the 32-bit NTP fraction.
        assert!((anchor.ntp_ms as i64 - 1_700_000_000_123i64).abs() <= 1);
    }

    #[test]
    fn on_rtcp_skips_malformed_tail() {
        let mut ctx = RtcpContext::new(RtcpFlavor::Recv);
        // Valid header claiming more bytes than present.
        ctx.on_rtcp(&[0x80, RTCP_SR, 0x00, 0xff, 0, 0, 0, 0]);
        assert!(ctx.sr_anchor().is_none());
    }

    #[test]
    fn sdes_padding_and_cname() {
        for cname in ["a", "relay", "rtsp-relay/0.1"] {
            let sdes = create_sdes(0x1234_5678, cname);
            assert_eq!(sdes.len() % 4, 0, "padded to 32 bits");
            assert_eq!(sdes[1], RTCP_SDES);
            let words = u16::from_be_bytes([sdes[2], sdes[3]]) as usize;
            assert_eq!((words + 1) * 4, sdes.len(), "length field covers packet");
            assert_eq!(sdes[8], 1, "CNAME item type");
            assert_eq!(sdes[9] as usize, cname.len());
            assert_eq!(&sdes[10..10 + cname.len()], cname.as_bytes());
        }
    }
}
