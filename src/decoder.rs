//! Packet framing and firmware version binding
//!
//! The decoder owns the receive buffer. The transport appends bytes into
//! [`PacketDecoder::buffer_mut`], then the control loop calls
//! [`PacketDecoder::decode`] until it reports [`DecodeOutcome::Incomplete`].

use crate::buffer::RawBuffer;
use crate::packet::{decode_packet, declared_length, FirmwareVersion, RealtimePacket, LENGTH_FIELD_SIZE};
use tracing::{debug, info, warn};

/// Consecutive packets of a different known length needed to rebind the version
pub const VERSION_SWITCH_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// Not enough bytes buffered for a complete packet
    Incomplete,
    Packet(RealtimePacket),
    /// Bytes were discarded to resynchronize
    Invalid { observed: usize, expected: usize },
}

#[derive(Debug, Default)]
pub struct PacketDecoder {
    buffer: RawBuffer,
    version: FirmwareVersion,
    /// Different known length seen after binding, and its run length
    candidate: Option<(FirmwareVersion, u32)>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Firmware version bound on this connection
    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    pub fn buffer(&self) -> &RawBuffer {
        &self.buffer
    }

    /// Buffer for the transport to append into
    pub fn buffer_mut(&mut self) -> &mut RawBuffer {
        &mut self.buffer
    }

    /// Forget buffered bytes and the bound version, e.g. after reconnecting
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.version = FirmwareVersion::Unknown;
        self.candidate = None;
    }

    fn expected_len(&self) -> usize {
        match self.version {
            FirmwareVersion::Unknown => FirmwareVersion::min_packet_len(),
            bound => bound.packet_len(),
        }
    }

    /// Try to take one packet off the front of the buffer
    pub fn decode(&mut self) -> DecodeOutcome {
        let buffered = self.buffer.len();
        if buffered < FirmwareVersion::min_packet_len() {
            return DecodeOutcome::Incomplete;
        }

        let Some(declared) = declared_length(self.buffer.as_slice()) else {
            return DecodeOutcome::Incomplete;
        };

        let Some(matched) = FirmwareVersion::from_packet_len(declared) else {
            return self.resync(declared);
        };

        // Every known length fits the buffer, so this always completes
        if buffered < declared {
            return DecodeOutcome::Incomplete;
        }

        if self.version == FirmwareVersion::Unknown {
            info!("Firmware version detected: {} ({} byte packets)", matched, declared);
            self.version = matched;
        } else if matched != self.version {
            let run = match self.candidate {
                Some((candidate, count)) if candidate == matched => count + 1,
                _ => 1,
            };
            if run < VERSION_SWITCH_THRESHOLD {
                debug!(
                    "Packet length {} does not match bound version {} ({} of {})",
                    declared, self.version, run, VERSION_SWITCH_THRESHOLD
                );
                self.candidate = Some((matched, run));
                let expected = self.expected_len();
                self.buffer.consume(declared);
                return DecodeOutcome::Invalid {
                    observed: declared,
                    expected,
                };
            }
            warn!("Firmware version changed from {} to {}", self.version, matched);
            self.version = matched;
        }
        self.candidate = None;

        let packet = decode_packet(&self.buffer.as_slice()[..declared], self.version);
        self.buffer.consume(declared);
        match packet {
            Some(packet) => DecodeOutcome::Packet(packet),
            None => DecodeOutcome::Invalid {
                observed: declared,
                expected: self.expected_len(),
            },
        }
    }

    /// Unknown length: drop the declared span if it is buffered, else everything
    fn resync(&mut self, declared: usize) -> DecodeOutcome {
        let expected = self.expected_len();
        let plausible = (LENGTH_FIELD_SIZE..=self.buffer.capacity()).contains(&declared);
        if plausible && declared <= self.buffer.len() {
            self.buffer.consume(declared);
        } else {
            self.buffer.clear();
        }
        self.candidate = None;
        debug!("Discarded packet with unknown length {}", declared);
        DecodeOutcome::Invalid {
            observed: declared,
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::fixtures::{running_packet, PacketBuilder};

    fn feed(decoder: &mut PacketDecoder, bytes: &[u8]) {
        let taken = decoder.buffer_mut().extend_from_slice(bytes);
        assert_eq!(taken, bytes.len());
    }

    #[test]
    fn test_incomplete_until_whole_packet_buffered() {
        let mut decoder = PacketDecoder::new();
        let packet = running_packet(FirmwareVersion::V32);

        feed(&mut decoder, &packet[..500]);
        assert_eq!(decoder.decode(), DecodeOutcome::Incomplete);
        feed(&mut decoder, &packet[500..900]);
        assert_eq!(decoder.decode(), DecodeOutcome::Incomplete);
        feed(&mut decoder, &packet[900..]);

        assert!(matches!(decoder.decode(), DecodeOutcome::Packet(_)));
        assert_eq!(decoder.version(), FirmwareVersion::V32);
        assert!(decoder.buffer().is_empty());
    }

    #[test]
    fn test_trailing_bytes_of_next_packet_are_kept() {
        let mut decoder = PacketDecoder::new();
        let first = PacketBuilder::new(FirmwareVersion::Pre18).time(1.0).build();
        let second = PacketBuilder::new(FirmwareVersion::Pre18).time(2.0).build();

        feed(&mut decoder, &first);
        feed(&mut decoder, &second[..300]);
        match decoder.decode() {
            DecodeOutcome::Packet(p) => assert_eq!(p.controller.timestamp, 1.0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(decoder.buffer().as_slice(), &second[..300]);

        feed(&mut decoder, &second[300..]);
        match decoder.decode() {
            DecodeOutcome::Packet(p) => assert_eq!(p.controller.timestamp, 2.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_length_resynchronizes() {
        let mut decoder = PacketDecoder::new();
        let bad = PacketBuilder::new(FirmwareVersion::Pre18).declared_len(800).build();
        feed(&mut decoder, &bad);
        feed(&mut decoder, &[0u8; 100]);

        assert_eq!(
            decoder.decode(),
            DecodeOutcome::Invalid {
                observed: 800,
                expected: 764
            }
        );
        // The declared 800 bytes go, the remaining 64 stay
        assert_eq!(decoder.buffer().len(), 64);
    }

    #[test]
    fn test_implausible_length_clears_buffer() {
        let mut decoder = PacketDecoder::new();
        let bad = PacketBuilder::new(FirmwareVersion::V18).declared_len(70_000).build();
        feed(&mut decoder, &bad);

        assert!(matches!(decoder.decode(), DecodeOutcome::Invalid { observed: 70_000, .. }));
        assert!(decoder.buffer().is_empty());
    }

    #[test]
    fn test_version_binding_stable_under_single_corruption() {
        let mut decoder = PacketDecoder::new();
        let good = running_packet(FirmwareVersion::Pre18);
        let stray = running_packet(FirmwareVersion::V18);

        for _ in 0..3 {
            feed(&mut decoder, &good);
            assert!(matches!(decoder.decode(), DecodeOutcome::Packet(_)));
        }

        feed(&mut decoder, &stray);
        assert_eq!(
            decoder.decode(),
            DecodeOutcome::Invalid {
                observed: 812,
                expected: 764
            }
        );
        assert_eq!(decoder.version(), FirmwareVersion::Pre18);

        for _ in 0..3 {
            feed(&mut decoder, &good);
            assert!(matches!(decoder.decode(), DecodeOutcome::Packet(_)));
        }
        assert_eq!(decoder.version(), FirmwareVersion::Pre18);
    }

    #[test]
    fn test_version_switches_after_consecutive_run() {
        let mut decoder = PacketDecoder::new();
        feed(&mut decoder, &running_packet(FirmwareVersion::V30_31));
        assert!(matches!(decoder.decode(), DecodeOutcome::Packet(_)));

        let newer = running_packet(FirmwareVersion::V32);
        for _ in 1..VERSION_SWITCH_THRESHOLD {
            feed(&mut decoder, &newer);
            assert!(matches!(decoder.decode(), DecodeOutcome::Invalid { observed: 1060, .. }));
            assert_eq!(decoder.version(), FirmwareVersion::V30_31);
        }

        feed(&mut decoder, &newer);
        assert!(matches!(decoder.decode(), DecodeOutcome::Packet(_)));
        assert_eq!(decoder.version(), FirmwareVersion::V32);
    }

    #[test]
    fn test_interrupted_run_does_not_switch() {
        let mut decoder = PacketDecoder::new();
        let bound = running_packet(FirmwareVersion::Pre18);
        let other = running_packet(FirmwareVersion::V18);
        feed(&mut decoder, &bound);
        decoder.decode();

        for _ in 0..3 {
            for _ in 1..VERSION_SWITCH_THRESHOLD {
                feed(&mut decoder, &other);
                decoder.decode();
            }
            feed(&mut decoder, &bound);
            assert!(matches!(decoder.decode(), DecodeOutcome::Packet(_)));
        }
        assert_eq!(decoder.version(), FirmwareVersion::Pre18);
    }

    #[test]
    fn test_buffer_never_holds_two_complete_packets() {
        let mut decoder = PacketDecoder::new();
        let stream: Vec<u8> = (0..20).flat_map(|_| running_packet(FirmwareVersion::Pre18)).collect();
        let min_len = FirmwareVersion::min_packet_len();
        let mut decoded = 0;

        // Arbitrary chunking: fill whatever is free, then drain
        for chunk in stream.chunks(997) {
            let mut rest = chunk;
            while !rest.is_empty() {
                let taken = decoder.buffer_mut().extend_from_slice(rest);
                rest = &rest[taken..];
                assert!(decoder.buffer().len() < 2 * min_len);
                loop {
                    match decoder.decode() {
                        DecodeOutcome::Incomplete => break,
                        DecodeOutcome::Packet(_) => decoded += 1,
                        other => panic!("unexpected {:?}", other),
                    }
                }
            }
        }
        assert_eq!(decoded, 20);
    }

    #[test]
    fn test_reset_unbinds_version() {
        let mut decoder = PacketDecoder::new();
        feed(&mut decoder, &running_packet(FirmwareVersion::V18));
        decoder.decode();
        feed(&mut decoder, &[1, 2, 3]);

        decoder.reset();
        assert_eq!(decoder.version(), FirmwareVersion::Unknown);
        assert!(decoder.buffer().is_empty());
    }
}
