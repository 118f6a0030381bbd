use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;

use crate::messaging::message::{ChannelId, PeerId};
use crate::util::buf_ext::BufExt;

/// marks the absence of a reply channel on the wire
const NO_REPLY_CHANNEL: u32 = u32::MAX;

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(shared_secret: &[u8], from: PeerId, to: PeerId, channel: ChannelId, reply_to: Option<ChannelId>, msg: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();

        digest.update(shared_secret);
        digest.update(&from.0.to_be_bytes());
        digest.update(&to.0.to_be_bytes());
        digest.update(&channel.0.to_be_bytes());
        digest.update(&Envelope::reply_to_raw(reply_to).to_be_bytes());
        digest.update(msg);

        Checksum(
            digest.finalize()
        )
    }
}


/// The header that precedes a message's payload on the wire:
///
/// ```ascii
///  0: sender (u32)
///  4: recipient (u32)
///  8: checksum (u64)
/// 16: channel id (u32)
/// 20: reply channel id (u32), FFFFFFFF if none
/// 24: payload
/// ```
///
/// All numbers are in network byte order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub from: PeerId,
    pub to: PeerId,
    pub checksum: Checksum,
    pub channel: ChannelId,
    pub reply_to: Option<ChannelId>,
}
impl Envelope {
    pub const SERIALIZED_LEN: usize = 24;

    fn reply_to_raw(reply_to: Option<ChannelId>) -> u32 {
        reply_to
            .map(|c| c.0)
            .unwrap_or(NO_REPLY_CHANNEL)
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let from = PeerId(buf.try_read_u32()?);
        let to = PeerId(buf.try_read_u32()?);
        let checksum = Checksum(buf.try_read_u64()?);
        let channel = ChannelId(buf.try_read_u32()?);
        let reply_to = match buf.try_read_u32()? {
            NO_REPLY_CHANNEL => None,
            raw => Some(ChannelId(raw)),
        };

        Ok(Envelope {
            from,
            to,
            checksum,
            channel,
            reply_to,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.from.0);
        buf.put_u32(self.to.0);
        buf.put_u64(self.checksum.0);
        buf.put_u32(self.channel.0);
        buf.put_u32(Self::reply_to_raw(self.reply_to));
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::no_reply(1, 2, 7, None, b"\0\0\0\x01\0\0\0\x02\x12\x34\x56\x78\x90\x98\x76\x54\0\0\0\x07\xff\xff\xff\xff")]
    #[case::reply(3, 0, 0x102, Some(0x8000_0003), b"\0\0\0\x03\0\0\0\0\x12\x34\x56\x78\x90\x98\x76\x54\0\0\x01\x02\x80\0\0\x03")]
    fn test_envelope_write(#[case] from: u32, #[case] to: u32, #[case] channel: u32, #[case] reply_to: Option<u32>, #[case] expected: &[u8]) {
        let envelope = Envelope {
            from: PeerId(from),
            to: PeerId(to),
            checksum: Checksum(0x1234567890987654),
            channel: ChannelId(channel),
            reply_to: reply_to.map(ChannelId),
        };

        let mut buf = BytesMut::new();
        envelope.write(&mut buf);
        assert_eq!(&buf, expected);
        assert_eq!(buf.len(), Envelope::SERIALIZED_LEN);
    }

    #[rstest]
    #[case::just_envelope(b"\0\0\0\x01\0\0\0\x02\0\0\0\0\0\0\0\x09\0\0\0\x07\xff\xff\xff\xff", b"", Some(Envelope {
        from: PeerId(1),
        to: PeerId(2),
        checksum: Checksum(9),
        channel: ChannelId(7),
        reply_to: None,
    }))]
    #[case::remainder(b"\0\0\0\x04\0\0\0\x05\0\0\0\0\0\0\0\x01\0\0\0\x06\x80\0\0\x01abc", b"abc", Some(Envelope {
        from: PeerId(4),
        to: PeerId(5),
        checksum: Checksum(1),
        channel: ChannelId(6),
        reply_to: Some(ChannelId(0x8000_0001)),
    }))]
    #[case::too_short(b"\0\0\0\x01\0\0\0\x02\0\0\0\0\0\0\0\x09\0\0\0\x07\xff\xff\xff", b"", None)]
    fn test_envelope_try_read(#[case] mut buf: &[u8], #[case] buf_after: &[u8], #[case] expected: Option<Envelope>) {
        match Envelope::try_read(&mut buf) {
            Ok(actual) => {
                assert_eq!(actual, expected.unwrap());
                assert_eq!(buf, buf_after);
            }
            Err(e) => {
                println!("{}", e);
                assert!(expected.is_none());
            }
        }
    }

    #[test]
    fn test_checksum_covers_routing_and_payload() {
        let base = Checksum::new(b"secret", PeerId(1), PeerId(2), ChannelId(3), None, b"payload");
        assert_eq!(base, Checksum::new(b"secret", PeerId(1), PeerId(2), ChannelId(3), None, b"payload"));

        assert_ne!(base, Checksum::new(b"other", PeerId(1), PeerId(2), ChannelId(3), None, b"payload"));
        assert_ne!(base, Checksum::new(b"secret", PeerId(2), PeerId(2), ChannelId(3), None, b"payload"));
        assert_ne!(base, Checksum::new(b"secret", PeerId(1), PeerId(1), ChannelId(3), None, b"payload"));
        assert_ne!(base, Checksum::new(b"secret", PeerId(1), PeerId(2), ChannelId(4), None, b"payload"));
        assert_ne!(base, Checksum::new(b"secret", PeerId(1), PeerId(2), ChannelId(3), Some(ChannelId(3)), b"payload"));
        assert_ne!(base, Checksum::new(b"secret", PeerId(1), PeerId(2), ChannelId(3), None, b"payloaD"));
    }
}
