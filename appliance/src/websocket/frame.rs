use tokio::io::{AsyncRead, AsyncReadExt};

use super::WsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;
const MAX_CONTROL_PAYLOAD: usize = 125;

pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (index, byte) in data.iter_mut().enumerate() {
        *byte ^= key[index % 4];
    }
}

/// Client frames carry a mask key; server frames are sent with `None`.
pub fn encode(fin: bool, opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(if fin { FIN_BIT } else { 0 } | opcode.bits());

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let length = payload.len();
    if length < LEN_16 as usize {
        out.push(mask_bit | length as u8);
    } else if length <= u16::MAX as usize {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64);
        out.extend_from_slice(&(length as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, WsError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    if header[0] & RSV_BITS != 0 {
        return Err(WsError::Malformed("reserved bits set"));
    }
    let fin = header[0] & FIN_BIT != 0;
    let opcode = OpCode::try_from(header[0] & 0x0F)?;
    let masked = header[1] & MASK_BIT != 0;

    let length = match header[1] & 0x7F {
        LEN_16 => {
            let mut raw = [0u8; 2];
            reader.read_exact(&mut raw).await?;
            u16::from_be_bytes(raw) as u64
        }
        LEN_64 => {
            let mut raw = [0u8; 8];
            reader.read_exact(&mut raw).await?;
            let length = u64::from_be_bytes(raw);
            if length >> 63 != 0 {
                return Err(WsError::Malformed("64-bit length has high bit set"));
            }
            length
        }
        short => short as u64,
    };

    if opcode.is_control() && (!fin || length > MAX_CONTROL_PAYLOAD as u64) {
        return Err(WsError::Malformed("fragmented or oversized control frame"));
    }
    if length > max_payload as u64 {
        return Err(WsError::TooLarge(length));
    }

    let key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<Frame, WsError> {
        let mut reader = bytes;
        read_frame(&mut reader, 1 << 20).await
    }

    #[tokio::test]
    async fn short_text_frame_layout() {
        let encoded = encode(true, OpCode::Text, b"Hello", None);
        assert_eq!(encoded, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

        let masked = encode(true, OpCode::Text, b"Hello", Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(
            masked,
            [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
        assert_eq!(decode(&masked).await.unwrap().payload, b"Hello");
    }

    #[tokio::test]
    async fn sixteen_bit_length_round_trip() {
        let payload = "x".repeat(200);
        let encoded = encode(true, OpCode::Text, payload.as_bytes(), Some([1, 2, 3, 4]));
        assert_eq!(encoded[1], MASK_BIT | LEN_16);
        assert_eq!(&encoded[2..4], &200u16.to_be_bytes());

        let frame = decode(&encoded).await.unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, payload.as_bytes());
    }

    #[tokio::test]
    async fn sixty_four_bit_length_round_trip() {
        let payload: String = (0..70_000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let encoded = encode(true, OpCode::Text, payload.as_bytes(), Some([9, 8, 7, 6]));
        assert_eq!(encoded[1], MASK_BIT | LEN_64);
        assert_eq!(&encoded[2..10], &70_000u64.to_be_bytes());

        let frame = decode(&encoded).await.unwrap();
        assert_eq!(frame.payload, payload.as_bytes());
    }

    #[tokio::test]
    async fn rejects_unknown_opcode_and_reserved_bits() {
        assert!(matches!(
            decode(&[0x83, 0x00]).await,
            Err(WsError::UnknownOpcode(0x3))
        ));
        assert!(matches!(
            decode(&[0xC1, 0x00]).await,
            Err(WsError::Malformed(_))
        ));
        assert!(matches!(
            decode(&[0x09, 0x00]).await,
            Err(WsError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn oversized_payload_is_reported_before_reading() {
        let encoded = encode(true, OpCode::Binary, &[0u8; 300], None);
        let mut reader = encoded.as_slice();
        assert!(matches!(
            read_frame(&mut reader, 256).await,
            Err(WsError::TooLarge(300))
        ));
    }
}
