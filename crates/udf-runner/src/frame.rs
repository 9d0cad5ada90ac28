use crate::Framing;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum size of a frame body, in either direction.
pub const MAX_FRAME_BYTES: usize = 1 << 26;

// Byte length of a sequence number.
const SEQ_LEN: usize = 8;

/// Frame is a decoded result frame of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Sequence number of the call this frame answers, under sequenced framing.
    pub seq: Option<u64>,
    pub body: Bytes,
}

/// Append a frame holding `payload` to `buf`.
///
/// Every frame is prefixed with a fixed four-byte little-endian length.
/// Under sequenced framing the body begins with `seq` as eight little-endian bytes.
pub fn encode_frame(
    framing: Framing,
    seq: u64,
    payload: &[u8],
    buf: &mut BytesMut,
) -> anyhow::Result<()> {
    let len = match framing {
        Framing::Ordered => payload.len(),
        Framing::Sequenced => SEQ_LEN + payload.len(),
    };
    anyhow::ensure!(
        len <= MAX_FRAME_BYTES,
        "call of {} bytes exceeds the maximum frame size of {MAX_FRAME_BYTES} bytes",
        payload.len(),
    );

    buf.reserve(4 + len);
    buf.put_u32_le(len as u32);
    if let Framing::Sequenced = framing {
        buf.put_u64_le(seq);
    }
    buf.extend_from_slice(payload);

    Ok(())
}

/// FrameDecoder accumulates worker output and splits it into Frames.
pub struct FrameDecoder {
    framing: Framing,
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: BytesMut::new(),
        }
    }

    /// Buffer into which worker output is read.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        if self.buf.capacity() == self.buf.len() {
            self.buf.reserve(32 * 1024);
        }
        &mut self.buf
    }

    /// Split the next complete Frame from the buffer, if there is one.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = (&self.buf[..4]).get_u32_le() as usize;

        anyhow::ensure!(
            len <= MAX_FRAME_BYTES,
            "function worker wrote a frame of {len} bytes, which exceeds the maximum of {MAX_FRAME_BYTES} bytes",
        );
        if self.buf.len() < 4 + len {
            self.buf.reserve(4 + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(4);
        let mut body = self.buf.split_to(len).freeze();

        let seq = match self.framing {
            Framing::Ordered => None,
            Framing::Sequenced => {
                anyhow::ensure!(
                    body.len() >= SEQ_LEN,
                    "function worker wrote a sequenced frame of {len} bytes, which cannot hold a sequence number",
                );
                Some(body.get_u64_le())
            }
        };

        Ok(Some(Frame { seq, body }))
    }

    /// Check that no partial frame remains, once worker output has closed.
    pub fn finish(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.buf.is_empty(),
            "function worker wrote a partial frame of {} bytes and then closed its output",
            self.buf.len(),
        );
        Ok(())
    }
}
