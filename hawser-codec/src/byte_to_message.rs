use bytes::BytesMut;
use hawser::{ChannelHandler, HandlerContext, InboundHandler, Message, TransportError};
use log::warn;

/// Splits an accumulated byte stream into frames.
pub trait FrameDecoder: Send + 'static {
    /// Extracts at most one frame from the front of `buf`, consuming the
    /// bytes it used. `Ok(None)` means more bytes are needed.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, TransportError>;
}

/// An inbound handler that accumulates [`hawser_buffer::ByteBuf`] chunks
/// and emits the frames a [`FrameDecoder`] finds in them.
///
/// Incoming buffers are copied into the accumulation cursor and released
/// immediately, so the decoder owns every byte it sits on. A decode error
/// drops the accumulated bytes and funnels into `exception_caught`.
pub struct ByteToMessageDecoder {
    decoder: Box<dyn FrameDecoder>,
    acc: BytesMut,
}

impl ByteToMessageDecoder {
    /// Wraps `decoder` with an empty accumulation buffer.
    pub fn new(decoder: Box<dyn FrameDecoder>) -> ByteToMessageDecoder {
        ByteToMessageDecoder {
            decoder,
            acc: BytesMut::new(),
        }
    }
}

impl ChannelHandler for ByteToMessageDecoder {}

impl InboundHandler for ByteToMessageDecoder {
    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) {
        let buf = match msg.downcast::<hawser_buffer::ByteBuf>() {
            Ok(buf) => *buf,
            // Not ours; upstream already produced typed messages.
            Err(other) => return ctx.fire_channel_read(other),
        };
        match buf.readable() {
            Ok(readable) => self.acc.extend_from_slice(readable),
            Err(err) => {
                warn!("unreadable inbound buffer: {}", err);
            }
        }
        if let Err(err) = buf.release() {
            warn!("failed to release a decoded buffer: {}", err);
        }
        loop {
            match self.decoder.decode(&mut self.acc) {
                Ok(Some(frame)) => ctx.fire_channel_read(Box::new(frame)),
                Ok(None) => break,
                Err(err) => {
                    self.acc.clear();
                    ctx.fire_exception_caught(err.into_cause());
                    break;
                }
            }
        }
    }
}

/// Frames terminated by `\n`, with an optional `\r` stripped.
pub struct LineFramer {
    max_length: usize,
    strip_delimiter: bool,
}

impl LineFramer {
    /// Frames of at most `max_length` bytes (delimiter excluded). With
    /// `strip_delimiter`, emitted frames carry neither `\r` nor `\n`.
    pub fn new(max_length: usize, strip_delimiter: bool) -> LineFramer {
        LineFramer {
            max_length,
            strip_delimiter,
        }
    }
}

impl FrameDecoder for LineFramer {
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, TransportError> {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > self.max_length {
                return Err(TransportError::Decoder(format!(
                    "line longer than {} bytes",
                    self.max_length
                )));
            }
            return Ok(None);
        };
        let line_len = if pos > 0 && buf[pos - 1] == b'\r' {
            pos - 1
        } else {
            pos
        };
        if line_len > self.max_length {
            let _ = buf.split_to(pos + 1);
            return Err(TransportError::Decoder(format!(
                "line longer than {} bytes",
                self.max_length
            )));
        }
        let mut frame = buf.split_to(pos + 1);
        if self.strip_delimiter {
            frame.truncate(line_len);
        }
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_on_newline_and_strip_cr() {
        let mut framer = LineFramer::new(64, true);
        let mut buf = BytesMut::from(&b"one\r\ntwo\nthr"[..]);
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "one");
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "two");
        assert_eq!(framer.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"ee\n");
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "three");
    }

    #[test]
    fn delimiter_kept_when_asked() {
        let mut framer = LineFramer::new(64, false);
        let mut buf = BytesMut::from(&b"keep\n"[..]);
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "keep\n");
    }

    #[test]
    fn oversized_lines_are_a_decode_error() {
        let mut framer = LineFramer::new(4, true);
        let mut buf = BytesMut::from(&b"toolong\nok\n"[..]);
        assert!(matches!(
            framer.decode(&mut buf),
            Err(TransportError::Decoder(_))
        ));
        // The offending line was consumed; decoding can resume.
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "ok");
    }

    #[test]
    fn unterminated_oversize_is_rejected_early() {
        let mut framer = LineFramer::new(4, true);
        let mut buf = BytesMut::from(&b"waytoolong"[..]);
        assert!(framer.decode(&mut buf).is_err());
    }
}
