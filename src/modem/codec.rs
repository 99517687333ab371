//! AT command line codec.
//!
//! Modems answer with CR/LF terminated lines, except for the `> ` prompt
//! that asks for SMS text after `AT+CMGS`, which has no terminator.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Longest line accepted before the stream is considered garbage.
const MAX_LINE: usize = 4096;

/// Ctrl-Z, terminates SMS text.
const SUBMIT: u8 = 0x1a;

/// Frame received from the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtFrame {
    /// One response line without terminator
    Line(String),
    /// Text input prompt
    Prompt,
}

/// Data sent to the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtOut {
    /// Command line, terminated with CR
    Command(String),
    /// SMS text, terminated with Ctrl-Z
    Text(String),
}

#[derive(Debug, Default)]
pub struct AtCodec;

impl AtCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for AtCodec {
    type Item = AtFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<AtFrame>, io::Error> {
        let blank = src.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
        src.advance(blank);

        if src.is_empty() {
            return Ok(None);
        }

        // The prompt is the only thing the modem sends until text arrives.
        if src[0] == b'>' && src[1..].iter().all(|b| *b == b' ') {
            src.clear();
            return Ok(Some(AtFrame::Prompt));
        }

        match src.iter().position(|b| *b == b'\r' || *b == b'\n') {
            Some(end) => {
                let line = src.split_to(end);
                let text = String::from_utf8_lossy(&line).trim().to_string();
                Ok(Some(AtFrame::Line(text)))
            }
            None if src.len() > MAX_LINE => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "modem line exceeds maximum length",
            )),
            None => Ok(None),
        }
    }
}

impl Encoder<AtOut> for AtCodec {
    type Error = io::Error;

    fn encode(&mut self, item: AtOut, dst: &mut BytesMut) -> Result<(), io::Error> {
        match item {
            AtOut::Command(command) => {
                dst.reserve(command.len() + 1);
                dst.put_slice(command.as_bytes());
                dst.put_u8(b'\r');
            }
            AtOut::Text(text) => {
                dst.reserve(text.len() + 1);
                dst.put_slice(text.as_bytes());
                dst.put_u8(SUBMIT);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<AtFrame> {
        let mut codec = AtCodec::new();
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_lines() {
        let frames = decode_all(b"\r\n+CSQ: 17,99\r\n\r\nOK\r\n");
        assert_eq!(
            frames,
            vec![
                AtFrame::Line("+CSQ: 17,99".into()),
                AtFrame::Line("OK".into()),
            ]
        );
    }

    #[test]
    fn test_decode_prompt() {
        assert_eq!(decode_all(b"\r\n> "), vec![AtFrame::Prompt]);
        assert_eq!(decode_all(b">"), vec![AtFrame::Prompt]);
    }

    #[test]
    fn test_line_starting_with_angle_bracket() {
        assert_eq!(decode_all(b"> quoted text\r\n"), vec![AtFrame::Line("> quoted text".into())]);
    }

    #[test]
    fn test_partial_line_waits() {
        let mut codec = AtCodec::new();
        let mut buf = BytesMut::from(&b"+CREG: 0,"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"1\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(AtFrame::Line("+CREG: 0,1".into())));
    }

    #[test]
    fn test_overlong_line_rejected() {
        let mut codec = AtCodec::new();
        let mut buf = BytesMut::from(vec![b'A'; MAX_LINE + 1].as_slice());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encode() {
        let mut codec = AtCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(AtOut::Command("AT+CSQ".into()), &mut buf).unwrap();
        codec.encode(AtOut::Text("hi".into()), &mut buf).unwrap();
        assert_eq!(&buf[..], b"AT+CSQ\rhi\x1a");
    }
}
