//! Framed messages between backup clients, sessions and the champion chooser.
//!
//! A frame is a command byte, a big-endian `u32` payload length and a
//! postcard-encoded payload. Each direction has its own closed message enum,
//! decoded once at the transport boundary.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::block::Signature;
use crate::dpth::Location;
use crate::error::{Error, Result};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// A block signature, or the location found for one.
    Sig = b'S',
    WrapUp = b'W',
    Manifest = b'M',
    AttribsSigs = b'A',
    ClientSig = b's',
    SigsEnd = b'E',
    Data = b'D',
    DataReq = b'Q',
    Forget = b'F',
    BackupEnd = b'Z',
    Error = b'X',
}

impl TryFrom<u8> for Cmd {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            b'S' => Self::Sig,
            b'W' => Self::WrapUp,
            b'M' => Self::Manifest,
            b'A' => Self::AttribsSigs,
            b's' => Self::ClientSig,
            b'E' => Self::SigsEnd,
            b'D' => Self::Data,
            b'Q' => Self::DataReq,
            b'F' => Self::Forget,
            b'Z' => Self::BackupEnd,
            b'X' => Self::Error,
            other => {
                return Err(Error::protocol(format!(
                    "unknown command byte {other:#04x}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Cmd,
    pub payload: Vec<u8>,
}

impl Frame {
    fn new(cmd: Cmd, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            cmd,
            payload: postcard::to_stdvec(payload)?,
        })
    }

    fn empty(cmd: Cmd) -> Self {
        Self {
            cmd,
            payload: Vec::new(),
        }
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    fn unexpected(&self, family: &str) -> Error {
        Error::protocol(format!("unexpected {:?} frame in {family} stream", self.cmd))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let cmd = Cmd::try_from(src[0])?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "{cmd:?} frame of {len} bytes exceeds the limit"
            )));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).to_vec();
        Ok(Some(Frame { cmd, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "{:?} frame of {} bytes exceeds the limit",
                frame.cmd,
                frame.payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.cmd as u8);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Converts between a message family and frames.
pub trait Message: Sized {
    fn to_frame(&self) -> Result<Frame>;
    fn from_frame(frame: Frame) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedSig {
    pub index: u64,
    pub sig: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundSig {
    pub index: u64,
    pub location: Location,
}

/// Session to champion chooser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChampRequest {
    Sig(IndexedSig),
    /// Everything up to `index` has been sent; run a pass over it.
    WrapUp(u64),
    /// A finished backup to index as a new candidate.
    Manifest(String),
}

/// Champion chooser to session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChampReply {
    /// The block at `index` is already stored.
    Sig(FoundSig),
    /// Every block up to `index` not answered with `Sig` is new.
    WrapUp(u64),
    /// The candidate has been indexed.
    Manifest(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStart {
    pub file_index: u64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Backup client to session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    AttribsSigs(FileStart),
    Sig(Signature),
    SigsEnd,
    Data(BlockData),
    BackupEnd,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub blocks: u64,
    pub got: u64,
    pub not_got: u64,
    pub bytes_written: u64,
}

/// Session to backup client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    DataReq(u64),
    /// No block up to and including `index` will be requested.
    Forget(u64),
    BackupEnd(BackupSummary),
    Error(String),
}

impl Message for ChampRequest {
    fn to_frame(&self) -> Result<Frame> {
        match self {
            Self::Sig(sig) => Frame::new(Cmd::Sig, sig),
            Self::WrapUp(index) => Frame::new(Cmd::WrapUp, index),
            Self::Manifest(path) => Frame::new(Cmd::Manifest, path),
        }
    }

    fn from_frame(frame: Frame) -> Result<Self> {
        Ok(match frame.cmd {
            Cmd::Sig => Self::Sig(frame.decode()?),
            Cmd::WrapUp => Self::WrapUp(frame.decode()?),
            Cmd::Manifest => Self::Manifest(frame.decode()?),
            _ => return Err(frame.unexpected("champ request")),
        })
    }
}

impl Message for ChampReply {
    fn to_frame(&self) -> Result<Frame> {
        match self {
            Self::Sig(found) => Frame::new(Cmd::Sig, found),
            Self::WrapUp(index) => Frame::new(Cmd::WrapUp, index),
            Self::Manifest(path) => Frame::new(Cmd::Manifest, path),
            Self::Error(reason) => Frame::new(Cmd::Error, reason),
        }
    }

    fn from_frame(frame: Frame) -> Result<Self> {
        Ok(match frame.cmd {
            Cmd::Sig => Self::Sig(frame.decode()?),
            Cmd::WrapUp => Self::WrapUp(frame.decode()?),
            Cmd::Manifest => Self::Manifest(frame.decode()?),
            Cmd::Error => Self::Error(frame.decode()?),
            _ => return Err(frame.unexpected("champ reply")),
        })
    }
}

impl Message for ClientMessage {
    fn to_frame(&self) -> Result<Frame> {
        match self {
            Self::AttribsSigs(file) => Frame::new(Cmd::AttribsSigs, file),
            Self::Sig(sig) => Frame::new(Cmd::ClientSig, sig),
            Self::SigsEnd => Ok(Frame::empty(Cmd::SigsEnd)),
            Self::Data(data) => Frame::new(Cmd::Data, data),
            Self::BackupEnd => Ok(Frame::empty(Cmd::BackupEnd)),
        }
    }

    fn from_frame(frame: Frame) -> Result<Self> {
        Ok(match frame.cmd {
            Cmd::AttribsSigs => Self::AttribsSigs(frame.decode()?),
            Cmd::ClientSig => Self::Sig(frame.decode()?),
            Cmd::SigsEnd => Self::SigsEnd,
            Cmd::Data => Self::Data(frame.decode()?),
            Cmd::BackupEnd => Self::BackupEnd,
            _ => return Err(frame.unexpected("client")),
        })
    }
}

impl Message for ServerMessage {
    fn to_frame(&self) -> Result<Frame> {
        match self {
            Self::DataReq(index) => Frame::new(Cmd::DataReq, index),
            Self::Forget(index) => Frame::new(Cmd::Forget, index),
            Self::BackupEnd(summary) => Frame::new(Cmd::BackupEnd, summary),
            Self::Error(reason) => Frame::new(Cmd::Error, reason),
        }
    }

    fn from_frame(frame: Frame) -> Result<Self> {
        Ok(match frame.cmd {
            Cmd::DataReq => Self::DataReq(frame.decode()?),
            Cmd::Forget => Self::Forget(frame.decode()?),
            Cmd::BackupEnd => Self::BackupEnd(frame.decode()?),
            Cmd::Error => Self::Error(frame.decode()?),
            _ => return Err(frame.unexpected("server")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn frame_layout() {
        let frame = ServerMessage::DataReq(300).to_frame().unwrap();
        let buf = encode(frame);
        // postcard encodes 300 as the varint ac 02
        assert_eq!(&buf[..], b"Q\0\0\0\x02\xac\x02");
    }

    #[test]
    fn decoder_waits_for_whole_frames() {
        let sig = Signature::of(0xF00, b"data");
        let frame = ClientMessage::Sig(sig).to_frame().unwrap();
        let full = encode(frame.clone());

        let mut partial = BytesMut::from(&full[..3]);
        assert_eq!(FrameCodec.decode(&mut partial).unwrap(), None);
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(FrameCodec.decode(&mut partial).unwrap(), None);

        let mut two = full.clone();
        two.extend_from_slice(&full);
        let first = FrameCodec.decode(&mut two).unwrap().unwrap();
        assert_eq!(ClientMessage::from_frame(first).unwrap(), ClientMessage::Sig(sig));
        assert_eq!(FrameCodec.decode(&mut two).unwrap(), Some(frame));
        assert!(two.is_empty());
    }

    #[test]
    fn rejects_unknown_and_oversized_frames() {
        let mut unknown = BytesMut::from(&b"?\0\0\0\0"[..]);
        assert!(matches!(
            FrameCodec.decode(&mut unknown),
            Err(Error::Protocol(_))
        ));

        let mut huge = BytesMut::from(&b"D\xff\xff\xff\xff"[..]);
        assert!(matches!(FrameCodec.decode(&mut huge), Err(Error::Protocol(_))));
    }

    #[test]
    fn messages_stay_in_their_family() {
        let frame = ServerMessage::Forget(7).to_frame().unwrap();
        assert!(ClientMessage::from_frame(frame.clone()).is_err());
        assert_eq!(
            ServerMessage::from_frame(frame).unwrap(),
            ServerMessage::Forget(7)
        );

        // `Sig` frames carry different payloads in each direction
        let request = ChampRequest::Sig(IndexedSig {
            index: 1,
            sig: Signature::of(1, b"x"),
        });
        let frame = request.to_frame().unwrap();
        assert_eq!(ChampRequest::from_frame(frame).unwrap(), request);

        let reply = ChampReply::Sig(FoundSig {
            index: 1,
            location: Location::new(1, 2, 3),
        });
        let frame = reply.to_frame().unwrap();
        assert_eq!(ChampReply::from_frame(frame).unwrap(), reply);
    }

    #[test]
    fn block_data_and_summaries() {
        let data = ClientMessage::Data(BlockData {
            index: 9,
            data: vec![1, 2, 3],
        });
        let frame = data.to_frame().unwrap();
        assert_eq!(frame.cmd, Cmd::Data);
        assert_eq!(ClientMessage::from_frame(frame).unwrap(), data);

        let end = ServerMessage::BackupEnd(BackupSummary {
            blocks: 3,
            got: 1,
            not_got: 2,
            bytes_written: 10,
        });
        let frame = end.to_frame().unwrap();
        assert_eq!(ServerMessage::from_frame(frame).unwrap(), end);

        let frame = ClientMessage::BackupEnd.to_frame().unwrap();
        assert!(frame.payload.is_empty());
    }
}
