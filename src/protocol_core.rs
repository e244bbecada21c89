//! Byte-level codec shared by the server session and the client
//!
//! Decoding is structural only: the codec knows frame shapes, not what a
//! filename or status means. All readers are generic over `AsyncRead` so the
//! same functions run against a `TcpStream`, a `DuplexStream`, or a `&[u8]`.

use std::borrow::Cow;
use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{opcode, status, ACK, MAX_MESSAGE_LEN, MAX_TARGET_LEN, SIZE_HEADER_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get,
    Put,
    Delete,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            opcode::GET => Some(Opcode::Get),
            opcode::PUT => Some(Opcode::Put),
            opcode::DELETE => Some(Opcode::Delete),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::Get => opcode::GET,
            Opcode::Put => opcode::PUT,
            Opcode::Delete => opcode::DELETE,
        }
    }

    /// Parse the method word typed at the client prompt (case-insensitive)
    pub fn from_method(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Opcode::Get),
            "PUT" => Some(Opcode::Put),
            "DELETE" => Some(Opcode::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Opcode::Get => "GET",
            Opcode::Put => "PUT",
            Opcode::Delete => "DELETE",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub message: Vec<u8>,
}

impl Response {
    pub fn new(status: u8, message: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(status::OK, "OK")
    }

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }

    pub fn message_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.message)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.status, self.message_lossy())
    }
}

/// What the client finds at the head of a GET reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// An 8-byte size header; that many payload bytes follow
    Payload(u64),
    /// A response frame in place of a payload (error, or final status)
    Status(Response),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The peer closed the stream before the first byte of a frame
    #[error("peer closed the connection")]
    Eof,
    #[error("frame truncated")]
    Truncated,
    #[error("malformed opcode: {0}")]
    MalformedOpcode(u8),
    #[error("response frame declares zero size")]
    EmptyResponse,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("response message too long: {0} bytes (max: {max})", max = MAX_MESSAGE_LEN)]
    MessageTooLong(usize),
    #[error("request target too long: {0} bytes (max: {max})", max = MAX_TARGET_LEN)]
    TargetTooLong(usize),
}

/// Build a request frame: `u16 len | u8 opcode | target`
pub fn encode_request(op: Opcode, target: &str) -> Result<Vec<u8>, EncodeError> {
    let bytes = target.as_bytes();
    if bytes.len() > MAX_TARGET_LEN {
        return Err(EncodeError::TargetTooLong(bytes.len()));
    }
    let mut buf = Vec::with_capacity(3 + bytes.len());
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.push(op.as_byte());
    buf.extend_from_slice(bytes);
    Ok(buf)
}

/// Build a response frame: `u16 size | u8 status | message`, size = 1 + len(message)
pub fn encode_response(status: u8, message: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if message.len() > MAX_MESSAGE_LEN {
        return Err(EncodeError::MessageTooLong(message.len()));
    }
    let size = (1 + message.len()) as u16;
    let mut buf = Vec::with_capacity(3 + message.len());
    buf.extend_from_slice(&size.to_be_bytes());
    buf.push(status);
    buf.extend_from_slice(message);
    Ok(buf)
}

/// Length prefix for a raw or compressed payload
pub fn encode_size_header(n: u64) -> [u8; SIZE_HEADER_LEN] {
    n.to_be_bytes()
}

async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), DecodeError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DecodeError::Truncated),
        Err(e) => Err(e.into()),
    }
}

// Zero bytes before the first one is a clean close; anything short after that is truncation.
async fn fill_frame_start<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), DecodeError>
where
    R: AsyncRead + Unpin,
{
    if buf.is_empty() {
        return Ok(());
    }
    if reader.read(&mut buf[..1]).await? == 0 {
        return Err(DecodeError::Eof);
    }
    fill(reader, &mut buf[1..]).await
}

pub async fn decode_request<R>(reader: &mut R) -> Result<Request, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 3];
    fill_frame_start(reader, &mut head).await?;
    let len = u16::from_be_bytes([head[0], head[1]]) as usize;
    let opcode = Opcode::from_byte(head[2]).ok_or(DecodeError::MalformedOpcode(head[2]))?;
    let mut target = vec![0u8; len];
    fill(reader, &mut target).await?;
    Ok(Request {
        opcode,
        target: String::from_utf8_lossy(&target).into_owned(),
    })
}

async fn decode_response_body<R>(reader: &mut R, size: u16) -> Result<Response, DecodeError>
where
    R: AsyncRead + Unpin,
{
    if size == 0 {
        return Err(DecodeError::EmptyResponse);
    }
    let mut body = vec![0u8; size as usize];
    fill(reader, &mut body).await?;
    let status = body.remove(0);
    Ok(Response {
        status,
        message: body,
    })
}

pub async fn decode_response<R>(reader: &mut R) -> Result<Response, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut size = [0u8; 2];
    fill_frame_start(reader, &mut size).await?;
    decode_response_body(reader, u16::from_be_bytes(size)).await
}

pub async fn read_size_header<R>(reader: &mut R) -> Result<u64, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; SIZE_HEADER_LEN];
    fill_frame_start(reader, &mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

/// Read either a size header or a response frame.
///
/// A size header for any payload below 2^48 bytes starts with `00 00`, while a
/// response frame's size field is never zero, so two bytes decide.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    fill_frame_start(reader, &mut head).await?;
    if head == [0, 0] {
        let mut rest = [0u8; SIZE_HEADER_LEN - 2];
        fill(reader, &mut rest).await?;
        let mut full = [0u8; SIZE_HEADER_LEN];
        full[2..].copy_from_slice(&rest);
        return Ok(Reply::Payload(u64::from_be_bytes(full)));
    }
    let resp = decode_response_body(reader, u16::from_be_bytes(head)).await?;
    Ok(Reply::Status(resp))
}

/// Read one 2-byte ACK frame. `Ok(false)` means two bytes arrived but were not an ACK.
pub async fn read_ack<R>(reader: &mut R) -> Result<bool, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    fill_frame_start(reader, &mut buf).await?;
    Ok(buf[0] == ACK[0])
}

pub async fn write_response<W>(writer: &mut W, resp: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_response(resp.status, &resp.message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<Request, DecodeError> {
        let mut rd = bytes;
        decode_request(&mut rd).await
    }

    #[tokio::test]
    async fn request_round_trip_all_opcodes() {
        for op in [Opcode::Get, Opcode::Put, Opcode::Delete] {
            for name in ["", "a.txt", "dir/nested/file.bin"] {
                let frame = encode_request(op, name).unwrap();
                let req = decode(&frame).await.unwrap();
                assert_eq!(req.opcode, op);
                assert_eq!(req.target, name);
            }
        }
    }

    #[tokio::test]
    async fn request_round_trip_max_target() {
        let name = "x".repeat(MAX_TARGET_LEN);
        let frame = encode_request(Opcode::Get, &name).unwrap();
        assert_eq!(&frame[..2], &[0xFF, 0xFF]);
        assert_eq!(decode(&frame).await.unwrap().target, name);
        assert_eq!(
            encode_request(Opcode::Get, &"x".repeat(MAX_TARGET_LEN + 1)),
            Err(EncodeError::TargetTooLong(MAX_TARGET_LEN + 1))
        );
    }

    #[tokio::test]
    async fn decode_known_get_bytes() {
        let req = decode(b"\x00\x05\x01a.txt").await.unwrap();
        assert_eq!(
            req,
            Request {
                opcode: Opcode::Get,
                target: "a.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn malformed_opcode_is_rejected() {
        match decode(b"\x00\x01\x04x").await {
            Err(DecodeError::MalformedOpcode(4)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            decode(b"\x00\x01\x00x").await,
            Err(DecodeError::MalformedOpcode(0))
        ));
    }

    #[tokio::test]
    async fn non_utf8_target_decodes_lossily() {
        let mut rd: &[u8] = b"\x00\x02\x01\xff\xfe\x00\x01\x03x";
        let req = decode_request(&mut rd).await.unwrap();
        assert_eq!(req.opcode, Opcode::Get);
        assert_eq!(req.target, "\u{FFFD}\u{FFFD}");

        // The following frame is still aligned
        let req = decode_request(&mut rd).await.unwrap();
        assert_eq!(req.opcode, Opcode::Delete);
        assert_eq!(req.target, "x");
    }

    #[tokio::test]
    async fn clean_close_versus_truncation() {
        assert!(matches!(decode(b"").await, Err(DecodeError::Eof)));
        assert!(matches!(decode(b"\x00").await, Err(DecodeError::Truncated)));
        assert!(matches!(decode(b"\x00\x05\x01a.t").await, Err(DecodeError::Truncated)));
    }

    #[test]
    fn not_found_response_bytes() {
        let frame = encode_response(status::NOT_FOUND, b"file not found").unwrap();
        let mut expected = vec![0x00, 0x0F, 0x41];
        expected.extend_from_slice(b"file not found");
        assert_eq!(frame, expected);
    }

    #[tokio::test]
    async fn response_round_trip_at_limit() {
        for len in [0usize, 1, 2, MAX_MESSAGE_LEN] {
            let msg = vec![b'm'; len];
            let frame = encode_response(status::OK, &msg).unwrap();
            let mut rd = frame.as_slice();
            let resp = decode_response(&mut rd).await.unwrap();
            assert_eq!(resp.status, status::OK);
            assert_eq!(resp.message, msg);
        }
    }

    #[test]
    fn oversized_response_fails_to_encode() {
        assert_eq!(
            encode_response(status::OK, &vec![0u8; MAX_MESSAGE_LEN + 1]),
            Err(EncodeError::MessageTooLong(MAX_MESSAGE_LEN + 1))
        );
        assert!(encode_response(status::OK, &vec![0u8; 70_000]).is_err());
    }

    #[tokio::test]
    async fn zero_size_response_is_a_framing_error() {
        let mut rd: &[u8] = b"\x00\x00";
        assert!(matches!(
            decode_response(&mut rd).await,
            Err(DecodeError::EmptyResponse)
        ));
    }

    #[test]
    fn size_header_is_big_endian() {
        assert_eq!(encode_size_header(0), [0u8; 8]);
        assert_eq!(encode_size_header(0x0102), [0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn reply_distinguishes_payload_from_status() {
        let header = encode_size_header(1234);
        let mut rd = &header[..];
        assert_eq!(read_reply(&mut rd).await.unwrap(), Reply::Payload(1234));

        let frame = encode_response(status::NOT_FOUND, b"file not found").unwrap();
        let mut rd = frame.as_slice();
        match read_reply(&mut rd).await.unwrap() {
            Reply::Status(resp) => {
                assert_eq!(resp.status, status::NOT_FOUND);
                assert_eq!(resp.message_lossy(), "file not found");
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ack_frames() {
        let mut rd: &[u8] = &[0x07, 0x00, 0x01, 0x00, 0x07, 0x09];
        assert!(read_ack(&mut rd).await.unwrap());
        assert!(!read_ack(&mut rd).await.unwrap());
        assert!(read_ack(&mut rd).await.unwrap());
        assert!(matches!(read_ack(&mut rd).await, Err(DecodeError::Eof)));
    }

    #[tokio::test]
    async fn write_response_frames_message() {
        let mut out = Vec::new();
        write_response(&mut out, &Response::ok()).await.unwrap();
        assert_eq!(out, vec![0x00, 0x03, status::OK, b'O', b'K']);
    }

    #[test]
    fn method_words() {
        assert_eq!(Opcode::from_method("get"), Some(Opcode::Get));
        assert_eq!(Opcode::from_method("DELETE"), Some(Opcode::Delete));
        assert_eq!(Opcode::from_method("LIST"), None);
        assert_eq!(Opcode::Put.to_string(), "PUT");
    }
}
