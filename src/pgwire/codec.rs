//! Encoding/decoding of messages in pgwire. See "[Frontend/Backend Protocol:
//! Message Formats][1]" in the PostgreSQL reference for the specification.
//!
//! Startup-category frames carry no type byte and are distinguished
//! positionally: the decoder starts in [`DecodeState::Startup`] and only
//! moves to typed-frame decoding once the startup message has been seen.
//! Bytes that arrive bundled behind an SSL request stay buffered and are
//! decoded on the next poll.
//!
//! [1]: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;
use std::io;

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BufMut, BytesMut};
use futures::{sink, SinkExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{GatewayError, Result};
use crate::pgwire::message::{
    BackendMessage, ErrorResponse, FrontendMessage, Target, VERSION_3_MAJOR, VERSION_SSL,
};

/// The single-byte reply to an SslRequest: no SSL, continue in cleartext.
pub const REJECT_ENCRYPTION: u8 = b'N';

/// A connection that manages the encoding and decoding of pgwire frames.
pub struct FramedConn<A> {
    conn_id: u32,
    inner: sink::Buffer<Framed<A, Codec>, BackendMessage>,
}

impl<A> FramedConn<A>
where
    A: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn_id: u32, inner: A) -> FramedConn<A> {
        FramedConn {
            conn_id,
            inner: Framed::new(inner, Codec::new()).buffer(32),
        }
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    /// Reads and decodes one frontend message from the client.
    ///
    /// Blocks until the client sends a complete message. If the client
    /// terminates the stream, returns `None`. Payload-level decode
    /// failures surface as [`GatewayError::Framing`] and leave the
    /// connection usable; frame-level failures surface as
    /// [`GatewayError::Protocol`].
    pub async fn recv(&mut self) -> Result<Option<FrontendMessage>> {
        match self.inner.try_next().await {
            Ok(message) => Ok(message),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                Err(GatewayError::framing(e.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(GatewayError::protocol(e.to_string()))
            }
            Err(e) => Err(GatewayError::Io(e)),
        }
    }

    /// Encodes and sends one backend message to the client.
    ///
    /// Note that the connection is not flushed after calling this method.
    /// You must call [`FramedConn::flush`] explicitly. Returns an error if
    /// the underlying connection is broken.
    pub async fn send<M>(&mut self, message: M) -> Result<()>
    where
        M: Into<BackendMessage>,
    {
        let message = message.into();
        Ok(self.inner.send(message).await?)
    }

    /// Encodes and sends the backend messages in the `messages` iterator to
    /// the client. As with [`FramedConn::send`], the connection is not
    /// flushed afterwards.
    pub async fn send_all(
        &mut self,
        messages: impl IntoIterator<Item = BackendMessage>,
    ) -> Result<()> {
        // we intentionally don't use `self.inner.send_all` here to avoid
        // flushing the sink unnecessarily.
        for m in messages {
            self.send(m).await?;
        }
        Ok(())
    }

    /// Flushes all outstanding messages.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes the single-byte negative reply to an SslRequest directly to
    /// the transport. Any bytes the client sent bundled behind the request
    /// stay buffered in the decoder.
    pub async fn reject_encryption(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.flush().await?;
        let stream = self.inner.get_mut().get_mut();
        stream.write_all(&[REJECT_ENCRYPTION]).await?;
        stream.flush().await?;
        Ok(())
    }
}

fn parse_frame_len(src: &[u8]) -> std::result::Result<usize, io::Error> {
    let n = NetworkEndian::read_u32(src) as usize;
    if n < 4 {
        return Err(framing_err("invalid frame length"));
    }
    Ok(n - 4)
}

pub struct Codec {
    decode_state: DecodeState,
}

#[derive(Debug)]
enum DecodeState {
    /// Connection birth: expecting an SSL request or a startup message,
    /// neither of which carries a type byte.
    Startup,
    Head,
    Data(u8, usize),
}

impl Codec {
    pub fn new() -> Codec {
        Codec {
            decode_state: DecodeState::Startup,
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new()
    }
}

impl Decoder for Codec {
    type Item = FrontendMessage;
    type Error = io::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.decode_state {
                DecodeState::Startup => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let frame_len = NetworkEndian::read_i32(&src[0..4]);
                    // A valid startup-category frame holds at least the
                    // length and the protocol code. Reject short frames
                    // before touching any byte past their declared end.
                    if frame_len < 8 {
                        return Err(protocol_err(format!(
                            "startup frame too short: {frame_len}"
                        )));
                    }
                    if src.len() < 8 {
                        return Ok(None);
                    }
                    let code = NetworkEndian::read_i32(&src[4..8]);
                    if frame_len == 8 && code == VERSION_SSL {
                        src.advance(8);
                        return Ok(Some(FrontendMessage::SslRequest));
                    }
                    if code >> 16 == VERSION_3_MAJOR {
                        let frame_len = frame_len as usize;
                        if src.len() < frame_len {
                            src.reserve(frame_len - src.len());
                            return Ok(None);
                        }
                        let frame = src.split_to(frame_len);
                        let message = decode_startup(&frame[4..])?;
                        self.decode_state = DecodeState::Head;
                        return Ok(Some(message));
                    }
                    return Err(protocol_err(format!(
                        "unsupported startup protocol code: {code:#010x}"
                    )));
                }

                DecodeState::Head => {
                    if src.len() < 5 {
                        return Ok(None);
                    }
                    let msg_type = src[0];
                    let frame_len = parse_frame_len(&src[1..]);
                    // Consume the header bytes even when the declared
                    // length is bad; otherwise the same bytes would be
                    // re-decoded on the next poll.
                    src.advance(5);
                    let frame_len = frame_len?;
                    src.reserve(frame_len);
                    self.decode_state = DecodeState::Data(msg_type, frame_len);
                }

                DecodeState::Data(msg_type, frame_len) => {
                    if src.len() < frame_len {
                        return Ok(None);
                    }
                    let buf = src.split_to(frame_len).freeze();
                    let buf = Cursor::new(&buf);

                    let parsed = match msg_type {
                        // Simple query flow.
                        b'Q' => decode_query(buf),
                        // Extended query flow.
                        b'P' => decode_parse(buf),
                        b'B' => decode_bind(buf),
                        b'E' => decode_execute(buf),
                        b'D' => decode_describe(buf),
                        b'C' => decode_close(buf),
                        b'S' => Ok(FrontendMessage::Sync),
                        b'X' => Ok(FrontendMessage::Terminate),
                        // Authentication.
                        b'p' => decode_password(buf),
                        // Anything else is consumed and left to the state
                        // machine to log and ignore.
                        other => Ok(FrontendMessage::Unknown { tag: other }),
                    };
                    // The frame was fully consumed either way, so a payload
                    // that fails to decode leaves the stream intact.
                    let msg = parsed.unwrap_or_else(|e| FrontendMessage::Malformed {
                        tag: msg_type,
                        error: e.to_string(),
                    });
                    src.reserve(5);
                    self.decode_state = DecodeState::Head;
                    return Ok(Some(msg));
                }
            }
        }
    }
}

impl Encoder<BackendMessage> for Codec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: BackendMessage,
        dst: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        let byte = match &msg {
            BackendMessage::AuthenticationOk => b'R',
            BackendMessage::AuthenticationCleartextPassword => b'R',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::ReadyForQuery(_) => b'Z',
            BackendMessage::RowDescription(_) => b'T',
            BackendMessage::DataRow(_) => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::ErrorResponse(_) => b'E',
            BackendMessage::NoticeResponse(_) => b'N',
            BackendMessage::ParseComplete => b'1',
            BackendMessage::BindComplete => b'2',
            BackendMessage::CloseComplete => b'3',
        };
        dst.put_u8(byte);

        // Write message length placeholder. The true length is filled in
        // later.
        let base = dst.len();
        dst.put_u32(0);

        match msg {
            BackendMessage::AuthenticationOk => {
                dst.put_u32(0);
            }
            BackendMessage::AuthenticationCleartextPassword => {
                dst.put_u32(3);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                dst.put_i32(process_id);
                dst.put_i32(secret_key);
            }
            BackendMessage::ParameterStatus { name, value } => {
                dst.put_string(&name);
                dst.put_string(&value);
            }
            BackendMessage::ReadyForQuery(status) => {
                dst.put_u8(status.byte());
            }
            BackendMessage::RowDescription(fields) => {
                dst.put_length_i16(fields.len())?;
                for (i, field) in fields.iter().enumerate() {
                    dst.put_string(&field.name);
                    // table oid
                    dst.put_u32(0);
                    // column attribute number, starting at 1
                    dst.put_length_i16(i + 1)?;
                    dst.put_u32(field.type_oid);
                    dst.put_i16(field.type_size);
                    // type modifier
                    dst.put_i32(-1);
                    // format code: text
                    dst.put_i16(0);
                }
            }
            BackendMessage::DataRow(cols) => {
                dst.put_length_i16(cols.len())?;
                for col in cols {
                    match col {
                        None => dst.put_i32(-1),
                        Some(text) => {
                            dst.put_i32(i32::try_from(text.len()).map_err(|_| {
                                io::Error::new(
                                    io::ErrorKind::Other,
                                    "column value does not fit into an i32",
                                )
                            })?);
                            dst.put(text.as_bytes());
                        }
                    }
                }
            }
            BackendMessage::CommandComplete { tag } => {
                dst.put_string(&tag);
            }
            BackendMessage::EmptyQueryResponse => (),
            BackendMessage::ErrorResponse(err) | BackendMessage::NoticeResponse(err) => {
                let ErrorResponse {
                    severity,
                    code,
                    message,
                    detail,
                    hint,
                } = err;
                dst.put_u8(b'S');
                dst.put_string(severity.as_str());
                dst.put_u8(b'C');
                dst.put_string(code.code());
                dst.put_u8(b'M');
                dst.put_string(&message);
                if let Some(detail) = &detail {
                    dst.put_u8(b'D');
                    dst.put_string(detail);
                }
                if let Some(hint) = &hint {
                    dst.put_u8(b'H');
                    dst.put_string(hint);
                }
                dst.put_u8(b'\0');
            }
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete => (),
        }

        let len = dst.len() - base;

        // Overwrite length placeholder with true length.
        let len = i32::try_from(len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::Other,
                "length of encoded message does not fit into an i32",
            )
        })?;
        dst[base..base + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

trait Pgbuf: BufMut {
    fn put_string(&mut self, s: &str);
    fn put_length_i16(&mut self, len: usize) -> std::result::Result<(), io::Error>;
}

impl<B: BufMut> Pgbuf for B {
    fn put_string(&mut self, s: &str) {
        self.put(s.as_bytes());
        self.put_u8(b'\0');
    }

    fn put_length_i16(&mut self, len: usize) -> std::result::Result<(), io::Error> {
        let len = i16::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "length does not fit in an i16"))?;
        self.put_i16(len);
        Ok(())
    }
}

fn decode_startup(payload: &[u8]) -> std::result::Result<FrontendMessage, io::Error> {
    let mut buf = Cursor::new(payload);
    let version = buf.read_i32()?;
    let mut params = HashMap::new();
    while buf.peek_byte()? != 0 {
        let name = buf.read_cstr()?.to_owned();
        let value = buf.read_cstr()?.to_owned();
        params.insert(name, value);
    }
    Ok(FrontendMessage::Startup { version, params })
}

fn decode_query(mut buf: Cursor) -> std::result::Result<FrontendMessage, io::Error> {
    Ok(FrontendMessage::Query {
        sql: buf.read_cstr()?.to_string(),
    })
}

fn decode_parse(mut buf: Cursor) -> std::result::Result<FrontendMessage, io::Error> {
    let name = buf.read_cstr()?.to_string();
    let sql = buf.read_cstr()?.to_string();
    let n_types = buf.read_i16()?;
    let mut param_types = Vec::with_capacity(n_types.max(0) as usize);
    for _ in 0..n_types {
        param_types.push(buf.read_u32()?);
    }
    Ok(FrontendMessage::Parse {
        name,
        sql,
        param_types,
    })
}

fn decode_bind(mut buf: Cursor) -> std::result::Result<FrontendMessage, io::Error> {
    let portal = buf.read_cstr()?.to_string();
    let statement = buf.read_cstr()?.to_string();

    let n_formats = buf.read_i16()?;
    let mut param_formats = Vec::with_capacity(n_formats.max(0) as usize);
    for _ in 0..n_formats {
        param_formats.push(buf.read_i16()?);
    }

    let n_params = buf.read_i16()?;
    let mut params = Vec::with_capacity(n_params.max(0) as usize);
    for _ in 0..n_params {
        let len = buf.read_i32()?;
        if len == -1 {
            params.push(None);
        } else {
            params.push(Some(buf.read_bytes(len as usize)?.to_vec()));
        }
    }

    let n_result_formats = buf.read_i16()?;
    let mut result_formats = Vec::with_capacity(n_result_formats.max(0) as usize);
    for _ in 0..n_result_formats {
        result_formats.push(buf.read_i16()?);
    }

    Ok(FrontendMessage::Bind {
        portal,
        statement,
        param_formats,
        params,
        result_formats,
    })
}

fn decode_execute(mut buf: Cursor) -> std::result::Result<FrontendMessage, io::Error> {
    Ok(FrontendMessage::Execute {
        portal: buf.read_cstr()?.to_string(),
        max_rows: buf.read_i32()?,
    })
}

fn decode_describe(mut buf: Cursor) -> std::result::Result<FrontendMessage, io::Error> {
    let target = buf.read_target()?;
    Ok(FrontendMessage::Describe {
        target,
        name: buf.read_cstr()?.to_string(),
    })
}

fn decode_close(mut buf: Cursor) -> std::result::Result<FrontendMessage, io::Error> {
    let target = buf.read_target()?;
    Ok(FrontendMessage::Close {
        target,
        name: buf.read_cstr()?.to_string(),
    })
}

fn decode_password(mut buf: Cursor) -> std::result::Result<FrontendMessage, io::Error> {
    Ok(FrontendMessage::Password {
        password: buf.read_cstr()?.to_string(),
    })
}

/// Decodes data within pgwire messages.
///
/// The API provided is very similar to [`bytes::Buf`], but operations
/// return errors rather than panicking, so a malformed message from a
/// client cannot crash the gateway.
#[derive(Debug)]
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    /// Constructs a new `Cursor` from a byte slice. The cursor will begin
    /// decoding from the beginning of the slice.
    fn new(buf: &'a [u8]) -> Cursor {
        Cursor { buf }
    }

    /// Returns the next byte without advancing the cursor.
    fn peek_byte(&self) -> std::result::Result<u8, io::Error> {
        self.buf
            .first()
            .copied()
            .ok_or_else(|| framing_err("no byte to read"))
    }

    /// Returns the next byte, advancing the cursor by one byte.
    fn read_byte(&mut self) -> std::result::Result<u8, io::Error> {
        let byte = self.peek_byte()?;
        self.advance(1);
        Ok(byte)
    }

    fn read_target(&mut self) -> std::result::Result<Target, io::Error> {
        match self.read_byte()? {
            b'S' => Ok(Target::Statement),
            b'P' => Ok(Target::Portal),
            other => Err(framing_err(format!(
                "invalid describe/close target: {}",
                char::from(other)
            ))),
        }
    }

    /// Returns the next null-terminated string. The null character is not
    /// included in the returned string. The cursor is advanced past the
    /// null-terminated string.
    fn read_cstr(&mut self) -> std::result::Result<&'a str, io::Error> {
        if let Some(pos) = self.buf.iter().position(|b| *b == 0) {
            let val = std::str::from_utf8(&self.buf[..pos])
                .map_err(|e| framing_err(format!("non-UTF-8 string: {e}")))?;
            self.advance(pos + 1);
            Ok(val)
        } else {
            Err(framing_err("string has no terminator"))
        }
    }

    fn read_bytes(&mut self, n: usize) -> std::result::Result<&'a [u8], io::Error> {
        if self.buf.len() < n {
            return Err(framing_err("not enough buffer for bytes"));
        }
        let val = &self.buf[..n];
        self.advance(n);
        Ok(val)
    }

    /// Reads the next 16-bit signed integer, advancing the cursor by two
    /// bytes.
    fn read_i16(&mut self) -> std::result::Result<i16, io::Error> {
        if self.buf.len() < 2 {
            return Err(framing_err("not enough buffer for an Int16"));
        }
        let val = NetworkEndian::read_i16(self.buf);
        self.advance(2);
        Ok(val)
    }

    /// Reads the next 32-bit signed integer, advancing the cursor by four
    /// bytes.
    fn read_i32(&mut self) -> std::result::Result<i32, io::Error> {
        if self.buf.len() < 4 {
            return Err(framing_err("not enough buffer for an Int32"));
        }
        let val = NetworkEndian::read_i32(self.buf);
        self.advance(4);
        Ok(val)
    }

    /// Reads the next 32-bit unsigned integer, advancing the cursor by four
    /// bytes.
    fn read_u32(&mut self) -> std::result::Result<u32, io::Error> {
        if self.buf.len() < 4 {
            return Err(framing_err("not enough buffer for an Int32"));
        }
        let val = NetworkEndian::read_u32(self.buf);
        self.advance(4);
        Ok(val)
    }

    /// Advances the cursor by `n` bytes.
    fn advance(&mut self, n: usize) {
        self.buf = &self.buf[n..]
    }
}

/// A recoverable payload-level decode failure.
fn framing_err(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, source.into())
}

/// A frame-level failure the connection cannot recover from.
fn protocol_err(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, source.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgwire::message::{FieldDescription, Severity, SqlState, TransactionStatus};

    fn startup_payload(params: &[(&str, &str)]) -> Vec<u8> {
        let mut payload = vec![0x00, 0x03, 0x00, 0x00];
        for (k, v) in params {
            payload.extend_from_slice(k.as_bytes());
            payload.push(0);
            payload.extend_from_slice(v.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        payload
    }

    fn startup_frame(params: &[(&str, &str)]) -> Vec<u8> {
        let payload = startup_payload(params);
        let mut frame = ((payload.len() + 4) as i32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame
    }

    fn typed_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![tag];
        frame.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn decode_one(codec: &mut Codec, src: &mut BytesMut) -> Option<FrontendMessage> {
        codec.decode(src).expect("decode failed")
    }

    #[test]
    fn test_ssl_request_consumes_exactly_eight_bytes() {
        let mut codec = Codec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&8i32.to_be_bytes());
        src.extend_from_slice(&VERSION_SSL.to_be_bytes());
        src.extend_from_slice(b"leftover");

        let msg = decode_one(&mut codec, &mut src);
        assert_eq!(msg, Some(FrontendMessage::SslRequest));
        assert_eq!(&src[..], b"leftover");
    }

    #[test]
    fn test_startup_bundled_behind_ssl_request() {
        let mut codec = Codec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&8i32.to_be_bytes());
        src.extend_from_slice(&VERSION_SSL.to_be_bytes());
        src.extend_from_slice(&startup_frame(&[("user", "alice"), ("database", "db")]));

        assert_eq!(decode_one(&mut codec, &mut src), Some(FrontendMessage::SslRequest));
        match decode_one(&mut codec, &mut src) {
            Some(FrontendMessage::Startup { version, params }) => {
                assert_eq!(version >> 16, VERSION_3_MAJOR);
                assert_eq!(params.get("user").map(String::as_str), Some("alice"));
                assert_eq!(params.get("database").map(String::as_str), Some("db"));
            }
            other => panic!("expected startup, got {other:?}"),
        }
        assert!(src.is_empty());
    }

    #[test]
    fn test_partial_startup_frame_needs_more_data() {
        let mut codec = Codec::new();
        let frame = startup_frame(&[("user", "alice")]);
        let mut src = BytesMut::new();
        // Feed the frame one byte at a time; no prefix may produce a
        // message or consume input.
        for (i, b) in frame.iter().enumerate() {
            src.put_u8(*b);
            let before = src.len();
            if i < frame.len() - 1 {
                assert_eq!(codec.decode(&mut src).unwrap(), None);
                assert_eq!(src.len(), before);
            }
        }
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(FrontendMessage::Startup { .. })
        ));
    }

    #[test]
    fn test_startup_frame_of_length_seven_is_rejected() {
        let mut codec = Codec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&7i32.to_be_bytes());
        // Only three payload bytes exist; classification must fail without
        // reading past the declared end.
        src.extend_from_slice(&[0, 0, 0]);
        let err = codec.decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unsupported_startup_code_is_rejected() {
        let mut codec = Codec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&16i32.to_be_bytes());
        // The cancel-request pseudo-version.
        src.extend_from_slice(&((1234 << 16) + 5678i32).to_be_bytes());
        src.extend_from_slice(&[0; 8]);
        let err = codec.decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_typed_frame_with_short_length_is_framing_error() {
        let mut codec = Codec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&startup_frame(&[]));
        codec.decode(&mut src).unwrap();

        src.put_u8(b'Q');
        src.extend_from_slice(&3i32.to_be_bytes());
        assert!(codec.decode(&mut src).is_err());
        // The bad header was consumed; re-polling the same buffer must
        // not spin on it.
        assert!(src.is_empty());
    }

    fn ready_codec() -> (Codec, BytesMut) {
        let mut codec = Codec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&startup_frame(&[("user", "u")]));
        codec.decode(&mut src).unwrap();
        (codec, src)
    }

    #[test]
    fn test_decode_simple_query() {
        let (mut codec, mut src) = ready_codec();
        src.extend_from_slice(&typed_frame(b'Q', b"SELECT 1\0"));
        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Query { sql: "SELECT 1".into() })
        );
    }

    #[test]
    fn test_decode_extended_query_flow() {
        let (mut codec, mut src) = ready_codec();

        let mut parse = Vec::new();
        parse.extend_from_slice(b"s1\0SELECT $1\0");
        parse.extend_from_slice(&1i16.to_be_bytes());
        parse.extend_from_slice(&25u32.to_be_bytes());
        src.extend_from_slice(&typed_frame(b'P', &parse));

        let mut bind = Vec::new();
        bind.extend_from_slice(b"\0s1\0");
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&2i16.to_be_bytes());
        bind.extend_from_slice(&3i32.to_be_bytes());
        bind.extend_from_slice(b"abc");
        bind.extend_from_slice(&(-1i32).to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        src.extend_from_slice(&typed_frame(b'B', &bind));

        let mut execute = Vec::new();
        execute.extend_from_slice(b"\0");
        execute.extend_from_slice(&0i32.to_be_bytes());
        src.extend_from_slice(&typed_frame(b'E', &execute));

        src.extend_from_slice(&typed_frame(b'D', b"Ss1\0"));
        src.extend_from_slice(&typed_frame(b'C', b"Ps1\0"));
        src.extend_from_slice(&typed_frame(b'S', b""));
        src.extend_from_slice(&typed_frame(b'X', b""));

        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Parse {
                name: "s1".into(),
                sql: "SELECT $1".into(),
                param_types: vec![25],
            })
        );
        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Bind {
                portal: "".into(),
                statement: "s1".into(),
                param_formats: vec![],
                params: vec![Some(b"abc".to_vec()), None],
                result_formats: vec![],
            })
        );
        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Execute { portal: "".into(), max_rows: 0 })
        );
        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Describe { target: Target::Statement, name: "s1".into() })
        );
        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Close { target: Target::Portal, name: "s1".into() })
        );
        assert_eq!(decode_one(&mut codec, &mut src), Some(FrontendMessage::Sync));
        assert_eq!(decode_one(&mut codec, &mut src), Some(FrontendMessage::Terminate));
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_password() {
        let (mut codec, mut src) = ready_codec();
        src.extend_from_slice(&typed_frame(b'p', b"hunter2\0"));
        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Password { password: "hunter2".into() })
        );
    }

    #[test]
    fn test_malformed_payload_keeps_stream_intact() {
        let (mut codec, mut src) = ready_codec();
        // A query payload with no NUL terminator, then a valid query.
        src.extend_from_slice(&typed_frame(b'Q', b"SELECT 1"));
        src.extend_from_slice(&typed_frame(b'Q', b"SELECT 2\0"));
        assert!(matches!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Malformed { tag: b'Q', .. })
        ));
        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Query { sql: "SELECT 2".into() })
        );
    }

    #[test]
    fn test_unknown_type_byte_is_consumed_not_fatal() {
        let (mut codec, mut src) = ready_codec();
        src.extend_from_slice(&typed_frame(b'F', b"\x00\x01payload"));
        src.extend_from_slice(&typed_frame(b'Q', b"SELECT 1\0"));
        assert_eq!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Unknown { tag: b'F' })
        );
        assert!(matches!(
            decode_one(&mut codec, &mut src),
            Some(FrontendMessage::Query { .. })
        ));
    }

    fn encode_one(msg: BackendMessage) -> Vec<u8> {
        let mut codec = Codec::new();
        let mut dst = BytesMut::new();
        codec.encode(msg, &mut dst).expect("encode failed");
        dst.to_vec()
    }

    #[test]
    fn test_encode_ready_for_query_is_deterministic() {
        let bytes = encode_one(BackendMessage::ReadyForQuery(TransactionStatus::Idle));
        assert_eq!(bytes, b"Z\x00\x00\x00\x05I");
        assert_eq!(
            bytes,
            encode_one(BackendMessage::ReadyForQuery(TransactionStatus::Idle))
        );
        assert_eq!(
            encode_one(BackendMessage::ReadyForQuery(TransactionStatus::InTransaction)),
            b"Z\x00\x00\x00\x05T"
        );
    }

    #[test]
    fn test_encode_authentication_messages() {
        assert_eq!(
            encode_one(BackendMessage::AuthenticationOk),
            b"R\x00\x00\x00\x08\x00\x00\x00\x00"
        );
        assert_eq!(
            encode_one(BackendMessage::AuthenticationCleartextPassword),
            b"R\x00\x00\x00\x08\x00\x00\x00\x03"
        );
    }

    #[test]
    fn test_encode_null_column_as_minus_one_with_no_bytes() {
        let bytes = encode_one(BackendMessage::DataRow(vec![None, Some("x".into())]));
        // 'D', len 15, 2 columns, -1, then 1 + "x".
        let mut expected = vec![b'D'];
        expected.extend_from_slice(&15i32.to_be_bytes());
        expected.extend_from_slice(&2i16.to_be_bytes());
        expected.extend_from_slice(&(-1i32).to_be_bytes());
        expected.extend_from_slice(&1i32.to_be_bytes());
        expected.push(b'x');
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_encode_row_description_field_layout() {
        let bytes = encode_one(BackendMessage::RowDescription(vec![FieldDescription::new(
            "id", "int4",
        )]));
        let mut expected = vec![b'T'];
        expected.extend_from_slice(&27i32.to_be_bytes());
        expected.extend_from_slice(&1i16.to_be_bytes());
        expected.extend_from_slice(b"id\0");
        expected.extend_from_slice(&0u32.to_be_bytes());
        expected.extend_from_slice(&1i16.to_be_bytes());
        expected.extend_from_slice(&23u32.to_be_bytes());
        expected.extend_from_slice(&4i16.to_be_bytes());
        expected.extend_from_slice(&(-1i32).to_be_bytes());
        expected.extend_from_slice(&0i16.to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_encode_error_response_fields() {
        let err = ErrorResponse::error(SqlState::SYNTAX_ERROR, "bad query")
            .with_detail("detail")
            .with_hint("hint");
        let bytes = encode_one(BackendMessage::ErrorResponse(err.clone()));
        assert_eq!(bytes[0], b'E');
        let body = &bytes[5..];
        assert_eq!(body[0], b'S');
        assert!(body.windows(6).any(|w| w == b"42601\0"));
        assert!(body.windows(10).any(|w| w == b"bad query\0"));
        assert!(body.windows(7).any(|w| w == b"detail\0"));
        assert!(body.windows(5).any(|w| w == b"hint\0"));
        assert_eq!(*body.last().unwrap(), 0);

        let notice = encode_one(BackendMessage::NoticeResponse(ErrorResponse::new(
            Severity::Notice,
            SqlState::INTERNAL_ERROR,
            "n",
        )));
        assert_eq!(notice[0], b'N');
    }

    #[test]
    fn test_encode_acknowledgements() {
        assert_eq!(encode_one(BackendMessage::ParseComplete), b"1\x00\x00\x00\x04");
        assert_eq!(encode_one(BackendMessage::BindComplete), b"2\x00\x00\x00\x04");
        assert_eq!(encode_one(BackendMessage::CloseComplete), b"3\x00\x00\x00\x04");
        assert_eq!(encode_one(BackendMessage::EmptyQueryResponse), b"I\x00\x00\x00\x04");
    }
}
