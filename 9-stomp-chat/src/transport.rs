//! Null-terminated frame transport over any async byte stream.
//!
//! Reading and writing are split so one task can sit on reads while others
//! send. Writes go through an async mutex: the session loop and the inbound
//! dispatcher both send frames, and one frame must never interleave with
//! another on the wire.

use std::io;

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};

use crate::frame::{FRAME_TERMINATOR, Frame};

pub type TcpFrameReader = FrameReader<BufReader<OwnedReadHalf>>;
pub type TcpFrameWriter = FrameWriter<OwnedWriteHalf>;

pub async fn connect(host: &str, port: u16) -> io::Result<(TcpFrameReader, TcpFrameWriter)> {
    let stream = TcpStream::connect((host, port)).await?;
    Ok(split(stream))
}

pub fn split(stream: TcpStream) -> (TcpFrameReader, TcpFrameWriter) {
    let (reader, writer) = stream.into_split();
    (
        FrameReader::new(BufReader::new(reader)),
        FrameWriter::new(writer),
    )
}

pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    /// Reads up to the next terminator and returns the frame text without it.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream; a trailing
    /// partial frame is discarded. Bytes of a partially read frame stay in
    /// `buffer`, so dropping this future inside `select!` loses nothing.
    pub async fn read_frame(&mut self) -> io::Result<Option<String>> {
        let read = self
            .reader
            .read_until(FRAME_TERMINATOR, &mut self.buffer)
            .await?;
        if read == 0 || self.buffer.last() != Some(&FRAME_TERMINATOR) {
            self.buffer.clear();
            return Ok(None);
        }

        self.buffer.pop();
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Ok(Some(text))
    }
}

pub struct FrameWriter<W> {
    writer: Mutex<W>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Writes the encoded frame plus terminator and flushes.
    pub async fn send(&self, frame: &Frame) -> io::Result<()> {
        let mut encoded = frame.encode().into_bytes();
        encoded.push(FRAME_TERMINATOR);

        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    pub async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}
