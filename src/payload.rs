// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Encoded IPC payloads and the sinks they are written to

use std::io::Write;

use arrow_buffer::Buffer;
use arrow_ipc::MessageHeader;

use crate::error::Error;

/// Marks the start of an IPC message, per the Arrow IPC streaming format spec
const CONTINUATION_MARKER: [u8; 4] = [0xff; 4];

/// Body buffers and message framing are padded to this boundary
pub const ALIGNMENT: usize = 8;

pub(crate) const PADDING: [u8; ALIGNMENT] = [0; ALIGNMENT];

/// Rounds `len` up to the next multiple of [`ALIGNMENT`]
#[inline]
pub(crate) fn padded_length(len: usize) -> usize {
    (len + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Number of bytes needed to pad `len` to the next multiple of [`ALIGNMENT`]
#[inline]
pub(crate) fn pad_to_alignment(len: usize) -> usize {
    padded_length(len) - len
}

/// A single encoded IPC message: the flatbuffer header plus the body buffers
/// that follow it on the wire.
///
/// Body buffers are shared [`Buffer`] handles. A buffer passed through from
/// the source array holds an extra reference for the lifetime of the payload;
/// derived buffers (shifted offsets, truncated bitmaps, compressed bodies)
/// are owned solely by the payload. Dropping the payload releases every held
/// reference. A zero-length buffer is the absent-buffer sentinel (e.g. an
/// all-valid validity bitmap).
#[derive(Debug)]
pub struct Payload {
    pub(crate) kind: MessageHeader,
    pub(crate) meta: Vec<u8>,
    pub(crate) body: Vec<Buffer>,
    pub(crate) body_len: i64,
}

impl Payload {
    /// The message kind carried in the header
    pub fn kind(&self) -> MessageHeader {
        self.kind
    }

    /// The flatbuffer-encoded message header
    pub fn meta(&self) -> &[u8] {
        &self.meta
    }

    /// The body buffers, in wire order
    pub fn body(&self) -> &[Buffer] {
        &self.body
    }

    /// Total body size on the wire, including inter-buffer padding.
    /// Always a multiple of [`ALIGNMENT`].
    pub fn body_len(&self) -> i64 {
        self.body_len
    }
}

/// An ordered sink for encoded payloads.
///
/// [`crate::writer::StreamWriter`] hands payloads to the sink in strict
/// program order: Schema, then per batch zero or more DictionaryBatch
/// payloads followed by one RecordBatch payload. `close` terminates the
/// stream.
pub trait PayloadSink {
    /// Called once before the first payload
    fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Write one payload
    fn write_payload(&mut self, payload: &Payload) -> Result<(), Error>;

    /// Flush any buffered bytes
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Terminate the stream
    fn close(&mut self) -> Result<(), Error>;
}

/// The default sink: writes the IPC streaming format to a [`Write`].
///
/// Each payload is framed as the continuation marker `0xFFFFFFFF`, the padded
/// metadata length (little-endian i32), the metadata bytes padded to
/// [`ALIGNMENT`], and the body buffers each padded to [`ALIGNMENT`].
/// `close` writes the end-of-stream marker (continuation marker followed by a
/// zero length).
#[derive(Debug)]
pub struct StreamSink<W: Write> {
    writer: W,
}

impl<W: Write> StreamSink<W> {
    /// Wrap `writer` in a stream sink
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Gets a reference to the underlying writer
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Gets a mutable reference to the underlying writer.
    ///
    /// It is inadvisable to directly write to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PayloadSink for StreamSink<W> {
    fn write_payload(&mut self, payload: &Payload) -> Result<(), Error> {
        // the continuation marker and length prefix occupy 8 bytes ahead of
        // the metadata, and the metadata length is itself padded
        let prefix = CONTINUATION_MARKER.len() + size_of::<i32>();
        let aligned = padded_length(payload.meta.len() + prefix);
        let meta_len = aligned - prefix;

        self.writer.write_all(&CONTINUATION_MARKER)?;
        self.writer.write_all(&(meta_len as i32).to_le_bytes())?;
        self.writer.write_all(&payload.meta)?;
        self.writer
            .write_all(&PADDING[..aligned - prefix - payload.meta.len()])?;

        for buffer in &payload.body {
            self.writer.write_all(buffer.as_slice())?;
            self.writer
                .write_all(&PADDING[..pad_to_alignment(buffer.len())])?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.writer.write_all(&CONTINUATION_MARKER)?;
        self.writer.write_all(&0_i32.to_le_bytes())?;
        self.writer.flush()?;
        Ok(())
    }
}
