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

//! Body-buffer compression for IPC payloads

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow_buffer::Buffer;
use arrow_ipc::CompressionType;
use crossbeam_channel::unbounded;

use crate::error::Error;

/// Each compressed buffer starts with the uncompressed length as a
/// little-endian u64
const LENGTH_PREFIX_SIZE: usize = 8;

/// Supported compression codecs for IPC body buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    /// LZ4 frame format
    Lz4Frame,
    /// Zstandard
    Zstd,
}

impl TryFrom<CompressionType> for CompressionCodec {
    type Error = Error;

    fn try_from(compression_type: CompressionType) -> Result<Self, Error> {
        match compression_type {
            CompressionType::LZ4_FRAME => Ok(Self::Lz4Frame),
            CompressionType::ZSTD => Ok(Self::Zstd),
            other => Err(Error::Compression(format!(
                "unsupported compression type {other:?}"
            ))),
        }
    }
}

impl CompressionCodec {
    /// The wire identifier written into the `BodyCompression` header
    pub fn compression_type(&self) -> CompressionType {
        match self {
            Self::Lz4Frame => CompressionType::LZ4_FRAME,
            Self::Zstd => CompressionType::ZSTD,
        }
    }

    /// Compresses `input` into a fresh buffer laid out as
    /// `uint64_le(uncompressed_length) || compressed_bytes`
    pub(crate) fn compress_buffer(&self, input: &[u8]) -> Result<Buffer, Error> {
        let mut output = Vec::with_capacity(input.len() / 2 + LENGTH_PREFIX_SIZE);
        output.extend_from_slice(&(input.len() as u64).to_le_bytes());
        self.compress(input, &mut output)?;
        Ok(Buffer::from(output))
    }

    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            Self::Lz4Frame => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(output);
                encoder
                    .write_all(input)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| Error::Compression(e.to_string()))?;
                Ok(())
            }
            Self::Zstd => {
                let mut encoder = zstd::Encoder::new(output, 0)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                encoder
                    .write_all(input)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| Error::Compression(e.to_string()))?;
                Ok(())
            }
        }
    }
}

/// Rewrites every non-empty buffer in `body` with its compressed form.
///
/// Empty buffers, including absent-buffer sentinels, are left untouched so the
/// decoder still sees them as absent. With `workers <= 1` buffers are
/// compressed in caller context; otherwise `workers` threads drain a shared
/// queue of buffer indices, each with its own codec instance. The first error
/// cancels the remaining work and is returned once every worker has been
/// joined; buffers are only rewritten from the caller thread, after the join.
pub(crate) fn compress_body_buffers(
    codec: CompressionCodec,
    workers: usize,
    body: &mut [Buffer],
) -> Result<(), Error> {
    if workers <= 1 {
        for buffer in body.iter_mut() {
            if !buffer.is_empty() {
                *buffer = codec.compress_buffer(buffer.as_slice())?;
            }
        }
        return Ok(());
    }

    let (work_tx, work_rx) = unbounded();
    for (index, buffer) in body.iter().enumerate() {
        if !buffer.is_empty() {
            work_tx
                .send((index, buffer.clone()))
                .expect("receiver is held open until the scope ends");
        }
    }
    drop(work_tx);

    let cancelled = AtomicBool::new(false);
    let mut first_err = None;
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let work_rx = work_rx.clone();
                let cancelled = &cancelled;
                scope.spawn(move || {
                    let mut compressed = Vec::new();
                    while let Ok((index, buffer)) = work_rx.recv() {
                        if cancelled.load(Ordering::Relaxed) {
                            break;
                        }
                        match codec.compress_buffer(buffer.as_slice()) {
                            Ok(output) => compressed.push((index, output)),
                            Err(err) => {
                                cancelled.store(true, Ordering::Relaxed);
                                return Err(err);
                            }
                        }
                    }
                    Ok(compressed)
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(Ok(compressed)) => {
                    for (index, buffer) in compressed {
                        body[index] = buffer;
                    }
                }
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                Err(_) => {
                    first_err.get_or_insert(Error::Internal(
                        "compression worker panicked".to_string(),
                    ));
                }
            }
        }
    });

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
