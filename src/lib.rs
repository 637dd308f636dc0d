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

//! A streaming encoder for the [Arrow IPC format].
//!
//! [`writer::StreamWriter`] serializes [`RecordBatch`]es into the IPC
//! streaming layout: a schema message, interleaved dictionary batches, record
//! batches, and a final end-of-stream marker. Dictionaries are deduplicated
//! per stream; with [`writer::IpcWriteOptions::with_dictionary_deltas`] a
//! grown dictionary is sent as a delta batch carrying only the appended
//! values. Body buffers can be compressed with LZ4 or ZSTD, optionally fanned
//! out over a pool of worker threads.
//!
//! ```
//! # use std::sync::Arc;
//! # use arrow_array::{Int32Array, RecordBatch};
//! # use arrow_ipc_stream::writer::StreamWriter;
//! let batch = RecordBatch::try_from_iter(vec![(
//!     "a",
//!     Arc::new(Int32Array::from(vec![1, 2, 3])) as _,
//! )])
//! .unwrap();
//!
//! let mut writer = StreamWriter::try_new(Vec::new(), &batch.schema()).unwrap();
//! writer.write(&batch).unwrap();
//! let sink = writer.into_inner().unwrap();
//! assert!(!sink.into_inner().is_empty());
//! ```
//!
//! [Arrow IPC format]: https://arrow.apache.org/docs/format/Columnar.html#serialization-and-interprocess-communication-ipc
//! [`RecordBatch`]: arrow_array::RecordBatch

#![warn(missing_docs)]

pub mod compression;
pub mod error;
pub mod payload;
pub mod writer;
