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

//! Error types for the arrow-ipc-stream crate

use arrow_schema::{ArrowError, DataType};
use thiserror::Error;

/// Error type for operations in this crate
#[derive(Debug, Error)]
pub enum Error {
    /// A record batch was written with a schema other than the writer's
    #[error("record batch schema does not match the stream writer schema")]
    InconsistentSchema,

    /// An array length exceeds the 32-bit limit and 64-bit lengths are disabled
    #[error("array of length {0} exceeds the 32-bit length limit")]
    ArrayTooLarge(usize),

    /// The nesting depth budget was exhausted while visiting an array
    #[error("maximum nesting depth of {0} exceeded")]
    MaxRecursion(usize),

    /// A dictionary changed while writing the single-dictionary (file) variant
    #[error(
        "dictionary replacement detected for dictionary id {0}; the IPC file \
         format supports a single dictionary per field across all batches"
    )]
    DictionaryReplacement(i64),

    /// The array's data type has no IPC body-buffer encoding in this crate
    #[error("unsupported data type for IPC encoding: {0}")]
    UnsupportedType(DataType),

    /// A compression codec failed or is not supported
    #[error("compression failed: {0}")]
    Compression(String),

    /// The payload sink failed
    #[error("failed writing to the payload sink: {0}")]
    Sink(#[from] std::io::Error),

    /// An unexpected failure, typically a recovered panic
    #[error("unknown error while writing: {0}")]
    Internal(String),

    /// Error raised by one of the arrow crates
    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

impl From<Error> for ArrowError {
    fn from(err: Error) -> Self {
        ArrowError::ExternalError(Box::new(err))
    }
}
