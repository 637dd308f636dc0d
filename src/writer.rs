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

//! Arrow IPC stream writer
//!
//! [`StreamWriter`] turns a sequence of [`RecordBatch`]es into IPC stream
//! payloads: a schema prologue, dictionary batches as dictionaries appear or
//! change, one record batch payload per write, and a terminating
//! end-of-stream marker.

use std::cmp::min;
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use flatbuffers::FlatBufferBuilder;

use arrow_array::types::{Float32Type, Float64Type};
use arrow_array::{
    make_array, Array, ArrayRef, ArrowPrimitiveType, OffsetSizeTrait, RecordBatch,
    RecordBatchWriter,
};
use arrow_buffer::{bit_util, Buffer, MutableBuffer};
use arrow_data::{layout, ArrayData, BufferSpec};
use num_traits::Float;
use arrow_ipc::{
    BodyCompressionBuilder, BodyCompressionMethod, CompressionType, DictionaryBatchBuilder,
    FieldNode, MessageBuilder, MessageHeader, MetadataVersion, RecordBatchBuilder,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};

use crate::compression::{compress_body_buffers, CompressionCodec};
use crate::error::Error;
use crate::payload::{padded_length, Payload, PayloadSink, StreamSink};

/// IPC write options used to control the behaviour of the [`StreamWriter`]
/// and [`RecordEncoder`]
#[derive(Debug, Clone)]
pub struct IpcWriteOptions {
    /// Compression codec for body buffers. `None` means no compression and
    /// no `BodyCompression` header.
    compression: Option<CompressionType>,
    /// Worker count for the body compression pass; `<= 1` compresses in
    /// caller context
    compression_workers: usize,
    /// Emit grown dictionaries as delta batches instead of replacements
    emit_dictionary_deltas: bool,
    /// Permit array lengths above 2^31 - 1
    allow_64bit_lengths: bool,
    /// Maximum nesting depth of the arrays being encoded
    max_nesting_depth: usize,
    /// Fail with [`Error::DictionaryReplacement`] when a dictionary changes.
    /// This is the constraint the IPC file format places on the encoder: a
    /// file carries a single dictionary per field across all batches.
    error_on_replacement: bool,
}

impl Default for IpcWriteOptions {
    fn default() -> Self {
        Self {
            compression: None,
            compression_workers: 1,
            emit_dictionary_deltas: false,
            allow_64bit_lengths: true,
            max_nesting_depth: 64,
            error_on_replacement: false,
        }
    }
}

impl IpcWriteOptions {
    /// Configures body-buffer compression.
    ///
    /// Fails if the compression type has no codec in this crate.
    pub fn try_with_compression(
        mut self,
        compression: Option<CompressionType>,
    ) -> Result<Self, Error> {
        if let Some(compression_type) = compression {
            CompressionCodec::try_from(compression_type)?;
        }
        self.compression = compression;
        Ok(self)
    }

    /// Set the number of worker threads used to compress body buffers
    /// (defaults to 1, meaning compression runs in caller context)
    pub fn with_compression_workers(mut self, workers: usize) -> Self {
        self.compression_workers = workers.max(1);
        self
    }

    /// Set whether grown dictionaries are emitted as delta batches carrying
    /// only the appended values (defaults to false)
    pub fn with_dictionary_deltas(mut self, emit: bool) -> Self {
        self.emit_dictionary_deltas = emit;
        self
    }

    /// Set whether array lengths above 2^31 - 1 are permitted
    /// (defaults to true)
    pub fn with_allow_64bit_lengths(mut self, allow: bool) -> Self {
        self.allow_64bit_lengths = allow;
        self
    }

    /// Set the maximum nesting depth of encoded arrays (defaults to 64)
    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// Set whether a changed dictionary is an error, as required when the
    /// stream is embedded in the IPC file format (defaults to false)
    pub fn with_error_on_dictionary_replacement(mut self, error: bool) -> Self {
        self.error_on_replacement = error;
        self
    }
}

/// What the [`DictionaryTracker`] decided for a dictionary observed in a batch
#[derive(Debug)]
pub enum DictAction {
    /// The dictionary was already written; no payload is needed
    Skip,
    /// Emit `values` as a dictionary batch
    Emit {
        /// The dictionary values to write. For a delta this is only the
        /// appended suffix.
        values: ArrayData,
        /// Whether the payload extends the previous dictionary rather than
        /// replacing it
        is_delta: bool,
    },
}

/// Keeps track of dictionaries that have been written to a stream, to avoid
/// emitting the same dictionary multiple times.
///
/// Holds one reference to the most recently written values per dictionary id;
/// the reference is swapped when the dictionary changes and dropped by
/// [`DictionaryTracker::release`]. State is local to one writer: trackers
/// must not be shared between streams.
#[derive(Debug, Default)]
pub struct DictionaryTracker {
    written: HashMap<i64, ArrayData>,
    dict_ids: Vec<i64>,
    error_on_replacement: bool,
    emit_deltas: bool,
}

impl DictionaryTracker {
    /// Create a new [`DictionaryTracker`].
    ///
    /// If `error_on_replacement` is true, an update to an existing dictionary
    /// is an error; the IPC file format requires this.
    pub fn new(error_on_replacement: bool) -> Self {
        Self {
            written: HashMap::new(),
            dict_ids: Vec::new(),
            error_on_replacement,
            emit_deltas: false,
        }
    }

    /// Create a new [`DictionaryTracker`] that emits grown dictionaries as
    /// delta batches when `emit_deltas` is true
    pub fn new_with_deltas(error_on_replacement: bool, emit_deltas: bool) -> Self {
        Self {
            written: HashMap::new(),
            dict_ids: Vec::new(),
            error_on_replacement,
            emit_deltas,
        }
    }

    /// Assign dictionary ids for every dictionary field in `schema`.
    ///
    /// Ids are sequential from zero in depth-first schema order, children
    /// before their parent dictionary field. This matches the order in which
    /// the `arrow-ipc` schema encoder assigns ids into the schema message,
    /// so the ids observed while walking a record's columns line up with the
    /// schema.
    pub fn import_schema(&mut self, schema: &Schema) {
        self.dict_ids.clear();
        let mut next = 0;
        for field in schema.fields() {
            assign_dict_ids(field.data_type(), &mut next, &mut self.dict_ids);
        }
    }

    /// The dictionary ids in the order they are observed while traversing
    /// the schema
    pub fn dict_ids(&self) -> &[i64] {
        &self.dict_ids
    }

    /// Record `values` as the dictionary for `dict_id` and decide whether a
    /// payload must be written. Behavior, in order:
    ///
    /// * first sighting of `dict_id`: emit the full dictionary;
    /// * same underlying buffers, or equal length and equal values (NaNs
    ///   comparing equal): skip;
    /// * a changed dictionary with `error_on_replacement` set: error;
    /// * a grown dictionary with an unchanged prefix, deltas enabled and no
    ///   nested dictionary in the values: emit the appended suffix as a
    ///   delta;
    /// * otherwise: emit the full dictionary as a replacement.
    pub fn track(&mut self, dict_id: i64, values: &ArrayData) -> Result<DictAction, Error> {
        let Some(last) = self.written.get(&dict_id) else {
            self.written.insert(dict_id, values.clone());
            return Ok(DictAction::Emit {
                values: values.clone(),
                is_delta: false,
            });
        };

        if ArrayData::ptr_eq(last, values) {
            return Ok(DictAction::Skip);
        }
        // value equality is required, not just identity: without it the file
        // format would raise spurious replacement errors for dictionaries
        // rebuilt with the same contents
        if last.len() == values.len() && values_approx_eq(last, values) {
            return Ok(DictAction::Skip);
        }
        if self.error_on_replacement {
            return Err(Error::DictionaryReplacement(dict_id));
        }

        let action = if self.emit_deltas
            && values.len() > last.len()
            && !has_nested_dictionary(values)
            && values_approx_eq(last, &values.slice(0, last.len()))
        {
            DictAction::Emit {
                values: values.slice(last.len(), values.len() - last.len()),
                is_delta: true,
            }
        } else {
            DictAction::Emit {
                values: values.clone(),
                is_delta: false,
            }
        };
        self.written.insert(dict_id, values.clone());
        Ok(action)
    }

    /// Drop every retained dictionary reference
    pub fn release(&mut self) {
        self.written.clear();
    }
}

fn assign_dict_ids(data_type: &DataType, next: &mut i64, ids: &mut Vec<i64>) {
    match data_type {
        DataType::Dictionary(_, value_type) => {
            // nested dictionaries take their ids before their parent
            assign_dict_ids(value_type, next, ids);
            ids.push(*next);
            *next += 1;
        }
        DataType::List(field)
        | DataType::LargeList(field)
        | DataType::FixedSizeList(field, _)
        | DataType::Map(field, _) => assign_dict_ids(field.data_type(), next, ids),
        DataType::Struct(fields) => {
            for field in fields {
                assign_dict_ids(field.data_type(), next, ids);
            }
        }
        DataType::RunEndEncoded(run_ends, values) => {
            assign_dict_ids(run_ends.data_type(), next, ids);
            assign_dict_ids(values.data_type(), next, ids);
        }
        DataType::Union(fields, _) => {
            for (_, field) in fields.iter() {
                assign_dict_ids(field.data_type(), next, ids);
            }
        }
        _ => {}
    }
}

fn has_nested_dictionary(data: &ArrayData) -> bool {
    if let DataType::Dictionary(_, _) = data.data_type() {
        return true;
    }
    data.child_data().iter().any(has_nested_dictionary)
}

fn values_approx_eq(last: &ArrayData, new: &ArrayData) -> bool {
    match last.data_type() {
        DataType::Float32 => float_values_eq::<Float32Type>(last, new),
        DataType::Float64 => float_values_eq::<Float64Type>(last, new),
        _ => last == new,
    }
}

// NaNs compare equal so a rebuilt float dictionary is not taken for a
// replacement
fn float_values_eq<T>(last: &ArrayData, new: &ArrayData) -> bool
where
    T: ArrowPrimitiveType,
    T::Native: num_traits::Float,
{
    let last = arrow_array::PrimitiveArray::<T>::from(last.clone());
    let new = arrow_array::PrimitiveArray::<T>::from(new.clone());
    last.len() == new.len()
        && last.iter().zip(new.iter()).all(|(a, b)| match (a, b) {
            (Some(a), Some(b)) => a == b || (a.is_nan() && b.is_nan()),
            (None, None) => true,
            _ => false,
        })
}

/// Encodes record batches and dictionary values into [`Payload`]s.
///
/// An encoder is single use: it visits the columns of one batch depth-first,
/// collecting field nodes and body buffers, then finishes into a payload
/// carrying the flatbuffer header.
#[derive(Debug)]
pub struct RecordEncoder {
    compression: Option<CompressionCodec>,
    compression_workers: usize,
    allow_64bit_lengths: bool,
    depth: usize,
    max_depth: usize,
    fields: Vec<FieldNode>,
    body: Vec<Buffer>,
}

impl RecordEncoder {
    /// Create an encoder from the writer options
    pub fn try_new(options: &IpcWriteOptions) -> Result<Self, Error> {
        let compression = options
            .compression
            .map(CompressionCodec::try_from)
            .transpose()?;
        Ok(Self {
            compression,
            compression_workers: options.compression_workers,
            allow_64bit_lengths: options.allow_64bit_lengths,
            depth: options.max_nesting_depth,
            max_depth: options.max_nesting_depth,
            fields: Vec::new(),
            body: Vec::new(),
        })
    }

    /// Encode `batch` into a record batch payload
    pub fn encode_record(mut self, batch: &RecordBatch) -> Result<Payload, Error> {
        let (buffers, body_len) = self.encode_body(batch.columns())?;
        let meta = self.batch_message(batch.num_rows() as i64, body_len, &buffers, None);
        Ok(Payload {
            kind: MessageHeader::RecordBatch,
            meta,
            body: self.body,
            body_len,
        })
    }

    /// Encode dictionary `values` into a dictionary batch payload carrying
    /// `dict_id` and the delta flag
    pub fn encode_dictionary(
        mut self,
        dict_id: i64,
        is_delta: bool,
        values: &ArrayData,
    ) -> Result<Payload, Error> {
        // a dictionary batch is a record batch with a single column holding
        // the dictionary values
        let schema = Arc::new(Schema::new(vec![Field::new(
            "dictionary",
            values.data_type().clone(),
            true,
        )]));
        let batch = RecordBatch::try_new(schema, vec![make_array(values.clone())])?;

        let (buffers, body_len) = self.encode_body(batch.columns())?;
        let meta = self.batch_message(
            batch.num_rows() as i64,
            body_len,
            &buffers,
            Some((dict_id, is_delta)),
        );
        Ok(Payload {
            kind: MessageHeader::DictionaryBatch,
            meta,
            body: self.body,
            body_len,
        })
    }

    fn encode_body(&mut self, columns: &[ArrayRef]) -> Result<(Vec<arrow_ipc::Buffer>, i64), Error> {
        for column in columns {
            self.visit(&column.to_data())?;
        }

        if let Some(codec) = self.compression {
            compress_body_buffers(codec, self.compression_workers, &mut self.body)?;
        }

        let mut offset = 0;
        let mut buffers = Vec::with_capacity(self.body.len());
        for buffer in &self.body {
            // lengths exclude the trailing padding so compressed buffers
            // decompress correctly, but offsets advance past it
            buffers.push(arrow_ipc::Buffer::new(offset, buffer.len() as i64));
            offset += padded_length(buffer.len()) as i64;
        }
        if offset % 8 != 0 {
            return Err(Error::Internal(
                "body buffers are not 8-byte aligned".to_string(),
            ));
        }
        Ok((buffers, offset))
    }

    /// Depth-first pre-order visit appending one field node per array and
    /// its body buffers in wire order
    fn visit(&mut self, data: &ArrayData) -> Result<(), Error> {
        if self.depth == 0 {
            return Err(Error::MaxRecursion(self.max_depth));
        }
        if !self.allow_64bit_lengths && data.len() > i32::MAX as usize {
            return Err(Error::ArrayTooLarge(data.len()));
        }

        self.fields.push(FieldNode::new(
            data.len() as i64,
            match data.data_type() {
                // NullArray reports a zero null count through ArrayData
                DataType::Null => data.len(),
                _ => data.null_count(),
            } as i64,
        ));

        if matches!(data.data_type(), DataType::Null) {
            return Ok(());
        }

        self.append_validity(data);

        match data.data_type() {
            DataType::Boolean => {
                let values = if data.is_empty() {
                    MutableBuffer::new(0).into()
                } else {
                    truncated_bitmap(&data.buffers()[0], data.offset(), data.len())
                };
                self.body.push(values);
            }
            DataType::Binary | DataType::Utf8 => {
                let (offsets, values) = get_byte_array_buffers::<i32>(data);
                self.body.push(offsets);
                self.body.push(values);
            }
            DataType::LargeBinary | DataType::LargeUtf8 => {
                let (offsets, values) = get_byte_array_buffers::<i64>(data);
                self.body.push(offsets);
                self.body.push(values);
            }
            dt @ (DataType::List(_) | DataType::Map(_, _) | DataType::LargeList(_)) => {
                let (offsets, child) = match dt {
                    DataType::LargeList(_) => get_list_array_buffers::<i64>(data),
                    _ => get_list_array_buffers::<i32>(data),
                };
                self.body.push(offsets);
                self.depth -= 1;
                self.visit(&child)?;
                self.depth += 1;
            }
            DataType::FixedSizeList(_, size) => {
                let size = *size as usize;
                let child = data.child_data()[0].slice(data.offset() * size, data.len() * size);
                self.depth -= 1;
                self.visit(&child)?;
                self.depth += 1;
            }
            DataType::Struct(_) => {
                // struct children in ArrayData are already window aligned
                self.depth -= 1;
                for child in data.child_data() {
                    self.visit(child)?;
                }
                self.depth += 1;
            }
            dt if dt.is_numeric()
                || dt.is_temporal()
                || matches!(dt, DataType::FixedSizeBinary(_) | DataType::Dictionary(_, _)) =>
            {
                // dictionaries contribute their indices here; the values
                // travel in dictionary batch payloads
                self.body.push(sliced_fixed_width(data));
            }
            dt => return Err(Error::UnsupportedType(dt.clone())),
        }

        Ok(())
    }

    /// The validity bitmap precedes the type-specific buffers of every
    /// non-null-typed array. An array without nulls contributes the
    /// absent-buffer sentinel.
    fn append_validity(&mut self, data: &ArrayData) {
        let bitmap = match data.nulls() {
            None => MutableBuffer::new(0).into(),
            Some(nulls) if nulls.null_count() == 0 => MutableBuffer::new(0).into(),
            Some(_) if data.null_count() == data.len() => {
                // every value is null: a fresh zeroed bitmap avoids copying
                // the source
                let num_bytes = padded_length(bit_util::ceil(data.len(), 8));
                MutableBuffer::from_len_zeroed(num_bytes).into()
            }
            Some(nulls) => truncated_bitmap(nulls.buffer(), nulls.offset(), nulls.len()),
        };
        self.body.push(bitmap);
    }

    fn batch_message(
        &self,
        n_rows: i64,
        body_len: i64,
        buffers: &[arrow_ipc::Buffer],
        dictionary: Option<(i64, bool)>,
    ) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::new();

        let compression = self.compression.map(|codec| {
            let mut builder = BodyCompressionBuilder::new(&mut fbb);
            builder.add_method(BodyCompressionMethod::BUFFER);
            builder.add_codec(codec.compression_type());
            builder.finish()
        });
        let nodes = fbb.create_vector(&self.fields);
        let buffers = fbb.create_vector(buffers);

        let batch = {
            let mut builder = RecordBatchBuilder::new(&mut fbb);
            builder.add_length(n_rows);
            builder.add_nodes(nodes);
            builder.add_buffers(buffers);
            if let Some(compression) = compression {
                builder.add_compression(compression);
            }
            builder.finish()
        };

        let (header_type, header) = match dictionary {
            None => (MessageHeader::RecordBatch, batch.as_union_value()),
            Some((dict_id, is_delta)) => {
                let mut builder = DictionaryBatchBuilder::new(&mut fbb);
                builder.add_id(dict_id);
                builder.add_data(batch);
                builder.add_isDelta(is_delta);
                (
                    MessageHeader::DictionaryBatch,
                    builder.finish().as_union_value(),
                )
            }
        };

        let message = {
            let mut builder = MessageBuilder::new(&mut fbb);
            builder.add_version(MetadataVersion::V5);
            builder.add_header_type(header_type);
            builder.add_bodyLength(body_len);
            builder.add_header(header);
            builder.finish()
        };
        fbb.finish(message, None);
        fbb.finished_data().to_vec()
    }
}

/// Truncates the bit range `[offset, offset + len)` out of `buffer`.
///
/// The source buffer is retained unchanged when the range already starts at
/// bit zero and the buffer carries no more than the padded minimum; a
/// byte-aligned range is truncated zero-copy; anything else is a bit-level
/// copy into a fresh zero-padded buffer.
fn truncated_bitmap(buffer: &Buffer, offset: usize, len: usize) -> Buffer {
    let min_length = padded_length(bit_util::ceil(len, 8));
    if offset % 8 == 0 {
        let byte_offset = offset / 8;
        if byte_offset == 0 && buffer.len() <= min_length {
            buffer.clone()
        } else {
            let length = min(bit_util::ceil(len, 8), buffer.len() - byte_offset);
            buffer.slice_with_length(byte_offset, length)
        }
    } else {
        buffer.bit_slice(offset, len)
    }
}

fn buffer_element_width(spec: &BufferSpec) -> usize {
    match spec {
        BufferSpec::FixedWidth { byte_width, .. } => *byte_width,
        _ => 0,
    }
}

/// Slices a fixed-width values buffer to the array's logical window,
/// retaining the source buffer when it is already minimal
fn sliced_fixed_width(data: &ArrayData) -> Buffer {
    let buffer = &data.buffers()[0];
    let byte_width = buffer_element_width(&layout(data.data_type()).buffers[0]);
    let min_length = padded_length(data.len() * byte_width);

    if data.offset() != 0 || min_length < buffer.len() {
        let byte_offset = data.offset() * byte_width;
        // keep source padding up to the alignment unit when it is available
        let length = min(min_length, buffer.len() - byte_offset);
        buffer.slice_with_length(byte_offset, length)
    } else {
        buffer.clone()
    }
}

/// Returns the offsets and values buffers for a variable-width array,
/// rebased so the first offset is zero and values outside the logical window
/// are not encoded
fn get_byte_array_buffers<O: OffsetSizeTrait>(data: &ArrayData) -> (Buffer, Buffer) {
    if data.is_empty() {
        return (MutableBuffer::new(0).into(), MutableBuffer::new(0).into());
    }

    let (offsets, start, len) = reencode_offsets::<O>(data);
    let values = data.buffers()[1].slice_with_length(start, len);
    (offsets, values)
}

/// Like [`get_byte_array_buffers`] but slices the child array instead of a
/// values buffer
fn get_list_array_buffers<O: OffsetSizeTrait>(data: &ArrayData) -> (Buffer, ArrayData) {
    if data.is_empty() {
        return (
            MutableBuffer::new(0).into(),
            data.child_data()[0].slice(0, 0),
        );
    }

    let (offsets, start, len) = reencode_offsets::<O>(data);
    let child = data.child_data()[0].slice(start, len);
    (offsets, child)
}

/// Rebases the offsets of a variable-width array to start at zero.
///
/// Returns the offsets buffer plus the start offset and byte length of the
/// window it describes in the values. When the window's first offset is
/// already zero the source buffer is retained, trimmed to `len + 1` entries;
/// otherwise a fresh shifted buffer is allocated.
fn reencode_offsets<O: OffsetSizeTrait>(data: &ArrayData) -> (Buffer, usize, usize) {
    let offsets_buf = &data.buffers()[0];
    let offsets = &offsets_buf.typed_data::<O>()[data.offset()..][..data.len() + 1];

    let start = offsets[0];
    let end = offsets[data.len()].as_usize();

    if start.as_usize() == 0 {
        let needed = (data.len() + 1) * size_of::<O>();
        let byte_offset = data.offset() * size_of::<O>();
        let trimmed = if byte_offset == 0 && offsets_buf.len() == needed {
            offsets_buf.clone()
        } else {
            offsets_buf.slice_with_length(byte_offset, needed)
        };
        (trimmed, 0, end)
    } else {
        let shifted: Buffer = offsets.iter().map(|o| *o - start).collect();
        (shifted, start.as_usize(), end - start.as_usize())
    }
}

/// The schema message is encoded by the `arrow-ipc` schema encoder, with a
/// fresh tracker assigning the same sequential depth-first dictionary ids
/// this crate's [`DictionaryTracker::import_schema`] produces
fn schema_payload(schema: &Schema) -> Payload {
    let data_gen = arrow_ipc::writer::IpcDataGenerator::default();
    let mut id_tracker = arrow_ipc::writer::DictionaryTracker::new(false);
    let encoded = data_gen.schema_to_bytes_with_dictionary_tracker(
        schema,
        &mut id_tracker,
        &arrow_ipc::writer::IpcWriteOptions::default(),
    );

    Payload {
        kind: MessageHeader::Schema,
        meta: encoded.ipc_message,
        body: Vec::new(),
        body_len: 0,
    }
}

/// Writer for the Arrow IPC streaming format.
///
/// Payloads leave the writer in strict program order: the schema, then per
/// batch zero or more dictionary batches followed by the record batch, and
/// finally the end-of-stream marker. A writer is not safe for concurrent use
/// from multiple producers.
pub struct StreamWriter<S: PayloadSink> {
    sink: S,
    schema: SchemaRef,
    options: IpcWriteOptions,
    started: bool,
    finished: bool,
    dictionary_tracker: DictionaryTracker,
}

impl<W: Write> StreamWriter<StreamSink<W>> {
    /// Try to create a new writer with default options
    pub fn try_new(writer: W, schema: &Schema) -> Result<Self, Error> {
        Self::try_new_with_options(writer, schema, IpcWriteOptions::default())
    }

    /// Try to create a new writer with the provided [`IpcWriteOptions`]
    pub fn try_new_with_options(
        writer: W,
        schema: &Schema,
        options: IpcWriteOptions,
    ) -> Result<Self, Error> {
        Self::try_new_with_sink(StreamSink::new(writer), schema, options)
    }
}

impl<W: Write> StreamWriter<StreamSink<BufWriter<W>>> {
    /// Try to create a new writer with the output wrapped in a `BufWriter`.
    ///
    /// See [`StreamWriter::try_new`] for an unbuffered version.
    pub fn try_new_buffered(writer: W, schema: &Schema) -> Result<Self, Error> {
        Self::try_new(BufWriter::new(writer), schema)
    }
}

impl<S: PayloadSink> StreamWriter<S> {
    /// Try to create a new writer emitting payloads to a custom sink
    pub fn try_new_with_sink(
        sink: S,
        schema: &Schema,
        options: IpcWriteOptions,
    ) -> Result<Self, Error> {
        if let Some(compression_type) = options.compression {
            CompressionCodec::try_from(compression_type)?;
        }
        let dictionary_tracker = DictionaryTracker::new_with_deltas(
            options.error_on_replacement,
            options.emit_dictionary_deltas,
        );
        Ok(Self {
            sink,
            schema: Arc::new(schema.clone()),
            options,
            started: false,
            finished: false,
            dictionary_tracker,
        })
    }

    /// Emit the schema prologue. Idempotent; `write` and `finish` call this
    /// on first use.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.dictionary_tracker.import_schema(&self.schema);
        self.sink.start()?;
        self.sink.write_payload(&schema_payload(&self.schema))
    }

    /// Write a record batch to the stream.
    ///
    /// Any panic escaping the encoder is converted into [`Error::Internal`].
    /// A failed write is terminal for the stream: dictionary state is not
    /// rolled back, and the writer should only be finished afterwards.
    pub fn write(&mut self, batch: &RecordBatch) -> Result<(), Error> {
        match catch_unwind(AssertUnwindSafe(|| self.write_batch(batch))) {
            Ok(result) => result,
            Err(panic) => {
                let message = if let Some(msg) = panic.downcast_ref::<&str>() {
                    msg.to_string()
                } else if let Some(msg) = panic.downcast_ref::<String>() {
                    msg.clone()
                } else {
                    "panic".to_string()
                };
                Err(Error::Internal(message))
            }
        }
    }

    fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), Error> {
        if self.finished {
            return Err(Error::Internal(
                "cannot write a record batch to a finished stream".to_string(),
            ));
        }
        if !self.started {
            self.start()?;
        }
        if batch.schema().as_ref() != self.schema.as_ref() {
            return Err(Error::InconsistentSchema);
        }

        self.write_dictionaries(batch)?;

        let payload = RecordEncoder::try_new(&self.options)?.encode_record(batch)?;
        self.sink.write_payload(&payload)
    }

    /// Walk the batch's columns, emitting a dictionary batch for every
    /// dictionary the tracker decides must be (re)written
    fn write_dictionaries(&mut self, batch: &RecordBatch) -> Result<(), Error> {
        let mut dict_id_seq = self.dictionary_tracker.dict_ids().to_vec().into_iter();
        for column in batch.columns() {
            self.encode_column_dictionaries(&column.to_data(), &mut dict_id_seq)?;
        }
        Ok(())
    }

    fn encode_column_dictionaries(
        &mut self,
        data: &ArrayData,
        dict_id_seq: &mut impl Iterator<Item = i64>,
    ) -> Result<(), Error> {
        match data.data_type() {
            DataType::Dictionary(_, _) => {
                let values = &data.child_data()[0];
                // the id sequence is depth-first with children before their
                // parent, so nested dictionaries must take their ids first
                self.encode_column_dictionaries(values, dict_id_seq)?;

                let dict_id = dict_id_seq.next().ok_or_else(|| {
                    Error::Internal("no dictionary id assigned for dictionary field".to_string())
                })?;
                match self.dictionary_tracker.track(dict_id, values)? {
                    DictAction::Skip => {}
                    DictAction::Emit { values, is_delta } => {
                        let payload = RecordEncoder::try_new(&self.options)?
                            .encode_dictionary(dict_id, is_delta, &values)?;
                        self.sink.write_payload(&payload)?;
                    }
                }
            }
            _ => {
                for child in data.child_data() {
                    self.encode_column_dictionaries(child, dict_id_seq)?;
                }
            }
        }
        Ok(())
    }

    /// Write the end-of-stream marker and release retained dictionaries.
    ///
    /// Calls [`StreamWriter::start`] first if nothing was ever written, so an
    /// empty stream still carries a valid prologue. Idempotent: subsequent
    /// calls are no-ops.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        self.start()?;
        self.sink.close()?;
        self.dictionary_tracker.release();
        self.finished = true;
        Ok(())
    }

    /// Returns the schema of this stream
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Gets a reference to the underlying sink
    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    /// Gets a mutable reference to the underlying sink.
    ///
    /// It is inadvisable to directly write to the underlying sink.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Flush the underlying sink
    pub fn flush(&mut self) -> Result<(), Error> {
        self.sink.flush()
    }

    /// Unwraps the underlying sink, finishing the stream first if needed
    pub fn into_inner(mut self) -> Result<S, Error> {
        if !self.finished {
            self.finish()?;
        }
        Ok(self.sink)
    }
}

impl<S: PayloadSink> RecordBatchWriter for StreamWriter<S> {
    fn write(&mut self, batch: &RecordBatch) -> Result<(), arrow_schema::ArrowError> {
        self.write(batch).map_err(Into::into)
    }

    fn close(mut self) -> Result<(), arrow_schema::ArrowError> {
        self.finish().map_err(Into::into)
    }
}
