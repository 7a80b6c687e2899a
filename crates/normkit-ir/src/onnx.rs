// ONNX: serialize a traced graph as an ONNX ModelProto
//
// ONNX files are Protocol Buffers. We write the wire format with a small
// encoder that covers the messages a traced graph needs:
//
//   ModelProto      ir_version, producer, graph, opset_import
//   GraphProto      nodes, name, inputs, outputs (ValueInfoProto)
//   NodeProto       inputs, outputs, name, op_type, attributes, doc_string
//   AttributeProto  INT, FLOAT, STRING, INTS, FLOATS
//
// A matching decoder reads nodes and graph I/O back, which is enough to
// check an export without an ONNX runtime.
//
// The batch-norm node carries `consumed_inputs` and `is_test`, attributes
// of BatchNormalization-1, so the default opset is the last one in which
// that operator version is current.
//
// REFERENCE:
//   https://onnx.ai/onnx/repo-docs/IR.html
//   https://protobuf.dev/programming-guides/encoding/

use std::fs;
use std::path::Path;

use normkit_core::{DType, Error, Result};
use tracing::debug;

use crate::graph::{Attribute, Graph, Node, ValueId, ValueType};

/// ONNX IR version matching the default opset.
const ONNX_IR_VERSION: u64 = 3;
/// Default (ai.onnx) opset version.
pub const DEFAULT_OPSET: u64 = 5;
const ONNX_DOMAIN: &str = "";

// TensorProto data types
const ONNX_FLOAT: i32 = 1;
const ONNX_FLOAT16: i32 = 10;
const ONNX_DOUBLE: i32 = 11;
const ONNX_BFLOAT16: i32 = 16;

// AttributeProto types
const ATTR_FLOAT: u64 = 1;
const ATTR_INT: u64 = 2;
const ATTR_STRING: u64 = 3;
const ATTR_FLOATS: u64 = 6;
const ATTR_INTS: u64 = 7;

fn dtype_to_onnx(dtype: DType) -> i32 {
    match dtype {
        DType::F32 => ONNX_FLOAT,
        DType::F64 => ONNX_DOUBLE,
        DType::F16 => ONNX_FLOAT16,
        DType::BF16 => ONNX_BFLOAT16,
    }
}

/// Settings for [`to_model_bytes_with`] and [`save_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub producer_name: String,
    pub graph_name: String,
    pub opset: u64,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            producer_name: "normkit".to_string(),
            graph_name: "normkit".to_string(),
            opset: DEFAULT_OPSET,
        }
    }
}

impl ExportOptions {
    pub fn with_producer_name(mut self, name: impl Into<String>) -> Self {
        self.producer_name = name.into();
        self
    }

    pub fn with_graph_name(mut self, name: impl Into<String>) -> Self {
        self.graph_name = name.into();
        self
    }

    pub fn with_opset(mut self, opset: u64) -> Self {
        self.opset = opset;
        self
    }
}

// Protobuf encoder

/// Protobuf wire-format writer: varints, length-delimited fields and
/// fixed32 floats.
struct PbEncoder {
    buf: Vec<u8>,
}

impl PbEncoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_varint(&mut self, mut val: u64) {
        loop {
            let byte = (val & 0x7F) as u8;
            val >>= 7;
            if val == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// field_number << 3 | wire_type
    fn write_tag(&mut self, field: u32, wire_type: u32) {
        self.write_varint(((field as u64) << 3) | wire_type as u64);
    }

    fn write_varint_field(&mut self, field: u32, val: u64) {
        self.write_tag(field, 0);
        self.write_varint(val);
    }

    /// int64 fields are plain varints; negatives take ten bytes.
    fn write_int64_field(&mut self, field: u32, val: i64) {
        self.write_varint_field(field, val as u64);
    }

    fn write_float_field(&mut self, field: u32, val: f32) {
        self.write_tag(field, 5);
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    fn write_bytes_field(&mut self, field: u32, data: &[u8]) {
        self.write_tag(field, 2);
        self.write_varint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    fn write_string_field(&mut self, field: u32, val: &str) {
        self.write_bytes_field(field, val.as_bytes());
    }

    fn write_message_field(&mut self, field: u32, msg: &PbEncoder) {
        self.write_bytes_field(field, &msg.buf);
    }
}

// Protobuf decoder

struct PbDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PbDecoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let Some(&byte) = self.data.get(self.pos) else {
                return Err(Error::msg("protobuf: unexpected end of data"));
            };
            self.pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::msg("protobuf: varint too long"));
            }
        }
        Ok(result)
    }

    fn read_tag(&mut self) -> Result<(u32, u32)> {
        let val = self.read_varint()?;
        Ok(((val >> 3) as u32, (val & 0x7) as u32))
    }

    fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or_else(|| Error::msg("protobuf: fixed field exceeds data"))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_float(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_fixed::<4>()?))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| Error::msg("protobuf: bytes field exceeds data"))?;
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::msg("protobuf: invalid UTF-8 string"))
    }

    fn skip_field(&mut self, wire_type: u32) -> Result<()> {
        match wire_type {
            0 => {
                self.read_varint()?;
            }
            1 => {
                self.read_fixed::<8>()?;
            }
            2 => {
                self.read_bytes()?;
            }
            5 => {
                self.read_fixed::<4>()?;
            }
            _ => {
                return Err(Error::msg(format!(
                    "protobuf: unsupported wire type {wire_type}"
                )))
            }
        }
        Ok(())
    }
}

// Encoding

fn encode_attribute(name: &str, val: &Attribute) -> PbEncoder {
    let mut enc = PbEncoder::new();
    enc.write_string_field(1, name);
    match val {
        Attribute::Float(f) => {
            enc.write_varint_field(20, ATTR_FLOAT);
            enc.write_float_field(2, *f as f32);
        }
        Attribute::Int(i) => {
            enc.write_varint_field(20, ATTR_INT);
            enc.write_int64_field(3, *i);
        }
        Attribute::String(s) => {
            enc.write_varint_field(20, ATTR_STRING);
            enc.write_bytes_field(4, s.as_bytes());
        }
        Attribute::Floats(fs) => {
            enc.write_varint_field(20, ATTR_FLOATS);
            for &f in fs {
                enc.write_float_field(7, f as f32);
            }
        }
        Attribute::Ints(is) => {
            enc.write_varint_field(20, ATTR_INTS);
            for &i in is {
                enc.write_int64_field(8, i);
            }
        }
    }
    enc
}

fn encode_node(graph: &Graph, node: &Node) -> PbEncoder {
    let mut enc = PbEncoder::new();
    for &input in node.inputs() {
        enc.write_string_field(1, graph.unique_name(input));
    }
    for &output in node.outputs() {
        enc.write_string_field(2, graph.unique_name(output));
    }
    if let Some(name) = node.name() {
        enc.write_string_field(3, name);
    }
    enc.write_string_field(4, node.op_type());
    for (key, val) in node.attributes() {
        enc.write_message_field(5, &encode_attribute(key, val));
    }
    if let Some(loc) = node.source_location() {
        enc.write_string_field(6, &loc.to_string());
    }
    enc
}

/// ValueInfoProto: name, plus a tensor type when the value's type is known.
fn encode_value_info(graph: &Graph, value: ValueId) -> PbEncoder {
    let mut vi = PbEncoder::new();
    vi.write_string_field(1, graph.unique_name(value));
    if let ValueType::Tensor { dtype, dims } = graph.value_type(value) {
        let mut shape = PbEncoder::new();
        for &d in dims {
            let mut dim = PbEncoder::new();
            dim.write_int64_field(1, d as i64);
            shape.write_message_field(1, &dim);
        }
        let mut tensor_type = PbEncoder::new();
        tensor_type.write_varint_field(1, dtype_to_onnx(*dtype) as u64);
        tensor_type.write_message_field(2, &shape);
        let mut type_proto = PbEncoder::new();
        type_proto.write_message_field(1, &tensor_type);
        vi.write_message_field(2, &type_proto);
    }
    vi
}

/// Encode `graph` as an ONNX ModelProto with default options.
pub fn to_model_bytes(graph: &Graph) -> Vec<u8> {
    to_model_bytes_with(graph, &ExportOptions::default())
}

pub fn to_model_bytes_with(graph: &Graph, options: &ExportOptions) -> Vec<u8> {
    let mut g = PbEncoder::new();
    for node in graph.nodes() {
        g.write_message_field(1, &encode_node(graph, node));
    }
    g.write_string_field(2, &options.graph_name);
    for &input in graph.inputs() {
        g.write_message_field(11, &encode_value_info(graph, input));
    }
    for &output in graph.outputs() {
        g.write_message_field(12, &encode_value_info(graph, output));
    }

    let mut model = PbEncoder::new();
    model.write_varint_field(1, ONNX_IR_VERSION);
    model.write_string_field(2, &options.producer_name);
    model.write_string_field(3, env!("CARGO_PKG_VERSION"));
    model.write_message_field(7, &g);
    let mut opset = PbEncoder::new();
    opset.write_string_field(1, ONNX_DOMAIN);
    opset.write_varint_field(2, options.opset);
    model.write_message_field(8, &opset);
    model.into_bytes()
}

/// Write `graph` to `path` as an `.onnx` file.
pub fn save<P: AsRef<Path>>(graph: &Graph, path: P) -> Result<()> {
    save_with(graph, path, &ExportOptions::default())
}

pub fn save_with<P: AsRef<Path>>(graph: &Graph, path: P, options: &ExportOptions) -> Result<()> {
    let bytes = to_model_bytes_with(graph, options);
    debug!(path = %path.as_ref().display(), bytes = bytes.len(), "writing ONNX model");
    fs::write(path.as_ref(), &bytes)
        .map_err(|e| Error::msg(format!("failed to write ONNX file: {e}")))
}

// Decoding

/// A node read back from an encoded model.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<(String, Attribute)>,
    pub doc_string: String,
}

impl DecodedNode {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }
}

/// The parts of a ModelProto the encoder writes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedModel {
    pub ir_version: u64,
    pub producer_name: String,
    pub opset: u64,
    pub graph_name: String,
    pub nodes: Vec<DecodedNode>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

fn decode_attribute(data: &[u8]) -> Result<(String, Attribute)> {
    let mut dec = PbDecoder::new(data);
    let mut name = String::new();
    let mut attr_type = 0;
    let mut f = 0.0f32;
    let mut i = 0i64;
    let mut s = Vec::new();
    let mut floats = Vec::new();
    let mut ints = Vec::new();
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match (field, wire_type) {
            (1, 2) => name = dec.read_string()?,
            (20, 0) => attr_type = dec.read_varint()?,
            (2, 5) => f = dec.read_float()?,
            (3, 0) => i = dec.read_varint()? as i64,
            (4, 2) => s = dec.read_bytes()?.to_vec(),
            (7, 5) => floats.push(dec.read_float()? as f64),
            (7, 2) => {
                for c in dec.read_bytes()?.chunks_exact(4) {
                    floats.push(f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64);
                }
            }
            (8, 0) => ints.push(dec.read_varint()? as i64),
            (8, 2) => {
                let mut packed = PbDecoder::new(dec.read_bytes()?);
                while packed.remaining() > 0 {
                    ints.push(packed.read_varint()? as i64);
                }
            }
            _ => dec.skip_field(wire_type)?,
        }
    }
    let val = match attr_type {
        ATTR_FLOAT => Attribute::Float(f as f64),
        ATTR_INT => Attribute::Int(i),
        ATTR_STRING => Attribute::String(
            String::from_utf8(s).map_err(|_| Error::msg("attribute: invalid UTF-8 string"))?,
        ),
        ATTR_FLOATS => Attribute::Floats(floats),
        ATTR_INTS => Attribute::Ints(ints),
        other => {
            return Err(Error::msg(format!(
                "attribute {name}: unsupported type {other}"
            )))
        }
    };
    Ok((name, val))
}

fn decode_node(data: &[u8]) -> Result<DecodedNode> {
    let mut dec = PbDecoder::new(data);
    let mut node = DecodedNode {
        name: String::new(),
        op_type: String::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        attributes: Vec::new(),
        doc_string: String::new(),
    };
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match (field, wire_type) {
            (1, 2) => node.inputs.push(dec.read_string()?),
            (2, 2) => node.outputs.push(dec.read_string()?),
            (3, 2) => node.name = dec.read_string()?,
            (4, 2) => node.op_type = dec.read_string()?,
            (5, 2) => node.attributes.push(decode_attribute(dec.read_bytes()?)?),
            (6, 2) => node.doc_string = dec.read_string()?,
            _ => dec.skip_field(wire_type)?,
        }
    }
    Ok(node)
}

fn value_info_name(data: &[u8]) -> Result<String> {
    let mut dec = PbDecoder::new(data);
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        if field == 1 && wire_type == 2 {
            return dec.read_string();
        }
        dec.skip_field(wire_type)?;
    }
    Ok(String::new())
}

fn decode_graph(data: &[u8], model: &mut DecodedModel) -> Result<()> {
    let mut dec = PbDecoder::new(data);
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match (field, wire_type) {
            (1, 2) => model.nodes.push(decode_node(dec.read_bytes()?)?),
            (2, 2) => model.graph_name = dec.read_string()?,
            (11, 2) => model.inputs.push(value_info_name(dec.read_bytes()?)?),
            (12, 2) => model.outputs.push(value_info_name(dec.read_bytes()?)?),
            _ => dec.skip_field(wire_type)?,
        }
    }
    Ok(())
}

fn decode_opset(data: &[u8]) -> Result<u64> {
    let mut dec = PbDecoder::new(data);
    let mut version = 0;
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match (field, wire_type) {
            (2, 0) => version = dec.read_varint()?,
            _ => dec.skip_field(wire_type)?,
        }
    }
    Ok(version)
}

/// Read back a model written by [`to_model_bytes`].
pub fn decode_model(data: &[u8]) -> Result<DecodedModel> {
    let mut dec = PbDecoder::new(data);
    let mut model = DecodedModel::default();
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match (field, wire_type) {
            (1, 0) => model.ir_version = dec.read_varint()?,
            (2, 2) => model.producer_name = dec.read_string()?,
            (7, 2) => decode_graph(dec.read_bytes()?, &mut model)?,
            (8, 2) => model.opset = decode_opset(dec.read_bytes()?)?,
            _ => dec.skip_field(wire_type)?,
        }
    }
    Ok(model)
}

/// The nodes of an encoded model, in graph order.
pub fn decode_nodes(data: &[u8]) -> Result<Vec<DecodedNode>> {
    Ok(decode_model(data)?.nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protobuf_varint_roundtrip() {
        for val in [0u64, 1, 127, 128, 300, 16384, u64::MAX] {
            let mut enc = PbEncoder::new();
            enc.write_varint(val);
            let bytes = enc.into_bytes();
            let mut dec = PbDecoder::new(&bytes);
            assert_eq!(dec.read_varint().unwrap(), val);
            assert_eq!(dec.remaining(), 0);
        }
    }

    #[test]
    fn test_varint_encoding_bytes() {
        let mut enc = PbEncoder::new();
        enc.write_varint(300);
        assert_eq!(enc.into_bytes(), vec![0xAC, 0x02]);
    }

    #[test]
    fn test_decode_attribute_roundtrip() {
        let cases = [
            ("epsilon", Attribute::Float(1e-5)),
            ("is_test", Attribute::Int(1)),
            ("neg", Attribute::Int(-3)),
            ("order", Attribute::String("NCHW".into())),
            ("consumed_inputs", Attribute::Ints(vec![0, 0, 0, 1, 1])),
            ("scales", Attribute::Floats(vec![0.5, 2.0])),
        ];
        for (name, attr) in cases {
            let bytes = encode_attribute(name, &attr).into_bytes();
            let (got_name, got) = decode_attribute(&bytes).unwrap();
            assert_eq!(got_name, name);
            match (&attr, &got) {
                (Attribute::Float(a), Attribute::Float(b)) => assert!((a - b).abs() < 1e-9),
                _ => assert_eq!(got, attr),
            }
        }
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let mut g = Graph::new();
        let x = g.add_input(ValueType::tensor(DType::F32, [1, 2]));
        let n = g.create("Relu", &[x], 1);
        g.append_node(n).unwrap();
        let bytes = to_model_bytes(&g);
        assert!(decode_model(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_model_header() {
        let g = Graph::new();
        let opts = ExportOptions::default()
            .with_producer_name("tester")
            .with_graph_name("empty")
            .with_opset(6);
        let model = decode_model(&to_model_bytes_with(&g, &opts)).unwrap();
        assert_eq!(model.ir_version, ONNX_IR_VERSION);
        assert_eq!(model.producer_name, "tester");
        assert_eq!(model.graph_name, "empty");
        assert_eq!(model.opset, 6);
        assert!(model.nodes.is_empty());
    }

    #[test]
    fn test_dtype_codes() {
        assert_eq!(dtype_to_onnx(DType::F32), 1);
        assert_eq!(dtype_to_onnx(DType::F16), 10);
        assert_eq!(dtype_to_onnx(DType::F64), 11);
        assert_eq!(dtype_to_onnx(DType::BF16), 16);
    }
}
