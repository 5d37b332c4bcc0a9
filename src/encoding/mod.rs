//! Binary item codec.
//!
//! Data files are a sequence of self-describing blocks framed the way a
//! minimal protobuf message is: a varint tag carrying the field number and
//! wire type, then for length-delimited blocks a varint length and the raw
//! payload. The codec is a pure transform; it knows nothing about which
//! field numbers a data file uses; callers classify decoded tags against
//! their own schema and reject what they do not recognize.

pub mod frame;
pub mod varint;

pub use frame::{
    decode_len_prefixed, decode_tag, encode_len_prefixed, encode_tag, frame_len,
    put_frame_header, read_len_prefixed_into, read_tag, Tag, WireType,
};
pub use varint::{decode_varint, put_varint, read_varint, varint_len, MAX_VARINT_LEN};
