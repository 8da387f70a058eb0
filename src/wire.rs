//! Wire-level request/response envelopes and the filesystem value types
//! that travel inside them (C1 §"every wire entity").

use crate::codec::{Decode, Decoder, Encode, Encoder};
use crate::error::{Error, Result, SerializableError};

pub const STATUS_OK: u32 = 200;
pub const STATUS_BULK: u32 = 213;
pub const STATUS_FORBIDDEN: u32 = 403;
pub const STATUS_NOT_FOUND: u32 = 404;
pub const STATUS_INTERNAL: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub payload: Vec<u8>,
}

impl Encode for Request {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_string(&self.method);
        buf.write_bytes(&self.payload);
    }
}

impl Decode for Request {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(Request {
            method: buf.read_string()?,
            payload: buf.read_bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u32,
    pub message: String,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok(data: Vec<u8>) -> Self {
        Response {
            status: STATUS_OK,
            message: String::new(),
            data,
        }
    }

    pub fn bulk_header() -> Self {
        Response {
            status: STATUS_BULK,
            message: String::new(),
            data: Vec::new(),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let status = err.status_code();
        let message = err.to_string();
        let serr = SerializableError::from(err);
        Response {
            status,
            message,
            data: serr.encode_to_vec(),
        }
    }

    pub fn into_result(self) -> Result<Vec<u8>> {
        if self.status == STATUS_OK || self.status == STATUS_BULK {
            Ok(self.data)
        } else {
            let serr = SerializableError::decode_from_slice(&self.data)
                .unwrap_or(SerializableError {
                    kind: "unknown".into(),
                    message: self.message,
                    op: String::new(),
                    path: String::new(),
                });
            Err(serr.into_error())
        }
    }
}

impl Encode for Response {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_u32(self.status);
        buf.write_string(&self.message);
        buf.write_bytes(&self.data);
    }
}

impl Decode for Response {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(Response {
            status: buf.read_u32()?,
            message: buf.read_string()?,
            data: buf.read_bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VSSFileInfo {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    pub mod_time_unix_nanos: i64,
    pub is_dir: bool,
    pub blocks: u64,
}

impl Encode for VSSFileInfo {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_string(&self.name);
        buf.write_i64(self.size);
        buf.write_u32(self.mode);
        buf.write_time_unix_nanos(self.mod_time_unix_nanos);
        buf.write_bool(self.is_dir);
        buf.write_u64(self.blocks);
    }
}

impl Decode for VSSFileInfo {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(VSSFileInfo {
            name: buf.read_string()?,
            size: buf.read_i64()?,
            mode: buf.read_u32()?,
            mod_time_unix_nanos: buf.read_time_unix_nanos()?,
            is_dir: buf.read_bool()?,
            blocks: buf.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VSSDirEntry {
    pub name: String,
    pub mode: u32,
}

impl Encode for VSSDirEntry {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_string(&self.name);
        buf.write_u32(self.mode);
    }
}

impl Decode for VSSDirEntry {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(VSSDirEntry {
            name: buf.read_string()?,
            mode: buf.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadDirEntries {
    pub entries: Vec<VSSDirEntry>,
}

impl Encode for ReadDirEntries {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_u32(self.entries.len() as u32);
        for e in &self.entries {
            e.encode(buf);
        }
    }
}

impl Decode for ReadDirEntries {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        let count = buf.read_u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(VSSDirEntry::decode(buf)?);
        }
        Ok(ReadDirEntries { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatFS {
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub name_len: u64,
}

impl Encode for StatFS {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_u64(self.bsize);
        buf.write_u64(self.blocks);
        buf.write_u64(self.bfree);
        buf.write_u64(self.bavail);
        buf.write_u64(self.files);
        buf.write_u64(self.ffree);
        buf.write_u64(self.name_len);
    }
}

impl Decode for StatFS {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(StatFS {
            bsize: buf.read_u64()?,
            blocks: buf.read_u64()?,
            bfree: buf.read_u64()?,
            bavail: buf.read_u64()?,
            files: buf.read_u64()?,
            ffree: buf.read_u64()?,
            name_len: buf.read_u64()?,
        })
    }
}

/// `OpenFile(path, flag, perm)` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFileReq {
    pub path: String,
    pub flag: u32,
    pub perm: u32,
}

impl Encode for OpenFileReq {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_string(&self.path);
        buf.write_u32(self.flag);
        buf.write_u32(self.perm);
    }
}

impl Decode for OpenFileReq {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(OpenFileReq {
            path: buf.read_string()?,
            flag: buf.read_u32()?,
            perm: buf.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathReq {
    pub path: String,
}

impl Encode for PathReq {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_string(&self.path);
    }
}

impl Decode for PathReq {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(PathReq {
            path: buf.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandleId {
    pub id: u64,
}

impl Encode for FileHandleId {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_u64(self.id);
    }
}

impl Decode for FileHandleId {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(FileHandleId {
            id: buf.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAtReq {
    pub handle: u64,
    pub offset: i64,
    pub length: u32,
}

impl Encode for ReadAtReq {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_u64(self.handle);
        buf.write_i64(self.offset);
        buf.write_u32(self.length);
    }
}

impl Decode for ReadAtReq {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(ReadAtReq {
            handle: buf.read_u64()?,
            offset: buf.read_i64()?,
            length: buf.read_u32()?,
        })
    }
}

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;
pub const SEEK_DATA: u32 = 3;
pub const SEEK_HOLE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LseekReq {
    pub handle: u64,
    pub offset: i64,
    pub whence: u32,
}

impl Encode for LseekReq {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_u64(self.handle);
        buf.write_i64(self.offset);
        buf.write_u32(self.whence);
    }
}

impl Decode for LseekReq {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(LseekReq {
            handle: buf.read_u64()?,
            offset: buf.read_i64()?,
            whence: buf.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LseekResp {
    pub new_offset: i64,
}

impl Encode for LseekResp {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_i64(self.new_offset);
    }
}

impl Decode for LseekResp {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(LseekResp {
            new_offset: buf.read_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReq {
    pub handle: u64,
}

impl Encode for CloseReq {
    fn encode(&self, buf: &mut Encoder) {
        buf.write_u64(self.handle);
    }
}

impl Decode for CloseReq {
    fn decode(buf: &mut Decoder) -> Result<Self> {
        Ok(CloseReq {
            handle: buf.read_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vss_file_info_round_trips() {
        let info = VSSFileInfo {
            name: "test1.txt".into(),
            size: 19,
            mode: 0o644,
            mod_time_unix_nanos: 1_700_000_000_000_000_000,
            is_dir: false,
            blocks: 1,
        };
        let bytes = info.encode_to_vec();
        let back = VSSFileInfo::decode_from_slice(&bytes).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn response_error_round_trip_preserves_kind() {
        let err = Error::NotFound;
        let resp = Response::from_error(&err);
        assert_eq!(resp.status, STATUS_NOT_FOUND);
        let result = resp.into_result();
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn read_dir_entries_round_trip() {
        let entries = ReadDirEntries {
            entries: vec![
                VSSDirEntry {
                    name: "a".into(),
                    mode: 0o644,
                },
                VSSDirEntry {
                    name: "subdir".into(),
                    mode: 0o755 | 0x8000_0000,
                },
            ],
        };
        let bytes = entries.encode_to_vec();
        let back = ReadDirEntries::decode_from_slice(&bytes).unwrap();
        assert_eq!(entries, back);
    }
}
