use std::collections::BTreeMap;

use crate::data::{SpecData, SCALAR_KEY};
use crate::error::SpecError;

pub const MAGIC: u32 = 0xFEED_FACE;
/// Protocol generation spoken by this library.
pub const PROTOCOL_VERSION: u32 = 4;
/// Identity advertised in outgoing HELLO frames.
pub const CLIENT_NAME: &str = "spec-client";

/// EVENT flag: the listed sub-keys have been removed on the server.
pub const DELETED: u32 = 0x1000;

// magic, vers, size, sn, cmd, type, flags, err, len
const FIXED_LEN: usize = 36;
const NAME_LEN_V2: usize = 32;
const NAME_LEN_V3: usize = 80;
// Upper bound on a sane payload, to fail fast on garbage lengths.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Close = 1,
    Abort = 2,
    Cmd = 3,
    CmdWithReturn = 4,
    Register = 6,
    Unregister = 7,
    Event = 8,
    Func = 9,
    FuncWithReturn = 10,
    ChanRead = 11,
    ChanSend = 12,
    Reply = 13,
    Hello = 14,
    HelloReply = 15,
}

impl Opcode {
    fn from_u32(v: u32) -> Option<Opcode> {
        Some(match v {
            1 => Opcode::Close,
            2 => Opcode::Abort,
            3 => Opcode::Cmd,
            4 => Opcode::CmdWithReturn,
            6 => Opcode::Register,
            7 => Opcode::Unregister,
            8 => Opcode::Event,
            9 => Opcode::Func,
            10 => Opcode::FuncWithReturn,
            11 => Opcode::ChanRead,
            12 => Opcode::ChanSend,
            13 => Opcode::Reply,
            14 => Opcode::Hello,
            15 => Opcode::HelloReply,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    Null = 0,
    Double = 1,
    String = 2,
    Error = 3,
    Assoc = 4,
    Int = 5,
    Array = 6,
}

impl DataType {
    fn from_u32(v: u32) -> Option<DataType> {
        Some(match v {
            0 => DataType::Null,
            1 => DataType::Double,
            2 => DataType::String,
            3 => DataType::Error,
            4 => DataType::Assoc,
            5 => DataType::Int,
            6 => DataType::Array,
            _ => return None,
        })
    }

    pub fn of(data: &SpecData) -> DataType {
        match data {
            SpecData::Null => DataType::Null,
            SpecData::Int(_) => DataType::Int,
            SpecData::Double(_) => DataType::Double,
            SpecData::Str(_) => DataType::String,
            SpecData::Assoc(_) => DataType::Assoc,
            SpecData::Array(_) => DataType::Array,
        }
    }
}

/// One protocol frame.
///
/// The header is self-delimiting: `size` names the header length, so a
/// frame decodes without knowing the peer's generation beforehand. The
/// generation only changes the width of the name field (32 bytes before
/// version 3, 80 from version 3 on).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub vers: u32,
    pub sn: u32,
    pub cmd: Opcode,
    pub kind: DataType,
    pub flags: u32,
    pub err: i32,
    pub name: String,
    pub data: SpecData,
}

fn name_len(vers: u32) -> usize {
    if vers < 3 {
        NAME_LEN_V2
    } else {
        NAME_LEN_V3
    }
}

impl Message {
    fn base(version: Option<u32>, cmd: Opcode) -> Message {
        Message {
            vers: version.unwrap_or(PROTOCOL_VERSION),
            sn: 0,
            cmd,
            kind: DataType::Null,
            flags: 0,
            err: 0,
            name: String::new(),
            data: SpecData::Null,
        }
    }

    fn with_data(mut self, data: SpecData) -> Message {
        self.kind = DataType::of(&data);
        self.data = data;
        self
    }

    pub fn hello(version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::Hello);
        m.name = CLIENT_NAME.to_string();
        m
    }

    /// Server side of the handshake; used by the scripted peers in tests.
    pub fn hello_reply(sn: u32, identity: &str, version: u32) -> Message {
        let mut m = Message::base(Some(version), Opcode::HelloReply);
        m.sn = sn;
        m.name = identity.to_string();
        m
    }

    pub fn cmd(command: &str, version: Option<u32>) -> Message {
        Message::base(version, Opcode::Cmd).with_data(SpecData::Str(command.to_string()))
    }

    pub fn cmd_with_return(sn: u32, command: &str, version: Option<u32>) -> Message {
        let mut m =
            Message::base(version, Opcode::CmdWithReturn).with_data(SpecData::Str(command.to_string()));
        m.sn = sn;
        m
    }

    pub fn func(call: Vec<SpecData>, version: Option<u32>) -> Message {
        Message::base(version, Opcode::Func).with_data(SpecData::Array(call))
    }

    pub fn func_with_return(sn: u32, call: Vec<SpecData>, version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::FuncWithReturn).with_data(SpecData::Array(call));
        m.sn = sn;
        m
    }

    pub fn chan_read(sn: u32, channel: &str, version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::ChanRead);
        m.sn = sn;
        m.name = channel.to_string();
        m
    }

    pub fn chan_send(channel: &str, value: SpecData, version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::ChanSend).with_data(value);
        m.name = channel.to_string();
        m
    }

    pub fn register(channel: &str, version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::Register);
        m.name = channel.to_string();
        m
    }

    pub fn unregister(channel: &str, version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::Unregister);
        m.name = channel.to_string();
        m
    }

    pub fn event(channel: &str, value: SpecData, deleted: bool, version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::Event).with_data(value);
        m.name = channel.to_string();
        if deleted {
            m.flags |= DELETED;
        }
        m
    }

    pub fn reply(sn: u32, value: SpecData, version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::Reply).with_data(value);
        m.sn = sn;
        m
    }

    pub fn reply_error(sn: u32, code: i32, text: &str, version: Option<u32>) -> Message {
        let mut m = Message::base(version, Opcode::Reply);
        m.sn = sn;
        m.kind = DataType::Error;
        m.err = code;
        m.data = SpecData::Str(text.to_string());
        m
    }

    pub fn abort(version: Option<u32>) -> Message {
        Message::base(version, Opcode::Abort)
    }

    pub fn close(version: Option<u32>) -> Message {
        Message::base(version, Opcode::Close)
    }

    /// Serialize the frame; the header width follows `self.vers`.
    pub fn encode(&self) -> Vec<u8> {
        let payload = encode_value(self.kind, &self.data);
        let nlen = name_len(self.vers);
        let mut out = Vec::with_capacity(FIXED_LEN + nlen + payload.len());
        put_u32(&mut out, MAGIC);
        put_u32(&mut out, self.vers);
        put_u32(&mut out, (FIXED_LEN + nlen) as u32);
        put_u32(&mut out, self.sn);
        put_u32(&mut out, self.cmd as u32);
        put_u32(&mut out, self.kind as u32);
        put_u32(&mut out, self.flags);
        put_u32(&mut out, self.err as u32);
        put_u32(&mut out, payload.len() as u32);
        let mut name = [0u8; NAME_LEN_V3];
        let raw = self.name.as_bytes();
        let n = raw.len().min(nlen - 1);
        name[..n].copy_from_slice(&raw[..n]);
        out.extend_from_slice(&name[..nlen]);
        out.extend_from_slice(&payload);
        out
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `None` when more bytes are needed; nothing is consumed in
    /// that case. On success the frame and the exact number of consumed
    /// bytes are returned.
    pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, SpecError> {
        if buf.len() < FIXED_LEN {
            return Ok(None);
        }
        let magic = get_u32(buf, 0);
        if magic != MAGIC {
            return Err(SpecError::BadFrame(format!("bad magic {magic:#x}")));
        }
        let vers = get_u32(buf, 4);
        let size = get_u32(buf, 8) as usize;
        let sn = get_u32(buf, 12);
        let cmd = get_u32(buf, 16);
        let kind = get_u32(buf, 20);
        let flags = get_u32(buf, 24);
        let err = get_u32(buf, 28) as i32;
        let len = get_u32(buf, 32) as usize;
        if size < FIXED_LEN || size > FIXED_LEN + NAME_LEN_V3 {
            return Err(SpecError::BadFrame(format!("bad header size {size}")));
        }
        if len > MAX_PAYLOAD {
            return Err(SpecError::BadFrame(format!("payload too large: {len}")));
        }
        if buf.len() < size + len {
            return Ok(None);
        }
        let cmd =
            Opcode::from_u32(cmd).ok_or_else(|| SpecError::BadFrame(format!("unknown opcode {cmd}")))?;
        let kind = DataType::from_u32(kind)
            .ok_or_else(|| SpecError::BadFrame(format!("unknown data type {kind}")))?;
        let name_bytes = &buf[FIXED_LEN..size];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
        let mut data = decode_value(kind, &buf[size..size + len])?;
        let mut kind = kind;
        // A mapping of exactly one entry under the synthetic scalar key is
        // the wire form of a bare scalar.
        let unwrapped = match &data {
            SpecData::Assoc(map) if map.len() == 1 && map.contains_key(SCALAR_KEY) => {
                Some(map[SCALAR_KEY].clone())
            }
            _ => None,
        };
        if let Some(scalar) = unwrapped {
            kind = DataType::of(&scalar);
            data = scalar;
        }
        Ok(Some((
            Message {
                vers,
                sn,
                cmd,
                kind,
                flags,
                err,
                name,
                data,
            },
            size + len,
        )))
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(
        buf[off..off + 4]
            .try_into()
            .expect("can't happen: four bytes can't be made into u32?"),
    )
}

fn encode_value(kind: DataType, data: &SpecData) -> Vec<u8> {
    match kind {
        DataType::Null => Vec::new(),
        DataType::Int | DataType::Double | DataType::String | DataType::Error => {
            let mut out = data.as_text().into_bytes();
            out.push(0);
            out
        }
        DataType::Assoc => {
            let mut out = Vec::new();
            if let SpecData::Assoc(map) = data {
                for (key, value) in map {
                    out.extend_from_slice(key.as_bytes());
                    out.push(0);
                    encode_cell(&mut out, value);
                }
            }
            out
        }
        DataType::Array => {
            let mut out = Vec::new();
            if let SpecData::Array(items) = data {
                put_u32(&mut out, items.len() as u32);
                for item in items {
                    encode_cell(&mut out, item);
                }
            } else {
                put_u32(&mut out, 0);
            }
            out
        }
    }
}

fn encode_cell(out: &mut Vec<u8>, value: &SpecData) {
    let kind = DataType::of(value);
    let bytes = encode_value(kind, value);
    put_u32(out, kind as u32);
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(&bytes);
}

fn decode_value(kind: DataType, bytes: &[u8]) -> Result<SpecData, SpecError> {
    Ok(match kind {
        DataType::Null => SpecData::Null,
        DataType::Int => {
            let text = text_of(bytes);
            match text.parse::<i32>() {
                Ok(i) => SpecData::Int(i),
                Err(_) => SpecData::coerce(&text),
            }
        }
        DataType::Double => {
            let text = text_of(bytes);
            match text.parse::<f64>() {
                Ok(d) => SpecData::Double(d),
                Err(_) => SpecData::coerce(&text),
            }
        }
        DataType::String | DataType::Error => SpecData::Str(text_of(bytes)),
        DataType::Assoc => {
            let mut map = BTreeMap::new();
            let mut off = 0;
            while off < bytes.len() {
                let key_end = bytes[off..]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| SpecError::BadFrame("unterminated assoc key".into()))?;
                let key = String::from_utf8_lossy(&bytes[off..off + key_end]).into_owned();
                off += key_end + 1;
                let (value, used) = decode_cell(&bytes[off..])?;
                off += used;
                map.insert(key, value);
            }
            SpecData::Assoc(map)
        }
        DataType::Array => {
            if bytes.len() < 4 {
                return Err(SpecError::BadFrame("truncated array payload".into()));
            }
            let count = get_u32(bytes, 0) as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            let mut off = 4;
            for _ in 0..count {
                let (value, used) = decode_cell(&bytes[off..])?;
                off += used;
                items.push(value);
            }
            SpecData::Array(items)
        }
    })
}

fn decode_cell(bytes: &[u8]) -> Result<(SpecData, usize), SpecError> {
    if bytes.len() < 8 {
        return Err(SpecError::BadFrame("truncated cell".into()));
    }
    let kind = DataType::from_u32(get_u32(bytes, 0))
        .ok_or_else(|| SpecError::BadFrame("unknown cell type".into()))?;
    let len = get_u32(bytes, 4) as usize;
    if bytes.len() < 8 + len {
        return Err(SpecError::BadFrame("truncated cell payload".into()));
    }
    Ok((decode_value(kind, &bytes[8..8 + len])?, 8 + len))
}

fn text_of(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assoc(entries: &[(&str, SpecData)]) -> SpecData {
        SpecData::Assoc(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn round_trip(msg: Message) {
        let bytes = msg.encode();
        let (decoded, used) = Message::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_all_frames_both_generations() {
        for version in [2, PROTOCOL_VERSION] {
            let v = Some(version);
            round_trip(Message::hello(v));
            round_trip(Message::hello_reply(1, "main", version));
            round_trip(Message::cmd("mv th 1.5", v));
            round_trip(Message::cmd_with_return(7, "1+1", v));
            round_trip(Message::func(
                vec![SpecData::Str("wa".into())],
                v,
            ));
            round_trip(Message::func_with_return(
                9,
                vec![SpecData::Str("count".into()), SpecData::Double(1.0)],
                v,
            ));
            round_trip(Message::chan_read(3, "var/TOTO", v));
            round_trip(Message::chan_send("var/TOTO", SpecData::Int(4), v));
            round_trip(Message::register("motor/th/position", v));
            round_trip(Message::unregister("motor/th/position", v));
            round_trip(Message::event(
                "var/ARR",
                assoc(&[("a", assoc(&[("k", SpecData::Str("1".into()))]))]),
                true,
                v,
            ));
            round_trip(Message::reply(5, SpecData::Double(0.0), v));
            round_trip(Message::reply_error(5, 13, "no such macro", v));
            round_trip(Message::abort(v));
            round_trip(Message::close(v));
        }
    }

    #[test]
    fn generations_differ_in_header_width() {
        let old = Message::register("var/A", Some(2)).encode();
        let new = Message::register("var/A", Some(4)).encode();
        assert_eq!(old.len(), 36 + 32);
        assert_eq!(new.len(), 36 + 80);
    }

    #[test]
    fn partial_frames_consume_nothing() {
        let bytes = Message::cmd_with_return(1, "date()", None).encode();
        for cut in [0, 1, 10, 36, bytes.len() - 1] {
            assert!(Message::decode(&bytes[..cut]).unwrap().is_none());
        }
        // Two frames back to back decode one at a time.
        let mut two = bytes.clone();
        two.extend_from_slice(&Message::abort(None).encode());
        let (first, used) = Message::decode(&two).unwrap().unwrap();
        assert_eq!(first.cmd, Opcode::CmdWithReturn);
        let (second, _) = Message::decode(&two[used..]).unwrap().unwrap();
        assert_eq!(second.cmd, Opcode::Abort);
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut bytes = Message::abort(None).encode();
        bytes[0] ^= 0xff;
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn scalar_key_unwraps_on_decode() {
        let wire = Message::event("var/FOO", assoc(&[("", SpecData::Int(7))]), false, None);
        let (decoded, _) = Message::decode(&wire.encode()).unwrap().unwrap();
        assert_eq!(decoded.data, SpecData::Int(7));
        assert_eq!(decoded.kind, DataType::Int);
    }

    #[test]
    fn error_replies_keep_code_and_text() {
        let (decoded, _) =
            Message::decode(&Message::reply_error(4, 2, "syntax error", None).encode())
                .unwrap()
                .unwrap();
        assert_eq!(decoded.kind, DataType::Error);
        assert_eq!(decoded.err, 2);
        assert_eq!(decoded.data, SpecData::Str("syntax error".into()));
    }

    #[test]
    fn deleted_flag_survives() {
        let wire = Message::event("var/A", assoc(&[("k", SpecData::Null)]), true, None);
        let (decoded, _) = Message::decode(&wire.encode()).unwrap().unwrap();
        assert_ne!(decoded.flags & DELETED, 0);
    }

    #[test]
    fn nested_assoc_payload() {
        let value = assoc(&[
            ("x", assoc(&[("y", SpecData::Str("2.5".into())), ("z", SpecData::Str("nope".into()))])),
            ("w", SpecData::Int(3)),
        ]);
        round_trip(Message::chan_send("var/T", value, None));
    }
}
