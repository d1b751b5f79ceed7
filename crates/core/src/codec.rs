//! Selector token codec.
//!
//! The canonical selector form is packed with a deterministic binary
//! serializer (a MessagePack-compatible subset) and base64url-encoded into
//! the URI token. The byte output doubles as the subscription key and must
//! therefore be bit-stable: every value is written in the smallest form
//! that fits, and map keys are emitted in lexicographic order (the model's
//! `BTreeMap`s give that for free). Token keys: `e` entities, `m` meta,
//! `d` events, `a` after (16 raw bytes), `l` limit; empty containers and
//! absent limits are omitted.

use std::collections::BTreeMap;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::event_id::{EventId, EVENT_ID_BYTES};
use crate::selector::{FilterSelector, JsonPathFilter, PlainSelector, Selector};

/// Encode a selector into its URI token.
///
/// The selector is canonicalized first, so for any selector `s`,
/// `decode(&encode(s)?)? == s.canonicalize()?`.
pub fn encode(selector: &Selector) -> DomainResult<String> {
    let canonical = selector.clone().canonicalize()?;
    let mut packer = Packer::default();
    pack_selector(&mut packer, &canonical);
    Ok(URL_SAFE_NO_PAD.encode(packer.buf))
}

/// Decode a URI token back into its canonical selector.
pub fn decode(token: &str) -> DomainResult<Selector> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .or_else(|_| URL_SAFE.decode(token))
        .map_err(|_| DomainError::invalid_selector("not base64url"))?;
    let mut unpacker = Unpacker::new(&bytes);
    let selector = unpack_selector(&mut unpacker)?;
    if !unpacker.at_end() {
        return Err(DomainError::invalid_selector("trailing bytes"));
    }
    selector.canonicalize()
}

fn pack_selector(packer: &mut Packer, selector: &Selector) {
    let (after, limit, filter) = match selector {
        Selector::Plain(s) => (s.after, s.limit, None),
        Selector::Filter(s) => (s.after, s.limit, Some(s)),
    };
    let entities = filter.map(|f| &f.entities).filter(|e| !e.is_empty());
    let meta = filter.and_then(|f| f.meta.as_ref());
    let events = filter.map(|f| &f.events).filter(|d| !d.is_empty());

    let len = usize::from(after.is_some())
        + usize::from(events.is_some())
        + usize::from(entities.is_some())
        + usize::from(limit.is_some())
        + usize::from(meta.is_some());
    packer.map_header(len);

    // Lexicographic key order: a, d, e, l, m.
    if let Some(after) = after {
        packer.str("a");
        packer.bin(&after.to_bytes());
    }
    if let Some(events) = events {
        packer.str("d");
        packer.map_header(events.len());
        for (name, filter) in events {
            packer.str(name);
            pack_path_filter(packer, filter);
        }
    }
    if let Some(entities) = entities {
        packer.str("e");
        packer.map_header(entities.len());
        for (name, keys) in entities {
            packer.str(name);
            packer.array_header(keys.len());
            for key in keys {
                packer.str(key);
            }
        }
    }
    if let Some(limit) = limit {
        packer.str("l");
        packer.uint(u64::from(limit));
    }
    if let Some(meta) = meta {
        packer.str("m");
        pack_path_filter(packer, meta);
    }
}

// `{ q: query, v?: vars }`, `v` omitted when empty.
fn pack_path_filter(packer: &mut Packer, filter: &JsonPathFilter) {
    if filter.vars.is_empty() {
        packer.map_header(1);
        packer.str("q");
        packer.str(&filter.query);
    } else {
        packer.map_header(2);
        packer.str("q");
        packer.str(&filter.query);
        packer.str("v");
        packer.map_header(filter.vars.len());
        for (name, value) in &filter.vars {
            packer.str(name);
            packer.json(value);
        }
    }
}

fn unpack_selector(unpacker: &mut Unpacker<'_>) -> DomainResult<Selector> {
    let len = unpacker.map_header()?;
    let mut after = None;
    let mut limit = None;
    let mut entities = BTreeMap::new();
    let mut meta = None;
    let mut events = BTreeMap::new();
    let mut is_filter = false;

    for _ in 0..len {
        let key = unpacker.str()?;
        match key.as_str() {
            "a" => {
                let bytes = unpacker.bin()?;
                let raw: [u8; EVENT_ID_BYTES] = bytes
                    .try_into()
                    .map_err(|_| DomainError::invalid_selector("after is not 16 bytes"))?;
                after = Some(EventId::from_bytes(raw));
            }
            "l" => {
                let value = unpacker.uint()?;
                let value = u32::try_from(value)
                    .map_err(|_| DomainError::invalid_selector("limit out of range"))?;
                limit = Some(value);
            }
            "e" => {
                is_filter = true;
                let entries = unpacker.map_header()?;
                for _ in 0..entries {
                    let name = unpacker.str()?;
                    let keys = unpacker.array_header()?;
                    let mut list = Vec::with_capacity(keys);
                    for _ in 0..keys {
                        list.push(unpacker.str()?);
                    }
                    entities.insert(name, list);
                }
            }
            "m" => {
                is_filter = true;
                meta = Some(unpack_path_filter(unpacker)?);
            }
            "d" => {
                is_filter = true;
                let entries = unpacker.map_header()?;
                for _ in 0..entries {
                    let name = unpacker.str()?;
                    let filter = unpack_path_filter(unpacker)?;
                    events.insert(name, filter);
                }
            }
            other => {
                return Err(DomainError::invalid_selector(format!(
                    "unknown key {other:?}"
                )));
            }
        }
    }

    if is_filter {
        Ok(Selector::Filter(FilterSelector {
            after,
            limit,
            entities,
            meta,
            events,
        }))
    } else {
        Ok(Selector::Plain(PlainSelector { after, limit }))
    }
}

fn unpack_path_filter(unpacker: &mut Unpacker<'_>) -> DomainResult<JsonPathFilter> {
    let len = unpacker.map_header()?;
    let mut query = None;
    let mut vars = BTreeMap::new();
    for _ in 0..len {
        match unpacker.str()?.as_str() {
            "q" => query = Some(unpacker.str()?),
            "v" => {
                let entries = unpacker.map_header()?;
                for _ in 0..entries {
                    let name = unpacker.str()?;
                    vars.insert(name, unpacker.json()?);
                }
            }
            other => {
                return Err(DomainError::invalid_selector(format!(
                    "unknown filter key {other:?}"
                )));
            }
        }
    }
    Ok(JsonPathFilter {
        query: query.ok_or_else(|| DomainError::invalid_selector("filter without query"))?,
        vars,
    })
}

// Wire bytes, MessagePack encoding.
const NIL: u8 = 0xc0;
const FALSE: u8 = 0xc2;
const TRUE: u8 = 0xc3;
const BIN8: u8 = 0xc4;
const BIN16: u8 = 0xc5;
const FLOAT64: u8 = 0xcb;
const UINT8: u8 = 0xcc;
const UINT16: u8 = 0xcd;
const UINT32: u8 = 0xce;
const UINT64: u8 = 0xcf;
const INT8: u8 = 0xd0;
const INT16: u8 = 0xd1;
const INT32: u8 = 0xd2;
const INT64: u8 = 0xd3;
const STR8: u8 = 0xd9;
const STR16: u8 = 0xda;
const STR32: u8 = 0xdb;
const ARRAY16: u8 = 0xdc;
const ARRAY32: u8 = 0xdd;
const MAP16: u8 = 0xde;
const MAP32: u8 = 0xdf;

#[derive(Default)]
struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    fn map_header(&mut self, len: usize) {
        if len < 16 {
            self.buf.push(0x80 | len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.push(MAP16);
            self.buf.extend((len as u16).to_be_bytes());
        } else {
            self.buf.push(MAP32);
            self.buf.extend((len as u32).to_be_bytes());
        }
    }

    fn array_header(&mut self, len: usize) {
        if len < 16 {
            self.buf.push(0x90 | len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.push(ARRAY16);
            self.buf.extend((len as u16).to_be_bytes());
        } else {
            self.buf.push(ARRAY32);
            self.buf.extend((len as u32).to_be_bytes());
        }
    }

    fn str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        match bytes.len() {
            len if len < 32 => self.buf.push(0xa0 | len as u8),
            len if len <= u8::MAX as usize => {
                self.buf.push(STR8);
                self.buf.push(len as u8);
            }
            len if len <= u16::MAX as usize => {
                self.buf.push(STR16);
                self.buf.extend((len as u16).to_be_bytes());
            }
            len => {
                self.buf.push(STR32);
                self.buf.extend((len as u32).to_be_bytes());
            }
        }
        self.buf.extend_from_slice(bytes);
    }

    fn bin(&mut self, bytes: &[u8]) {
        if bytes.len() <= u8::MAX as usize {
            self.buf.push(BIN8);
            self.buf.push(bytes.len() as u8);
        } else {
            self.buf.push(BIN16);
            self.buf.extend((bytes.len() as u16).to_be_bytes());
        }
        self.buf.extend_from_slice(bytes);
    }

    fn uint(&mut self, value: u64) {
        if value < 0x80 {
            self.buf.push(value as u8);
        } else if value <= u8::MAX as u64 {
            self.buf.push(UINT8);
            self.buf.push(value as u8);
        } else if value <= u16::MAX as u64 {
            self.buf.push(UINT16);
            self.buf.extend((value as u16).to_be_bytes());
        } else if value <= u32::MAX as u64 {
            self.buf.push(UINT32);
            self.buf.extend((value as u32).to_be_bytes());
        } else {
            self.buf.push(UINT64);
            self.buf.extend(value.to_be_bytes());
        }
    }

    fn int(&mut self, value: i64) {
        if value >= 0 {
            self.uint(value as u64);
        } else if value >= -32 {
            self.buf.push(value as u8);
        } else if value >= i8::MIN as i64 {
            self.buf.push(INT8);
            self.buf.push(value as u8);
        } else if value >= i16::MIN as i64 {
            self.buf.push(INT16);
            self.buf.extend((value as i16).to_be_bytes());
        } else if value >= i32::MIN as i64 {
            self.buf.push(INT32);
            self.buf.extend((value as i32).to_be_bytes());
        } else {
            self.buf.push(INT64);
            self.buf.extend(value.to_be_bytes());
        }
    }

    fn json(&mut self, value: &Value) {
        match value {
            Value::Null => self.buf.push(NIL),
            Value::Bool(false) => self.buf.push(FALSE),
            Value::Bool(true) => self.buf.push(TRUE),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    self.uint(u);
                } else if let Some(i) = n.as_i64() {
                    self.int(i);
                } else {
                    self.buf.push(FLOAT64);
                    self.buf.extend(n.as_f64().unwrap_or(f64::NAN).to_be_bytes());
                }
            }
            Value::String(s) => self.str(s),
            Value::Array(items) => {
                self.array_header(items.len());
                for item in items {
                    self.json(item);
                }
            }
            Value::Object(map) => {
                self.map_header(map.len());
                for (key, item) in map {
                    self.str(key);
                    self.json(item);
                }
            }
        }
    }
}

struct Unpacker<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn truncated() -> DomainError {
        DomainError::invalid_selector("truncated")
    }

    fn byte(&mut self) -> DomainResult<u8> {
        let b = *self.data.get(self.pos).ok_or_else(Self::truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> DomainResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(Self::truncated)?;
        let slice = self.data.get(self.pos..end).ok_or_else(Self::truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn be_u16(&mut self) -> DomainResult<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn be_u32(&mut self) -> DomainResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn map_header(&mut self) -> DomainResult<usize> {
        match self.byte()? {
            b if b & 0xf0 == 0x80 => Ok((b & 0x0f) as usize),
            MAP16 => Ok(self.be_u16()? as usize),
            MAP32 => Ok(self.be_u32()? as usize),
            other => Err(DomainError::invalid_selector(format!(
                "expected map, found byte {other:#04x}"
            ))),
        }
    }

    fn array_header(&mut self) -> DomainResult<usize> {
        match self.byte()? {
            b if b & 0xf0 == 0x90 => Ok((b & 0x0f) as usize),
            ARRAY16 => Ok(self.be_u16()? as usize),
            ARRAY32 => Ok(self.be_u32()? as usize),
            other => Err(DomainError::invalid_selector(format!(
                "expected array, found byte {other:#04x}"
            ))),
        }
    }

    fn str(&mut self) -> DomainResult<String> {
        let len = match self.byte()? {
            b if b & 0xe0 == 0xa0 => (b & 0x1f) as usize,
            STR8 => self.byte()? as usize,
            STR16 => self.be_u16()? as usize,
            STR32 => self.be_u32()? as usize,
            other => {
                return Err(DomainError::invalid_selector(format!(
                    "expected string, found byte {other:#04x}"
                )));
            }
        };
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DomainError::invalid_selector("string is not UTF-8"))
    }

    fn bin(&mut self) -> DomainResult<&'a [u8]> {
        let len = match self.byte()? {
            BIN8 => self.byte()? as usize,
            BIN16 => self.be_u16()? as usize,
            other => {
                return Err(DomainError::invalid_selector(format!(
                    "expected binary, found byte {other:#04x}"
                )));
            }
        };
        self.take(len)
    }

    fn uint(&mut self) -> DomainResult<u64> {
        match self.byte()? {
            b if b < 0x80 => Ok(u64::from(b)),
            UINT8 => Ok(u64::from(self.byte()?)),
            UINT16 => Ok(u64::from(self.be_u16()?)),
            UINT32 => Ok(u64::from(self.be_u32()?)),
            UINT64 => Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap())),
            other => Err(DomainError::invalid_selector(format!(
                "expected unsigned integer, found byte {other:#04x}"
            ))),
        }
    }

    fn json(&mut self) -> DomainResult<Value> {
        let marker = *self.data.get(self.pos).ok_or_else(Self::truncated)?;
        match marker {
            NIL => {
                self.pos += 1;
                Ok(Value::Null)
            }
            FALSE => {
                self.pos += 1;
                Ok(Value::Bool(false))
            }
            TRUE => {
                self.pos += 1;
                Ok(Value::Bool(true))
            }
            b if b < 0x80 || b == UINT8 || b == UINT16 || b == UINT32 || b == UINT64 => {
                Ok(Value::from(self.uint()?))
            }
            b if b >= 0xe0 => {
                self.pos += 1;
                Ok(Value::from(b as i8 as i64))
            }
            INT8 => {
                self.pos += 1;
                Ok(Value::from(self.byte()? as i8 as i64))
            }
            INT16 => {
                self.pos += 1;
                Ok(Value::from(i16::from_be_bytes(
                    self.take(2)?.try_into().unwrap(),
                )))
            }
            INT32 => {
                self.pos += 1;
                Ok(Value::from(i32::from_be_bytes(
                    self.take(4)?.try_into().unwrap(),
                )))
            }
            INT64 => {
                self.pos += 1;
                Ok(Value::from(i64::from_be_bytes(
                    self.take(8)?.try_into().unwrap(),
                )))
            }
            FLOAT64 => {
                self.pos += 1;
                let raw = f64::from_be_bytes(self.take(8)?.try_into().unwrap());
                serde_json::Number::from_f64(raw)
                    .map(Value::Number)
                    .ok_or_else(|| DomainError::invalid_selector("non-finite number"))
            }
            b if b & 0xe0 == 0xa0 || b == STR8 || b == STR16 || b == STR32 => {
                Ok(Value::String(self.str()?))
            }
            b if b & 0xf0 == 0x90 || b == ARRAY16 || b == ARRAY32 => {
                let len = self.array_header()?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.json()?);
                }
                Ok(Value::Array(items))
            }
            b if b & 0xf0 == 0x80 || b == MAP16 || b == MAP32 => {
                let len = self.map_header()?;
                let mut map = serde_json::Map::new();
                for _ in 0..len {
                    let key = self.str()?;
                    map.insert(key, self.json()?);
                }
                Ok(Value::Object(map))
            }
            other => Err(DomainError::invalid_selector(format!(
                "unsupported value byte {other:#04x}"
            ))),
        }
    }
}
