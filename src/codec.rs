use std::collections::HashMap;

use crate::error::{JoinError, Result};

/// Pixel parameters recognized out of the box, as emitted by the front-end
/// tracking tag. Ids 100+ are the localized query-string variants.
const DEFAULT_PARAMS: &[(&str, u32)] = &[
    ("dw_ab", 1),
    ("l", 2),
    ("u_x", 3),
    ("u_y", 4),
    ("is", 5),
    ("pg", 6),
    ("q_cat1", 7),
    ("q_cat2", 8),
    ("q_cat3", 9),
    ("slrid", 10),
    ("i", 11),
    ("s", 12),
    ("ml", 13),
    ("adm", 14),
    ("lgn", 15),
    ("slr", 16),
    ("lng", 17),
    ("dwnid", 18),
    ("fnm", 19),
    ("r_url", 20),
    ("r_nm", 21),
    ("r_cpn", 22),
    ("x", 23),
    ("qx", 24),
    ("cs", 25),
    ("qt", 26),
    ("qstr~de", 100),
    ("qstr~pl", 101),
    ("qstr~en", 102),
    ("qstr~fr", 103),
    ("qstr~it", 104),
    ("qstr~nl", 105),
    ("qstr~es", 106),
];

/// Injective mapping between short pixel parameter names and small integer
/// ids. The mapping is fixed once the core is constructed; `register` exists
/// for construction-time extension only.
#[derive(Debug, Clone)]
pub struct PixelParams {
    ids: HashMap<String, u32>,
    names: HashMap<u32, String>,
}

/// One event record decoded back out of its stored wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub time_s: u64,
    pub evid: String,
    pub params: Vec<(String, String)>,
}

impl PixelParams {
    pub fn empty() -> Self {
        Self {
            ids: HashMap::new(),
            names: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut params = Self::empty();
        for &(name, id) in DEFAULT_PARAMS {
            params.register(name, id);
        }
        params
    }

    /// Registers a name↔id pair. Duplicate names or ids are programmer
    /// errors and panic.
    pub fn register(&mut self, name: &str, id: u32) {
        assert!(
            self.ids.insert(name.to_string(), id).is_none(),
            "duplicate pixel param name: {name}"
        );
        assert!(
            self.names.insert(id, name.to_string()).is_none(),
            "duplicate pixel param id: {id}"
        );
    }

    pub fn id_of(&self, name: &str) -> Result<u32> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| JoinError::UnknownParam(name.to_string()))
    }

    pub fn name_of(&self, id: u32) -> Result<&str> {
        self.names
            .get(&id)
            .map(String::as_str)
            .ok_or(JoinError::UnknownParamId(u64::from(id)))
    }

    /// Packs one event into its stored wire form: timestamp in whole seconds
    /// (varint), length-prefixed event id, then `(param id, value)` pairs
    /// until the end of the buffer.
    pub fn encode_event(
        &self,
        time_s: u64,
        evid: &str,
        params: &[(String, String)],
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + evid.len());
        write_uvarint(&mut buf, time_s);
        write_uvarint(&mut buf, evid.len() as u64);
        buf.extend_from_slice(evid.as_bytes());
        for (name, value) in params {
            write_uvarint(&mut buf, u64::from(self.id_of(name)?));
            write_uvarint(&mut buf, value.len() as u64);
            buf.extend_from_slice(value.as_bytes());
        }
        Ok(buf)
    }

    pub fn decode_event(&self, buf: &[u8]) -> Result<DecodedEvent> {
        let mut pos = 0;
        let time_s = read_uvarint(buf, &mut pos)?;
        let evid_len = read_uvarint(buf, &mut pos)? as usize;
        let evid = String::from_utf8(read_bytes(buf, &mut pos, evid_len)?.to_vec())
            .map_err(|_| JoinError::Decode("event id is not utf-8".into()))?;

        let mut params = Vec::new();
        while pos < buf.len() {
            let raw_id = read_uvarint(buf, &mut pos)?;
            let id = u32::try_from(raw_id).map_err(|_| JoinError::UnknownParamId(raw_id))?;
            let name = self.name_of(id)?.to_string();
            let len = read_uvarint(buf, &mut pos)? as usize;
            let value = String::from_utf8(read_bytes(buf, &mut pos, len)?.to_vec())
                .map_err(|_| JoinError::Decode("param value is not utf-8".into()))?;
            params.push((name, value));
        }

        Ok(DecodedEvent {
            time_s,
            evid,
            params,
        })
    }
}

impl Default for PixelParams {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Reads just the leading timestamp varint of a stored event record. The
/// bootstrap scan uses this to rebuild deadlines without a full decode.
pub fn read_event_time(buf: &[u8]) -> Result<u64> {
    let mut pos = 0;
    read_uvarint(buf, &mut pos)
}

pub(crate) fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub(crate) fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| JoinError::Decode("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(JoinError::Decode("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub(crate) fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| JoinError::Decode("truncated event record".into()))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}
