use serde::{Serialize, Serializer};

use crate::{
    codec::{read_bytes, read_uvarint, write_uvarint},
    error::{JoinError, Result},
};

const ENVELOPE_VERSION: u64 = 1;

/// Event type as encoded in the single-character `e` pixel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Query,
    View,
    Click,
    UserUpdate,
}

impl EventKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'q' => Some(Self::Query),
            b'v' => Some(Self::View),
            b'c' => Some(Self::Click),
            b'u' => Some(Self::UserUpdate),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Query => 'q',
            Self::View => 'v',
            Self::Click => 'c',
            Self::UserUpdate => 'u',
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_char(self.as_char())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedEvent {
    /// Event time in microseconds since epoch.
    pub time: u64,
    pub kind: EventKind,
    pub evid: String,
    pub params: Vec<(String, String)>,
}

/// All events reconstructed for one user at flush time. The core makes no
/// ordering guarantee across events; consumers must tolerate duplicate and
/// out-of-order timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedSession {
    pub uid: String,
    pub customer_key: Option<String>,
    pub events: Vec<TrackedEvent>,
}

impl TrackedSession {
    pub fn new(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            customer_key: None,
            events: Vec::new(),
        }
    }

    pub fn insert_event(
        &mut self,
        time: u64,
        kind: EventKind,
        evid: String,
        params: Vec<(String, String)>,
    ) {
        self.events.push(TrackedEvent {
            time,
            kind,
            evid,
            params,
        });
    }

    /// Earliest event time in the session, in microseconds. `None` for a
    /// session that ended up with no decodable events.
    pub fn first_seen_time(&self) -> Option<u64> {
        self.events.iter().map(|event| event.time).min()
    }

    pub fn last_seen_time(&self) -> Option<u64> {
        self.events.iter().map(|event| event.time).max()
    }

    /// One-line summary for error logs when a join target rejects the
    /// session.
    pub fn debug_dump(&self) -> String {
        format!(
            "uid={} customer={} events={} first_seen={:?} last_seen={:?}",
            self.uid,
            self.customer_key.as_deref().unwrap_or("<none>"),
            self.events.len(),
            self.first_seen_time(),
            self.last_seen_time(),
        )
    }
}

/// Output record queued for the downstream feed writer, serialized as a
/// versioned length-prefixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnvelope {
    pub customer: String,
    /// Equals the session's uid.
    pub session_id: String,
    /// First-seen time in microseconds since epoch.
    pub time: u64,
    /// Opaque blob produced by the join target.
    pub session_data: Vec<u8>,
}

impl SessionEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            16 + self.customer.len() + self.session_id.len() + self.session_data.len(),
        );
        write_uvarint(&mut buf, ENVELOPE_VERSION);
        write_uvarint(&mut buf, self.customer.len() as u64);
        buf.extend_from_slice(self.customer.as_bytes());
        write_uvarint(&mut buf, self.session_id.len() as u64);
        buf.extend_from_slice(self.session_id.as_bytes());
        write_uvarint(&mut buf, self.time);
        write_uvarint(&mut buf, self.session_data.len() as u64);
        buf.extend_from_slice(&self.session_data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let version = read_uvarint(buf, &mut pos)?;
        if version != ENVELOPE_VERSION {
            return Err(JoinError::Decode(format!(
                "unsupported envelope version: {version}"
            )));
        }
        let customer = read_string(buf, &mut pos)?;
        let session_id = read_string(buf, &mut pos)?;
        let time = read_uvarint(buf, &mut pos)?;
        let data_len = read_uvarint(buf, &mut pos)? as usize;
        let session_data = read_bytes(buf, &mut pos, data_len)?.to_vec();
        Ok(Self {
            customer,
            session_id,
            time,
            session_data,
        })
    }
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_uvarint(buf, pos)? as usize;
    String::from_utf8(read_bytes(buf, pos, len)?.to_vec())
        .map_err(|_| JoinError::Decode("envelope field is not utf-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_maps_wire_characters() {
        for (byte, kind) in [
            (b'q', EventKind::Query),
            (b'v', EventKind::View),
            (b'c', EventKind::Click),
            (b'u', EventKind::UserUpdate),
        ] {
            assert_eq!(EventKind::from_byte(byte), Some(kind));
            assert_eq!(kind.as_char() as u8, byte);
        }
        assert_eq!(EventKind::from_byte(b'x'), None);
    }

    #[test]
    fn first_seen_is_minimum_over_out_of_order_events() {
        let mut session = TrackedSession::new("u1");
        assert_eq!(session.first_seen_time(), None);
        session.insert_event(2_500_000_000, EventKind::View, "e2".into(), Vec::new());
        session.insert_event(1_000_000_000, EventKind::Query, "e1".into(), Vec::new());
        session.insert_event(1_700_000_000, EventKind::Click, "e3".into(), Vec::new());
        assert_eq!(session.first_seen_time(), Some(1_000_000_000));
        assert_eq!(session.last_seen_time(), Some(2_500_000_000));
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = SessionEnvelope {
            customer: "CUST1".into(),
            session_id: "u1".into(),
            time: 1_000_000_000,
            session_data: b"payload".to_vec(),
        };
        let decoded = SessionEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn envelope_rejects_unknown_version() {
        let envelope = SessionEnvelope {
            customer: "CUST1".into(),
            session_id: "u1".into(),
            time: 1,
            session_data: Vec::new(),
        };
        let mut buf = envelope.encode();
        buf[0] = 9;
        assert!(matches!(
            SessionEnvelope::decode(&buf),
            Err(JoinError::Decode(_))
        ));
    }

    #[test]
    fn envelope_rejects_truncation() {
        let envelope = SessionEnvelope {
            customer: "CUST1".into(),
            session_id: "u1".into(),
            time: 1,
            session_data: b"xyz".to_vec(),
        };
        let mut buf = envelope.encode();
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            SessionEnvelope::decode(&buf),
            Err(JoinError::Decode(_))
        ));
    }
}
