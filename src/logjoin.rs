use std::sync::Arc;

use rand::Rng;
use tracing::{error, info, trace, warn};
use url::form_urlencoded;

use crate::{
    codec::{self, PixelParams},
    config::Config,
    deadline::DeadlineIndex,
    error::{JoinError, Result},
    session::{EventKind, SessionEnvelope, TrackedSession},
    shard::Shard,
    stats::JoinStats,
    store::Transaction,
    target::JoinTarget,
};

/// Sessions are finalized after this much inactivity unless configured
/// otherwise.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1_800;

pub const DEFAULT_STATS_PREFIX: &str = "logjoin";

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Keys with this prefix are internal (the output queue) and are skipped by
/// the bootstrap scan.
const INTERNAL_PREFIX: &[u8] = b"__";
const SESSION_QUEUE_PREFIX: &str = "__sessionq-";
const CUST_SUFFIX: &[u8] = b"~cust";

/// Shard-routed sessionizer. Ingests tracking-pixel log lines, buffers event
/// records per user in the session store, and finalizes a session once the
/// user has been idle past the configured timeout.
///
/// The core is single-threaded cooperative: one ingest/flush driver owns the
/// instance, and every call is synchronous with respect to the caller. Wrap
/// it in a mutex to serialize multi-producer feeds.
pub struct LogJoin {
    shard: Shard,
    dry_run: bool,
    idle_timeout_secs: u64,
    stats_prefix: String,
    params: PixelParams,
    deadlines: DeadlineIndex,
    stats: Arc<JoinStats>,
    target: Box<dyn JoinTarget>,
}

impl LogJoin {
    pub fn new(shard: Shard, dry_run: bool, target: Box<dyn JoinTarget>) -> Self {
        Self::with_stats(shard, dry_run, target, Arc::new(JoinStats::new()))
    }

    /// Shares a pre-built counter set with the caller, so a join target can
    /// hold the same handle.
    pub fn with_stats(
        shard: Shard,
        dry_run: bool,
        target: Box<dyn JoinTarget>,
        stats: Arc<JoinStats>,
    ) -> Self {
        Self {
            shard,
            dry_run,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            stats_prefix: DEFAULT_STATS_PREFIX.to_string(),
            params: PixelParams::with_defaults(),
            deadlines: DeadlineIndex::new(),
            stats,
            target,
        }
    }

    pub fn from_config(config: &Config, target: Box<dyn JoinTarget>, stats: Arc<JoinStats>) -> Self {
        let shard = Shard::of(config.shard_index, config.shard_count);
        let mut join = Self::with_stats(shard, config.dry_run, target, stats);
        join.idle_timeout_secs = config.idle_timeout_secs;
        join.stats_prefix = config.stats_prefix.clone();
        join
    }

    pub fn with_idle_timeout(mut self, idle_timeout_secs: u64) -> Self {
        self.idle_timeout_secs = idle_timeout_secs;
        self
    }

    /// Construction-time dictionary extension; see [`PixelParams::register`].
    pub fn register_param(&mut self, name: &str, id: u32) {
        self.params.register(name, id);
    }

    pub fn stats(&self) -> Arc<JoinStats> {
        Arc::clone(&self.stats)
    }

    /// Number of users currently awaiting a flush deadline.
    pub fn num_sessions(&self) -> usize {
        self.deadlines.len()
    }

    pub fn deadline_for(&self, uid: &str) -> Option<u64> {
        self.deadlines.get(uid)
    }

    /// Drains counter deltas into the `metrics` facade under the configured
    /// prefix.
    pub fn export_stats(&self) {
        self.stats.export(&self.stats_prefix);
    }

    /// Ingests one raw log line in the pipe-delimited wrapper form
    /// `"<customer_key>|<unix_seconds>|<query_string>"`.
    pub fn insert_logline(&mut self, line: &str, txn: &mut Transaction<'_>) -> Result<()> {
        match parse_wrapper(line) {
            Ok((customer_key, time, body)) => self.insert(customer_key, time, body, txn),
            Err(err) => {
                self.stats.incr_loglines_total();
                self.stats.incr_loglines_invalid();
                Err(err)
            }
        }
    }

    /// Main ingress. `time` is microseconds since epoch; `body` is the pixel
    /// query string. Lines outside this instance's shard are dropped
    /// silently.
    pub fn insert(
        &mut self,
        customer_key: &str,
        time: u64,
        body: &str,
        txn: &mut Transaction<'_>,
    ) -> Result<()> {
        self.stats.incr_loglines_total();
        match self.insert_inner(customer_key, time, body, txn) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.stats.incr_loglines_invalid();
                Err(err)
            }
        }
    }

    fn insert_inner(
        &mut self,
        customer_key: &str,
        time: u64,
        body: &str,
        txn: &mut Transaction<'_>,
    ) -> Result<()> {
        let params: Vec<(String, String)> = form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect();

        let c = first_param(&params, "c")
            .ok_or_else(|| JoinError::Parse("c param is missing".into()))?;
        let (uid, evid) = c
            .split_once('~')
            .ok_or_else(|| JoinError::Parse("c param is invalid".into()))?;
        if uid.is_empty() || evid.is_empty() {
            return Err(JoinError::Parse("c param is invalid".into()));
        }

        if !self.shard.accepts(uid) {
            trace!(target: "logjoin", uid, "dropping logline outside this shard");
            return Ok(());
        }

        let evtype = first_param(&params, "e")
            .ok_or_else(|| JoinError::Parse("e param is missing".into()))?;
        if evtype.len() != 1 {
            return Err(JoinError::Parse("e param is invalid".into()));
        }
        let kind = EventKind::from_byte(evtype.as_bytes()[0])
            .ok_or_else(|| JoinError::Parse("e param is invalid".into()))?;

        let stored_params: Vec<(String, String)> = params
            .iter()
            .filter(|(name, _)| name != "c" && name != "e" && name != "v")
            .cloned()
            .collect();

        self.append_to_session(customer_key, time, uid, evid, kind, &stored_params, txn)
    }

    #[allow(clippy::too_many_arguments)]
    fn append_to_session(
        &mut self,
        customer_key: &str,
        time: u64,
        uid: &str,
        evid: &str,
        kind: EventKind,
        params: &[(String, String)],
        txn: &mut Transaction<'_>,
    ) -> Result<()> {
        let deadline = time + self.idle_timeout_secs * MICROS_PER_SECOND;
        self.deadlines.touch(uid, deadline);

        let record = self
            .params
            .encode_event(time / MICROS_PER_SECOND, evid, params)?;

        let event_key = format!(
            "{uid}~{}~{:016x}",
            kind.as_char(),
            rand::thread_rng().gen::<u64>()
        );
        txn.insert(event_key.as_bytes(), &record);
        txn.update(cust_key(uid).as_bytes(), customer_key.as_bytes());
        Ok(())
    }

    /// Finalizes every session whose deadline elapsed before `stream_time`.
    /// The caller supplies the clock so tests can drive it; production passes
    /// wall time.
    pub fn flush(&mut self, txn: &mut Transaction<'_>, stream_time: u64) -> Result<()> {
        for uid in self.deadlines.due_before(stream_time) {
            self.flush_session(&uid, stream_time, txn)?;
            self.deadlines.remove(&uid);
        }
        Ok(())
    }

    /// Reconstructs one user's session from the store, drains the user's key
    /// range, and queues the output envelope.
    pub fn flush_session(
        &mut self,
        uid: &str,
        stream_time: u64,
        txn: &mut Transaction<'_>,
    ) -> Result<()> {
        trace!(target: "logjoin", uid, stream_time, "flushing session");

        let mut session = TrackedSession::new(uid);
        {
            let mut cursor = txn.cursor();
            let mut found = cursor.seek_first_or_greater(uid.as_bytes())?;
            while found {
                let Some(key) = cursor.key().map(<[u8]>::to_vec) else {
                    break;
                };
                if !key.starts_with(uid.as_bytes()) {
                    break;
                }

                if key.ends_with(CUST_SUFFIX) {
                    let customer = cursor.value().unwrap_or_default();
                    session.customer_key = Some(String::from_utf8_lossy(customer).into_owned());
                } else {
                    let value = cursor.value().map(<[u8]>::to_vec).unwrap_or_default();
                    match self.decode_stored_event(uid, &key, &value) {
                        Ok((time, kind, evid, params)) => {
                            session.insert_event(time, kind, evid, params);
                        }
                        Err(err) => {
                            error!(target: "logjoin", %err, uid, "invalid event record");
                            self.stats.incr_loglines_invalid();
                        }
                    }
                }

                cursor.delete_current()?;
                found = cursor.advance()?;
            }
        }

        let Some(customer) = session.customer_key.clone() else {
            error!(target: "logjoin", uid, "missing customer key for session");
            return Ok(());
        };

        let session_data = match self.target.join(&session) {
            Ok(data) => data,
            Err(err) => {
                error!(
                    target: "logjoin",
                    %err,
                    session = %session.debug_dump(),
                    "join target failed"
                );
                return Ok(());
            }
        };

        let Some(first_seen) = session.first_seen_time() else {
            error!(target: "logjoin", uid, "session has no decodable events");
            return Ok(());
        };

        let envelope = SessionEnvelope {
            customer,
            session_id: uid.to_string(),
            time: first_seen,
            session_data,
        };

        if self.dry_run {
            info!(target: "logjoin", uid, "dry run, not queueing session");
        } else {
            let queue_key = format!(
                "{SESSION_QUEUE_PREFIX}{:032x}",
                rand::thread_rng().gen::<u128>()
            );
            txn.update(queue_key.as_bytes(), &envelope.encode());
        }

        self.stats.incr_joined_sessions();
        Ok(())
    }

    /// Rebuilds the deadline index by scanning every persisted event record.
    /// Must complete before the first `insert` call.
    pub fn import_timeout_list(&mut self, txn: &mut Transaction<'_>) -> Result<()> {
        {
            let mut cursor = txn.cursor();
            let mut found = cursor.seek_first()?;
            while found {
                let Some(key) = cursor.key().map(<[u8]>::to_vec) else {
                    break;
                };
                if !key.starts_with(INTERNAL_PREFIX) && !key.ends_with(CUST_SUFFIX) {
                    match key.iter().position(|&b| b == b'~') {
                        Some(sep) => {
                            let uid = String::from_utf8_lossy(&key[..sep]).into_owned();
                            let value = cursor.value().unwrap_or_default();
                            match codec::read_event_time(value) {
                                Ok(time_s) => {
                                    let deadline =
                                        (time_s + self.idle_timeout_secs) * MICROS_PER_SECOND;
                                    self.deadlines.touch(&uid, deadline);
                                }
                                Err(err) => {
                                    warn!(
                                        target: "logjoin",
                                        %err,
                                        uid,
                                        "skipping undecodable event record during bootstrap"
                                    );
                                }
                            }
                        }
                        None => {
                            warn!(
                                target: "logjoin",
                                key = %String::from_utf8_lossy(&key),
                                "skipping foreign key during bootstrap"
                            );
                        }
                    }
                }
                found = cursor.advance()?;
            }
        }

        info!(
            target: "logjoin",
            sessions = self.deadlines.len(),
            "rebuilt deadline index from store"
        );
        Ok(())
    }

    fn decode_stored_event(
        &self,
        uid: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<(u64, EventKind, String, Vec<(String, String)>)> {
        let kind_byte = key
            .get(uid.len() + 1)
            .copied()
            .ok_or_else(|| JoinError::Decode("event key too short".into()))?;
        let kind = EventKind::from_byte(kind_byte).ok_or_else(|| {
            JoinError::Decode(format!("unknown event type: {}", kind_byte as char))
        })?;
        let decoded = self.params.decode_event(value)?;
        Ok((
            decoded.time_s * MICROS_PER_SECOND,
            kind,
            decoded.evid,
            decoded.params,
        ))
    }
}

fn first_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn cust_key(uid: &str) -> String {
    format!("{uid}~cust")
}

fn parse_wrapper(line: &str) -> Result<(&str, u64, &str)> {
    let (customer_key, rest) = line
        .split_once('|')
        .ok_or_else(|| JoinError::Parse(format!("invalid logline: {line}")))?;
    let (timestr, body) = rest
        .split_once('|')
        .ok_or_else(|| JoinError::Parse(format!("invalid logline: {line}")))?;
    let seconds: u64 = timestr
        .parse()
        .map_err(|_| JoinError::Parse(format!("invalid logline timestamp: {timestr}")))?;
    Ok((customer_key, seconds * MICROS_PER_SECOND, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_splits_customer_time_and_body() {
        let (customer, time, body) = parse_wrapper("CUST1|1000|c=u1~e1&e=q").unwrap();
        assert_eq!(customer, "CUST1");
        assert_eq!(time, 1_000_000_000);
        assert_eq!(body, "c=u1~e1&e=q");
    }

    #[test]
    fn wrapper_body_may_contain_pipes() {
        let (_, _, body) = parse_wrapper("CUST1|1000|c=u1~e1&e=q&qstr~en=a|b").unwrap();
        assert_eq!(body, "c=u1~e1&e=q&qstr~en=a|b");
    }

    #[test]
    fn wrapper_rejects_missing_separators() {
        assert!(matches!(
            parse_wrapper("CUST1|1000"),
            Err(JoinError::Parse(_))
        ));
        assert!(matches!(parse_wrapper("CUST1"), Err(JoinError::Parse(_))));
    }

    #[test]
    fn wrapper_rejects_non_numeric_timestamp() {
        assert!(matches!(
            parse_wrapper("CUST1|then|c=u1~e1&e=q"),
            Err(JoinError::Parse(_))
        ));
    }

    #[test]
    fn first_param_returns_the_first_occurrence() {
        let params = vec![
            ("c".to_string(), "u1~e1".to_string()),
            ("c".to_string(), "u2~e2".to_string()),
        ];
        assert_eq!(first_param(&params, "c"), Some("u1~e1"));
        assert_eq!(first_param(&params, "e"), None);
    }
}
