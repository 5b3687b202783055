//! Inspection of the byte stream, with optional canned replies.
//!
//! A [`Listener`] keeps a bounded rolling window of received bytes and fires
//! [`Trigger`]s against it. Rules have a compact text form:
//!
//! ```text
//! match=READY,send=START,once
//! match_hex=a1b2c3,send_hex=cc
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::control::ControlByte;
use crate::core::{LinkError, LinkResult};
use crate::transport::{Connection, Deadline, Probe};

/// Default cap on the rolling receive window.
pub const DEFAULT_WINDOW_LIMIT: usize = 8192;

/// Probe SYNC until READY arrives, then send START.
pub async fn basic_handshake(
    conn: &mut Connection,
    timeout: Duration,
    probe_interval: Duration,
) -> LinkResult<()> {
    conn.scan(
        ControlByte::Ready.as_u8(),
        timeout,
        Some(Probe::new(ControlByte::Sync.as_u8(), probe_interval)),
        ControlByte::Ready.name(),
    )
    .await?;
    info!("READY received, sending START");
    conn.send_byte(ControlByte::Start.as_u8()).await
}

/// Hand every received byte to `on_data` until `duration` elapses.
///
/// Returns the number of bytes observed.
pub async fn listen<F>(conn: &mut Connection, duration: Duration, on_data: F) -> LinkResult<usize>
where
    F: FnMut(&[u8]),
{
    let report = Listener::new(Vec::new())
        .run(conn, duration, on_data)
        .await?;
    Ok(report.bytes)
}

/// What a trigger looks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerMatch {
    /// The most recently received byte is this control byte.
    Control(ControlByte),
    /// This byte pattern ends within the bytes just received.
    Pattern(Vec<u8>),
}

/// A canned reply sent when its match is seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    matcher: TriggerMatch,
    send: Vec<Bytes>,
    once: bool,
}

impl Trigger {
    /// Fire when `byte` is the last byte received.
    pub fn on_control(byte: ControlByte) -> Self {
        Self::with_matcher(TriggerMatch::Control(byte))
    }

    /// Fire when `pattern` shows up in the window.
    pub fn on_pattern(pattern: impl Into<Vec<u8>>) -> Self {
        Self::with_matcher(TriggerMatch::Pattern(pattern.into()))
    }

    fn with_matcher(matcher: TriggerMatch) -> Self {
        Self {
            matcher,
            send: Vec::new(),
            once: false,
        }
    }

    /// Reply with a control byte.
    pub fn send_control(mut self, byte: ControlByte) -> Self {
        self.send.push(Bytes::copy_from_slice(&[byte.as_u8()]));
        self
    }

    /// Reply with raw bytes.
    pub fn send_bytes(mut self, payload: impl Into<Bytes>) -> Self {
        self.send.push(payload.into());
        self
    }

    /// Retire the trigger after it fires once.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// The match rule.
    pub fn matcher(&self) -> &TriggerMatch {
        &self.matcher
    }

    /// Payloads sent on each firing, in order.
    pub fn payloads(&self) -> &[Bytes] {
        &self.send
    }

    /// Whether the trigger retires after firing.
    pub fn is_once(&self) -> bool {
        self.once
    }

    /// `fresh` counts the bytes at the end of `window` that just arrived.
    fn matches(&self, window: &[u8], fresh: usize) -> bool {
        if fresh == 0 {
            return false;
        }
        match &self.matcher {
            TriggerMatch::Control(byte) => window.last() == Some(&byte.as_u8()),
            TriggerMatch::Pattern(pattern) if pattern.is_empty() => false,
            TriggerMatch::Pattern(pattern) => {
                let start = window.len().saturating_sub(fresh + pattern.len() - 1);
                window[start..]
                    .windows(pattern.len())
                    .any(|candidate| candidate == pattern.as_slice())
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            TriggerMatch::Control(byte) => write!(f, "match={}", byte.name())?,
            TriggerMatch::Pattern(pattern) => write!(f, "match_hex={}", hex::encode(pattern))?,
        }
        for payload in &self.send {
            match payload.as_ref() {
                [byte] => match ControlByte::from_u8(*byte) {
                    Some(control) => write!(f, ",send={}", control.name())?,
                    None => write!(f, ",send_hex={byte:02x}")?,
                },
                other => write!(f, ",send_hex={}", hex::encode(other))?,
            }
        }
        if self.once {
            f.write_str(",once")?;
        }
        Ok(())
    }
}

impl FromStr for Trigger {
    type Err = LinkError;

    /// Parse `match=KEYWORD` or `match_hex=HEX`, then any number of
    /// `send=KEYWORD` / `send_hex=HEX`, and an optional `once`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: String| LinkError::Config(format!("trigger {s:?}: {why}"));
        let mut matcher = None;
        let mut send = Vec::new();
        let mut once = false;

        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None if item.eq_ignore_ascii_case("once") => {
                    once = true;
                    continue;
                }
                None => return Err(invalid(format!("expected key=value, got {item:?}"))),
            };
            match key {
                "match" | "match_hex" if matcher.is_some() => {
                    return Err(invalid("more than one match rule".into()));
                }
                "match" => matcher = Some(TriggerMatch::Control(value.parse()?)),
                "match_hex" => {
                    let pattern = hex::decode(value).map_err(|e| invalid(e.to_string()))?;
                    if pattern.is_empty() {
                        return Err(invalid("empty match pattern".into()));
                    }
                    matcher = Some(TriggerMatch::Pattern(pattern));
                }
                "send" => {
                    let byte: ControlByte = value.parse()?;
                    send.push(Bytes::copy_from_slice(&[byte.as_u8()]));
                }
                "send_hex" => {
                    let payload = hex::decode(value).map_err(|e| invalid(e.to_string()))?;
                    send.push(Bytes::from(payload));
                }
                other => return Err(invalid(format!("unknown key {other:?}"))),
            }
        }

        let matcher = matcher.ok_or_else(|| invalid("missing match or match_hex".into()))?;
        if send.is_empty() {
            return Err(invalid("nothing to send".into()));
        }
        Ok(Self {
            matcher,
            send,
            once,
        })
    }
}

/// Built-in trigger sets.
///
/// `handshake_ack` answers the first READY with START and every START with
/// ACK.
pub fn preset(name: &str) -> LinkResult<Vec<Trigger>> {
    match name.to_ascii_lowercase().as_str() {
        "handshake_ack" => Ok(vec![
            Trigger::on_control(ControlByte::Ready)
                .send_control(ControlByte::Start)
                .once(),
            Trigger::on_control(ControlByte::Start).send_control(ControlByte::Ack),
        ]),
        other => Err(LinkError::Config(format!("unknown trigger preset {other:?}"))),
    }
}

/// Totals for one [`Listener::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenReport {
    /// Bytes received.
    pub bytes: usize,
    /// Payloads sent, by triggers or manual input.
    pub sent: usize,
}

/// Byte-stream listener with triggers and optional manual input.
#[derive(Debug)]
pub struct Listener {
    triggers: Vec<Trigger>,
    window: Vec<u8>,
    limit: usize,
    manual: Option<mpsc::Receiver<Bytes>>,
}

impl Listener {
    /// Listener firing `triggers`, with the default window size.
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self {
            triggers,
            window: Vec::new(),
            limit: DEFAULT_WINDOW_LIMIT,
            manual: None,
        }
    }

    /// Cap the rolling window at `limit` bytes (at least one).
    pub fn with_window_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Send whatever arrives on `input`; the run ends when `input` closes.
    pub fn with_manual_input(mut self, input: mpsc::Receiver<Bytes>) -> Self {
        self.manual = Some(input);
        self
    }

    /// Triggers still armed.
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// The rolling window, oldest byte first.
    pub fn window(&self) -> &[u8] {
        &self.window
    }

    /// Add `data` to the window and collect the replies it fires.
    pub fn observe(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.window.extend_from_slice(data);
        if self.window.len() > self.limit {
            let excess = self.window.len() - self.limit;
            self.window.drain(..excess);
        }

        let fresh = data.len().min(self.window.len());
        let window = &self.window;
        let mut replies = Vec::new();
        self.triggers.retain(|trigger| {
            if !trigger.matches(window, fresh) {
                return true;
            }
            debug!(%trigger, "trigger fired");
            replies.extend(trigger.send.iter().cloned());
            !trigger.once
        });
        replies
    }

    /// Watch `conn` for `duration`, handing received bytes to `on_data` and
    /// sending trigger replies and manual input as they come.
    pub async fn run<F>(
        &mut self,
        conn: &mut Connection,
        duration: Duration,
        mut on_data: F,
    ) -> LinkResult<ListenReport>
    where
        F: FnMut(&[u8]),
    {
        let deadline = Deadline::after(duration);
        let mut report = ListenReport::default();
        loop {
            let data = conn.drain_received()?;
            if !data.is_empty() {
                report.bytes += data.len();
                on_data(&data);
                for reply in self.observe(&data) {
                    conn.send(reply).await?;
                    report.sent += 1;
                }
            }

            if let Some(input) = &mut self.manual {
                loop {
                    match input.try_recv() {
                        Ok(payload) => {
                            info!(data = %hex::encode(&payload), "sending manual input");
                            conn.send(payload).await?;
                            report.sent += 1;
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            info!("manual input closed");
                            return Ok(report);
                        }
                    }
                }
            }

            if deadline.is_expired() {
                return Ok(report);
            }
            tokio::time::sleep(deadline.next_poll()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_basic_handshake() {
        let (mut peer, local) = tokio::io::duplex(256);
        let mut conn = Connection::from_stream(local, "pipe");

        let device = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            peer.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], 0xB0);
            peer.write_all(&[0xA0]).await.unwrap();
            loop {
                peer.read_exact(&mut byte).await.unwrap();
                if byte[0] == 0xAC {
                    break;
                }
            }
        });

        basic_handshake(&mut conn, Duration::from_secs(2), Duration::from_millis(200))
            .await
            .unwrap();
        device.await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn test_listen_collects_bytes() {
        let (mut peer, local) = tokio::io::duplex(256);
        let mut conn = Connection::from_stream(local, "pipe");
        peer.write_all(b"boot ok").await.unwrap();

        let mut seen = Vec::new();
        let total = listen(&mut conn, Duration::from_millis(300), |data| {
            seen.extend_from_slice(data)
        })
        .await
        .unwrap();
        assert_eq!(total, 7);
        assert_eq!(seen, b"boot ok");
        conn.close().await;
    }

    #[test]
    fn test_parse_rules() {
        let trigger: Trigger = "match=READY,send=START,once".parse().unwrap();
        assert_eq!(trigger.matcher(), &TriggerMatch::Control(ControlByte::Ready));
        assert_eq!(trigger.payloads(), &[Bytes::from_static(&[0xAC])]);
        assert!(trigger.is_once());
        assert_eq!(trigger.to_string(), "match=READY,send=START,once");

        let trigger: Trigger = "match_hex=a1b2c3, send_hex=cc00, send=ack".parse().unwrap();
        assert_eq!(trigger.matcher(), &TriggerMatch::Pattern(vec![0xA1, 0xB2, 0xC3]));
        assert_eq!(
            trigger.payloads(),
            &[Bytes::from_static(&[0xCC, 0x00]), Bytes::from_static(&[0xCC])]
        );
        assert!(!trigger.is_once());
    }

    #[test]
    fn test_parse_rejects_bad_rules() {
        for rule in [
            "send=START",
            "match=READY",
            "match=NAK,send=START",
            "match=READY,match_hex=a0,send=START",
            "match_hex=zz,send=START",
            "match_hex=,send=START",
            "match=READY,send=START,twice",
            "match=READY,reply=START",
        ] {
            let err = rule.parse::<Trigger>().unwrap_err();
            assert!(matches!(err, LinkError::Config(_)), "{rule}");
        }
    }

    #[test]
    fn test_presets() {
        let triggers = preset("handshake_ack").unwrap();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].to_string(), "match=READY,send=START,once");
        assert_eq!(triggers[1].to_string(), "match=START,send=ACK");
        assert!(preset("nope").is_err());
    }

    #[test]
    fn test_control_matches_last_byte() {
        let mut listener = Listener::new(preset("handshake_ack").unwrap());
        assert!(listener.observe(&[0xA0, 0x01]).is_empty());
        assert_eq!(listener.observe(&[0xA0]), vec![Bytes::from_static(&[0xAC])]);
        assert_eq!(listener.triggers().len(), 1);
        // once: READY no longer answered
        assert!(listener.observe(&[0xA0]).is_empty());
        assert_eq!(listener.observe(&[0xAC]), vec![Bytes::from_static(&[0xCC])]);
        assert_eq!(listener.observe(&[0xAC]), vec![Bytes::from_static(&[0xCC])]);
    }

    #[test]
    fn test_pattern_across_batches_fires_once_per_arrival() {
        let mut listener =
            Listener::new(vec![Trigger::on_pattern(vec![0x11, 0x22, 0x33]).send_bytes(&b"ok"[..])]);
        assert!(listener.observe(&[0x00, 0x11]).is_empty());
        assert_eq!(listener.observe(&[0x22, 0x33, 0x44]), vec![Bytes::from_static(b"ok")]);
        // already seen; old bytes do not fire again
        assert!(listener.observe(&[0x55]).is_empty());
        assert_eq!(listener.observe(&[0x11, 0x22, 0x33]).len(), 1);
    }

    #[test]
    fn test_window_is_capped() {
        let mut listener = Listener::new(Vec::new()).with_window_limit(4);
        listener.observe(&[1, 2, 3]);
        listener.observe(&[4, 5, 6]);
        assert_eq!(listener.window(), &[3, 4, 5, 6]);
        listener.observe(&[7, 8, 9, 10, 11]);
        assert_eq!(listener.window(), &[8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn test_ready_triggers_start() {
        let (mut peer, local) = tokio::io::duplex(256);
        let mut conn = Connection::from_stream(local, "pipe");
        peer.write_all(&[0xA0]).await.unwrap();

        let mut listener = Listener::new(preset("handshake_ack").unwrap());
        let report = listener
            .run(&mut conn, Duration::from_millis(400), |_| {})
            .await
            .unwrap();
        assert_eq!(report, ListenReport { bytes: 1, sent: 1 });

        let mut reply = [0u8; 1];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0xAC);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_manual_input_is_sent_until_closed() {
        let (mut peer, local) = tokio::io::duplex(256);
        let mut conn = Connection::from_stream(local, "pipe");
        let (input, rx) = mpsc::channel(4);
        input.send(Bytes::from_static(&[0xB0, 0xCC])).await.unwrap();
        drop(input);

        let started = tokio::time::Instant::now();
        let mut listener = Listener::new(Vec::new()).with_manual_input(rx);
        let report = listener
            .run(&mut conn, Duration::from_secs(30), |_| {})
            .await
            .unwrap();
        assert_eq!(report.sent, 1);
        assert!(started.elapsed() < Duration::from_secs(5));

        let mut sent = [0u8; 2];
        peer.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent, [0xB0, 0xCC]);
        conn.close().await;
    }
}
