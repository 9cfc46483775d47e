//! Push channel: the table's socket.io stream of state updates.
//!
//! The table runs a socket.io v1 server on port 3002 and pushes `set`
//! events carrying batches of update fragments. This module speaks just
//! enough of the engine.io v3 framing over a plain websocket to consume
//! them: the `0{json}` handshake advertises the ping interval, the client
//! sends `2` pings and receives `3` pongs, and messages arrive as
//! `42["event", args...]` frames.
//!
//! The channel owns reconnection: when the socket drops, it reports a
//! [`Update::Disconnect`] to the sink and retries establishing the
//! session with exponential backoff and jitter until told to shut down.
//! The state machine on the consuming side only reflects the lifecycle
//! signals delivered here; it never drives retries itself.

use std::{sync::Arc, time::Duration};

use exponential_backoff::Backoff;
use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use serde_with::{formats::Flexible, serde_as, DurationMilliSeconds};
use tokio_tungstenite::tungstenite::Message as WebsocketMessage;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    protocol::Update,
};

/// Delivery callback for decoded updates.
///
/// Returns `false` when the receiver is gone and the channel should stop.
pub type Sink = Arc<dyn Fn(Update) -> BoxFuture<'static, bool> + Send + Sync>;

/// Port of the table's socket.io server.
pub const PUSH_PORT: u16 = 3002;

/// Ping cadence until the handshake advertises one.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Reconnection schedule. After the attempts run out the loop starts
/// over, so the effective behavior is retry-forever capped at the max.
const RECONNECT_ATTEMPTS: u32 = 10;
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// The engine.io handshake payload.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde_as(as = "DurationMilliSeconds<f64, Flexible>")]
    pub ping_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<f64, Flexible>")]
    pub ping_timeout: Duration,
}

/// One decoded engine.io/socket.io text frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// `0{json}`: session opened, with the server's timing parameters.
    Open(Handshake),
    /// `1`: the server is closing the session.
    Close,
    /// `2`: server-initiated ping; answer with a pong.
    Ping,
    /// `3`: pong for one of our pings.
    Pong,
    /// `40`: the socket.io namespace is connected.
    Connect,
    /// `42["name", args...]`: a socket.io event.
    Event { name: String, args: Vec<Value> },
    /// Anything this client does not need to understand.
    Other(String),
}

/// Decodes one text frame.
///
/// # Errors
///
/// Returns `InvalidArgument` for frames that violate the framing, such
/// as a malformed handshake or event payload. Unknown but well-formed
/// frame types decode to [`Packet::Other`].
pub fn parse_packet(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| Error::invalid_argument("empty push frame"))?;
    let rest = chars.as_str();

    match kind {
        '0' => {
            let handshake = serde_json::from_str::<Handshake>(rest)?;
            Ok(Packet::Open(handshake))
        }
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => parse_socketio(rest),
        _ => Err(Error::invalid_argument(format!(
            "unrecognized engine.io frame: {text}"
        ))),
    }
}

/// Decodes the socket.io layer inside an engine.io message frame.
fn parse_socketio(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Ok(Packet::Connect),
        Some('2') => {
            let payload = serde_json::from_str::<Value>(chars.as_str())?;
            let Value::Array(mut items) = payload else {
                return Err(Error::invalid_argument("event payload is not an array"));
            };
            if items.is_empty() {
                return Err(Error::invalid_argument("event payload without a name"));
            }
            let Value::String(name) = items.remove(0) else {
                return Err(Error::invalid_argument("event name is not a string"));
            };
            Ok(Packet::Event { name, args: items })
        }
        _ => Ok(Packet::Other(text.to_owned())),
    }
}

/// How one websocket session ended.
enum SessionEnd {
    /// Shutdown was requested; do not reconnect.
    Shutdown,
    /// The sink reported its receiver gone; do not reconnect.
    Gone,
}

/// Runs the push channel until shutdown or until the sink's receiver
/// goes away. Spawned once per connected table.
pub async fn run(host: String, sink: Sink, shutdown: CancellationToken) {
    let url = format!("ws://{host}:{PUSH_PORT}/socket.io/?EIO=3&transport=websocket");

    'reconnect: loop {
        let backoff = Backoff::new(RECONNECT_ATTEMPTS, RECONNECT_MIN, RECONNECT_MAX);
        for delay in &backoff {
            if shutdown.is_cancelled() {
                return;
            }

            let mut opened = false;
            match session(&url, &sink, &shutdown, &mut opened).await {
                Ok(SessionEnd::Shutdown) => {
                    debug!("push channel shut down");
                    return;
                }
                Ok(SessionEnd::Gone) => {
                    debug!("table handle dropped; stopping push channel");
                    return;
                }
                Err(e) => {
                    warn!("push channel lost: {e}");
                    if opened {
                        // A live session just ended: report it and start
                        // the backoff schedule from scratch.
                        if !sink(Update::Disconnect).await {
                            return;
                        }
                        continue 'reconnect;
                    }
                }
            }

            // Jitter spreads reconnections when several clients share a
            // power cycle with the table.
            let delay = delay.unwrap_or(RECONNECT_MAX);
            let jitter = Duration::from_millis(fastrand::u64(..500));
            debug!("retrying push channel in {:.1}s", (delay + jitter).as_secs_f32());
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay + jitter) => {}
            }
        }
    }
}

/// One websocket session: connect, then pump frames until it ends.
async fn session(
    url: &str,
    sink: &Sink,
    shutdown: &CancellationToken,
    opened: &mut bool,
) -> Result<SessionEnd> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    *opened = true;
    info!("push channel established");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let mut ping_interval = DEFAULT_PING_INTERVAL;
    let ping_timer = tokio::time::sleep(ping_interval);
    tokio::pin!(ping_timer);

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                let _ = ws_tx.send(WebsocketMessage::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }

            () = &mut ping_timer => {
                ws_tx.send(WebsocketMessage::Text("2".into())).await?;
                ping_timer.as_mut().reset(tokio::time::Instant::now() + ping_interval);
            }

            message = ws_rx.next() => match message {
                None => return Err(Error::unavailable("push channel closed")),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WebsocketMessage::Text(text))) => {
                    match handle_frame(text.as_str(), sink, &mut ws_tx).await {
                        Ok(FrameEffect::None) => {}
                        Ok(FrameEffect::PingInterval(interval)) => {
                            ping_interval = interval;
                            ping_timer.as_mut().reset(tokio::time::Instant::now() + ping_interval);
                        }
                        Ok(FrameEffect::ReceiverGone) => return Ok(SessionEnd::Gone),
                        Ok(FrameEffect::Closed) => {
                            return Err(Error::unavailable("session closed by the table"));
                        }
                        // Protocol errors must not corrupt the session or
                        // the snapshot; skip the frame and carry on.
                        Err(e) => error!("ignoring bad push frame: {e}"),
                    }
                }
                Some(Ok(WebsocketMessage::Ping(payload))) => {
                    ws_tx.send(WebsocketMessage::Pong(payload)).await?;
                }
                Some(Ok(WebsocketMessage::Close(frame))) => {
                    return Err(Error::unavailable(format!(
                        "connection closed by the table: {frame:?}"
                    )));
                }
                Some(Ok(_)) => trace!("ignoring non-text push message"),
            }
        }
    }
}

/// What a handled frame asks the session loop to do next.
enum FrameEffect {
    None,
    PingInterval(Duration),
    ReceiverGone,
    Closed,
}

async fn handle_frame<S>(text: &str, sink: &Sink, ws_tx: &mut S) -> Result<FrameEffect>
where
    S: futures_util::Sink<WebsocketMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    match parse_packet(text)? {
        Packet::Open(handshake) => {
            debug!("push session open; ping interval {:?}", handshake.ping_interval);
            if handshake.ping_interval > Duration::ZERO {
                return Ok(FrameEffect::PingInterval(handshake.ping_interval));
            }
            Ok(FrameEffect::None)
        }
        Packet::Ping => {
            ws_tx.send(WebsocketMessage::Text("3".into())).await?;
            Ok(FrameEffect::None)
        }
        Packet::Event { name, args } if name == "set" => {
            let payload = args
                .into_iter()
                .next()
                .ok_or_else(|| Error::invalid_argument("set event without a payload"))?;
            let update = Update::from_value(payload)?;
            if sink(update).await {
                Ok(FrameEffect::None)
            } else {
                Ok(FrameEffect::ReceiverGone)
            }
        }
        Packet::Event { name, .. } => {
            trace!("ignoring push event {name}");
            Ok(FrameEffect::None)
        }
        Packet::Close => Ok(FrameEffect::Closed),
        Packet::Pong | Packet::Connect => Ok(FrameEffect::None),
        Packet::Other(frame) => {
            trace!("ignoring push frame {frame}");
            Ok(FrameEffect::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_handshake() {
        let packet = parse_packet(
            r#"0{"sid":"abc123","upgrades":[],"pingInterval":25000,"pingTimeout":60000}"#,
        )
        .expect("handshake frame");

        assert_eq!(
            packet,
            Packet::Open(Handshake {
                ping_interval: Duration::from_secs(25),
                ping_timeout: Duration::from_secs(60),
            })
        );
    }

    #[test]
    fn parses_heartbeat_frames() {
        assert_eq!(parse_packet("2").expect("ping"), Packet::Ping);
        assert_eq!(parse_packet("3").expect("pong"), Packet::Pong);
        assert_eq!(parse_packet("1").expect("close"), Packet::Close);
        assert_eq!(parse_packet("40").expect("connect"), Packet::Connect);
    }

    #[test]
    fn parses_set_event() {
        let packet = parse_packet(r#"42["set",[{"id":"d1","type":"device"}]]"#)
            .expect("event frame");

        let Packet::Event { name, args } = packet else {
            panic!("expected an event");
        };
        assert_eq!(name, "set");
        assert_eq!(args, vec![json!([{"id": "d1", "type": "device"}])]);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(parse_packet("").is_err());
        assert!(parse_packet("x").is_err());
        assert!(parse_packet("42{\"not\":\"an array\"}").is_err());
        assert!(parse_packet("42[]").is_err());
    }

    #[test]
    fn unknown_socketio_packet_is_other() {
        assert!(matches!(
            parse_packet("41").expect("namespace disconnect"),
            Packet::Other(_)
        ));
    }
}
