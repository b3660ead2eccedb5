// mock_mqtt_server: A minimal MQTT 3.1.1 broker on a loopback socket.
//
// Speaks just enough of the protocol for one client: CONNECT/CONNACK,
// SUBSCRIBE/SUBACK, PUBLISH (QoS 0 and 1) with PUBACK, PINGREQ and
// DISCONNECT. Acknowledgements can be withheld and server publishes can be
// interleaved with them, so a real client can be tested against the packet
// ordering it meets in the field.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

/// A PUBLISH the server received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

impl ReceivedPublish {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
struct State {
    connack_code: u8,
    withhold_pubacks: bool,
    before_next_puback: Vec<(String, Vec<u8>)>,
    client_ids: Vec<String>,
    subscriptions: Vec<String>,
    published: Vec<ReceivedPublish>,
    disconnects: u32,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// A mock MQTT broker for integration testing.
///
/// Binds to port 0 and exposes the bound port. One client is served at a
/// time; a new connection replaces the previous one as the target of
/// [`MockMqttServer::push`].
pub struct MockMqttServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    /// Handle to the background accept loop; dropped when the server is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockMqttServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(State::default()));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    // Client-side drops are expected in tests.
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    // -- behavior --

    /// Answer every CONNECT with this CONNACK return code (0 accepts).
    pub fn set_connack_code(&self, code: u8) {
        self.lock().connack_code = code;
    }

    /// Stop acknowledging QoS 1 publishes.
    pub fn withhold_pubacks(&self, withhold: bool) {
        self.lock().withhold_pubacks = withhold;
    }

    /// Send a QoS 0 publish to the client just before the next PUBACK.
    pub fn publish_before_next_puback(&self, topic: &str, payload: &[u8]) {
        self.lock()
            .before_next_puback
            .push((topic.to_owned(), payload.to_vec()));
    }

    /// Send a QoS 0 publish to the connected client now. Returns false when
    /// no client is connected.
    pub fn push(&self, topic: &str, payload: &[u8]) -> bool {
        let packet = encode_publish(topic, payload);
        self.lock()
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(packet).is_ok())
    }

    // -- inspection --

    pub fn client_ids(&self) -> Vec<String> {
        self.lock().client_ids.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<ReceivedPublish> {
        self.lock().published.clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.lock().disconnects
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    lock(&state).outbound = Some(tx.clone());

    // All writes go through the channel so pushes and replies never interleave
    // mid-packet.
    let writer_task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if writer.write_all(&packet).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let result = serve(&mut reader, &tx, &state).await;
    drop(tx);
    lock(&state).outbound = None;
    let _ = writer_task.await;
    result
}

async fn serve(
    reader: &mut OwnedReadHalf,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    state: &Mutex<State>,
) -> std::io::Result<()> {
    while let Some((header, body)) = read_packet(reader).await? {
        match header >> 4 {
            CONNECT => {
                let client_id = connect_client_id(&body);
                let code = {
                    let mut state = lock(state);
                    state.client_ids.push(client_id);
                    state.connack_code
                };
                send(tx, vec![0x20, 0x02, 0x00, code]);
                if code != 0 {
                    return Ok(());
                }
            }
            SUBSCRIBE => {
                let (pid, filters) = subscribe_filters(&body);
                let granted = filters.len();
                lock(state).subscriptions.extend(filters);
                let mut suback = vec![0x90];
                suback.extend(encode_remaining_length(2 + granted));
                suback.extend_from_slice(&pid);
                suback.extend(std::iter::repeat_n(0x01, granted));
                send(tx, suback);
            }
            PUBLISH => {
                let qos = (header >> 1) & 0x03;
                let (topic, pid, payload) = split_publish(&body, qos);
                let (withhold, interleave) = {
                    let mut state = lock(state);
                    state.published.push(ReceivedPublish {
                        topic,
                        payload,
                        qos,
                    });
                    if qos == 0 {
                        continue;
                    }
                    (
                        state.withhold_pubacks,
                        std::mem::take(&mut state.before_next_puback),
                    )
                };
                for (topic, payload) in interleave {
                    send(tx, encode_publish(&topic, &payload));
                }
                if !withhold && let Some(pid) = pid {
                    send(tx, vec![0x40, 0x02, pid[0], pid[1]]);
                }
            }
            PINGREQ => send(tx, vec![0xD0, 0x00]),
            DISCONNECT => {
                lock(state).disconnects += 1;
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}

fn send(tx: &mpsc::UnboundedSender<Vec<u8>>, packet: Vec<u8>) {
    let _ = tx.send(packet);
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// One packet as (fixed header byte, body). `None` on a clean EOF.
async fn read_packet(reader: &mut OwnedReadHalf) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 1];
    if reader.read(&mut header).await? == 0 {
        return Ok(None);
    }
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        len |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "remaining length too long",
            ));
        }
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some((header[0], body)))
}

fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = u8::try_from(len % 128).unwrap_or(0);
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            return out;
        }
    }
}

fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let topic_len = u16::try_from(topic.len()).unwrap_or(u16::MAX);
    let mut packet = vec![0x30];
    packet.extend(encode_remaining_length(2 + topic.len() + payload.len()));
    packet.extend_from_slice(&topic_len.to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// A length-prefixed string at `at`, and the offset just past it.
fn read_str(body: &[u8], at: usize) -> (String, usize) {
    let Some(prefix) = body.get(at..at + 2) else {
        return (String::new(), body.len());
    };
    let len = usize::from(u16::from_be_bytes([prefix[0], prefix[1]]));
    let end = (at + 2 + len).min(body.len());
    (
        String::from_utf8_lossy(&body[at + 2..end]).into_owned(),
        end,
    )
}

fn connect_client_id(body: &[u8]) -> String {
    // Protocol name, then level, flags and keep-alive (4 bytes).
    let (_protocol, after_name) = read_str(body, 0);
    read_str(body, after_name + 4).0
}

fn subscribe_filters(body: &[u8]) -> ([u8; 2], Vec<String>) {
    let pid = [
        body.first().copied().unwrap_or(0),
        body.get(1).copied().unwrap_or(0),
    ];
    let mut filters = Vec::new();
    let mut at = 2;
    while at + 2 <= body.len() {
        let (filter, end) = read_str(body, at);
        filters.push(filter);
        // Skip the requested QoS byte.
        at = end + 1;
    }
    (pid, filters)
}

fn split_publish(body: &[u8], qos: u8) -> (String, Option<[u8; 2]>, Vec<u8>) {
    let (topic, mut at) = read_str(body, 0);
    let mut pid = None;
    if qos > 0 && at + 2 <= body.len() {
        pid = Some([body[at], body[at + 1]]);
        at += 2;
    }
    (topic, pid, body.get(at..).unwrap_or_default().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_length_uses_continuation_bits() {
        assert_eq!(encode_remaining_length(0), vec![0x00]);
        assert_eq!(encode_remaining_length(127), vec![0x7F]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(encode_remaining_length(16_383), vec![0xFF, 0x7F]);
    }

    #[test]
    fn publish_body_splits_topic_packet_id_and_payload() {
        let packet = encode_publish("a/b", b"{}");
        // Skip fixed header and one length byte.
        let (topic, pid, payload) = split_publish(&packet[2..], 0);
        assert_eq!(topic, "a/b");
        assert_eq!(pid, None);
        assert_eq!(payload, b"{}");
    }
}
