// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Binary request/response transport over ZeroMQ.
//!
//! Two router sockets bound on the same address: clients push requests at
//! the receive socket and read responses (and the connection handshake)
//! from the send socket. One task owns each socket. Responses flow from
//! request-handler continuations through an unbounded MPSC queue into the
//! send task, which addresses each one with the identity frame recorded at
//! the client's handshake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{FutureExt, SinkExt, StreamExt};
use tmq::router::{router, Router};
use tmq::{Context, Multipart};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::arena::{PayloadArena, PayloadSlice};
use crate::metrics::{Counter, Histogram, Meter, MetricsRegistry};
use crate::protocols::{micros_since_epoch, stages, Input, InputType, Lineage};

/// Soft cap on queued responses; past this the queue keeps accepting but
/// the overflow counter records the excursion.
pub const RESPONSE_QUEUE_SOFT_CAP: usize = 80_000;
/// Requests drained per receive-loop wakeup.
pub const NUM_REQUESTS_RECV: usize = 100;
/// Responses drained per send-loop wakeup.
pub const NUM_RESPONSES_SEND: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message truncated at {0}")]
    Truncated(&'static str),

    #[error("unknown input type code {0}")]
    UnknownInputType(u8),

    #[error("application name is not utf-8")]
    BadAppName,

    #[error("input payload is not utf-8")]
    BadStringPayload,

    #[error("payload length {got} does not match {expected} expected bytes")]
    LengthMismatch { expected: usize, got: usize },
}

/// Byte-level request/response layout. Everything is little-endian.
pub mod wire {
    use super::*;

    pub struct RequestHeader {
        pub client_id: u32,
        pub request_id: u32,
        pub app: String,
        pub input_type: InputType,
        pub element_count: usize,
    }

    struct Cursor<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], WireError> {
            if self.pos + n > self.buf.len() {
                return Err(WireError::Truncated(what));
            }
            let out = &self.buf[self.pos..self.pos + n];
            self.pos += n;
            Ok(out)
        }

        fn u32(&mut self, what: &'static str) -> Result<u32, WireError> {
            let b = self.take(4, what)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        fn u8(&mut self, what: &'static str) -> Result<u8, WireError> {
            Ok(self.take(1, what)?[0])
        }

        fn rest(&self) -> &'a [u8] {
            &self.buf[self.pos..]
        }
    }

    /// Split a request payload frame into its header and the raw element
    /// bytes.
    pub fn parse_request(payload: &[u8]) -> Result<(RequestHeader, &[u8]), WireError> {
        let mut cursor = Cursor {
            buf: payload,
            pos: 0,
        };
        let client_id = cursor.u32("client_id")?;
        let request_id = cursor.u32("request_id")?;
        let name_len = cursor.u32("app_name_length")? as usize;
        let name = cursor.take(name_len, "app_name")?;
        let app = std::str::from_utf8(name)
            .map_err(|_| WireError::BadAppName)?
            .to_string();
        let type_code = cursor.u8("input_type_code")?;
        let input_type =
            InputType::from_wire_code(type_code).ok_or(WireError::UnknownInputType(type_code))?;
        let element_count = cursor.u32("input_length")? as usize;
        let elements = cursor.rest();
        if let Some(size) = input_type.element_size() {
            let expected = element_count * size;
            if elements.len() != expected {
                return Err(WireError::LengthMismatch {
                    expected,
                    got: elements.len(),
                });
            }
        }
        Ok((
            RequestHeader {
                client_id,
                request_id,
                app,
                input_type,
                element_count,
            },
            elements,
        ))
    }

    /// Decode typed elements from the raw bytes a request carried.
    pub fn decode_input(
        input_type: InputType,
        element_count: usize,
        bytes: &[u8],
    ) -> Result<Input, WireError> {
        let input = match input_type {
            InputType::Bytes => Input::Bytes(bytes.to_vec()),
            InputType::Ints => Input::Ints(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            InputType::Floats => Input::Floats(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            InputType::Doubles => Input::Doubles(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect(),
            ),
            InputType::Strings => {
                let mut cursor = Cursor { buf: bytes, pos: 0 };
                let mut strings = Vec::with_capacity(element_count);
                for _ in 0..element_count {
                    let len = cursor.u32("string_length")? as usize;
                    let raw = cursor.take(len, "string_bytes")?;
                    strings.push(
                        std::str::from_utf8(raw)
                            .map_err(|_| WireError::BadStringPayload)?
                            .to_string(),
                    );
                }
                Input::Strings(strings)
            }
        };
        if input.len() != element_count {
            return Err(WireError::LengthMismatch {
                expected: element_count,
                got: input.len(),
            });
        }
        Ok(input)
    }

    /// Encode the element bytes of an input (the portion stored in the
    /// payload arena).
    pub fn encode_elements(input: &Input) -> Vec<u8> {
        match input {
            Input::Bytes(v) => v.clone(),
            Input::Ints(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Input::Floats(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Input::Doubles(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Input::Strings(v) => {
                let mut out = Vec::new();
                for s in v {
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                out
            }
        }
    }

    /// Build a full request payload frame. Used by client drivers and the
    /// integration tests.
    pub fn pack_request(client_id: u32, request_id: u32, app: &str, input: &Input) -> Vec<u8> {
        let elements = encode_elements(input);
        let mut out = Vec::with_capacity(17 + app.len() + elements.len());
        out.extend_from_slice(&client_id.to_le_bytes());
        out.extend_from_slice(&request_id.to_le_bytes());
        out.extend_from_slice(&(app.len() as u32).to_le_bytes());
        out.extend_from_slice(app.as_bytes());
        out.push(input.input_type().wire_code());
        out.extend_from_slice(&(input.len() as u32).to_le_bytes());
        out.extend_from_slice(&elements);
        out
    }

    /// Build a response payload frame: request id, output type code and
    /// value, then the length-prefixed lineage JSON blob.
    pub fn pack_response(request_id: u32, output: f64, lineage: &Lineage) -> Vec<u8> {
        let lineage_json = serde_json::to_vec(lineage).unwrap_or_default();
        let mut out = Vec::with_capacity(21 + lineage_json.len());
        out.extend_from_slice(&request_id.to_le_bytes());
        out.push(InputType::Doubles.wire_code());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&output.to_le_bytes());
        out.extend_from_slice(&(lineage_json.len() as u32).to_le_bytes());
        out.extend_from_slice(&lineage_json);
        out
    }

    pub struct ResponseFrame {
        pub request_id: u32,
        pub output: f64,
        pub lineage: Lineage,
    }

    /// Client-side view of a response payload frame.
    pub fn parse_response(payload: &[u8]) -> Result<ResponseFrame, WireError> {
        let mut cursor = Cursor {
            buf: payload,
            pos: 0,
        };
        let request_id = cursor.u32("request_id")?;
        let type_code = cursor.u8("output_type_code")?;
        InputType::from_wire_code(type_code).ok_or(WireError::UnknownInputType(type_code))?;
        let count = cursor.u32("output_length")? as usize;
        let raw = cursor.take(count * 8, "output_bytes")?;
        let output = f64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]);
        let lineage_len = cursor.u32("lineage_length")? as usize;
        let lineage_raw = cursor.take(lineage_len, "lineage")?;
        let lineage: Lineage = serde_json::from_slice(lineage_raw)
            .map_err(|_| WireError::Truncated("lineage_json"))?;
        Ok(ResponseFrame {
            request_id,
            output,
            lineage,
        })
    }
}

/// Request tuple handed to a per-application dispatch function. The input
/// stays in the payload arena until the response goes out.
pub struct FrontendRpcRequest {
    pub input_type: InputType,
    pub element_count: usize,
    pub payload: PayloadSlice,
    pub request_id: u32,
    pub client_id: u64,
    pub lineage: Lineage,
    pub deadline: Instant,
}

impl FrontendRpcRequest {
    pub fn decode_input(&self) -> Result<Input, WireError> {
        wire::decode_input(self.input_type, self.element_count, &self.payload.bytes())
    }
}

pub struct FrontendRpcResponse {
    pub request_id: u32,
    pub client_id: u64,
    pub output: f64,
    pub lineage: Lineage,
    /// The request's arena range, released once the response is written.
    pub payload: Option<PayloadSlice>,
}

pub type AppFunction = Arc<dyn Fn(FrontendRpcRequest) + Send + Sync>;

struct AppEntry {
    latency_budget: Duration,
    function: AppFunction,
}

/// Non-blocking producer half of the response queue.
#[derive(Clone)]
pub struct ResponseSender {
    tx: UnboundedSender<FrontendRpcResponse>,
    depth: Arc<AtomicUsize>,
    enqueue_meter: Arc<Meter>,
    overflow: Arc<Counter>,
}

impl ResponseSender {
    pub fn send(&self, response: FrontendRpcResponse) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > RESPONSE_QUEUE_SOFT_CAP {
            self.overflow.increment(1);
        }
        self.enqueue_meter.mark(1);
        // The send loop owning the receiver only goes away at shutdown;
        // a failed send just drops the response (and its arena range).
        let _ = self.tx.send(response);
    }
}

struct ZmqState {
    active: AtomicBool,
    app_functions: Mutex<HashMap<String, AppEntry>>,
    client_routing: Mutex<HashMap<u64, Vec<u8>>>,
    client_id_counter: AtomicU64,
    arena: Arc<PayloadArena>,
    response_tx: UnboundedSender<FrontendRpcResponse>,
    response_rx: Mutex<Option<UnboundedReceiver<FrontendRpcResponse>>>,
    queue_depth: Arc<AtomicUsize>,
    request_enqueue_meter: Arc<Meter>,
    response_enqueue_meter: Arc<Meter>,
    response_dequeue_meter: Arc<Meter>,
    dropped_meter: Arc<Meter>,
    queue_overflow: Arc<Counter>,
    recv_latency: Arc<Histogram>,
}

#[derive(Clone)]
pub struct ZmqFrontend {
    state: Arc<ZmqState>,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ZmqFrontend {
    pub fn new(registry: &MetricsRegistry, arena_bytes: usize) -> anyhow::Result<Self> {
        let (tx, rx) = unbounded_channel();
        let wrap_counter = registry.create_counter("zmq_frontend:arena_wraps")?;
        let state = Arc::new(ZmqState {
            active: AtomicBool::new(false),
            app_functions: Mutex::new(HashMap::new()),
            client_routing: Mutex::new(HashMap::new()),
            client_id_counter: AtomicU64::new(0),
            arena: PayloadArena::new(arena_bytes, wrap_counter),
            response_tx: tx,
            response_rx: Mutex::new(Some(rx)),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            request_enqueue_meter: registry.create_meter("zmq_frontend:request_enqueue")?,
            response_enqueue_meter: registry.create_meter("zmq_frontend:response_enqueue")?,
            response_dequeue_meter: registry.create_meter("zmq_frontend:response_dequeue")?,
            dropped_meter: registry.create_meter("zmq_frontend:dropped_requests")?,
            queue_overflow: registry.create_counter("zmq_frontend:queue_overflow")?,
            recv_latency: registry.create_histogram("zmq_frontend:recv_latency_micros")?,
        });
        Ok(Self {
            state,
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Bind both router sockets and spawn the send and receive loops.
    /// A bind failure is fatal to startup.
    pub fn start(&self, address: &str, send_port: u16, recv_port: u16) -> anyhow::Result<()> {
        let context = Context::new();
        let recv_socket = router(&context)
            .bind(&format!("tcp://{address}:{recv_port}"))
            .map_err(|err| anyhow::anyhow!("failed to bind receive socket on {recv_port}: {err}"))?;
        let send_socket = router(&context)
            .bind(&format!("tcp://{address}:{send_port}"))
            .map_err(|err| anyhow::anyhow!("failed to bind send socket on {send_port}: {err}"))?;
        self.state.active.store(true, Ordering::Release);

        tracing::info!(address, send_port, recv_port, "zmq frontend listening");

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(recv_loop(
            self.state.clone(),
            recv_socket,
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(send_loop(
            self.state.clone(),
            send_socket,
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Install the dispatch function for an application. First writer wins;
    /// re-adding an existing name is a no-op and returns `false`.
    pub fn add_application(
        &self,
        name: &str,
        latency_budget: Duration,
        function: AppFunction,
    ) -> bool {
        let mut apps = self.state.app_functions.lock().unwrap();
        if apps.contains_key(name) {
            return false;
        }
        apps.insert(
            name.to_string(),
            AppEntry {
                latency_budget,
                function,
            },
        );
        true
    }

    pub fn response_sender(&self) -> ResponseSender {
        ResponseSender {
            tx: self.state.response_tx.clone(),
            depth: self.state.queue_depth.clone(),
            enqueue_meter: self.state.response_enqueue_meter.clone(),
            overflow: self.state.queue_overflow.clone(),
        }
    }

    pub fn num_clients(&self) -> usize {
        self.state.client_routing.lock().unwrap().len()
    }

    pub fn num_applications(&self) -> usize {
        self.state.app_functions.lock().unwrap().len()
    }

    /// Cooperative shutdown: both socket loops exit on the cancellation
    /// token, then the routing map is cleared.
    pub async fn stop(&self) {
        self.state.active.store(false, Ordering::Release);
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.state.client_routing.lock().unwrap().clear();
    }
}

async fn recv_loop(state: Arc<ZmqState>, mut socket: Router, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = socket.next() => {
                match msg {
                    Some(Ok(multipart)) => {
                        handle_request(&state, multipart);
                        // Drain whatever else is already queued, bounded per
                        // iteration so cancellation stays responsive.
                        let mut drained = 1;
                        while drained < NUM_REQUESTS_RECV {
                            match socket.next().now_or_never() {
                                Some(Some(Ok(multipart))) => {
                                    handle_request(&state, multipart);
                                    drained += 1;
                                }
                                Some(Some(Err(err))) => {
                                    tracing::error!(%err, "zmq receive error");
                                    break;
                                }
                                _ => break,
                            }
                        }
                    }
                    Some(Err(err)) => tracing::error!(%err, "zmq receive error"),
                    None => break,
                }
            }
        }
    }
    tracing::debug!("zmq receive loop exited");
}

fn handle_request(state: &Arc<ZmqState>, multipart: Multipart) {
    if !state.active.load(Ordering::Acquire) {
        return;
    }
    let received_at = Instant::now();
    if multipart.len() < 3 {
        state.dropped_meter.mark(1);
        tracing::warn!(frames = multipart.len(), "malformed zmq request envelope");
        return;
    }
    let payload: &[u8] = &multipart[2];
    let (header, elements) = match wire::parse_request(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            state.dropped_meter.mark(1);
            tracing::warn!(%err, "undecodable zmq request");
            return;
        }
    };

    let Some(slice) = state.arena.store(elements) else {
        state.dropped_meter.mark(1);
        tracing::warn!(
            app = header.app,
            bytes = elements.len(),
            "payload arena exhausted, dropping request"
        );
        return;
    };

    let (function, latency_budget) = {
        let apps = state.app_functions.lock().unwrap();
        match apps.get(&header.app) {
            Some(entry) => (entry.function.clone(), entry.latency_budget),
            None => {
                state.dropped_meter.mark(1);
                tracing::warn!(app = header.app, "request for unknown application");
                return;
            }
        }
    };

    let mut lineage = Lineage::new();
    lineage.insert(stages::FRONTEND_RECV.to_string(), micros_since_epoch());

    state.request_enqueue_meter.mark(1);
    function(FrontendRpcRequest {
        input_type: header.input_type,
        element_count: header.element_count,
        payload: slice,
        request_id: header.request_id,
        client_id: header.client_id as u64,
        lineage,
        deadline: received_at + latency_budget,
    });
    state
        .recv_latency
        .insert(received_at.elapsed().as_micros() as i64);
}

async fn send_loop(state: Arc<ZmqState>, mut socket: Router, cancel: CancellationToken) {
    let mut rx = state
        .response_rx
        .lock()
        .unwrap()
        .take()
        .expect("send loop started once");
    let mut batch: Vec<FrontendRpcResponse> = Vec::with_capacity(NUM_RESPONSES_SEND);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = socket.next() => {
                match msg {
                    Some(Ok(multipart)) => handle_connection(&state, &mut socket, multipart).await,
                    Some(Err(err)) => tracing::error!(%err, "zmq send-socket receive error"),
                    None => break,
                }
            }
            n = rx.recv_many(&mut batch, NUM_RESPONSES_SEND) => {
                if n == 0 {
                    break;
                }
                for response in batch.drain(..) {
                    state.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    send_response_frame(&state, &mut socket, response).await;
                }
            }
        }
    }
    tracing::debug!("zmq send loop exited");
}

/// First contact: a zero-length payload after the identity frame. Assign a
/// fresh client id, record the identity for response routing, and echo the
/// id back as four little-endian bytes.
async fn handle_connection(state: &Arc<ZmqState>, socket: &mut Router, multipart: Multipart) {
    if multipart.len() < 3 || !multipart[2].is_empty() {
        tracing::warn!(
            frames = multipart.len(),
            "unexpected message on send socket"
        );
        return;
    }
    let identity = multipart[0].to_vec();
    let client_id = state.client_id_counter.fetch_add(1, Ordering::Relaxed);
    state
        .client_routing
        .lock()
        .unwrap()
        .entry(client_id)
        .or_insert_with(|| identity.clone());

    let reply: Multipart = vec![
        identity,
        Vec::new(),
        (client_id as u32).to_le_bytes().to_vec(),
    ]
    .into();
    if let Err(err) = socket.send(reply).await {
        tracing::error!(client_id, %err, "failed to answer handshake");
        return;
    }
    tracing::debug!(client_id, "new zmq client connected");
}

async fn send_response_frame(
    state: &Arc<ZmqState>,
    socket: &mut Router,
    mut response: FrontendRpcResponse,
) {
    let identity = {
        let routing = state.client_routing.lock().unwrap();
        routing.get(&response.client_id).cloned()
    };
    let Some(identity) = identity else {
        state.dropped_meter.mark(1);
        tracing::warn!(
            client_id = response.client_id,
            "no routing entry for response"
        );
        return;
    };
    response
        .lineage
        .insert(stages::FRONTEND_SEND.to_string(), micros_since_epoch());
    let payload = wire::pack_response(response.request_id, response.output, &response.lineage);
    let frames: Multipart = vec![identity, Vec::new(), payload].into();
    if let Err(err) = socket.send(frames).await {
        tracing::error!(client_id = response.client_id, %err, "failed to send response");
    }
    state.response_dequeue_meter.mark(1);
    // Dropping the response releases its arena range.
    response.payload.take();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let input = Input::Doubles(vec![1.0, 2.0, 3.0]);
        let payload = wire::pack_request(7, 42, "alpha", &input);
        let (header, elements) = wire::parse_request(&payload).unwrap();
        assert_eq!(header.client_id, 7);
        assert_eq!(header.request_id, 42);
        assert_eq!(header.app, "alpha");
        assert_eq!(header.input_type, InputType::Doubles);
        assert_eq!(header.element_count, 3);
        let decoded = wire::decode_input(header.input_type, header.element_count, elements).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn string_inputs_are_length_prefixed() {
        let input = Input::Strings(vec!["abc".to_string(), "".to_string()]);
        let payload = wire::pack_request(0, 1, "alpha", &input);
        let (header, elements) = wire::parse_request(&payload).unwrap();
        let decoded = wire::decode_input(header.input_type, header.element_count, elements).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn truncated_request_is_rejected() {
        let input = Input::Floats(vec![1.0, 2.0]);
        let payload = wire::pack_request(0, 1, "alpha", &input);
        assert!(matches!(
            wire::parse_request(&payload[..payload.len() - 1]),
            Err(WireError::LengthMismatch { .. })
        ));
        assert!(wire::parse_request(&payload[..6]).is_err());
    }

    #[test]
    fn bad_input_type_code_is_rejected() {
        let input = Input::Bytes(vec![1, 2, 3]);
        let mut payload = wire::pack_request(0, 1, "a", &input);
        // Type code sits right after the 4+4+4-byte header and the name.
        payload[13] = 9;
        assert!(matches!(
            wire::parse_request(&payload),
            Err(WireError::UnknownInputType(9))
        ));
    }

    #[test]
    fn response_round_trip_carries_lineage() {
        let mut lineage = Lineage::new();
        lineage.insert("frontend::recv".to_string(), 123);
        let payload = wire::pack_response(42, 7.5, &lineage);
        let frame = wire::parse_response(&payload).unwrap();
        assert_eq!(frame.request_id, 42);
        assert_eq!(frame.output, 7.5);
        assert_eq!(frame.lineage.get("frontend::recv"), Some(&123));
    }

    #[tokio::test]
    async fn add_application_is_first_writer_wins() {
        let registry = MetricsRegistry::new();
        let frontend = ZmqFrontend::new(&registry, 1 << 16).unwrap();
        let noop: AppFunction = Arc::new(|_request| {});
        assert!(frontend.add_application("alpha", Duration::from_millis(20), noop.clone()));
        assert!(!frontend.add_application("alpha", Duration::from_millis(50), noop));
        assert_eq!(frontend.num_applications(), 1);
    }

    #[tokio::test]
    async fn response_sender_tracks_depth_and_overflow() {
        let registry = MetricsRegistry::new();
        let frontend = ZmqFrontend::new(&registry, 1 << 16).unwrap();
        let sender = frontend.response_sender();
        sender.send(FrontendRpcResponse {
            request_id: 1,
            client_id: 1,
            output: 0.0,
            lineage: Lineage::new(),
            payload: None,
        });
        assert_eq!(frontend.state.queue_depth.load(Ordering::Relaxed), 1);
        assert_eq!(frontend.state.response_enqueue_meter.count(), 1);
        assert_eq!(frontend.state.queue_overflow.value(), 0);
    }
}
