//! Multi-client request/response server around one map backend (§3.6,
//! §4.6).
//!
//! Grounded in `original_source/libnt/nanotube_map_taps.cpp`'s
//! `nanotube_tap_map_func`: scan latched clients, latch new requests only
//! when nobody is already latched (head-of-line-overtake prevention),
//! serve the lowest-indexed latched client, respond, repeat.
//!
//! Wire format note (§4.6 names a client's `key_in`/`data_in` attributes
//! but not an operation code -- the arbiter clearly needs one to know
//! which of NOP/READ/WRITE/INSERT/UPDATE/REMOVE to perform). This crate
//! prepends one operation byte to the request element
//! (`encode_request`/`decode_request`); this is a design decision beyond
//! what §4.6 states explicitly, recorded in `DESIGN.md`.

use std::sync::Arc;

use crate::config::{MAP_CLIENT_REQUEST_DEPTH, MAP_CLIENT_RESPONSE_DEPTH};
use crate::context::{ChannelFlags, ChannelId, Context};
use crate::channel::Channel;
use crate::fatal;
use crate::map::{self, MapBackend, MapOp, MapResult};
use crate::thread::Thread;

/// The two channels wired to one arbiter client.
pub struct ClientChannels {
    pub request: Arc<Channel>,
    pub response: Arc<Channel>,
}

fn op_to_byte(op: MapOp) -> u8 {
    match op {
        MapOp::Nop => 0,
        MapOp::Read => 1,
        MapOp::Write => 2,
        MapOp::Insert => 3,
        MapOp::Update => 4,
        MapOp::Remove => 5,
    }
}

fn byte_to_op(byte: u8) -> MapOp {
    match byte {
        1 => MapOp::Read,
        2 => MapOp::Write,
        3 => MapOp::Insert,
        4 => MapOp::Update,
        5 => MapOp::Remove,
        _ => MapOp::Nop,
    }
}

/// Builds a request element for a map-tap client channel.
pub fn encode_request(op: MapOp, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len() + data.len());
    out.push(op_to_byte(op));
    out.extend_from_slice(key);
    out.extend_from_slice(data);
    out
}

/// Splits a response element back into `(result, data)`, given whether
/// this client's responses carry a leading result byte.
pub fn decode_response(response_needs_result: bool, element: &[u8]) -> (Option<MapResult>, &[u8]) {
    if response_needs_result {
        let result = if element[0] != 0 { MapResult::Present } else { MapResult::Absent };
        (Some(result), &element[1..])
    } else {
        (None, element)
    }
}

struct PendingClient {
    request: Arc<Channel>,
    response: Arc<Channel>,
    key_in_length: usize,
    data_in_length: usize,
    response_needs_result: bool,
    data_out_length: usize,
}

/// Build-time configuration of a map-tap arbiter (§4.6 "Build-time").
pub struct MapTapArbiterBuilder {
    context: Arc<Context>,
    backend: Arc<dyn MapBackend>,
    num_clients: usize,
    clients: Vec<PendingClient>,
}

impl MapTapArbiterBuilder {
    pub fn new(name: impl Into<String>, backend: Arc<dyn MapBackend>, num_clients: usize) -> Self {
        MapTapArbiterBuilder {
            context: Context::new(name),
            backend,
            num_clients,
            clients: Vec::new(),
        }
    }

    /// Registers one client, returning the request/response channels for
    /// the *client's* context to bind (as writer/reader respectively).
    pub fn add_client(
        &mut self,
        key_in_length: usize,
        data_in_length: usize,
        response_needs_result: bool,
        data_out_length: usize,
    ) -> ClientChannels {
        let idx = self.clients.len() as ChannelId;
        let request = Arc::new(Channel::new(
            format!("{}-req-{}", self.context.name(), idx),
            1 + key_in_length + data_in_length,
            MAP_CLIENT_REQUEST_DEPTH,
        ));
        let response_width = data_out_length + if response_needs_result { 1 } else { 0 };
        let response = Arc::new(Channel::new(
            format!("{}-resp-{}", self.context.name(), idx),
            response_width.max(1),
            MAP_CLIENT_RESPONSE_DEPTH,
        ));

        self.context.add_channel(idx, Arc::clone(&request), ChannelFlags::READ);
        self.context.add_channel(idx, Arc::clone(&response), ChannelFlags::WRITE);

        self.clients.push(PendingClient {
            request: Arc::clone(&request),
            response: Arc::clone(&response),
            key_in_length,
            data_in_length,
            response_needs_result,
            data_out_length,
        });

        ClientChannels { request, response }
    }

    /// §4.6: "At build, the number of *added* clients must equal
    /// `num_clients`, else fatal." Starts the single service thread.
    pub fn build(self) -> Arc<MapTapArbiter> {
        if self.clients.len() != self.num_clients {
            fatal!(
                "map tap arbiter '{}': expected {} clients, got {}",
                self.context.name(),
                self.num_clients,
                self.clients.len()
            );
        }

        let thread = Thread::new(format!("{}-svc", self.context.name()));
        let backend = self.backend;
        let context = self.context;
        let mut service_clients: Vec<ServiceClient> = self.clients.into_iter().map(ServiceClient::new).collect();

        let thread_for_body = Arc::clone(&thread);
        thread.start(Arc::clone(&context), move || {
            service_step(backend.as_ref(), &mut service_clients, &thread_for_body);
        });

        Arc::new(MapTapArbiter { context, thread })
    }
}

struct ServiceClient {
    request: Arc<Channel>,
    response: Arc<Channel>,
    key_in_length: usize,
    data_in_length: usize,
    response_needs_result: bool,
    data_out_length: usize,
    latched: bool,
    latched_op: MapOp,
    latched_key: Vec<u8>,
    latched_data: Vec<u8>,
}

impl ServiceClient {
    fn new(p: PendingClient) -> Self {
        ServiceClient {
            request: p.request,
            response: p.response,
            key_in_length: p.key_in_length,
            data_in_length: p.data_in_length,
            response_needs_result: p.response_needs_result,
            data_out_length: p.data_out_length,
            latched: false,
            latched_op: MapOp::Nop,
            latched_key: Vec::new(),
            latched_data: Vec::new(),
        }
    }

    fn request_width(&self) -> usize {
        1 + self.key_in_length + self.data_in_length
    }
}

fn resize_bytes(buf: &[u8], target: usize) -> Vec<u8> {
    let mut out = vec![0u8; target];
    let n = buf.len().min(target);
    out[..n].copy_from_slice(&buf[..n]);
    out
}

/// One service-thread invocation (§4.6 steps 1-6).
fn service_step(backend: &dyn MapBackend, clients: &mut [ServiceClient], thread: &Arc<Thread>) {
    let any_latched = clients.iter().any(|c| c.latched);
    let mut made_progress = any_latched;

    if !any_latched {
        for client in clients.iter_mut() {
            let mut buf = vec![0u8; client.request_width()];
            if client.request.try_read(&mut buf) {
                client.latched_op = byte_to_op(buf[0]);
                client.latched_key = buf[1..1 + client.key_in_length].to_vec();
                client.latched_data = buf[1 + client.key_in_length..].to_vec();
                client.latched = true;
                made_progress = true;
            }
        }
    }

    if !made_progress {
        thread.sleep();
        return;
    }

    let Some(index) = clients.iter().position(|c| c.latched) else {
        return;
    };
    clients[index].latched = false;

    let backend_key_len = backend.key_length();
    let backend_val_len = backend.value_length();
    let key = resize_bytes(&clients[index].latched_key, backend_key_len);
    let data_in = resize_bytes(&clients[index].latched_data, backend_val_len);
    // The arbiter-facing protocol exposes whole-value read/write, not the
    // byte-level masking of the lower-level `map_op` API (§4.6 does not
    // mention a mask among a client's attributes) -- so every WRITE-class
    // request here is a full-width overlay.
    let full_mask = vec![0xffu8; (backend_val_len + 7) / 8];
    let mut data_out = vec![0u8; backend_val_len];

    let (result, _written) = map::map_op(
        backend,
        clients[index].latched_op,
        &key,
        Some(&data_in),
        Some(&mut data_out),
        Some(&full_mask),
        0,
        backend_val_len,
    );

    let client = &mut clients[index];
    // Matches the response channel's own `element_size`, which floors the
    // same width to 1 byte (`add_client`'s `response_width.max(1)`) so a
    // client with no result flag and no data-out still has a slot to
    // write to.
    let response_len = (client.data_out_length + if client.response_needs_result { 1 } else { 0 }).max(1);
    let mut response = vec![0u8; response_len];
    let mut pos = 0;
    if client.response_needs_result {
        response[0] = matches!(result, MapResult::Present) as u8;
        pos = 1;
    }
    let copy_len = client.data_out_length.min(data_out.len());
    response[pos..pos + copy_len].copy_from_slice(&data_out[..copy_len]);

    while !client.response.try_write(&response) {
        thread.sleep();
    }
}

/// A running map-tap arbiter: one backend, its clients, and the service
/// thread that serves them.
pub struct MapTapArbiter {
    context: Arc<Context>,
    thread: Arc<Thread>,
}

impl MapTapArbiter {
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    pub fn stop(&self) {
        self.thread.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ChannelFlags as CF, Direction};
    use crate::map::cam::CamMap;

    #[test]
    fn single_client_write_then_read() {
        let backend = CamMap::new(1, 4, 4, 4);
        let mut builder = MapTapArbiterBuilder::new("m", backend, 1);
        let client = builder.add_client(4, 4, true, 4);
        let arbiter = builder.build();

        let client_ctx = Context::new("client");
        let client_thread = Thread::new("client");
        client_thread.bind_current_for_test();
        client_ctx.bind_thread(Arc::clone(&client_thread));
        client_ctx.add_channel(0, Arc::clone(&client.request), CF::WRITE);
        client_ctx.add_channel(0, Arc::clone(&client.response), CF::READ);

        let req = encode_request(MapOp::Write, &[1, 0, 0, 0], &[9, 9, 9, 9]);
        while !client_ctx.find_channel(0, Direction::Write).try_write(&req) {}

        let mut resp = vec![0u8; 5];
        let mut tries = 0;
        while !client_ctx.find_channel(0, Direction::Read).try_read(&mut resp) {
            std::thread::sleep(std::time::Duration::from_millis(1));
            tries += 1;
            assert!(tries < 1000, "arbiter never responded");
        }
        let (result, data) = decode_response(true, &resp);
        assert_eq!(result, Some(MapResult::Absent));
        assert_eq!(data, [0, 0, 0, 0]);

        let req = encode_request(MapOp::Read, &[1, 0, 0, 0], &[0, 0, 0, 0]);
        while !client_ctx.find_channel(0, Direction::Write).try_write(&req) {}
        let mut tries = 0;
        while !client_ctx.find_channel(0, Direction::Read).try_read(&mut resp) {
            std::thread::sleep(std::time::Duration::from_millis(1));
            tries += 1;
            assert!(tries < 1000, "arbiter never responded");
        }
        let (result, data) = decode_response(true, &resp);
        assert_eq!(result, Some(MapResult::Present));
        assert_eq!(data, [9, 9, 9, 9]);

        arbiter.stop();
    }
}
