//! Processing system (§4.13, component M): the container that owns
//! contexts, threads, channels, maps, and packet kernels, wires them
//! together via an application-provided `setup`, and tears them down.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::context::{Context, MapId};
use crate::fatal;
use crate::idle::IdleWaiter;
use crate::kernel::{ChannelPacketKernel, FuncPacketKernel, KernelResult};
use crate::map::MapBackend;
use crate::packet::{BusKind, Packet};
use crate::thread::Thread;

/// A user function kernel, boxed for heterogeneous storage alongside
/// channel kernels (§4.12).
pub type BoxedFunc = Box<dyn FnMut(&mut Packet) -> KernelResult + Send>;

/// One entry of the system's packet-kernel-shim vector.
pub enum KernelShim {
    Func(FuncPacketKernel<BoxedFunc>),
    Channel(ChannelPacketKernel),
}

/// Owns the whole dataflow graph for one running instance (§4.13).
pub struct ProcessingSystem {
    main_context: Arc<Context>,
    main_thread: Arc<Thread>,
    contexts: Mutex<Vec<Arc<Context>>>,
    threads: Mutex<Vec<Arc<Thread>>>,
    /// "multi-map name -> channel": a name may legitimately be shared by
    /// more than one channel instance (e.g. per-client map-tap request
    /// channels), so lookups by name return every channel registered
    /// under it.
    channels: Mutex<HashMap<String, Vec<Arc<Channel>>>>,
    maps: Mutex<HashMap<MapId, Arc<dyn MapBackend>>>,
    kernels: Mutex<Vec<KernelShim>>,
    exported_read: Mutex<Vec<Arc<Channel>>>,
    exported_write: Mutex<Vec<Arc<Channel>>>,
    /// "heap-allocated blobs to free at teardown": arbitrary owned state
    /// a `setup()` closure wants the system to keep alive (and drop) on
    /// its behalf, e.g. a backend `Arc` with no other owner.
    blobs: Mutex<Vec<Box<dyn Any + Send>>>,
    idle: Mutex<Option<Arc<IdleWaiter>>>,
}

impl ProcessingSystem {
    /// §4.13 `attach`. Creates the system, runs `setup` (which builds the
    /// graph using the methods below), creates kernel shims from any
    /// exported packet channels, and returns the running system. Threads
    /// created via `new_thread`/`Thread::start` during `setup` are
    /// already running by the time `setup` returns -- `start` spawns
    /// immediately, matching how `map::arbiter::MapTapArbiterBuilder`
    /// starts its own service thread at `build()`.
    pub fn attach(setup: impl FnOnce(&Arc<ProcessingSystem>)) -> Arc<ProcessingSystem> {
        let main_context = Context::new("main");
        let main_thread = Thread::new("main");
        main_context.bind_thread(Arc::clone(&main_thread));

        let system = Arc::new(ProcessingSystem {
            main_context: Arc::clone(&main_context),
            main_thread: Arc::clone(&main_thread),
            contexts: Mutex::new(vec![main_context]),
            threads: Mutex::new(vec![main_thread]),
            channels: Mutex::new(HashMap::new()),
            maps: Mutex::new(HashMap::new()),
            kernels: Mutex::new(Vec::new()),
            exported_read: Mutex::new(Vec::new()),
            exported_write: Mutex::new(Vec::new()),
            blobs: Mutex::new(Vec::new()),
            idle: Mutex::new(None),
        });

        setup(&system);
        system.make_channel_kernels();
        system
    }

    /// §4.13 `detach`. Stops every registered thread (joining each) and
    /// drops any tracked blobs.
    pub fn detach(&self) {
        for thread in self.threads.lock().unwrap().iter() {
            if !std::ptr::eq(thread.as_ref(), self.main_thread.as_ref()) {
                thread.stop();
            }
        }
        self.blobs.lock().unwrap().clear();
    }

    pub fn main_context(&self) -> &Arc<Context> {
        &self.main_context
    }

    pub fn main_thread(&self) -> &Arc<Thread> {
        &self.main_thread
    }

    pub fn new_context(&self, name: impl Into<String>) -> Arc<Context> {
        let ctx = Context::new(name);
        self.contexts.lock().unwrap().push(Arc::clone(&ctx));
        ctx
    }

    /// Registers a thread for teardown tracking. The caller still calls
    /// `thread.start(context, body)` themselves.
    pub fn new_thread(&self, name: impl Into<String>) -> Arc<Thread> {
        let thread = Thread::new(name);
        self.threads.lock().unwrap().push(Arc::clone(&thread));
        thread
    }

    pub fn new_channel(&self, name: impl Into<String>, element_size: usize, capacity: usize) -> Arc<Channel> {
        let name = name.into();
        let channel = Arc::new(Channel::new(name.clone(), element_size, capacity));
        self.channels.lock().unwrap().entry(name).or_default().push(Arc::clone(&channel));
        channel
    }

    pub fn find_channels(&self, name: &str) -> Vec<Arc<Channel>> {
        self.channels.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    pub fn new_map(&self, id: MapId, backend: Arc<dyn MapBackend>) {
        self.maps.lock().unwrap().insert(id, backend);
    }

    pub fn find_map(&self, id: MapId) -> Option<Arc<dyn MapBackend>> {
        self.maps.lock().unwrap().get(&id).cloned()
    }

    /// Marks `channel` as the single external-read endpoint for the
    /// graph (the egress a client's `poll()` drains).
    pub fn export_read(&self, channel: Arc<Channel>) {
        self.exported_read.lock().unwrap().push(channel);
    }

    /// Marks `channel` as the single external-write endpoint (the
    /// ingress a client's `process()` feeds).
    pub fn export_write(&self, channel: Arc<Channel>) {
        self.exported_write.lock().unwrap().push(channel);
    }

    pub fn register_kernel(&self, shim: KernelShim) {
        self.kernels.lock().unwrap().push(shim);
    }

    /// Keeps `blob` alive until `detach()`, for setup-time state with no
    /// other owner (§4.13 "vector of heap-allocated blobs to free at
    /// teardown").
    pub fn track_blob<T: Send + 'static>(&self, blob: T) {
        self.blobs.lock().unwrap().push(Box::new(blob));
    }

    /// Registers a function kernel directly (no channel plumbing
    /// needed).
    pub fn register_func_kernel(&self, bus: Option<BusKind>, func: BoxedFunc) {
        self.register_kernel(KernelShim::Func(FuncPacketKernel::new(bus, func)));
    }

    /// §4.13: "creates kernel shims from exported packet channels".
    /// Fatal unless exactly zero or exactly one channel was exported in
    /// each direction (a partially-wired external interface is a setup
    /// bug, not a runtime condition).
    fn make_channel_kernels(self: &Arc<Self>) {
        let reads = self.exported_read.lock().unwrap();
        let writes = self.exported_write.lock().unwrap();
        if reads.len() > 1 || writes.len() > 1 {
            fatal!(
                "processing system: expected at most one exported read/write channel each, got {}/{}",
                reads.len(),
                writes.len()
            );
        }
        if reads.is_empty() && writes.is_empty() {
            return;
        }
        if reads.is_empty() != writes.is_empty() {
            fatal!("processing system: exported read/write channels must both be present or both absent");
        }

        let idle = IdleWaiter::new(Arc::clone(&self.main_thread));
        for thread in self.threads.lock().unwrap().iter() {
            if !std::ptr::eq(thread.as_ref(), self.main_thread.as_ref()) {
                idle.monitor(Arc::clone(thread));
            }
        }
        *self.idle.lock().unwrap() = Some(Arc::clone(&idle));

        let kernel = ChannelPacketKernel::new(
            Arc::clone(&writes[0]),
            Arc::clone(&reads[0]),
            BusKind::Simple,
            idle,
        );
        drop(reads);
        drop(writes);
        self.register_kernel(KernelShim::Channel(kernel));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ChannelFlags;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn attach_runs_setup_and_tracks_resources() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let system = ProcessingSystem::attach(move |sys| {
            let ctx = sys.new_context("worker-ctx");
            let channel = sys.new_channel("c", 4, 2);
            ctx.add_channel(0, Arc::clone(&channel), ChannelFlags::READ | ChannelFlags::WRITE);
            let thread = sys.new_thread("worker");
            let c = Arc::clone(&calls2);
            thread.start(ctx, move || {
                c.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(1));
            });
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(calls.load(Ordering::SeqCst) > 0);
        assert_eq!(system.find_channels("c").len(), 1);
        system.detach();
    }

    #[test]
    fn mismatched_exported_channels_is_fatal() {
        let result = std::panic::catch_unwind(|| {
            ProcessingSystem::attach(|sys| {
                let channel = sys.new_channel("x", 4, 1);
                sys.export_read(channel);
            });
        });
        assert!(result.is_err());
    }

    #[test]
    fn paired_exported_channels_build_a_channel_kernel() {
        let system = ProcessingSystem::attach(|sys| {
            let read = sys.new_channel("egress", 66, 4);
            let write = sys.new_channel("ingress", 66, 4);
            sys.export_read(read);
            sys.export_write(write);
        });
        assert_eq!(system.kernels.lock().unwrap().len(), 1);
        system.detach();
    }
}
