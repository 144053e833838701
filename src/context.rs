//! Per-thread resource registry (§3.4, §4.4).
//!
//! Binds numerical ids to channels and maps and enforces the "one reader,
//! one writer per channel" discipline. Lookup misses and duplicate
//! registration are programmer-contract violations (§7.1) and therefore
//! fatal, not `Result`-returning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::channel::{Channel, Direction};
use crate::fatal;
use crate::map::MapBackend;
use crate::thread::Thread;

pub type ChannelId = u32;
pub type MapId = u32;

bitflags::bitflags! {
    /// Which access a context requests when registering a channel
    /// (mirrors `NANOTUBE_CHANNEL_READ`/`NANOTUBE_CHANNEL_WRITE`).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ChannelFlags: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// A per-thread registry of channels and maps (§3.4).
pub struct Context {
    name: String,
    thread: Mutex<Option<Weak<Thread>>>,
    channels: Mutex<HashMap<(ChannelId, Direction), Arc<Channel>>>,
    maps: Mutex<HashMap<MapId, Arc<dyn MapBackend>>>,
}

impl Context {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Context {
            name: name.into(),
            thread: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            maps: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// §4.4 `bind_thread`. Exclusive: asserted unbound first.
    pub fn bind_thread(&self, thread: Arc<Thread>) {
        let mut slot = self.thread.lock().unwrap();
        if slot.is_some() {
            fatal!("context '{}': bind_thread called while already bound", self.name);
        }
        *slot = Some(Arc::downgrade(&thread));
    }

    /// §4.4 `unbind_thread`.
    pub fn unbind_thread(&self, thread: &Thread) {
        let mut slot = self.thread.lock().unwrap();
        match slot.as_ref().and_then(Weak::upgrade) {
            Some(bound) if std::ptr::eq(bound.as_ref(), thread) => *slot = None,
            _ => fatal!("context '{}': unbind_thread called with mismatched thread", self.name),
        }
    }

    /// §4.4 `add_channel`. Registers `channel` for `flags`, setting the
    /// channel's reader and/or writer to this context. Duplicate
    /// registration for a direction is fatal.
    pub fn add_channel(self: &Arc<Self>, id: ChannelId, channel: Arc<Channel>, flags: ChannelFlags) {
        if flags.contains(ChannelFlags::READ) {
            let mut channels = self.channels.lock().unwrap();
            if channels
                .insert((id, Direction::Read), Arc::clone(&channel))
                .is_some()
            {
                fatal!("context '{}': channel {} already registered for reading", self.name, id);
            }
            drop(channels);
            channel.set_reader(Arc::downgrade(self));
        }
        if flags.contains(ChannelFlags::WRITE) {
            let mut channels = self.channels.lock().unwrap();
            if channels
                .insert((id, Direction::Write), Arc::clone(&channel))
                .is_some()
            {
                fatal!("context '{}': channel {} already registered for writing", self.name, id);
            }
            drop(channels);
            channel.set_writer(Arc::downgrade(self));
        }
    }

    /// §4.4 `find_channel`. Fatal if absent.
    pub fn find_channel(&self, id: ChannelId, direction: Direction) -> Arc<Channel> {
        self.channels
            .lock()
            .unwrap()
            .get(&(id, direction))
            .cloned()
            .unwrap_or_else(|| fatal!("context '{}': no channel {:?}/{:?} registered", self.name, id, direction))
    }

    pub fn add_map(&self, id: MapId, map: Arc<dyn MapBackend>) {
        self.maps.lock().unwrap().insert(id, map);
    }

    pub fn get_map(&self, id: MapId) -> Option<Arc<dyn MapBackend>> {
        self.maps.lock().unwrap().get(&id).cloned()
    }

    /// §4.4 `check_thread`. Fatal if the bound thread is not the caller.
    pub fn check_thread(&self) {
        let bound = self.thread.lock().unwrap().as_ref().and_then(Weak::upgrade);
        match bound {
            Some(thread) => thread.check_current(),
            None => fatal!("context '{}': check_thread called with no bound thread", self.name),
        }
    }

    /// §4.4 `wake`. Wakes the bound thread.
    pub fn wake(&self) {
        if let Some(thread) = self.thread.lock().unwrap().as_ref().and_then(Weak::upgrade) {
            thread.wake();
        }
    }

    pub fn bound_thread(&self) -> Option<Arc<Thread>> {
        self.thread.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_channel_registration_for_same_direction_is_fatal() {
        let ctx = Context::new("c");
        let ch = Arc::new(Channel::new("ch", 4, 2));
        ctx.add_channel(1, Arc::clone(&ch), ChannelFlags::READ);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.add_channel(1, ch, ChannelFlags::READ);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn missing_channel_lookup_is_fatal() {
        let ctx = Context::new("c");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.find_channel(42, Direction::Read);
        }));
        assert!(result.is_err());
    }
}
