//! Process-wide set of open channels
//!
//! Channels register on construction and deregister in `close()`. A channel
//! dropped without closing stays listed, which is how lifecycle tests catch
//! leaks.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use parking_lot::Mutex;

use crate::types::ChannelId;

/// Snapshot entry of one open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub transport: String,
}

static OPEN_CHANNELS: Mutex<BTreeMap<ChannelId, OpenChannelInfo>> =
    parking_lot::const_mutex(BTreeMap::new());

pub(crate) fn register(info: OpenChannelInfo) {
    OPEN_CHANNELS.lock().insert(info.id, info);
}

pub(crate) fn deregister(id: ChannelId) {
    OPEN_CHANNELS.lock().remove(&id);
}

/// Every currently open channel, in construction order
pub fn open_channels() -> Vec<OpenChannelInfo> {
    OPEN_CHANNELS.lock().values().cloned().collect()
}

pub fn open_channel_count() -> usize {
    OPEN_CHANNELS.lock().len()
}

pub fn is_open(id: ChannelId) -> bool {
    OPEN_CHANNELS.lock().contains_key(&id)
}
