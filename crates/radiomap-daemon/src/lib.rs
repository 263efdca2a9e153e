pub mod catalog;
pub mod core;
pub mod directory;
pub mod http;
pub mod logging;
pub mod mpv;
pub mod playback;
pub mod volume;

use radiomap_proto::protocol::Notice;

/// Fan-out to every observer of the daemon (log panel, HTTP pollers).
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Notice(Notice),
    Log(String),
}
