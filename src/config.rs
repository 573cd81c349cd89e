use nix::unistd::{getgid, getuid};
use std::num::NonZeroU32;
use std::time::{Duration, SystemTime};

const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);
const MIN_MAX_WRITE: u32 = 4096;

#[derive(Debug, Clone)]
pub struct Config {
    pub attr_ttl: Duration,
    pub max_write: NonZeroU32,
    pub uid: u32,
    pub gid: u32,
    pub started_at: SystemTime,
}

impl Config {
    /// Synthesized entries are owned by the user running the daemon.
    pub fn from_process(attr_ttl: Duration, max_write_kb: u32) -> Self {
        let mut config = Self::for_owner(getuid().as_raw(), getgid().as_raw());
        config.attr_ttl = attr_ttl;
        config.max_write = max_write_from_kb(max_write_kb);
        config
    }

    pub fn for_owner(uid: u32, gid: u32) -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            max_write: max_write_from_kb(0),
            uid,
            gid,
            started_at: SystemTime::now(),
        }
    }
}

fn max_write_from_kb(kb: u32) -> NonZeroU32 {
    let bytes = kb.saturating_mul(1024).max(MIN_MAX_WRITE);
    NonZeroU32::new(bytes).unwrap_or(NonZeroU32::MIN)
}
