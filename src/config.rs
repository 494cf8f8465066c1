//! Runtime configuration: the entry-point flags and their parsed form.

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid maxmemory policy '{0}'")]
    BadPolicy(String),
    #[error("invalid notify-keyspace-events flags '{0}'")]
    BadNotifyFlags(String),
    #[error("databases must be between 1 and 64, got {0}")]
    BadDatabases(usize),
    #[error("active-expire-effort must be between 1 and 10, got {0}")]
    BadEffort(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxmemoryPolicy {
    NoEviction,
    AllkeysRandom,
    VolatileRandom,
    AllkeysLru,
    VolatileLru,
    VolatileTtl,
}

impl MaxmemoryPolicy {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "noeviction" => Ok(MaxmemoryPolicy::NoEviction),
            "allkeys-random" => Ok(MaxmemoryPolicy::AllkeysRandom),
            "volatile-random" => Ok(MaxmemoryPolicy::VolatileRandom),
            "allkeys-lru" => Ok(MaxmemoryPolicy::AllkeysLru),
            "volatile-lru" => Ok(MaxmemoryPolicy::VolatileLru),
            "volatile-ttl" => Ok(MaxmemoryPolicy::VolatileTtl),
            other => Err(ConfigError::BadPolicy(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MaxmemoryPolicy::NoEviction => "noeviction",
            MaxmemoryPolicy::AllkeysRandom => "allkeys-random",
            MaxmemoryPolicy::VolatileRandom => "volatile-random",
            MaxmemoryPolicy::AllkeysLru => "allkeys-lru",
            MaxmemoryPolicy::VolatileLru => "volatile-lru",
            MaxmemoryPolicy::VolatileTtl => "volatile-ttl",
        }
    }

    pub fn is_volatile(self) -> bool {
        matches!(
            self,
            MaxmemoryPolicy::VolatileRandom
                | MaxmemoryPolicy::VolatileLru
                | MaxmemoryPolicy::VolatileTtl
        )
    }
}

/// Command-line surface. Only flags that change runtime semantics; anything
/// operational (log filtering and so on) rides on `RUST_LOG`.
#[derive(Debug, Parser)]
#[command(name = "riptide-server", version, about)]
pub struct Cli {
    /// TCP port to accept clients on.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Memory ceiling in bytes for materialized values; 0 disables.
    #[arg(long, default_value_t = 0)]
    pub maxmemory: u64,

    /// What to do at the ceiling: noeviction, allkeys-random,
    /// volatile-random, allkeys-lru, volatile-lru, volatile-ttl.
    #[arg(long, default_value = "noeviction")]
    pub maxmemory_policy: String,

    /// Number of numbered databases.
    #[arg(long, default_value_t = 16)]
    pub databases: usize,

    /// Active expiration effort, 1 (default) to 10.
    #[arg(long, default_value_t = 1)]
    pub active_expire_effort: u32,

    /// In-flight swap memory (bytes) above which clients get delayed.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub swap_memory_slowdown: u64,

    /// In-flight swap memory (bytes) at which the delay maxes out.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    pub swap_memory_stop: u64,

    /// ACL file to load at startup and rewrite on ACL SAVE.
    #[arg(long)]
    pub acl_filename: Option<String>,

    /// Microsecond threshold for the slow log; negative disables.
    #[arg(long, default_value_t = 10_000)]
    pub slowlog_log_slower_than: i64,

    #[arg(long, default_value_t = 128)]
    pub slowlog_max_len: usize,

    /// Reply-size threshold in bytes for the fat log; negative disables.
    #[arg(long, default_value_t = 64 * 1024)]
    pub fatlog_log_bigger_than: i64,

    #[arg(long, default_value_t = 128)]
    pub fatlog_max_len: usize,

    /// Keyspace notification classes, e.g. "KEA".
    #[arg(long, default_value = "")]
    pub notify_keyspace_events: String,

    /// Maximum simultaneous client connections.
    #[arg(long, default_value_t = 10_000)]
    pub maxclients: usize,

    /// Background timer frequency (cron ticks per second).
    #[arg(long, default_value_t = 10)]
    pub hz: u32,

    /// Parallel swap I/O pipes; raw keys are routed by crc16.
    #[arg(long, default_value_t = 4)]
    pub swap_pipes: usize,

    /// Tracking-table size that triggers invalidation-table eviction;
    /// 0 disables the bound.
    #[arg(long, default_value_t = 1_000_000)]
    pub tracking_table_max_keys: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub maxmemory: u64,
    pub maxmemory_policy: MaxmemoryPolicy,
    pub databases: usize,
    pub active_expire_effort: u32,
    pub swap_memory_slowdown: u64,
    pub swap_memory_stop: u64,
    pub acl_filename: Option<String>,
    pub slowlog_log_slower_than: i64,
    pub slowlog_max_len: usize,
    pub fatlog_log_bigger_than: i64,
    pub fatlog_max_len: usize,
    pub notify_flags: u32,
    pub maxclients: usize,
    pub hz: u32,
    pub swap_pipes: usize,
    pub tracking_table_max_keys: usize,
    pub repl_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 6379,
            bind: "127.0.0.1".to_string(),
            maxmemory: 0,
            maxmemory_policy: MaxmemoryPolicy::NoEviction,
            databases: 16,
            active_expire_effort: 1,
            swap_memory_slowdown: 64 * 1024 * 1024,
            swap_memory_stop: 256 * 1024 * 1024,
            acl_filename: None,
            slowlog_log_slower_than: 10_000,
            slowlog_max_len: 128,
            fatlog_log_bigger_than: 64 * 1024,
            fatlog_max_len: 128,
            notify_flags: 0,
            maxclients: 10_000,
            hz: 10,
            swap_pipes: 4,
            tracking_table_max_keys: 1_000_000,
            repl_workers: 256,
        }
    }
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Config, ConfigError> {
        if !(1..=64).contains(&cli.databases) {
            return Err(ConfigError::BadDatabases(cli.databases));
        }
        if !(1..=10).contains(&cli.active_expire_effort) {
            return Err(ConfigError::BadEffort(cli.active_expire_effort));
        }
        let notify_flags = crate::notify::parse_notify_flags(&cli.notify_keyspace_events)
            .ok_or_else(|| ConfigError::BadNotifyFlags(cli.notify_keyspace_events.clone()))?;
        Ok(Config {
            port: cli.port,
            bind: cli.bind,
            maxmemory: cli.maxmemory,
            maxmemory_policy: MaxmemoryPolicy::parse(&cli.maxmemory_policy)?,
            databases: cli.databases,
            active_expire_effort: cli.active_expire_effort,
            swap_memory_slowdown: cli.swap_memory_slowdown,
            swap_memory_stop: cli.swap_memory_stop.max(cli.swap_memory_slowdown),
            acl_filename: cli.acl_filename,
            slowlog_log_slower_than: cli.slowlog_log_slower_than,
            slowlog_max_len: cli.slowlog_max_len,
            fatlog_log_bigger_than: cli.fatlog_log_bigger_than,
            fatlog_max_len: cli.fatlog_max_len,
            notify_flags,
            maxclients: cli.maxclients,
            hz: cli.hz.clamp(1, 500),
            swap_pipes: cli.swap_pipes.clamp(1, 64),
            tracking_table_max_keys: cli.tracking_table_max_keys,
            repl_workers: 256,
        })
    }
}
