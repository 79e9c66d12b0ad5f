use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DbConfig {
    /// log2 of the fast-index segment length. Each doubling of the index
    /// adds segments of this size.
    pub fast_seg_shift: u32,
    /// The index doubles when locks granted in the last second, scaled by
    /// this rate, exceed the current capacity.
    pub fast_resize_rate: u64,
    /// Reclaimed key managers beyond this many pooled entries per database
    /// are dropped instead of reused.
    pub manager_pool_ceiling: usize,
    /// Reclaimed lock records beyond this many pooled entries per shard are
    /// dropped instead of reused.
    pub lock_pool_ceiling: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            fast_seg_shift: 23, // 8M slots per segment
            fast_resize_rate: 512,
            manager_pool_ceiling: 4_194_303,
            lock_pool_ceiling: 4096,
        }
    }
}

impl DbConfig {
    /// A config tuned for fast testing.
    ///
    /// - **fast_seg_shift:** Tiny segments force index collisions and make
    ///   the resize path reachable without millions of keys.
    pub fn for_testing() -> Self {
        Self {
            fast_seg_shift: 6,
            fast_resize_rate: 4,
            manager_pool_ceiling: 256,
            lock_pool_ceiling: 64,
        }
    }
}

/// Configuration for the server binary and all its sub-components.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Append-only-file path; `None` disables persistence.
    pub aof_path: Option<PathBuf>,
    pub db: DbConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5658,
            aof_path: None,
            db: DbConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Applies `WARDEN_BIND`, `WARDEN_PORT` and `WARDEN_AOF` from the
    /// environment on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("WARDEN_BIND") {
            config.bind = bind;
        }
        if let Ok(port) = std::env::var("WARDEN_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(path) = std::env::var("WARDEN_AOF") {
            config.aof_path = Some(PathBuf::from(path));
        }
        config
    }
}
