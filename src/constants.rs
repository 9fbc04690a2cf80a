/// Constants module to avoid magic numbers in the codebase

// Network Configuration
pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_GATEWAY_PORT: u16 = 8765;
pub const HEALTH_BODY: &str = "OK";
pub const HEALTH_PROBE_TIMEOUT_MS: u64 = 200;
pub const GATEWAY_SHUTDOWN_GRACE_MS: u64 = 250;

// Streaming
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024; // Small enough that a seek doesn't drag a large prefix
pub const DEFAULT_MIME_TYPE: &str = "video/mp4";
pub const TOKEN_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const REGISTRY_SWEEP_INTERVAL_SECS: u64 = 60;
pub const RELAY_PROGRESS_LOG_BYTES: u64 = 1024 * 1024;

// Runtime
pub const RUNTIME_STOP_TIMEOUT_MS: u64 = 3000;
pub const RUNTIME_STARTUP_TIMEOUT_MS: u64 = 30_000;
pub const RUNTIME_THREAD_NAME: &str = "shadow-stream-worker";

// Container layout probing
pub const BOX_HEADER_SIZE: usize = 8;
pub const LARGE_BOX_HEADER_SIZE: usize = 16;
pub const FRONT_LOADED_THRESHOLD: u64 = 100 * 1024;

// Cache
pub const GIB: u64 = 1024 * 1024 * 1024;
pub const DISK_RESERVE_BYTES: u64 = 5 * GIB;
pub const CACHE_INDEX_FILE: &str = "cache_index.db";
pub const CACHE_BLOB_DIR: &str = "blobs";
pub const PARTIAL_SUFFIX: &str = "part";
pub const DEFAULT_SIZE_LIMIT_BYTES: u64 = 10 * GIB;

pub const RETENTION_3_DAYS: i64 = 3 * 24 * 60 * 60;
pub const RETENTION_1_WEEK: i64 = 7 * 24 * 60 * 60;
pub const RETENTION_1_MONTH: i64 = 30 * 24 * 60 * 60;
pub const RETENTION_UNLIMITED: i64 = -1;

/// Size tiers offered to the user, in ascending order
pub const SIZE_TIERS: &[(&str, u64)] = &[
    ("2 GB", 2 * GIB),
    ("4 GB", 4 * GIB),
    ("6 GB", 6 * GIB),
    ("8 GB", 8 * GIB),
    ("10 GB", 10 * GIB),
    ("30 GB", 30 * GIB),
    ("50 GB", 50 * GIB),
];

// Backend session state corruption signatures
pub const CORRUPT_SESSION_SIGNATURES: &[&str] = &[
    "no such column",
    "database is locked",
    "database disk image is malformed",
];
