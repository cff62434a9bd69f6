//! `CacheConfig`: the construction-time parameters spec §6's `create`
//! takes positionally (`sma, serializer, size_hint, gc_ttl, ttl, smart,
//! defend`), collected into one builder — the same shape as the teacher's
//! `ShmCache::create_or_open` parameter list, but named rather than
//! positional since this crate's surface is a library, not an embedding.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name of the shared region (`/dev/shm/<name>.data` / `.lock`).
    pub shm_name: String,
    /// Total bytes available to the `Sma` arena, beyond the fixed header
    /// and slot table.
    pub sma_size: u32,
    /// Hint for the slot table's chain-head count; rounded up to the
    /// nearest prime in `table::PRIMES` (spec §3/§4.1).
    pub size_hint: u32,
    /// Seconds an entry may sit on the GC list with outstanding references
    /// before being freed anyway (with a leak diagnostic). `0` disables
    /// the escape hatch.
    pub gc_ttl: u32,
    /// Global soft TTL (spec glossary: "soft expiry"). `0` disables it.
    pub ttl: u32,
    /// Expunge "smart" multiplier (spec §4.7): `suitable = smart * size`
    /// when nonzero, else `sma.size() / 2`.
    pub smart: u32,
    /// Enable slam defense (spec §4.8).
    pub defend: bool,
    /// Reject `store`/`update` when the key exceeds this many bytes, `0`
    /// disables the check.
    pub max_key_size: u32,
    /// Reject `store` when the encoded value exceeds this many bytes, `0`
    /// disables the check.
    pub max_value_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            shm_name: "userdata_cache".to_string(),
            sma_size: 32 * 1024 * 1024,
            size_hint: 2000,
            gc_ttl: 3600,
            ttl: 0,
            smart: 0,
            defend: false,
            max_key_size: 0,
            max_value_size: 0,
        }
    }
}

impl CacheConfig {
    pub fn new(shm_name: impl Into<String>) -> Self {
        CacheConfig {
            shm_name: shm_name.into(),
            ..Default::default()
        }
    }

    pub fn sma_size(mut self, n: u32) -> Self {
        self.sma_size = n;
        self
    }

    pub fn size_hint(mut self, n: u32) -> Self {
        self.size_hint = n;
        self
    }

    pub fn gc_ttl(mut self, n: u32) -> Self {
        self.gc_ttl = n;
        self
    }

    pub fn ttl(mut self, n: u32) -> Self {
        self.ttl = n;
        self
    }

    pub fn smart(mut self, n: u32) -> Self {
        self.smart = n;
        self
    }

    pub fn defend(mut self, on: bool) -> Self {
        self.defend = on;
        self
    }

    pub fn max_key_size(mut self, n: u32) -> Self {
        self.max_key_size = n;
        self
    }

    pub fn max_value_size(mut self, n: u32) -> Self {
        self.max_value_size = n;
        self
    }
}
