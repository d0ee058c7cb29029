use ctype::Abi;

/// Number of callback thunks compiled into the binary.
pub const MAX_TRAMPOLINES: usize = 4096;

// unset fields fall back to `AlienSettings::default()`
#[derive(Debug, Default, Clone)]
pub struct AlienCreateInfo {
    pub abi: Option<Abi>,
    pub sync_stack_size: Option<usize>,
    pub sync_heap_size: Option<usize>,
    pub async_stack_size: Option<usize>,
    pub async_heap_size: Option<usize>,
    pub resident_async_pools: Option<usize>,
    pub max_async_calls: Option<usize>,
    // bytes kept free below the frame image
    pub red_zone: Option<usize>,
    // heap requests above this get their own allocation
    pub heap_fallback: Option<usize>,
    pub event_loop: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct AlienSettings {
    /// `None` when the host ABI is unknown; classification still works for
    /// explicit ABIs but native calls fail.
    pub abi: Option<Abi>,
    pub sync_stack_size: usize,
    pub sync_heap_size: usize,
    pub async_stack_size: usize,
    pub async_heap_size: usize,
    pub resident_async_pools: usize,
    pub max_async_calls: usize,
    pub red_zone: usize,
    pub heap_fallback: usize,
    pub event_loop: bool,
}

impl Default for AlienSettings {
    fn default() -> Self {
        Self {
            abi: Abi::host(),
            sync_stack_size: 1 << 20,
            sync_heap_size: 2 << 20,
            async_stack_size: 256 << 10,
            async_heap_size: 512 << 10,
            resident_async_pools: 2,
            max_async_calls: 64,
            red_zone: 256,
            heap_fallback: 64 << 10,
            event_loop: true,
        }
    }
}

impl AlienSettings {
    #[must_use]
    pub fn resolve(info: &AlienCreateInfo) -> AlienSettings {
        let mut settings = AlienSettings::default();
        info.abi.inspect(|&val| settings.abi = Some(val));
        info.sync_stack_size
            .inspect(|&val| settings.sync_stack_size = val);
        info.sync_heap_size
            .inspect(|&val| settings.sync_heap_size = val);
        info.async_stack_size
            .inspect(|&val| settings.async_stack_size = val);
        info.async_heap_size
            .inspect(|&val| settings.async_heap_size = val);
        info.resident_async_pools
            .inspect(|&val| settings.resident_async_pools = val);
        info.max_async_calls
            .inspect(|&val| settings.max_async_calls = val);
        info.red_zone.inspect(|&val| settings.red_zone = val);
        info.heap_fallback.inspect(|&val| settings.heap_fallback = val);
        info.event_loop.inspect(|&val| settings.event_loop = val);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_keep_defaults() {
        let settings = AlienSettings::resolve(&AlienCreateInfo {
            max_async_calls: Some(4),
            event_loop: Some(false),
            ..AlienCreateInfo::default()
        });
        assert_eq!(settings.max_async_calls, 4);
        assert!(!settings.event_loop);
        assert_eq!(settings.sync_stack_size, 1 << 20);
        assert_eq!(settings.red_zone, 256);
        assert_eq!(settings.abi, Abi::host());
    }
}
