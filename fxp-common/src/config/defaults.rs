pub(crate) const fn _default_request_id_offset() -> u32 {
    256
}

pub(crate) const fn _default_max_names_memory() -> usize {
    8 << 20
}

pub(crate) const fn _default_read_chunk_size() -> u32 {
    32768
}

pub(crate) const fn _default_window_size() -> u64 {
    1048576
}

pub(crate) const fn _default_scp_max_backlog() -> usize {
    65536
}

pub(crate) const fn _default_scp_read_chunk_size() -> u64 {
    4096
}

pub(crate) const fn _default_max_readdir_entries() -> u32 {
    u32::MAX
}
