pub mod config;
pub mod ext_mem;
pub mod perf_log;
pub mod top;
