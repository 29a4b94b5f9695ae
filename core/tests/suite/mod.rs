mod boot_patch;
mod brief_purity;
mod common;
mod episode_span;
mod eviction;
mod memory_gate;
mod resume_roundtrip;
