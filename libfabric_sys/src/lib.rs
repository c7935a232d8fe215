#![allow(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    dead_code,
    clippy::all
)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

/// `FI_ADDR_UNSPEC` is a cast macro in `rdma/fabric.h` and does not survive
/// bindgen.
pub const FI_ADDR_UNSPEC: fi_addr_t = !0;

/// `FI_KEY_NOTAVAIL` is likewise a cast macro.
pub const FI_KEY_NOTAVAIL: u64 = !0;

/// `FI_VERSION(major, minor)` macro equivalent.
#[inline]
pub const fn FI_VERSION(major: u32, minor: u32) -> u32 {
    (major << 16) | minor
}

/// `FI_MAJOR`/`FI_MINOR` macro equivalents.
#[inline]
pub const fn FI_MAJOR(version: u32) -> u32 {
    version >> 16
}

#[inline]
pub const fn FI_MINOR(version: u32) -> u32 {
    version & 0xffff
}

/// `FI_VERSION_LT` macro equivalent.
#[inline]
pub const fn FI_VERSION_LT(a: u32, b: u32) -> bool {
    (FI_MAJOR(a) < FI_MAJOR(b)) || (FI_MAJOR(a) == FI_MAJOR(b) && FI_MINOR(a) < FI_MINOR(b))
}
