//! Core value types shared by every layer.

mod addr;

pub use addr::{parse_addr, Addr};
