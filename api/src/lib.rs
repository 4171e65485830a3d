//! Multi-backend ION-style physical memory allocator.

#[macro_use]
extern crate log;
extern crate alloc;

pub mod file;
pub mod ion;
