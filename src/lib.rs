mod aefs_lib;

pub use aefs_lib::*;
