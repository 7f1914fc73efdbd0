use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::aefs_lib::CoreTime;

pub fn init_logs() {
    let _ = env_logger::builder().try_init();
}

/// Current time as 32-bit POSIX seconds.
pub fn now() -> CoreTime {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as CoreTime,
        Err(_) => 0,
    }
}

/// Case-insensitive ordering of file/EA names, byte-wise over ASCII.
pub fn compare_names_ci(a: &[u8], b: &[u8]) -> Ordering {
    let la = a.iter().map(|c| c.to_ascii_lowercase());
    let lb = b.iter().map(|c| c.to_ascii_lowercase());
    la.cmp(lb)
}

pub fn names_eq_ci(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Round `x` up to a multiple of `y` (0 stays 0).
pub fn round_up(x: usize, y: usize) -> usize {
    if x == 0 {
        0
    } else {
        ((x - 1) / y + 1) * y
    }
}
