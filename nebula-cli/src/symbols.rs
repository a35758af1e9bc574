//! Console symbols, ASCII on Windows

#[cfg(windows)]
pub const CHECK: &str = "[OK]";
#[cfg(not(windows))]
pub const CHECK: &str = "\u{2713}";

#[cfg(windows)]
pub const REPAIRED: &str = "[R]";
#[cfg(not(windows))]
pub const REPAIRED: &str = "\u{21bb}";

#[cfg(windows)]
pub const WARN: &str = "[!]";
#[cfg(not(windows))]
pub const WARN: &str = "\u{26a0}";
