/// Native module contains implementations of core traits and the process
/// plumbing behind them, talking to the OS directly (process groups,
/// signals, pipes) instead of going through containers or sandboxes.
pub mod collector;
pub mod gate;
pub mod runner;
pub mod workdir;
