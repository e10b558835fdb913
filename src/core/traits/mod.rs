pub mod gate;
pub mod notifier;
