//! Small shared runtime helpers.

pub mod timers;

pub use timers::TimerSet;
