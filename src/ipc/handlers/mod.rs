pub mod control;
pub mod core;
pub mod groups;
pub mod journal;
pub mod students;
