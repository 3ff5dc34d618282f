pub mod recover;
pub mod reset;
pub mod schedule;
pub mod status;
pub mod stop;
pub mod tick;
