pub mod config;
pub mod execs;
pub mod run;
