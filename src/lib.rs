pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod launch;
pub mod monitor;
pub mod outcome;
pub mod ratelimit;
pub mod retry;
pub mod signals;
pub mod supervise;
pub mod timebound;
pub mod watchdog;
