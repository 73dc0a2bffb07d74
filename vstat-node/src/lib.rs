pub mod agent;
pub mod authfile;
pub mod config;
pub mod corecfg;
pub mod logtail;
pub mod stats;
