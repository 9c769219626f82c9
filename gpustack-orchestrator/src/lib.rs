pub mod bootstrap;
pub mod cli;
pub mod collector;
pub mod config;
pub mod cost_report;
pub mod health_check;
pub mod interruption_monitor;
pub mod logger;
pub mod monitoring;
pub mod provider_manager;
pub mod selection;
pub mod state_machine;
pub mod state_store;
pub mod teardown;
