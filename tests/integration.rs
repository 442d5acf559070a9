// Integration tests for the telemetry agent, organized by feature area.
// Each module exercises several public modules together; common.rs holds
// the shared fixtures.

mod common;

mod command_channel_flags;
mod register_and_vortex;
mod runtime_startup;
mod store_and_sender;
